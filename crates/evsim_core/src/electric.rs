//! Electrical relations used to derive amperage bounds from rated power.

pub mod ac {
    /// Amperage on each phase for a given total power.
    ///
    /// Three-phase output uses `P / (√3 · V)`, anything else `P / V`.
    pub fn amperage_per_phase_from_power(number_of_phases: u8, power: f64, voltage: f64) -> f64 {
        match number_of_phases {
            3 => power / (3f64.sqrt() * voltage),
            _ => power / voltage,
        }
    }
}

pub mod dc {
    pub fn amperage(power: f64, voltage: f64) -> f64 {
        power / voltage
    }
}
