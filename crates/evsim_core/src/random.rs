use rand::Rng;

use crate::TelemetryError;

pub fn round_to(value: f64, scale: i32) -> f64 {
    let factor = 10f64.powi(scale);
    (value * factor).round() / factor
}

/// Uniform integer in `0..=max`.
pub fn random_int<R: Rng + ?Sized>(rng: &mut R, max: u64) -> u64 {
    rng.gen_range(0..=max)
}

/// Uniform float in `min..max`, rounded to two decimals.
pub fn random_float_rounded<R: Rng + ?Sized>(rng: &mut R, max: f64, min: f64) -> f64 {
    if max.is_nan() || min.is_nan() || max <= min {
        return round_to(min, 2);
    }
    round_to(rng.gen_range(min..max), 2)
}

/// Value drawn uniformly within `fluctuation_percent` of `static_value`,
/// rounded to two decimals.
pub fn random_float_fluctuated_rounded<R: Rng + ?Sized>(
    rng: &mut R,
    static_value: f64,
    fluctuation_percent: f64,
) -> Result<f64, TelemetryError> {
    if !(0.0..=100.0).contains(&fluctuation_percent) {
        return Err(TelemetryError::InvalidFluctuationPercent {
            fluctuation_percent,
        });
    }
    if fluctuation_percent == 0.0 {
        return Ok(round_to(static_value, 2));
    }
    let fluctuation = (static_value * fluctuation_percent / 100.0).abs();
    Ok(random_float_rounded(
        rng,
        static_value + fluctuation,
        static_value - fluctuation,
    ))
}
