//! Telemetry simulation engine.
//!
//! Builds the meter values a station reports on every sampling tick and at
//! transaction boundaries. Everything here is synchronous: randomness is
//! injected by the caller so a seeded generator yields reproducible samples.
//!
//! Measurands are sampled in a fixed order: state of charge, voltage, power,
//! current and finally the energy register, which is always present.

use std::time::Duration;

use rand::Rng;

use crate::electric::{ac, dc};
use crate::random::{
    random_float_fluctuated_rounded, random_float_rounded, random_int, round_to,
};
use crate::{
    ChargingStation, ConnectorStatus, CurrentOutType, Location, Measurand, MeterValue, Phase,
    ReadingContext, SampledValue, SampledValueTemplate, StationInfo, TelemetryError, Unit,
    VOLTAGE_LINE_TO_LINE,
};

/// Per-phase values of one measurand together with their aggregate.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MeasurandValues {
    pub l1: f64,
    pub l2: f64,
    pub l3: f64,
    pub all_phases: f64,
}

impl MeasurandValues {
    fn phase(&self, index: usize) -> f64 {
        match index {
            0 => self.l1,
            1 => self.l2,
            _ => self.l3,
        }
    }
}

/// Per-phase templates of a measurand, looked up only for three-phase output.
#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseTemplates<'a> {
    pub l1: Option<&'a SampledValueTemplate>,
    pub l2: Option<&'a SampledValueTemplate>,
    pub l3: Option<&'a SampledValueTemplate>,
}

impl<'a> PhaseTemplates<'a> {
    fn phase(&self, index: usize) -> Option<&'a SampledValueTemplate> {
        match index {
            0 => self.l1,
            1 => self.l2,
            _ => self.l3,
        }
    }
}

/// Find the template configured for a measurand, on a phase or phase-less.
///
/// Measurands missing from the station's sampled data are never reported,
/// except the energy register.
pub fn sampled_value_template<'a>(
    info: &StationInfo,
    connector: &'a ConnectorStatus,
    measurand: Measurand,
    phase: Option<Phase>,
) -> Option<&'a SampledValueTemplate> {
    if measurand != Measurand::EnergyActiveImportRegister
        && !info.meter_values_sampled_data.contains(&measurand)
    {
        return None;
    }
    connector
        .meter_values
        .iter()
        .find(|template| template.measurand() == measurand && template.phase == phase)
}

/// Static baseline of a template, if it declares one.
pub fn template_baseline(template: &SampledValueTemplate) -> Result<Option<f64>, TelemetryError> {
    match template.value.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(raw) => raw
            .parse::<f64>()
            .map(Some)
            .map_err(|_| TelemetryError::InvalidTemplateValue {
                measurand: template.measurand(),
                value: raw.to_string(),
            }),
    }
}

pub fn check_power_divider(info: &StationInfo, measurand: Measurand) -> Result<(), TelemetryError> {
    // Also rejects NaN
    if !(info.power_divider > 0.0) {
        let error = TelemetryError::InvalidPowerDivider {
            measurand,
            power_divider: info.power_divider,
        };
        tracing::error!("{} {}", info.charging_station_id, error);
        return Err(error);
    }
    Ok(())
}

fn unit_divider(template: &SampledValueTemplate, kilo: Unit) -> f64 {
    if template.unit == Some(kilo) {
        1000.0
    } else {
        1.0
    }
}

fn unsupported_current_out_type(info: &StationInfo, measurand: Measurand) -> TelemetryError {
    let error = TelemetryError::UnsupportedCurrentOutType {
        current_out_type: info.current_out_type.to_string(),
        measurand,
    };
    tracing::error!("{} MeterValues measurand {}: {}", info.charging_station_id, measurand, error);
    error
}

/// Value of one phase, by precedence: the phase's own template baseline,
/// then the shared baseline, then a random value below `max`.
fn phase_value<R: Rng + ?Sized>(
    rng: &mut R,
    own: Option<&SampledValueTemplate>,
    shared: Option<(f64, f64)>,
    max: f64,
) -> Result<f64, TelemetryError> {
    if let Some(template) = own {
        if let Some(baseline) = template_baseline(template)? {
            return random_float_fluctuated_rounded(rng, baseline, template.fluctuation_percent());
        }
    }
    match shared {
        Some((baseline, fluctuation_percent)) => {
            random_float_fluctuated_rounded(rng, baseline, fluctuation_percent)
        }
        None => Ok(random_float_rounded(rng, max, 0.0)),
    }
}

/// Compute active import power in the unit declared by `template`.
pub fn power_values<R: Rng + ?Sized>(
    info: &StationInfo,
    template: &SampledValueTemplate,
    per_phase: &PhaseTemplates<'_>,
    rng: &mut R,
) -> Result<MeasurandValues, TelemetryError> {
    let unit_divider = unit_divider(template, Unit::KiloWatt);
    let max_power = (info.max_power / info.power_divider).round();
    let baseline = template_baseline(template)?;
    let mut values = MeasurandValues::default();
    match info.current_out_type {
        CurrentOutType::Ac if info.number_of_phases == 3 => {
            let max_power_per_phase = (info.max_power / info.power_divider / 3.0).round();
            let shared = baseline.map(|baseline| (baseline / 3.0, template.fluctuation_percent()));
            values.l1 = phase_value(rng, per_phase.l1, shared, max_power_per_phase / unit_divider)?;
            values.l2 = phase_value(rng, per_phase.l2, shared, max_power_per_phase / unit_divider)?;
            values.l3 = phase_value(rng, per_phase.l3, shared, max_power_per_phase / unit_divider)?;
            values.all_phases = round_to(values.l1 + values.l2 + values.l3, 2);
        }
        CurrentOutType::Ac => {
            values.l1 = phase_value(rng, Some(template), None, max_power / unit_divider)?;
            values.all_phases = round_to(values.l1, 2);
        }
        CurrentOutType::Dc => {
            values.all_phases = phase_value(rng, Some(template), None, max_power / unit_divider)?;
        }
        CurrentOutType::Unsupported(_) => {
            return Err(unsupported_current_out_type(info, template.measurand()));
        }
    }
    Ok(values)
}

/// Maximum amperage the station can draw on one phase (AC) or in total (DC).
pub fn max_amperage(info: &StationInfo, measurand: Measurand) -> Result<f64, TelemetryError> {
    let max_power = info.max_power / info.power_divider;
    match info.current_out_type {
        CurrentOutType::Ac => Ok(ac::amperage_per_phase_from_power(
            info.number_of_phases,
            max_power,
            info.voltage_out,
        )),
        CurrentOutType::Dc => Ok(dc::amperage(max_power, info.voltage_out)),
        CurrentOutType::Unsupported(_) => Err(unsupported_current_out_type(info, measurand)),
    }
}

/// Compute import current. The three-phase aggregate is the phase average.
pub fn current_values<R: Rng + ?Sized>(
    info: &StationInfo,
    template: &SampledValueTemplate,
    per_phase: &PhaseTemplates<'_>,
    rng: &mut R,
) -> Result<MeasurandValues, TelemetryError> {
    let max_amperage = max_amperage(info, template.measurand())?;
    let baseline = template_baseline(template)?;
    let mut values = MeasurandValues::default();
    match info.current_out_type {
        CurrentOutType::Ac if info.number_of_phases == 3 => {
            let shared = baseline.map(|baseline| (baseline, template.fluctuation_percent()));
            values.l1 = phase_value(rng, per_phase.l1, shared, max_amperage)?;
            values.l2 = phase_value(rng, per_phase.l2, shared, max_amperage)?;
            values.l3 = phase_value(rng, per_phase.l3, shared, max_amperage)?;
            values.all_phases = round_to((values.l1 + values.l2 + values.l3) / 3.0, 2);
        }
        CurrentOutType::Ac => {
            values.l1 = phase_value(rng, Some(template), None, max_amperage)?;
            values.all_phases = round_to(values.l1, 2);
        }
        _ => {
            values.all_phases = phase_value(rng, Some(template), None, max_amperage)?;
        }
    }
    Ok(values)
}

fn default_location(measurand: Measurand) -> Option<Location> {
    match measurand {
        Measurand::StateOfCharge => Some(Location::Ev),
        _ => None,
    }
}

/// Render one sample from its template. Explicit context and phase win over
/// the template's own.
pub fn build_sampled_value(
    template: &SampledValueTemplate,
    value: f64,
    context: Option<ReadingContext>,
    phase: Option<Phase>,
) -> SampledValue {
    SampledValue {
        value: value.to_string(),
        context: context.or(template.context),
        measurand: template.measurand,
        phase: phase.or(template.phase),
        location: template
            .location
            .or_else(|| default_location(template.measurand())),
        unit: template.unit,
    }
}

struct Sampler<'a> {
    info: &'a StationInfo,
    connector: &'a ConnectorStatus,
    connector_id: u32,
    debug: bool,
}

impl<'a> Sampler<'a> {
    fn template(&self, measurand: Measurand, phase: Option<Phase>) -> Option<&'a SampledValueTemplate> {
        sampled_value_template(self.info, self.connector, measurand, phase)
    }

    fn phase_templates(&self, measurand: Measurand, phases: [Phase; 3]) -> PhaseTemplates<'a> {
        if self.info.number_of_phases != 3 {
            return PhaseTemplates::default();
        }
        PhaseTemplates {
            l1: self.template(measurand, Some(phases[0])),
            l2: self.template(measurand, Some(phases[1])),
            l3: self.template(measurand, Some(phases[2])),
        }
    }

    /// Log a sample above its bound. `debug` forces the log.
    fn check_bound(&self, sampled_value: &SampledValue, bound: f64) {
        let value = sampled_value.numeric_value().unwrap_or(f64::NAN);
        if value > bound || self.debug {
            let phase = sampled_value
                .phase
                .map(|phase| format!("phase: {phase}, "))
                .unwrap_or_default();
            tracing::error!(
                "{} | MeterValues measurand {}: {}connectorId {}, transaction {:?}, value: {}/{}",
                self.info.charging_station_id,
                sampled_value.measurand(),
                phase,
                self.connector_id,
                self.connector.transaction_id,
                sampled_value.value,
                bound
            );
        }
    }

    fn state_of_charge<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        out: &mut Vec<SampledValue>,
    ) -> Result<(), TelemetryError> {
        let Some(template) = self.template(Measurand::StateOfCharge, None) else {
            return Ok(());
        };
        let value = match template_baseline(template)? {
            Some(baseline) => {
                random_float_fluctuated_rounded(rng, baseline, template.fluctuation_percent())?
            }
            None => random_int(rng, 100) as f64,
        };
        let sampled_value = build_sampled_value(template, value, None, None);
        self.check_bound(&sampled_value, 100.0);
        out.push(sampled_value);
        Ok(())
    }

    fn voltage<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        out: &mut Vec<SampledValue>,
    ) -> Result<(), TelemetryError> {
        let Some(template) = self.template(Measurand::Voltage, None) else {
            return Ok(());
        };
        let baseline = template_baseline(template)?.unwrap_or(self.info.voltage_out);
        let fluctuation_percent = template.fluctuation_percent();
        let three_phase = self.info.number_of_phases == 3;

        if !three_phase || self.info.main_voltage_meter_values {
            let value = random_float_fluctuated_rounded(rng, baseline, fluctuation_percent)?;
            out.push(build_sampled_value(template, value, None, None));
        }
        if !three_phase {
            return Ok(());
        }
        for (line_to_neutral, line_to_line) in Phase::LINE_TO_NEUTRAL.into_iter().zip(Phase::LINE_TO_LINE) {
            let own = self.template(Measurand::Voltage, Some(line_to_neutral));
            let value = match own {
                Some(own) => random_float_fluctuated_rounded(
                    rng,
                    template_baseline(own)?.unwrap_or(self.info.voltage_out),
                    own.fluctuation_percent(),
                )?,
                None => random_float_fluctuated_rounded(rng, baseline, fluctuation_percent)?,
            };
            out.push(build_sampled_value(
                own.unwrap_or(template),
                value,
                None,
                Some(line_to_neutral),
            ));

            let own = self.template(Measurand::Voltage, Some(line_to_line));
            let value = match own {
                Some(own) => random_float_fluctuated_rounded(
                    rng,
                    template_baseline(own)?.unwrap_or(VOLTAGE_LINE_TO_LINE),
                    own.fluctuation_percent(),
                )?,
                None => random_float_fluctuated_rounded(rng, VOLTAGE_LINE_TO_LINE, fluctuation_percent)?,
            };
            out.push(build_sampled_value(
                own.unwrap_or(template),
                value,
                None,
                Some(line_to_line),
            ));
        }
        Ok(())
    }

    fn power<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        out: &mut Vec<SampledValue>,
    ) -> Result<(), TelemetryError> {
        let Some(template) = self.template(Measurand::PowerActiveImport, None) else {
            return Ok(());
        };
        check_power_divider(self.info, template.measurand())?;
        let per_phase = self.phase_templates(Measurand::PowerActiveImport, Phase::LINE_TO_NEUTRAL);
        let values = power_values(self.info, template, &per_phase, rng)?;

        let unit_divider = unit_divider(template, Unit::KiloWatt);
        let max_power = (self.info.max_power / self.info.power_divider).round();
        let sampled_value = build_sampled_value(template, values.all_phases, None, None);
        self.check_bound(&sampled_value, round_to(max_power / unit_divider, 2));
        out.push(sampled_value);

        if self.info.current_out_type == CurrentOutType::Ac && self.info.number_of_phases == 3 {
            let max_power_per_phase = (self.info.max_power / self.info.power_divider / 3.0).round();
            for (index, phase) in Phase::LINE_TO_NEUTRAL.into_iter().enumerate() {
                let sampled_value = build_sampled_value(
                    per_phase.phase(index).unwrap_or(template),
                    values.phase(index),
                    None,
                    Some(phase),
                );
                self.check_bound(&sampled_value, round_to(max_power_per_phase / unit_divider, 2));
                out.push(sampled_value);
            }
        }
        Ok(())
    }

    fn current<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        out: &mut Vec<SampledValue>,
    ) -> Result<(), TelemetryError> {
        let Some(template) = self.template(Measurand::CurrentImport, None) else {
            return Ok(());
        };
        check_power_divider(self.info, template.measurand())?;
        let per_phase = self.phase_templates(Measurand::CurrentImport, Phase::LINES);
        let values = current_values(self.info, template, &per_phase, rng)?;
        let max_amperage = max_amperage(self.info, template.measurand())?;

        let sampled_value = build_sampled_value(template, values.all_phases, None, None);
        self.check_bound(&sampled_value, max_amperage);
        out.push(sampled_value);

        if self.info.current_out_type == CurrentOutType::Ac && self.info.number_of_phases == 3 {
            for (index, phase) in Phase::LINES.into_iter().enumerate() {
                let sampled_value = build_sampled_value(
                    per_phase.phase(index).unwrap_or(template),
                    values.phase(index),
                    None,
                    Some(phase),
                );
                self.check_bound(&sampled_value, max_amperage);
                out.push(sampled_value);
            }
        }
        Ok(())
    }
}

fn energy_template(
    station: &ChargingStation,
    connector_id: u32,
) -> Result<SampledValueTemplate, TelemetryError> {
    let connector = station.connector(connector_id)?;
    sampled_value_template(
        station.info(),
        connector,
        Measurand::EnergyActiveImportRegister,
        None,
    )
    .cloned()
    .ok_or_else(|| {
        let error = TelemetryError::MissingDefaultTemplate {
            measurand: Measurand::EnergyActiveImportRegister,
            connector_id,
        };
        tracing::error!("{} {}", station.log_prefix(), error);
        error
    })
}

/// Advance the connector energy registers by one tick and sample them.
fn energy<R: Rng + ?Sized>(
    station: &mut ChargingStation,
    connector_id: u32,
    transaction_id: Option<i32>,
    interval: Duration,
    rng: &mut R,
    debug: bool,
) -> Result<SampledValue, TelemetryError> {
    let template = energy_template(station, connector_id)?;
    let info = station.info();
    check_power_divider(info, template.measurand())?;
    let unit_divider = unit_divider(&template, Unit::KiloWattHour);
    let interval_ms = interval.as_millis() as f64;
    let tick_energy = match template_baseline(&template)? {
        Some(baseline) => {
            random_float_fluctuated_rounded(rng, baseline, template.fluctuation_percent())?
        }
        None => {
            let max_tick_energy = (info.max_power / (info.power_divider * 3_600_000.0) * interval_ms).round();
            random_int(rng, max_tick_energy as u64) as f64
        }
    };
    let max_energy = (info.max_power * 3600.0 / (info.power_divider * interval_ms)).round();
    let max_energy_rounded = round_to(max_energy / unit_divider, 4);

    station.connector_mut(connector_id)?.accumulate_energy(tick_energy);
    let register = station.energy_active_import_register(connector_id)?;
    let sampled_value = build_sampled_value(&template, round_to(register / unit_divider, 4), None, None);
    if round_to(register / unit_divider, 4) > max_energy_rounded || debug {
        tracing::error!(
            "{} MeterValues measurand {}: connectorId {}, transaction {:?}, value: {}/{}",
            station.log_prefix(),
            sampled_value.measurand(),
            connector_id,
            transaction_id,
            sampled_value.value,
            max_energy_rounded
        );
    }
    Ok(sampled_value)
}

/// Build the meter value of one sampling tick on a connector.
///
/// This advances the connector energy registers. Samples above their bound
/// are logged but reported unchanged; `debug` logs every sample.
pub fn build_meter_value<R: Rng + ?Sized>(
    station: &mut ChargingStation,
    connector_id: u32,
    transaction_id: Option<i32>,
    interval: Duration,
    rng: &mut R,
    debug: bool,
) -> Result<MeterValue, TelemetryError> {
    let mut meter_value = MeterValue::now();
    {
        let sampler = Sampler {
            info: station.info(),
            connector: station.connector(connector_id)?,
            connector_id,
            debug,
        };
        sampler.state_of_charge(rng, &mut meter_value.sampled_value)?;
        sampler.voltage(rng, &mut meter_value.sampled_value)?;
        sampler.power(rng, &mut meter_value.sampled_value)?;
        sampler.current(rng, &mut meter_value.sampled_value)?;
    }
    let energy = energy(station, connector_id, transaction_id, interval, rng, debug)?;
    meter_value.sampled_value.push(energy);
    Ok(meter_value)
}

fn build_transaction_meter_value(
    station: &ChargingStation,
    connector_id: u32,
    meter: f64,
    context: ReadingContext,
) -> Result<MeterValue, TelemetryError> {
    let template = energy_template(station, connector_id)?;
    let unit_divider = unit_divider(&template, Unit::KiloWattHour);
    let mut meter_value = MeterValue::now();
    meter_value.sampled_value.push(build_sampled_value(
        &template,
        round_to(meter / unit_divider, 4),
        Some(context),
        None,
    ));
    Ok(meter_value)
}

/// Energy reading taken when a transaction starts.
pub fn build_transaction_begin_meter_value(
    station: &ChargingStation,
    connector_id: u32,
    meter_begin: f64,
) -> Result<MeterValue, TelemetryError> {
    build_transaction_meter_value(
        station,
        connector_id,
        meter_begin,
        ReadingContext::TransactionBegin,
    )
}

/// Energy reading taken when a transaction stops.
pub fn build_transaction_end_meter_value(
    station: &ChargingStation,
    connector_id: u32,
    meter_stop: f64,
) -> Result<MeterValue, TelemetryError> {
    build_transaction_meter_value(
        station,
        connector_id,
        meter_stop,
        ReadingContext::TransactionEnd,
    )
}

pub fn build_transaction_data_meter_values(begin: &MeterValue, end: &MeterValue) -> Vec<MeterValue> {
    vec![begin.clone(), end.clone()]
}
