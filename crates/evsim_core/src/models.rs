use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fluctuation applied around a static template value when the template
/// does not carry its own percentage.
pub const DEFAULT_FLUCTUATION_PERCENT: f64 = 5.0;

/// Nominal line-to-line voltage used when no template is configured for it.
pub const VOLTAGE_LINE_TO_LINE: f64 = 400.0;

/// Identity tag sent when no tag is supplied by the caller.
pub const DEFAULT_ID_TAG: &str = "00000000";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Measurand {
    #[serde(rename = "SoC")]
    StateOfCharge,
    Voltage,
    #[serde(rename = "Power.Active.Import")]
    PowerActiveImport,
    #[serde(rename = "Current.Import")]
    CurrentImport,
    #[default]
    #[serde(rename = "Energy.Active.Import.Register")]
    EnergyActiveImportRegister,
}

impl fmt::Display for Measurand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Measurand::StateOfCharge => "SoC",
            Measurand::Voltage => "Voltage",
            Measurand::PowerActiveImport => "Power.Active.Import",
            Measurand::CurrentImport => "Current.Import",
            Measurand::EnergyActiveImportRegister => "Energy.Active.Import.Register",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    L1,
    L2,
    L3,
    N,
    #[serde(rename = "L1-N")]
    L1N,
    #[serde(rename = "L2-N")]
    L2N,
    #[serde(rename = "L3-N")]
    L3N,
    #[serde(rename = "L1-L2")]
    L1L2,
    #[serde(rename = "L2-L3")]
    L2L3,
    #[serde(rename = "L3-L1")]
    L3L1,
}

impl Phase {
    pub const LINES: [Phase; 3] = [Phase::L1, Phase::L2, Phase::L3];
    pub const LINE_TO_NEUTRAL: [Phase; 3] = [Phase::L1N, Phase::L2N, Phase::L3N];
    /// `L{n}-L{n+1}`, wrapping the last line back to the first.
    pub const LINE_TO_LINE: [Phase; 3] = [Phase::L1L2, Phase::L2L3, Phase::L3L1];
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::L1 => "L1",
            Phase::L2 => "L2",
            Phase::L3 => "L3",
            Phase::N => "N",
            Phase::L1N => "L1-N",
            Phase::L2N => "L2-N",
            Phase::L3N => "L3-N",
            Phase::L1L2 => "L1-L2",
            Phase::L2L3 => "L2-L3",
            Phase::L3L1 => "L3-L1",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Unit {
    #[serde(rename = "Wh")]
    WattHour,
    #[serde(rename = "kWh")]
    KiloWattHour,
    #[serde(rename = "W")]
    Watt,
    #[serde(rename = "kW")]
    KiloWatt,
    #[serde(rename = "A")]
    Amp,
    #[serde(rename = "V")]
    Volt,
    Celsius,
    Percent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadingContext {
    #[serde(rename = "Interruption.Begin")]
    InterruptionBegin,
    #[serde(rename = "Interruption.End")]
    InterruptionEnd,
    Other,
    #[serde(rename = "Sample.Clock")]
    SampleClock,
    #[serde(rename = "Sample.Periodic")]
    SamplePeriodic,
    #[serde(rename = "Transaction.Begin")]
    TransactionBegin,
    #[serde(rename = "Transaction.End")]
    TransactionEnd,
    Trigger,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Location {
    Body,
    Cable,
    #[serde(rename = "EV")]
    Ev,
    Inlet,
    Outlet,
}

/// Electrical output of a station.
///
/// Templates are free-form, so an unknown value is kept as-is and only
/// rejected when a measurand actually depends on it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CurrentOutType {
    #[default]
    Ac,
    Dc,
    Unsupported(String),
}

impl From<String> for CurrentOutType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "AC" => CurrentOutType::Ac,
            "DC" => CurrentOutType::Dc,
            _ => CurrentOutType::Unsupported(value),
        }
    }
}

impl From<CurrentOutType> for String {
    fn from(value: CurrentOutType) -> Self {
        value.to_string()
    }
}

impl fmt::Display for CurrentOutType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CurrentOutType::Ac => f.write_str("AC"),
            CurrentOutType::Dc => f.write_str("DC"),
            CurrentOutType::Unsupported(other) => f.write_str(other),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChargePointStatus {
    #[default]
    Available,
    Preparing,
    Charging,
    #[serde(rename = "SuspendedEVSE")]
    SuspendedEvse,
    #[serde(rename = "SuspendedEV")]
    SuspendedEv,
    Finishing,
    Reserved,
    Unavailable,
    Faulted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistrationStatus {
    Accepted,
    Pending,
    Rejected,
}

/// Configuration describing how one measurand (optionally on one phase) is
/// simulated on a connector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SampledValueTemplate {
    /// Static baseline, as written in the template file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub measurand: Option<Measurand>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<Unit>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<ReadingContext>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fluctuation_percent: Option<f64>,
}

impl SampledValueTemplate {
    /// Measurand of the template; templates without one describe the energy register.
    pub fn measurand(&self) -> Measurand {
        self.measurand.unwrap_or_default()
    }

    pub fn fluctuation_percent(&self) -> f64 {
        self.fluctuation_percent
            .unwrap_or(DEFAULT_FLUCTUATION_PERCENT)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SampledValue {
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<ReadingContext>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub measurand: Option<Measurand>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<Unit>,
}

impl SampledValue {
    pub fn numeric_value(&self) -> Option<f64> {
        self.value.parse().ok()
    }

    pub fn measurand(&self) -> Measurand {
        self.measurand.unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeterValue {
    pub timestamp: DateTime<Utc>,
    pub sampled_value: Vec<SampledValue>,
}

impl MeterValue {
    pub fn now() -> Self {
        MeterValue {
            timestamp: Utc::now(),
            sampled_value: Vec::new(),
        }
    }
}

/// Static description of a simulated station, resolved from its template.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StationInfo {
    pub charging_station_id: String,
    pub charge_point_model: String,
    pub charge_point_vendor: String,
    pub charge_box_serial_number: Option<String>,
    pub charge_point_serial_number: Option<String>,
    pub firmware_version: Option<String>,
    pub iccid: Option<String>,
    pub imsi: Option<String>,
    pub meter_serial_number: Option<String>,
    pub meter_type: Option<String>,
    /// Maximum power in W
    pub max_power: f64,
    pub power_divider: f64,
    pub number_of_phases: u8,
    pub current_out_type: CurrentOutType,
    /// Output voltage in V
    pub voltage_out: f64,
    pub main_voltage_meter_values: bool,
    pub begin_end_meter_values: bool,
    pub out_of_order_end_meter_values: bool,
    pub transaction_data_meter_values: bool,
    pub metering_per_transaction: bool,
    pub meter_values_sampled_data: Vec<Measurand>,
    /// Sampling interval in seconds
    pub meter_value_sample_interval: u64,
    /// Heartbeat interval in seconds, until the central system imposes one
    pub heartbeat_interval: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorStatus {
    pub status: ChargePointStatus,
    pub transaction_started: bool,
    pub transaction_id: Option<i32>,
    pub id_tag: Option<String>,
    pub(crate) energy_active_import_register_value: Option<f64>,
    pub(crate) transaction_energy_active_import_register_value: Option<f64>,
    pub transaction_begin_meter_value: Option<MeterValue>,
    pub meter_values: Vec<SampledValueTemplate>,
}

impl ConnectorStatus {
    pub fn new(meter_values: Vec<SampledValueTemplate>) -> Self {
        ConnectorStatus {
            status: ChargePointStatus::Available,
            transaction_started: false,
            transaction_id: None,
            id_tag: None,
            energy_active_import_register_value: Some(0.0),
            transaction_energy_active_import_register_value: Some(0.0),
            transaction_begin_meter_value: None,
            meter_values,
        }
    }

    pub fn energy_active_import_register_value(&self) -> Option<f64> {
        self.energy_active_import_register_value
    }

    pub fn transaction_energy_active_import_register_value(&self) -> Option<f64> {
        self.transaction_energy_active_import_register_value
    }

    /// Add the energy delivered during one tick to both registers.
    ///
    /// Both registers restart from zero when either one is unset or negative.
    pub fn accumulate_energy(&mut self, energy: f64) {
        let energy = energy.max(0.0);
        match (
            self.energy_active_import_register_value,
            self.transaction_energy_active_import_register_value,
        ) {
            (Some(total), Some(transaction)) if total >= 0.0 && transaction >= 0.0 => {
                self.energy_active_import_register_value = Some(total + energy);
                self.transaction_energy_active_import_register_value =
                    Some(transaction + energy);
            }
            _ => {
                self.energy_active_import_register_value = Some(0.0);
                self.transaction_energy_active_import_register_value = Some(0.0);
            }
        }
    }
}
