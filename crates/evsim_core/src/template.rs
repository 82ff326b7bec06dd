use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    ChargingStation, ConnectorStatus, CurrentOutType, Measurand, SampledValueTemplate, StationInfo,
};

const DEFAULT_AC_VOLTAGE: f64 = 230.0;
const DEFAULT_DC_VOLTAGE: f64 = 400.0;

fn default_true() -> bool {
    true
}

fn default_interval() -> u64 {
    60
}

fn default_registration_retry_interval() -> u64 {
    30
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorTemplate {
    #[serde(rename = "MeterValues", default)]
    pub meter_values: Vec<SampledValueTemplate>,
}

/// Settings of the automatic transaction generator. Durations are in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AutomaticTransactionGeneratorConfig {
    pub enable: bool,
    pub min_duration: u64,
    pub max_duration: u64,
    pub min_delay_between_two_transactions: u64,
    pub max_delay_between_two_transactions: u64,
    pub probability_of_start: f64,
    pub require_authorize: bool,
    pub id_tags: Vec<String>,
}

impl Default for AutomaticTransactionGeneratorConfig {
    fn default() -> Self {
        AutomaticTransactionGeneratorConfig {
            enable: false,
            min_duration: 60,
            max_duration: 120,
            min_delay_between_two_transactions: 15,
            max_delay_between_two_transactions: 30,
            probability_of_start: 1.0,
            require_authorize: true,
            id_tags: Vec::new(),
        }
    }
}

/// Station template file, shared by every station launched from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StationTemplate {
    pub base_name: String,
    pub charge_point_model: String,
    pub charge_point_vendor: String,
    pub charge_box_serial_number_prefix: Option<String>,
    pub charge_point_serial_number_prefix: Option<String>,
    pub firmware_version: Option<String>,
    pub iccid: Option<String>,
    pub imsi: Option<String>,
    pub meter_serial_number: Option<String>,
    pub meter_type: Option<String>,
    /// Station power in W
    pub power: f64,
    #[serde(default)]
    pub power_shared_by_connectors: bool,
    pub number_of_phases: Option<u8>,
    #[serde(default)]
    pub current_out_type: CurrentOutType,
    pub voltage_out: Option<f64>,
    #[serde(default = "default_true")]
    pub main_voltage_meter_values: bool,
    #[serde(default)]
    pub begin_end_meter_values: bool,
    #[serde(default)]
    pub out_of_order_end_meter_values: bool,
    #[serde(default)]
    pub transaction_data_meter_values: bool,
    #[serde(default = "default_true")]
    pub metering_per_transaction: bool,
    pub meter_values_sampled_data: Option<Vec<Measurand>>,
    #[serde(default = "default_interval")]
    pub meter_value_sample_interval: u64,
    #[serde(default = "default_interval")]
    pub heartbeat_interval: u64,
    /// Unlimited when absent
    pub registration_max_retries: Option<u32>,
    #[serde(default = "default_registration_retry_interval")]
    pub registration_retry_interval: u64,
    #[serde(rename = "Connectors", default)]
    pub connectors: BTreeMap<u32, ConnectorTemplate>,
    #[serde(rename = "AutomaticTransactionGenerator", default)]
    pub automatic_transaction_generator: AutomaticTransactionGeneratorConfig,
}

impl StationTemplate {
    pub fn station_id(&self, index: u32) -> String {
        format!("{}-{:04}", self.base_name, index)
    }

    fn physical_connector_count(&self) -> usize {
        self.connectors.keys().filter(|id| **id > 0).count()
    }

    fn number_of_phases(&self) -> u8 {
        self.number_of_phases.unwrap_or(match self.current_out_type {
            CurrentOutType::Dc => 0,
            _ => 3,
        })
    }

    fn voltage_out(&self) -> f64 {
        self.voltage_out.unwrap_or(match self.current_out_type {
            CurrentOutType::Ac => DEFAULT_AC_VOLTAGE,
            CurrentOutType::Dc => DEFAULT_DC_VOLTAGE,
            CurrentOutType::Unsupported(_) => 0.0,
        })
    }

    /// Measurands found in the connector templates, in order of appearance.
    fn sampled_measurands(&self) -> Vec<Measurand> {
        let mut measurands = Vec::new();
        for connector in self.connectors.values() {
            for template in &connector.meter_values {
                if !measurands.contains(&template.measurand()) {
                    measurands.push(template.measurand());
                }
            }
        }
        measurands
    }

    pub fn station_info(&self, index: u32) -> StationInfo {
        let power_divider = if self.power_shared_by_connectors {
            self.physical_connector_count().max(1) as f64
        } else {
            1.0
        };
        StationInfo {
            charging_station_id: self.station_id(index),
            charge_point_model: self.charge_point_model.clone(),
            charge_point_vendor: self.charge_point_vendor.clone(),
            charge_box_serial_number: self
                .charge_box_serial_number_prefix
                .as_ref()
                .map(|prefix| format!("{prefix}{index:04}")),
            charge_point_serial_number: self
                .charge_point_serial_number_prefix
                .as_ref()
                .map(|prefix| format!("{prefix}{index:04}")),
            firmware_version: self.firmware_version.clone(),
            iccid: self.iccid.clone(),
            imsi: self.imsi.clone(),
            meter_serial_number: self.meter_serial_number.clone(),
            meter_type: self.meter_type.clone(),
            max_power: self.power,
            power_divider,
            number_of_phases: self.number_of_phases(),
            current_out_type: self.current_out_type.clone(),
            voltage_out: self.voltage_out(),
            main_voltage_meter_values: self.main_voltage_meter_values,
            begin_end_meter_values: self.begin_end_meter_values,
            out_of_order_end_meter_values: self.out_of_order_end_meter_values,
            transaction_data_meter_values: self.transaction_data_meter_values,
            metering_per_transaction: self.metering_per_transaction,
            meter_values_sampled_data: self
                .meter_values_sampled_data
                .clone()
                .unwrap_or_else(|| self.sampled_measurands()),
            meter_value_sample_interval: self.meter_value_sample_interval,
            heartbeat_interval: self.heartbeat_interval,
        }
    }

    /// Instantiate the `index`-th station of this template.
    ///
    /// Connector 0 always exists, even when the template omits it.
    pub fn build_station(&self, index: u32) -> ChargingStation {
        let mut connectors: BTreeMap<u32, ConnectorStatus> = self
            .connectors
            .iter()
            .map(|(id, connector)| (*id, ConnectorStatus::new(connector.meter_values.clone())))
            .collect();
        connectors
            .entry(0)
            .or_insert_with(|| ConnectorStatus::new(Vec::new()));
        let station = ChargingStation::new(self.station_info(index), connectors);
        tracing::info!(
            "{} Built station with {} connector(s) from template {}",
            station.log_prefix(),
            self.physical_connector_count(),
            self.base_name
        );
        station
    }
}
