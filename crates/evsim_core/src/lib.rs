pub mod electric;
pub mod meter_values;
mod models;
pub mod random;
mod registry;
mod template;

pub use crate::models::*;
pub use crate::registry::*;
pub use crate::template::*;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StationError {
    #[error("Connector {connector_id} does not exist on the station")]
    ConnectorNotFound { connector_id: u32 },
    #[error("No connector hosts transaction {transaction_id}")]
    TransactionNotFound { transaction_id: i32 },
    #[error("Connector 0 cannot host a transaction")]
    StationLevelConnector,
    #[error("Connector {connector_id} already hosts transaction {transaction_id}")]
    ConnectorBusy {
        connector_id: u32,
        transaction_id: i32,
    },
    #[error("Transaction {transaction_id} is already open on connector {connector_id}")]
    DuplicateTransaction {
        transaction_id: i32,
        connector_id: u32,
    },
    #[error("Station {station_id} is already registered")]
    DuplicateStation { station_id: String },
}

/// Errors raised while computing telemetry. They all point at an unusable
/// device definition.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TelemetryError {
    #[error(
        "Unknown {current_out_type} currentOutType in template file, cannot calculate {measurand} measurand value"
    )]
    UnsupportedCurrentOutType {
        current_out_type: String,
        measurand: Measurand,
    },
    #[error("MeterValues measurand {measurand}: powerDivider have zero or below value {power_divider}")]
    InvalidPowerDivider {
        measurand: Measurand,
        power_divider: f64,
    },
    #[error("Missing MeterValues for default measurand {measurand} in template on connectorId {connector_id}")]
    MissingDefaultTemplate {
        measurand: Measurand,
        connector_id: u32,
    },
    #[error("MeterValues measurand {measurand}: invalid template value '{value}'")]
    InvalidTemplateValue { measurand: Measurand, value: String },
    #[error("Fluctuation percent {fluctuation_percent} is outside 0..=100")]
    InvalidFluctuationPercent { fluctuation_percent: f64 },
    #[error(transparent)]
    Station(#[from] StationError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargingStation {
    info: StationInfo,
    connectors: BTreeMap<u32, ConnectorStatus>,
    registration: Option<RegistrationStatus>,
}

impl ChargingStation {
    pub fn new(info: StationInfo, connectors: BTreeMap<u32, ConnectorStatus>) -> Self {
        ChargingStation {
            info,
            connectors,
            registration: None,
        }
    }

    pub fn info(&self) -> &StationInfo {
        &self.info
    }

    pub fn station_id(&self) -> &str {
        &self.info.charging_station_id
    }

    pub fn log_prefix(&self) -> String {
        format!("{} |", self.info.charging_station_id)
    }

    pub fn registration(&self) -> Option<RegistrationStatus> {
        self.registration
    }

    pub fn set_registration(&mut self, status: RegistrationStatus) {
        self.registration = Some(status);
    }

    pub fn connector(&self, connector_id: u32) -> Result<&ConnectorStatus, StationError> {
        self.connectors
            .get(&connector_id)
            .ok_or(StationError::ConnectorNotFound { connector_id })
    }

    pub fn connector_mut(&mut self, connector_id: u32) -> Result<&mut ConnectorStatus, StationError> {
        self.connectors
            .get_mut(&connector_id)
            .ok_or(StationError::ConnectorNotFound { connector_id })
    }

    /// Ids of the chargeable connectors, in order.
    pub fn physical_connector_ids(&self) -> Vec<u32> {
        self.connectors.keys().copied().filter(|id| *id > 0).collect()
    }

    /// Return the physical connector hosting the given transaction.
    pub fn connector_id_by_transaction(&self, transaction_id: i32) -> Result<u32, StationError> {
        self.connectors
            .iter()
            .find(|(id, connector)| **id > 0 && connector.transaction_id == Some(transaction_id))
            .map(|(id, _)| *id)
            .ok_or(StationError::TransactionNotFound { transaction_id })
    }

    /// Return the energy register reported for the connector.
    ///
    /// This is the per-transaction register when metering per transaction,
    /// the cumulative one otherwise.
    pub fn energy_active_import_register(&self, connector_id: u32) -> Result<f64, StationError> {
        let connector = self.connector(connector_id)?;
        let register = if self.info.metering_per_transaction {
            connector.transaction_energy_active_import_register_value
        } else {
            connector.energy_active_import_register_value
        };
        Ok(register.unwrap_or(0.0))
    }

    pub fn set_status(&mut self, connector_id: u32, status: ChargePointStatus) -> Result<(), StationError> {
        self.connector_mut(connector_id)?.status = status;
        Ok(())
    }

    /// Open a transaction accepted by the central system on a connector.
    pub fn begin_transaction(
        &mut self,
        connector_id: u32,
        transaction_id: i32,
        id_tag: &str,
    ) -> Result<(), StationError> {
        tracing::info!(
            "{} Beginning transaction {} on connector {}",
            self.log_prefix(),
            transaction_id,
            connector_id
        );
        if connector_id == 0 {
            return Err(StationError::StationLevelConnector);
        }
        if let Ok(other) = self.connector_id_by_transaction(transaction_id) {
            return Err(StationError::DuplicateTransaction {
                transaction_id,
                connector_id: other,
            });
        }
        let connector = self.connector_mut(connector_id)?;
        if let Some(current) = connector.transaction_id {
            return Err(StationError::ConnectorBusy {
                connector_id,
                transaction_id: current,
            });
        }
        connector.transaction_started = true;
        connector.transaction_id = Some(transaction_id);
        connector.id_tag = Some(id_tag.to_string());
        connector.transaction_energy_active_import_register_value = Some(0.0);
        Ok(())
    }

    pub fn set_transaction_begin_meter_value(
        &mut self,
        connector_id: u32,
        meter_value: MeterValue,
    ) -> Result<(), StationError> {
        self.connector_mut(connector_id)?.transaction_begin_meter_value = Some(meter_value);
        Ok(())
    }

    /// Close the transaction running on a connector, returning its id.
    pub fn end_transaction(&mut self, connector_id: u32) -> Result<Option<i32>, StationError> {
        let prefix = self.log_prefix();
        let connector = self.connector_mut(connector_id)?;
        let transaction_id = connector.transaction_id.take();
        if let Some(transaction_id) = transaction_id {
            tracing::info!(
                "{} Ending transaction {} on connector {}",
                prefix,
                transaction_id,
                connector_id
            );
        }
        connector.transaction_started = false;
        connector.id_tag = None;
        connector.transaction_energy_active_import_register_value = Some(0.0);
        connector.transaction_begin_meter_value = None;
        Ok(transaction_id)
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;

    pub(crate) fn default_info() -> StationInfo {
        StationInfo {
            charging_station_id: "CS-SIM-0001".into(),
            charge_point_model: "SIM-AC-22".into(),
            charge_point_vendor: "Simulated".into(),
            charge_box_serial_number: None,
            charge_point_serial_number: None,
            firmware_version: None,
            iccid: None,
            imsi: None,
            meter_serial_number: None,
            meter_type: None,
            max_power: 22_000.0,
            power_divider: 1.0,
            number_of_phases: 3,
            current_out_type: CurrentOutType::Ac,
            voltage_out: 230.0,
            main_voltage_meter_values: true,
            begin_end_meter_values: false,
            out_of_order_end_meter_values: false,
            transaction_data_meter_values: false,
            metering_per_transaction: true,
            meter_values_sampled_data: vec![
                Measurand::StateOfCharge,
                Measurand::Voltage,
                Measurand::PowerActiveImport,
                Measurand::CurrentImport,
                Measurand::EnergyActiveImportRegister,
            ],
            meter_value_sample_interval: 60,
            heartbeat_interval: 60,
        }
    }

    pub(crate) fn station_with(info: StationInfo, templates: Vec<SampledValueTemplate>) -> ChargingStation {
        let connectors = BTreeMap::from([
            (0, ConnectorStatus::new(vec![])),
            (1, ConnectorStatus::new(templates.clone())),
            (2, ConnectorStatus::new(templates)),
        ]);
        ChargingStation::new(info, connectors)
    }

    fn default_station() -> ChargingStation {
        station_with(default_info(), vec![SampledValueTemplate::default()])
    }

    #[test]
    fn test_begin_and_end_transaction() {
        let mut station = default_station();

        station.begin_transaction(1, 42, "TAG-1").unwrap();
        assert_eq!(station.connector_id_by_transaction(42), Ok(1));
        assert_eq!(station.connector(1).unwrap().id_tag.as_deref(), Some("TAG-1"));

        assert_eq!(station.end_transaction(1), Ok(Some(42)));
        assert_eq!(
            station.connector_id_by_transaction(42),
            Err(StationError::TransactionNotFound { transaction_id: 42 })
        );
        assert!(!station.connector(1).unwrap().transaction_started);
    }

    #[test]
    fn test_connector_zero_never_hosts_transactions() {
        let mut station = default_station();
        assert_eq!(
            station.begin_transaction(0, 1, "TAG"),
            Err(StationError::StationLevelConnector)
        );

        // Even a corrupted connector 0 is never matched by the lookup
        station.connector_mut(0).unwrap().transaction_id = Some(7);
        assert_eq!(
            station.connector_id_by_transaction(7),
            Err(StationError::TransactionNotFound { transaction_id: 7 })
        );
    }

    #[test]
    fn test_one_transaction_per_connector() {
        let mut station = default_station();
        station.begin_transaction(1, 1, "TAG").unwrap();

        match station.begin_transaction(1, 2, "TAG") {
            Err(StationError::ConnectorBusy {
                connector_id,
                transaction_id,
            }) => {
                assert_eq!(connector_id, 1);
                assert_eq!(transaction_id, 1);
            }
            other => panic!("Expected ConnectorBusy error, got {other:?}"),
        }

        // Same transaction id on another connector
        assert_eq!(
            station.begin_transaction(2, 1, "TAG"),
            Err(StationError::DuplicateTransaction {
                transaction_id: 1,
                connector_id: 1
            })
        );

        // Unknown connector
        assert_eq!(
            station.begin_transaction(9, 3, "TAG"),
            Err(StationError::ConnectorNotFound { connector_id: 9 })
        );
    }

    #[test]
    fn test_transaction_register_resets_on_begin() {
        let mut station = default_station();
        station.connector_mut(1).unwrap().accumulate_energy(500.0);

        station.begin_transaction(1, 5, "TAG").unwrap();
        assert_eq!(station.energy_active_import_register(1), Ok(0.0));
        assert_eq!(
            station.connector(1).unwrap().energy_active_import_register_value(),
            Some(500.0)
        );

        station.connector_mut(1).unwrap().accumulate_energy(20.0);
        assert_eq!(station.energy_active_import_register(1), Ok(20.0));
    }

    #[test]
    fn test_cumulative_register_without_metering_per_transaction() {
        let mut info = default_info();
        info.metering_per_transaction = false;
        let mut station = station_with(info, vec![SampledValueTemplate::default()]);
        station.connector_mut(1).unwrap().accumulate_energy(500.0);
        station.begin_transaction(1, 5, "TAG").unwrap();
        station.connector_mut(1).unwrap().accumulate_energy(20.0);
        assert_eq!(station.energy_active_import_register(1), Ok(520.0));
    }
}
