use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::{ChargePointStatus, ChargingStation, RegistrationStatus, StationError};

/// A station shared between its own tasks. Never held across an await.
pub type SharedStation = Arc<Mutex<ChargingStation>>;

pub fn lock_station(station: &SharedStation) -> MutexGuard<'_, ChargingStation> {
    station.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorSnapshot {
    pub connector_id: u32,
    pub status: ChargePointStatus,
    pub transaction_id: Option<i32>,
    pub energy_active_import_register_value: Option<f64>,
    pub transaction_energy_active_import_register_value: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StationSnapshot {
    pub charging_station_id: String,
    pub registration: Option<RegistrationStatus>,
    pub connectors: Vec<ConnectorSnapshot>,
}

impl From<&ChargingStation> for StationSnapshot {
    fn from(station: &ChargingStation) -> Self {
        let connectors = station
            .physical_connector_ids()
            .into_iter()
            .filter_map(|connector_id| {
                let connector = station.connector(connector_id).ok()?;
                Some(ConnectorSnapshot {
                    connector_id,
                    status: connector.status,
                    transaction_id: connector.transaction_id,
                    energy_active_import_register_value: connector
                        .energy_active_import_register_value(),
                    transaction_energy_active_import_register_value: connector
                        .transaction_energy_active_import_register_value(),
                })
            })
            .collect();
        StationSnapshot {
            charging_station_id: station.station_id().to_string(),
            registration: station.registration(),
            connectors,
        }
    }
}

/// Every station running in the process, keyed by station id.
#[derive(Debug, Clone, Default)]
pub struct StationRegistry {
    stations: Arc<RwLock<BTreeMap<String, SharedStation>>>,
}

impl StationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a station. A station id already in use is rejected and the
    /// registered station is kept.
    pub fn register(&self, station: SharedStation) -> Result<(), StationError> {
        let station_id = lock_station(&station).station_id().to_string();
        let mut stations = self.stations.write().unwrap_or_else(PoisonError::into_inner);
        match stations.entry(station_id) {
            Entry::Occupied(entry) => Err(StationError::DuplicateStation {
                station_id: entry.key().clone(),
            }),
            Entry::Vacant(entry) => {
                tracing::info!("Registering station {}", entry.key());
                entry.insert(station);
                Ok(())
            }
        }
    }

    pub fn get(&self, station_id: &str) -> Option<SharedStation> {
        self.stations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(station_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.stations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self, station_id: &str) -> Option<StationSnapshot> {
        self.get(station_id)
            .map(|station| StationSnapshot::from(&*lock_station(&station)))
    }

    pub fn snapshots(&self) -> Vec<StationSnapshot> {
        let stations: Vec<SharedStation> = self
            .stations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        stations
            .iter()
            .map(|station| StationSnapshot::from(&*lock_station(station)))
            .collect()
    }
}
