use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use evsim_core::StationTemplate;
use serde::{Deserialize, Serialize};

fn default_stations_per_worker() -> usize {
    1
}

fn default_worker_start_delay() -> u64 {
    500
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

/// One station template and how many stations to launch from it
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StationTemplateUrl {
    /// Template path, relative to the configuration file
    pub file: PathBuf,
    pub number_of_stations: u32,
}

/// Represents the simulator configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulatorConfig {
    #[serde(default)]
    pub station_template_urls: Vec<StationTemplateUrl>,
    #[serde(default = "default_stations_per_worker")]
    pub charging_stations_per_worker: usize,
    /// Delay between two worker starts in ms
    #[serde(default = "default_worker_start_delay")]
    pub worker_start_delay: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
}

impl SimulatorConfig {
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file '{}'", path.display()))
    }

    pub fn log_level(&self) -> anyhow::Result<tracing::Level> {
        self.log_level
            .parse()
            .with_context(|| format!("Invalid log level '{}'", self.log_level))
    }

    pub fn worker_start_delay(&self) -> Duration {
        Duration::from_millis(self.worker_start_delay)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }
}

pub async fn load_template(path: PathBuf) -> anyhow::Result<StationTemplate> {
    let content = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("Failed to read station template '{}'", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse station template '{}'", path.display()))
}
