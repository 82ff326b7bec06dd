//! Fleet launch scheduler.
//!
//! Stations are packed onto hosts in order: a new host is created whenever
//! the current one holds `stations_per_host` stations, and the scheduler
//! waits `start_delay` after starting each host.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use evsim_core::StationTemplate;
use thiserror::Error;

use crate::config::StationTemplateUrl;

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("Failed to load station template {file}: {reason}")]
    TemplateLoad { file: String, reason: String },
    #[error("Failed to spawn host {host}: {reason}")]
    HostSpawn { host: usize, reason: String },
    #[error("Host {host} is no longer accepting stations")]
    HostClosed { host: usize },
}

/// One station to start on a host.
#[derive(Debug, Clone)]
pub struct StationLaunch {
    pub template: Arc<StationTemplate>,
    pub index: u32,
}

pub trait Host {
    fn start(&mut self) -> Result<(), LaunchError>;
    fn add_station(&mut self, launch: StationLaunch) -> Result<(), LaunchError>;
}

pub trait HostFactory {
    type Host: Host;

    /// Create a host with `first` as its first occupant. The host is not started.
    fn create_host(&mut self, index: usize, first: StationLaunch) -> Result<Self::Host, LaunchError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchReport {
    NothingToSimulate,
    Started {
        stations: usize,
        hosts: usize,
        /// Stations per host, in creation order
        occupancy: Vec<usize>,
    },
}

pub struct Bootstrap<F: HostFactory> {
    factory: F,
    stations_per_host: usize,
    start_delay: Duration,
    hosts: Vec<F::Host>,
    occupancy: Vec<usize>,
}

impl<F: HostFactory> Bootstrap<F> {
    pub fn new(factory: F, stations_per_host: usize, start_delay: Duration) -> Self {
        Bootstrap {
            factory,
            stations_per_host: stations_per_host.max(1),
            start_delay,
            hosts: Vec::new(),
            occupancy: Vec::new(),
        }
    }

    /// Release the hosts, which stop when dropped.
    pub fn stop(&mut self) {
        tracing::info!("Stopping {} host(s)", self.hosts.len());
        self.hosts.clear();
    }

    async fn open_host(&mut self, launch: StationLaunch) -> Result<(), LaunchError> {
        let index = self.hosts.len();
        let mut host = self.factory.create_host(index, launch)?;
        host.start()?;
        tracing::info!("Host {} started", index);
        self.hosts.push(host);
        self.occupancy.push(1);
        if !self.start_delay.is_zero() {
            tokio::time::sleep(self.start_delay).await;
        }
        Ok(())
    }

    fn add_to_current_host(&mut self, launch: StationLaunch) -> Result<(), LaunchError> {
        let index = self.hosts.len() - 1;
        self.hosts[index].add_station(launch)?;
        self.occupancy[index] += 1;
        Ok(())
    }

    /// Launch every station of every source. A source that fails is logged
    /// and skipped without affecting the others.
    pub async fn start<L, Fut>(&mut self, sources: &[StationTemplateUrl], mut load: L) -> LaunchReport
    where
        L: FnMut(&StationTemplateUrl) -> Fut,
        Fut: Future<Output = anyhow::Result<StationTemplate>>,
    {
        let mut stations = 0;
        let mut counter = 0;
        for source in sources {
            if source.number_of_stations == 0 {
                continue;
            }
            let template = match load(source).await {
                Ok(template) => Arc::new(template),
                Err(error) => {
                    let error = LaunchError::TemplateLoad {
                        file: source.file.display().to_string(),
                        reason: format!("{error:#}"),
                    };
                    tracing::error!("{}", error);
                    continue;
                }
            };
            for index in 1..=source.number_of_stations {
                let launch = StationLaunch {
                    template: template.clone(),
                    index,
                };
                let launched = if self.hosts.is_empty() || counter == self.stations_per_host {
                    let opened = self.open_host(launch).await;
                    if opened.is_ok() {
                        counter = 0;
                    }
                    opened
                } else {
                    self.add_to_current_host(launch)
                };
                if let Err(error) = launched {
                    tracing::error!(
                        "Skipping the remaining stations of {}: {}",
                        source.file.display(),
                        error
                    );
                    break;
                }
                counter += 1;
                stations += 1;
            }
        }

        if stations == 0 {
            tracing::warn!("No charging station to simulate");
            return LaunchReport::NothingToSimulate;
        }
        tracing::info!(
            "Started {} charging station(s) on {} host(s)",
            stations,
            self.hosts.len()
        );
        LaunchReport::Started {
            stations,
            hosts: self.hosts.len(),
            occupancy: self.occupancy.clone(),
        }
    }
}

impl<F> Bootstrap<F>
where
    F: HostFactory + Send + 'static,
    F::Host: Send + 'static,
{
    /// Stop the hosts on the blocking pool, since a host may wait for its
    /// thread when dropped.
    pub async fn shutdown(mut self) {
        let stopped = tokio::task::spawn_blocking(move || self.stop()).await;
        if let Err(error) = stopped {
            tracing::error!("Failed to stop hosts: {}", error);
        }
    }
}
