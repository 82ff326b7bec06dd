//! Worker hosts: one OS thread per host, each driving a current-thread tokio
//! runtime on which its stations interleave.

use std::sync::atomic::AtomicI32;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use evsim_core::{ChargingStation, SharedStation, StationError, StationRegistry};
use evsim_engine::{LoopbackCentralSystem, RequestService, StationRuntime, StationSettings};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::bootstrap::{Host, HostFactory, LaunchError, StationLaunch};

/// State shared by every station of the fleet, whatever worker runs it.
#[derive(Clone)]
struct Fleet {
    registry: StationRegistry,
    request_timeout: Duration,
    /// Transaction ids are unique across the fleet
    next_transaction_id: Arc<AtomicI32>,
}

impl Fleet {
    /// Register the station and connect it to its central system.
    fn connect(
        &self,
        station: ChargingStation,
    ) -> Result<(RequestService, mpsc::UnboundedReceiver<String>), StationError> {
        let heartbeat_interval = station.info().heartbeat_interval;
        let station: SharedStation = Arc::new(Mutex::new(station));
        self.registry.register(station.clone())?;

        let (central_system, inbound) = LoopbackCentralSystem::new(heartbeat_interval);
        let central_system = central_system.with_transaction_ids(self.next_transaction_id.clone());
        let service =
            RequestService::new(station, Arc::new(central_system)).with_timeout(self.request_timeout);
        Ok((service, inbound))
    }
}

pub struct WorkerFactory {
    fleet: Fleet,
}

impl WorkerFactory {
    pub fn new(registry: StationRegistry, request_timeout: Duration) -> Self {
        WorkerFactory {
            fleet: Fleet {
                registry,
                request_timeout,
                next_transaction_id: Arc::new(AtomicI32::new(1)),
            },
        }
    }
}

impl HostFactory for WorkerFactory {
    type Host = Worker;

    fn create_host(&mut self, index: usize, first: StationLaunch) -> Result<Worker, LaunchError> {
        Ok(Worker {
            index,
            fleet: self.fleet.clone(),
            queued: vec![first],
            sender: None,
            thread: None,
        })
    }
}

pub struct Worker {
    index: usize,
    fleet: Fleet,
    /// Stations added before the worker started
    queued: Vec<StationLaunch>,
    sender: Option<mpsc::UnboundedSender<StationLaunch>>,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    fn shutdown(&mut self) {
        // Closing the channel ends the worker loop
        self.sender = None;
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("Worker {} panicked", self.index);
            }
        }
    }
}

impl Host for Worker {
    fn start(&mut self) -> Result<(), LaunchError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let index = self.index;
        let fleet = self.fleet.clone();
        let thread = std::thread::Builder::new()
            .name(format!("evsim-worker-{index}"))
            .spawn(move || run_worker(index, receiver, fleet))
            .map_err(|error| LaunchError::HostSpawn {
                host: index,
                reason: error.to_string(),
            })?;
        self.thread = Some(thread);
        self.sender = Some(sender);
        for launch in std::mem::take(&mut self.queued) {
            self.add_station(launch)?;
        }
        Ok(())
    }

    fn add_station(&mut self, launch: StationLaunch) -> Result<(), LaunchError> {
        match &self.sender {
            Some(sender) => sender
                .send(launch)
                .map_err(|_| LaunchError::HostClosed { host: self.index }),
            None => {
                self.queued.push(launch);
                Ok(())
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(index: usize, mut receiver: mpsc::UnboundedReceiver<StationLaunch>, fleet: Fleet) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(error) => {
            tracing::error!("Worker {} could not build its runtime: {}", index, error);
            return;
        }
    };
    runtime.block_on(async move {
        let mut stations = JoinSet::new();
        while let Some(launch) = receiver.recv().await {
            stations.spawn(launch_station(launch, fleet.clone()));
        }
        tracing::info!("Worker {} stopping {} station(s)", index, stations.len());
        stations.shutdown().await;
    });
}

async fn launch_station(launch: StationLaunch, fleet: Fleet) {
    let station_id = launch.template.station_id(launch.index);
    let (service, inbound) = match fleet.connect(launch.template.build_station(launch.index)) {
        Ok(connected) => connected,
        Err(error) => {
            tracing::error!("Station {} not started: {}", station_id, error);
            return;
        }
    };
    let settings = StationSettings::from(launch.template.as_ref());
    let runtime = Arc::new(StationRuntime::new(Arc::new(service), settings));
    runtime.run(inbound).await;
}
