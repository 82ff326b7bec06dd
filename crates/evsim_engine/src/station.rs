//! Lifecycle of one simulated station: registration, heartbeats, connector
//! status and the automatic transaction generator.

use std::sync::Arc;
use std::time::Duration;

use evsim_core::{
    AutomaticTransactionGeneratorConfig, ChargePointStatus, RegistrationStatus, StationTemplate,
    lock_station,
};
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::{
    AuthorizationStatus, ChargePointErrorCode, RequestError, RequestService,
    StopTransactionReason,
};

/// Station-level settings taken from the template.
#[derive(Debug, Clone)]
pub struct StationSettings {
    /// Unlimited when absent
    pub registration_max_retries: Option<u32>,
    pub registration_retry_interval: Duration,
    pub automatic_transaction_generator: AutomaticTransactionGeneratorConfig,
}

impl From<&StationTemplate> for StationSettings {
    fn from(template: &StationTemplate) -> Self {
        StationSettings {
            registration_max_retries: template.registration_max_retries,
            registration_retry_interval: Duration::from_secs(template.registration_retry_interval),
            automatic_transaction_generator: template.automatic_transaction_generator.clone(),
        }
    }
}

/// How one generated transaction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionOutcome {
    /// The start probability draw said no.
    Skipped,
    /// The central system refused the tag or the transaction.
    Refused,
    Completed { transaction_id: i32 },
    /// The central system never answered the stop. The connector
    /// transaction is closed all the same.
    StopUnanswered { transaction_id: i32 },
}

pub struct StationRuntime {
    service: Arc<RequestService>,
    settings: StationSettings,
}

impl StationRuntime {
    pub fn new(service: Arc<RequestService>, settings: StationSettings) -> Self {
        StationRuntime { service, settings }
    }

    pub fn service(&self) -> &Arc<RequestService> {
        &self.service
    }

    fn log_prefix(&self) -> String {
        self.service.log_prefix()
    }

    /// Run the station until every task stops or the runtime shuts down.
    pub async fn run(self: Arc<Self>, mut inbound: mpsc::UnboundedReceiver<String>) {
        let mut tasks = JoinSet::new();
        {
            let service = self.service.clone();
            tasks.spawn(async move {
                while let Some(text) = inbound.recv().await {
                    service.handle_message(&text).await;
                }
            });
        }

        let Some(heartbeat_interval) = self.register().await else {
            tasks.shutdown().await;
            return;
        };

        let connector_ids = lock_station(self.service.station()).physical_connector_ids();
        for connector_id in &connector_ids {
            self.service
                .send_status_notification(
                    *connector_id,
                    ChargePointStatus::Available,
                    ChargePointErrorCode::NoError,
                )
                .await;
        }

        if heartbeat_interval.is_zero() {
            tracing::warn!("{} Heartbeat disabled", self.log_prefix());
        } else {
            let runtime = self.clone();
            tasks.spawn(async move { runtime.heartbeat(heartbeat_interval).await });
        }

        if self.settings.automatic_transaction_generator.enable {
            for connector_id in connector_ids {
                let runtime = self.clone();
                tasks.spawn(async move { runtime.generate_transactions(connector_id).await });
            }
        }

        while let Some(result) = tasks.join_next().await {
            if let Err(error) = result {
                if error.is_panic() {
                    tracing::error!("{} Station task panicked: {}", self.log_prefix(), error);
                }
            }
        }
    }

    /// Send boot notifications until accepted, returning the heartbeat interval.
    pub async fn register(&self) -> Option<Duration> {
        let mut attempts: u32 = 0;
        loop {
            if let Some(response) = self.service.send_boot_notification().await {
                lock_station(self.service.station()).set_registration(response.status);
                if response.status == RegistrationStatus::Accepted {
                    tracing::info!(
                        "{} Registration accepted, heartbeat every {}s",
                        self.log_prefix(),
                        response.interval
                    );
                    let interval = if response.interval > 0 {
                        response.interval
                    } else {
                        lock_station(self.service.station()).info().heartbeat_interval
                    };
                    return Some(Duration::from_secs(interval));
                }
                tracing::warn!(
                    "{} Registration {:?} by the central system",
                    self.log_prefix(),
                    response.status
                );
            }
            attempts += 1;
            if let Some(max_retries) = self.settings.registration_max_retries {
                if attempts > max_retries {
                    tracing::error!(
                        "{} Registration failure: maximum retries reached ({})",
                        self.log_prefix(),
                        max_retries
                    );
                    return None;
                }
            }
            tokio::time::sleep(self.settings.registration_retry_interval).await;
        }
    }

    async fn heartbeat(&self, period: Duration) {
        let mut interval = tokio::time::interval(period);
        // The first tick completes immediately
        interval.tick().await;
        loop {
            interval.tick().await;
            self.service.send_heartbeat().await;
        }
    }

    async fn generate_transactions(&self, connector_id: u32) {
        tracing::info!(
            "{} Automatic transaction generator started on connector {}",
            self.log_prefix(),
            connector_id
        );
        let atg = &self.settings.automatic_transaction_generator;
        loop {
            let delay = random_seconds(
                atg.min_delay_between_two_transactions,
                atg.max_delay_between_two_transactions,
            );
            tokio::time::sleep(delay).await;
            if let Err(error) = self.transaction_cycle(connector_id).await {
                if error.escalates() {
                    tracing::error!(
                        "{} Automatic transaction generator stopped on connector {}: {}",
                        self.log_prefix(),
                        connector_id,
                        error
                    );
                    return;
                }
                tracing::warn!(
                    "{} Transaction on connector {} aborted: {}",
                    self.log_prefix(),
                    connector_id,
                    error
                );
            }
        }
    }

    fn pick_id_tag(&self) -> Option<String> {
        let id_tags = &self.settings.automatic_transaction_generator.id_tags;
        if id_tags.is_empty() {
            return None;
        }
        let index = rand::thread_rng().gen_range(0..id_tags.len());
        Some(id_tags[index].clone())
    }

    /// Run one generated transaction on a connector, from start to stop.
    pub async fn transaction_cycle(&self, connector_id: u32) -> Result<TransactionOutcome, RequestError> {
        let atg = &self.settings.automatic_transaction_generator;
        let draw: f64 = rand::thread_rng().r#gen();
        if draw >= atg.probability_of_start {
            tracing::info!(
                "{} Skipping transaction on connector {}",
                self.log_prefix(),
                connector_id
            );
            return Ok(TransactionOutcome::Skipped);
        }

        let id_tag = self.pick_id_tag();
        if atg.require_authorize {
            let authorized = self
                .service
                .send_authorize(id_tag.as_deref())
                .await
                .is_some_and(|response| response.id_tag_info.status == AuthorizationStatus::Accepted);
            if !authorized {
                return Ok(TransactionOutcome::Refused);
            }
        }

        let Some(started) = self
            .service
            .send_start_transaction(connector_id, id_tag.as_deref())
            .await?
        else {
            return Ok(TransactionOutcome::Refused);
        };
        if started.id_tag_info.status != AuthorizationStatus::Accepted {
            return Ok(TransactionOutcome::Refused);
        }
        let transaction_id = started.transaction_id;
        self.set_status(connector_id, ChargePointStatus::Charging).await;

        let result = self.charge(connector_id, transaction_id).await;
        let stopped = self
            .service
            .send_stop_transaction(transaction_id, Some(StopTransactionReason::Local))
            .await;
        self.set_status(connector_id, ChargePointStatus::Available).await;
        result?;
        match stopped? {
            Some(_) => Ok(TransactionOutcome::Completed { transaction_id }),
            None => Ok(TransactionOutcome::StopUnanswered { transaction_id }),
        }
    }

    /// Sample meter values for a random duration.
    async fn charge(&self, connector_id: u32, transaction_id: i32) -> Result<(), RequestError> {
        let atg = &self.settings.automatic_transaction_generator;
        let duration = random_seconds(atg.min_duration, atg.max_duration);
        let sample_interval = {
            let station = lock_station(self.service.station());
            Duration::from_secs(station.info().meter_value_sample_interval.max(1))
        };
        tracing::info!(
            "{} Transaction {} on connector {} runs for {:?}",
            self.log_prefix(),
            transaction_id,
            connector_id,
            duration
        );

        let deadline = tokio::time::sleep(duration);
        tokio::pin!(deadline);
        let mut interval = tokio::time::interval(sample_interval);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = &mut deadline => return Ok(()),
                _ = interval.tick() => {
                    self.service
                        .send_meter_values(connector_id, Some(transaction_id), sample_interval, false)
                        .await?;
                }
            }
        }
    }

    async fn set_status(&self, connector_id: u32, status: ChargePointStatus) {
        let updated = lock_station(self.service.station()).set_status(connector_id, status);
        if let Err(error) = updated {
            tracing::error!("{} {}", self.log_prefix(), error);
            return;
        }
        self.service
            .send_status_notification(connector_id, status, ChargePointErrorCode::NoError)
            .await;
    }
}

fn random_seconds(min: u64, max: u64) -> Duration {
    let seconds = if max > min {
        rand::thread_rng().gen_range(min..=max)
    } else {
        min
    };
    Duration::from_secs(seconds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LoopbackCentralSystem, Transport, TransportError};
    use async_trait::async_trait;
    use evsim_core::{SharedStation, StationTemplate};
    use std::sync::Mutex;

    const TEMPLATE: &str = r#"
    {
      "baseName": "CS-ATG",
      "chargePointModel": "SIM-AC-22",
      "chargePointVendor": "Simulated",
      "power": 22000,
      "meterValueSampleInterval": 1,
      "registrationMaxRetries": 2,
      "registrationRetryInterval": 0,
      "Connectors": {
        "1": {"MeterValues": [{"unit": "W", "measurand": "Power.Active.Import"}, {"unit": "Wh"}]}
      },
      "AutomaticTransactionGenerator": {
        "enable": true,
        "minDuration": 0,
        "maxDuration": 0,
        "minDelayBetweenTwoTransactions": 0,
        "maxDelayBetweenTwoTransactions": 0,
        "idTags": ["TAG-ATG"]
      }
    }
    "#;

    struct Recorder {
        inner: LoopbackCentralSystem,
        actions: Mutex<Vec<String>>,
        /// Calls of this action are recorded but never answered
        unanswered: Option<&'static str>,
    }

    #[async_trait]
    impl Transport for Recorder {
        async fn send(&self, frame: String) -> Result<(), TransportError> {
            let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
            if let Some(action) = value[2].as_str() {
                self.actions.lock().unwrap().push(action.to_string());
                if self.unanswered == Some(action) {
                    return Ok(());
                }
            }
            self.inner.send(frame).await
        }
    }

    fn runtime(status: RegistrationStatus) -> (Arc<StationRuntime>, Arc<Recorder>) {
        runtime_with(status, None)
    }

    fn runtime_with(
        status: RegistrationStatus,
        unanswered: Option<&'static str>,
    ) -> (Arc<StationRuntime>, Arc<Recorder>) {
        let template: StationTemplate = serde_json::from_str(TEMPLATE).unwrap();
        let station: SharedStation = Arc::new(Mutex::new(template.build_station(1)));
        let (inner, mut inbound) = LoopbackCentralSystem::new(60);
        let recorder = Arc::new(Recorder {
            inner: inner.with_registration_status(status),
            actions: Mutex::new(Vec::new()),
            unanswered,
        });
        let service = Arc::new(
            RequestService::new(station, recorder.clone()).with_timeout(Duration::from_millis(50)),
        );
        {
            let service = service.clone();
            tokio::spawn(async move {
                while let Some(text) = inbound.recv().await {
                    service.handle_message(&text).await;
                }
            });
        }
        let runtime = Arc::new(StationRuntime::new(service, StationSettings::from(&template)));
        (runtime, recorder)
    }

    #[tokio::test]
    async fn test_register_accepted() {
        let (runtime, _) = runtime(RegistrationStatus::Accepted);
        assert_eq!(runtime.register().await, Some(Duration::from_secs(60)));
        assert_eq!(
            lock_station(runtime.service().station()).registration(),
            Some(RegistrationStatus::Accepted)
        );
    }

    #[tokio::test]
    async fn test_register_gives_up_after_max_retries() {
        let (runtime, recorder) = runtime(RegistrationStatus::Rejected);
        assert_eq!(runtime.register().await, None);
        // First attempt plus two retries
        assert_eq!(recorder.actions.lock().unwrap().len(), 3);
        assert_eq!(
            lock_station(runtime.service().station()).registration(),
            Some(RegistrationStatus::Rejected)
        );
    }

    #[tokio::test]
    async fn test_transaction_cycle() {
        let (runtime, recorder) = runtime(RegistrationStatus::Accepted);

        let outcome = runtime.transaction_cycle(1).await.unwrap();
        assert_eq!(outcome, TransactionOutcome::Completed { transaction_id: 1 });
        assert_eq!(
            *recorder.actions.lock().unwrap(),
            vec![
                "Authorize",
                "StartTransaction",
                "StatusNotification",
                "StopTransaction",
                "StatusNotification"
            ]
        );

        let station = lock_station(runtime.service().station());
        let connector = station.connector(1).unwrap();
        assert_eq!(connector.status, ChargePointStatus::Available);
        assert_eq!(connector.transaction_id, None);
    }

    #[tokio::test]
    async fn test_unanswered_stop_keeps_connector_usable() {
        let (runtime, recorder) = runtime_with(RegistrationStatus::Accepted, Some("StopTransaction"));

        for transaction_id in 1..=3 {
            let outcome = runtime.transaction_cycle(1).await.unwrap();
            assert_eq!(outcome, TransactionOutcome::StopUnanswered { transaction_id });
            let station = lock_station(runtime.service().station());
            assert_eq!(station.connector(1).unwrap().transaction_id, None);
        }
        let starts = recorder
            .actions
            .lock()
            .unwrap()
            .iter()
            .filter(|action| *action == "StartTransaction")
            .count();
        assert_eq!(starts, 3);
    }

    #[tokio::test]
    async fn test_run_starts_generator() {
        let (runtime, recorder) = runtime(RegistrationStatus::Accepted);
        let (_central_system, inbound) = LoopbackCentralSystem::new(60);
        let handle = tokio::spawn(runtime.clone().run(inbound));

        for _ in 0..200 {
            if recorder
                .actions
                .lock()
                .unwrap()
                .iter()
                .any(|action| action == "StopTransaction")
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handle.abort();

        let actions = recorder.actions.lock().unwrap().clone();
        assert_eq!(actions[0], "BootNotification");
        assert_eq!(actions[1], "StatusNotification");
        assert!(actions.iter().any(|action| action == "StopTransaction"));
    }
}
