//! Outbound request engine of one station.
//!
//! Every command allocates a fresh message id, registers a pending entry,
//! hands the CALL frame to the transport and waits for the matching RESULT or
//! ERROR delivered through [`RequestService::handle_message`].
//!
//! Failures are logged with the command name and swallowed at the command
//! boundary. Only telemetry configuration errors and unknown transaction
//! lookups reach the caller.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use evsim_core::meter_values::{
    build_meter_value, build_transaction_begin_meter_value, build_transaction_data_meter_values,
    build_transaction_end_meter_value,
};
use evsim_core::{
    ChargePointStatus, ChargingStation, DEFAULT_ID_TAG, MeterValue, SharedStation, lock_station,
};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::{
    AuthorizationStatus, AuthorizeRequest, AuthorizeResponse, BootNotificationRequest,
    BootNotificationResponse, ChargePointErrorCode, ErrorType, Frame, HeartbeatRequest,
    HeartbeatResponse, MeterValuesRequest, MeterValuesResponse, OcppError, PendingRequests,
    RequestCommand, RequestError, StartTransactionRequest, StartTransactionResponse,
    StatusNotificationRequest, StatusNotificationResponse, StopTransactionReason,
    StopTransactionRequest, StopTransactionResponse, Transport,
};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct RequestService {
    station: SharedStation,
    transport: Arc<dyn Transport>,
    pending: PendingRequests,
    rng: Mutex<StdRng>,
    timeout: Duration,
}

impl RequestService {
    pub fn new(station: SharedStation, transport: Arc<dyn Transport>) -> Self {
        RequestService {
            station,
            transport,
            pending: PendingRequests::default(),
            rng: Mutex::new(StdRng::from_entropy()),
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Seed the telemetry random source.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    pub fn station(&self) -> &SharedStation {
        &self.station
    }

    pub fn pending(&self) -> &PendingRequests {
        &self.pending
    }

    fn lock_station(&self) -> MutexGuard<'_, ChargingStation> {
        lock_station(&self.station)
    }

    fn lock_rng(&self) -> MutexGuard<'_, StdRng> {
        self.rng.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn log_prefix(&self) -> String {
        self.lock_station().log_prefix()
    }

    async fn send_request<Req, Res>(
        &self,
        command: RequestCommand,
        payload: &Req,
    ) -> Result<Res, RequestError>
    where
        Req: Serialize + Sync,
        Res: DeserializeOwned,
    {
        let payload = serde_json::to_value(payload)?;
        let (message_id, completion) = self.pending.register(command);
        let frame = Frame::Call {
            message_id: message_id.clone(),
            action: command.action().to_string(),
            payload,
        };
        if let Err(error) = self.transport.send(frame.to_text()).await {
            self.pending.remove(&message_id);
            return Err(error.into());
        }
        match tokio::time::timeout(self.timeout, completion).await {
            Ok(Ok(Ok(payload))) => Ok(serde_json::from_value(payload)?),
            Ok(Ok(Err(error))) => Err(error.into()),
            // Completion dropped without an answer
            Ok(Err(_)) => Err(crate::TransportError::Closed.into()),
            Err(_) => {
                self.pending.remove(&message_id);
                Err(RequestError::Timeout {
                    command,
                    after: self.timeout,
                })
            }
        }
    }

    fn log_error(&self, command: RequestCommand, error: &RequestError) {
        tracing::error!(
            "{} Request command {} failed: {}",
            self.log_prefix(),
            command,
            error
        );
    }

    /// Run a command, logging and swallowing its failure.
    async fn request<Req, Res>(&self, command: RequestCommand, payload: &Req) -> Option<Res>
    where
        Req: Serialize + Sync,
        Res: DeserializeOwned,
    {
        match self.send_request(command, payload).await {
            Ok(response) => Some(response),
            Err(error) => {
                self.log_error(command, &error);
                None
            }
        }
    }

    fn escalate<T>(&self, command: RequestCommand, error: impl Into<RequestError>) -> Result<T, RequestError> {
        let error = error.into();
        self.log_error(command, &error);
        Err(error)
    }

    pub async fn send_heartbeat(&self) -> Option<HeartbeatResponse> {
        self.request(RequestCommand::Heartbeat, &HeartbeatRequest {})
            .await
    }

    pub async fn send_boot_notification(&self) -> Option<BootNotificationResponse> {
        let payload = BootNotificationRequest::from(self.lock_station().info());
        self.request(RequestCommand::BootNotification, &payload)
            .await
    }

    pub async fn send_status_notification(
        &self,
        connector_id: u32,
        status: ChargePointStatus,
        error_code: ChargePointErrorCode,
    ) -> Option<StatusNotificationResponse> {
        let payload = StatusNotificationRequest {
            connector_id,
            error_code,
            status,
            timestamp: Some(Utc::now()),
        };
        self.request(RequestCommand::StatusNotification, &payload)
            .await
    }

    pub async fn send_authorize(&self, id_tag: Option<&str>) -> Option<AuthorizeResponse> {
        let payload = AuthorizeRequest {
            id_tag: id_tag.unwrap_or(DEFAULT_ID_TAG).to_string(),
        };
        self.request(RequestCommand::Authorize, &payload).await
    }

    /// Start a transaction on a connector.
    ///
    /// On acceptance the connector opens the transaction with a fresh
    /// transaction register and keeps the begin meter value, which is also
    /// sent right away when the station reports begin/end meter values.
    pub async fn send_start_transaction(
        &self,
        connector_id: u32,
        id_tag: Option<&str>,
    ) -> Result<Option<StartTransactionResponse>, RequestError> {
        let command = RequestCommand::StartTransaction;
        let id_tag = id_tag.unwrap_or(DEFAULT_ID_TAG).to_string();
        let register = self.lock_station().energy_active_import_register(connector_id);
        let meter_start = match register {
            Ok(register) => register.round() as i64,
            Err(error) => {
                self.log_error(command, &error.into());
                return Ok(None);
            }
        };
        let payload = StartTransactionRequest {
            connector_id,
            id_tag: id_tag.clone(),
            meter_start,
            timestamp: Utc::now(),
        };
        let Some(response) = self
            .request::<_, StartTransactionResponse>(command, &payload)
            .await
        else {
            return Ok(None);
        };
        if response.id_tag_info.status != AuthorizationStatus::Accepted {
            tracing::warn!(
                "{} Transaction on connector {} refused with status {:?}",
                self.log_prefix(),
                connector_id,
                response.id_tag_info.status
            );
            return Ok(Some(response));
        }

        let opened = {
            let mut station = self.lock_station();
            open_transaction(&mut station, connector_id, response.transaction_id, &id_tag)
        };
        let (begin, begin_end_meter_values) = match opened {
            Ok(opened) => opened,
            Err(error) => return self.escalate(command, error),
        };
        if begin_end_meter_values {
            self.send_transaction_begin_meter_values(connector_id, response.transaction_id, &begin)
                .await;
        }
        Ok(Some(response))
    }

    /// Stop a transaction, wherever it runs on the station.
    ///
    /// An unknown transaction id is a lookup error and nothing is sent.
    /// Otherwise the connector transaction is closed once the exchange is
    /// over, answered or not, and `None` reports a missing answer.
    pub async fn send_stop_transaction(
        &self,
        transaction_id: i32,
        reason: Option<StopTransactionReason>,
    ) -> Result<Option<StopTransactionResponse>, RequestError> {
        let command = RequestCommand::StopTransaction;
        let prepared = {
            let station = self.lock_station();
            prepare_stop(&station, transaction_id)
        };
        let (connector_id, meter_stop, id_tag, begin, end, flags) = match prepared {
            Ok(prepared) => prepared,
            Err(error) => return self.escalate(command, error),
        };

        if flags.begin_end_meter_values && !flags.out_of_order_end_meter_values {
            self.send_transaction_end_meter_values(connector_id, transaction_id, &end)
                .await;
        }
        let transaction_data = flags.transaction_data_meter_values.then(|| match &begin {
            Some(begin) => build_transaction_data_meter_values(begin, &end),
            None => vec![end.clone()],
        });
        let payload = StopTransactionRequest {
            transaction_id,
            id_tag,
            meter_stop: meter_stop.round() as i64,
            timestamp: Utc::now(),
            reason,
            transaction_data,
        };
        let response = self
            .request::<_, StopTransactionResponse>(command, &payload)
            .await;
        if response.is_none() {
            tracing::warn!(
                "{} Transaction {} on connector {} closed without a stop response",
                self.log_prefix(),
                transaction_id,
                connector_id
            );
        }
        let ended = self.lock_station().end_transaction(connector_id);
        if let Err(error) = ended {
            return self.escalate(command, error);
        }
        Ok(response)
    }

    /// Sample and send the meter values of one tick.
    pub async fn send_meter_values(
        &self,
        connector_id: u32,
        transaction_id: Option<i32>,
        interval: Duration,
        debug: bool,
    ) -> Result<Option<MeterValuesResponse>, RequestError> {
        let command = RequestCommand::MeterValues;
        let meter_value = {
            let mut station = self.lock_station();
            let mut rng = self.lock_rng();
            build_meter_value(
                &mut station,
                connector_id,
                transaction_id,
                interval,
                &mut *rng,
                debug,
            )
        };
        let meter_value = match meter_value {
            Ok(meter_value) => meter_value,
            Err(error) => return self.escalate(command, error),
        };
        let payload = MeterValuesRequest {
            connector_id,
            transaction_id,
            meter_value: vec![meter_value],
        };
        Ok(self.request(command, &payload).await)
    }

    pub async fn send_transaction_begin_meter_values(
        &self,
        connector_id: u32,
        transaction_id: i32,
        begin: &MeterValue,
    ) -> Option<MeterValuesResponse> {
        let payload = MeterValuesRequest {
            connector_id,
            transaction_id: Some(transaction_id),
            meter_value: vec![begin.clone()],
        };
        self.request(RequestCommand::MeterValues, &payload).await
    }

    pub async fn send_transaction_end_meter_values(
        &self,
        connector_id: u32,
        transaction_id: i32,
        end: &MeterValue,
    ) -> Option<MeterValuesResponse> {
        let payload = MeterValuesRequest {
            connector_id,
            transaction_id: Some(transaction_id),
            meter_value: vec![end.clone()],
        };
        self.request(RequestCommand::MeterValues, &payload).await
    }

    /// Answer a remote CALL with a CALL_ERROR. No pending entry is created.
    pub async fn send_error(
        &self,
        message_id: &str,
        error: OcppError,
        command: &str,
    ) -> Result<(), RequestError> {
        let frame = Frame::CallError {
            message_id: message_id.to_string(),
            error,
        };
        if let Err(error) = self.transport.send(frame.to_text()).await {
            tracing::error!(
                "{} Send error for command {} failed: {}",
                self.log_prefix(),
                command,
                error
            );
            return Err(error.into());
        }
        Ok(())
    }

    /// Route one inbound frame.
    pub async fn handle_message(&self, text: &str) {
        let frame = match Frame::parse(text) {
            Ok(frame) => frame,
            Err(error) => {
                tracing::error!(
                    "{} Dropping unparseable message {}: {}",
                    self.log_prefix(),
                    text,
                    error
                );
                return;
            }
        };
        match frame {
            Frame::Call {
                message_id, action, ..
            } => {
                tracing::warn!(
                    "{} Remote command {} is not implemented",
                    self.log_prefix(),
                    action
                );
                let error = OcppError::new(
                    ErrorType::NotImplemented,
                    format!("{action} is not implemented"),
                );
                // Already logged
                let _ = self.send_error(&message_id, error, &action).await;
            }
            Frame::CallResult {
                message_id,
                payload,
            } => self.complete(&message_id, Ok(payload)),
            Frame::CallError { message_id, error } => self.complete(&message_id, Err(error)),
        }
    }

    fn complete(&self, message_id: &str, outcome: crate::Completion) {
        match self.pending.remove(message_id) {
            Some(request) => {
                let command = request.command;
                if !request.complete(outcome) {
                    tracing::warn!(
                        "{} Response to {} {} arrived after its caller gave up",
                        self.log_prefix(),
                        command,
                        message_id
                    );
                }
            }
            None => tracing::error!(
                "{} Response to unknown message id {}",
                self.log_prefix(),
                message_id
            ),
        }
    }
}

/// Open an accepted transaction on the connector and record its begin meter value.
fn open_transaction(
    station: &mut ChargingStation,
    connector_id: u32,
    transaction_id: i32,
    id_tag: &str,
) -> Result<(MeterValue, bool), RequestError> {
    station.begin_transaction(connector_id, transaction_id, id_tag)?;
    let meter_begin = station.energy_active_import_register(connector_id)?;
    let begin = build_transaction_begin_meter_value(station, connector_id, meter_begin)?;
    station.set_transaction_begin_meter_value(connector_id, begin.clone())?;
    Ok((begin, station.info().begin_end_meter_values))
}

struct MeterValueFlags {
    begin_end_meter_values: bool,
    out_of_order_end_meter_values: bool,
    transaction_data_meter_values: bool,
}

type PreparedStop = (
    u32,
    f64,
    Option<String>,
    Option<MeterValue>,
    MeterValue,
    MeterValueFlags,
);

fn prepare_stop(station: &ChargingStation, transaction_id: i32) -> Result<PreparedStop, RequestError> {
    let connector_id = station.connector_id_by_transaction(transaction_id)?;
    let meter_stop = station.energy_active_import_register(connector_id)?;
    let end = build_transaction_end_meter_value(station, connector_id, meter_stop)?;
    let connector = station.connector(connector_id)?;
    let info = station.info();
    Ok((
        connector_id,
        meter_stop,
        connector.id_tag.clone(),
        connector.transaction_begin_meter_value.clone(),
        end,
        MeterValueFlags {
            begin_end_meter_values: info.begin_end_meter_values,
            out_of_order_end_meter_values: info.out_of_order_end_meter_values,
            transaction_data_meter_values: info.transaction_data_meter_values,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LoopbackCentralSystem, TransportError};
    use async_trait::async_trait;
    use evsim_core::{
        ConnectorStatus, CurrentOutType, Measurand, RegistrationStatus, SampledValueTemplate,
        StationError, StationInfo, TelemetryError, Unit,
    };
    use serde_json::{Value, json};
    use std::collections::{BTreeMap, HashSet};
    use tokio::sync::mpsc;

    fn test_info() -> StationInfo {
        StationInfo {
            charging_station_id: "CS-TEST-0001".into(),
            charge_point_model: "SIM-AC-22".into(),
            charge_point_vendor: "Simulated".into(),
            charge_box_serial_number: None,
            charge_point_serial_number: Some("CP-0001".into()),
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
                Measurand::Voltage,
                Measurand::PowerActiveImport,
                Measurand::EnergyActiveImportRegister,
            ],
            meter_value_sample_interval: 60,
            heartbeat_interval: 60,
        }
    }

    fn test_station(info: StationInfo) -> SharedStation {
        let templates = vec![
            SampledValueTemplate {
                measurand: Some(Measurand::Voltage),
                unit: Some(Unit::Volt),
                ..Default::default()
            },
            SampledValueTemplate {
                measurand: Some(Measurand::PowerActiveImport),
                unit: Some(Unit::Watt),
                ..Default::default()
            },
            SampledValueTemplate {
                unit: Some(Unit::WattHour),
                ..Default::default()
            },
        ];
        let connectors = BTreeMap::from([
            (0, ConnectorStatus::new(vec![])),
            (1, ConnectorStatus::new(templates.clone())),
            (2, ConnectorStatus::new(templates)),
        ]);
        Arc::new(Mutex::new(ChargingStation::new(info, connectors)))
    }

    /// Records outbound frames and never answers on its own.
    #[derive(Default)]
    struct RecordingTransport {
        frames: Mutex<Vec<String>>,
        fail: bool,
    }

    impl RecordingTransport {
        fn frames(&self) -> Vec<Value> {
            self.frames
                .lock()
                .unwrap()
                .iter()
                .map(|frame| serde_json::from_str(frame).unwrap())
                .collect()
        }

        fn actions(&self) -> Vec<String> {
            self.frames()
                .iter()
                .filter(|frame| frame[0] == 2)
                .map(|frame| frame[2].as_str().unwrap().to_string())
                .collect()
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send(&self, frame: String) -> Result<(), TransportError> {
            if self.fail {
                return Err(TransportError::SendFailed("socket closed".into()));
            }
            self.frames.lock().unwrap().push(frame);
            Ok(())
        }
    }

    /// Loopback central system that also records outbound frames.
    struct RecordingLoopback {
        inner: LoopbackCentralSystem,
        recorder: RecordingTransport,
        /// Calls of this action are recorded but never answered
        unanswered: Option<&'static str>,
    }

    #[async_trait]
    impl Transport for RecordingLoopback {
        async fn send(&self, frame: String) -> Result<(), TransportError> {
            self.recorder.send(frame.clone()).await?;
            if let Some(action) = self.unanswered {
                if frame.contains(&format!(r#""{action}""#)) {
                    return Ok(());
                }
            }
            self.inner.send(frame).await
        }
    }

    /// Service wired to a loopback central system with its inbound router running.
    fn loopback_service(info: StationInfo) -> (Arc<RequestService>, Arc<RecordingLoopback>) {
        let (inner, inbound) = LoopbackCentralSystem::new(300);
        let transport = Arc::new(RecordingLoopback {
            inner,
            recorder: RecordingTransport::default(),
            unanswered: None,
        });
        let service = Arc::new(
            RequestService::new(test_station(info), transport.clone()).with_seed(42),
        );
        spawn_router(service.clone(), inbound);
        (service, transport)
    }

    fn spawn_router(service: Arc<RequestService>, mut inbound: mpsc::UnboundedReceiver<String>) {
        tokio::spawn(async move {
            while let Some(text) = inbound.recv().await {
                service.handle_message(&text).await;
            }
        });
    }

    async fn wait_for_frames(transport: &RecordingTransport, count: usize) -> Vec<Value> {
        for _ in 0..100 {
            let frames = transport.frames();
            if frames.len() >= count {
                return frames;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("Expected {count} frames");
    }

    #[tokio::test]
    async fn test_result_is_correlated_by_message_id() {
        let transport = Arc::new(RecordingTransport::default());
        let service = Arc::new(RequestService::new(test_station(test_info()), transport.clone()));

        let task = {
            let service = service.clone();
            tokio::spawn(async move { service.send_heartbeat().await })
        };
        let frames = wait_for_frames(&transport, 1).await;
        let message_id = frames[0][1].as_str().unwrap().to_string();
        assert_eq!(frames[0][2], "Heartbeat");
        assert_eq!(frames[0][3], json!({}));

        // Unrelated ids are dropped without touching the pending entry
        service
            .handle_message(r#"[3,"unknown-id",{"currentTime":"2024-01-01T00:00:00Z"}]"#)
            .await;
        assert!(service.pending().contains(&message_id));

        service
            .handle_message(&format!(
                r#"[3,"{message_id}",{{"currentTime":"2024-01-01T00:00:00Z"}}]"#
            ))
            .await;
        let response = task.await.unwrap().expect("Could not get heartbeat response");
        assert_eq!(response.current_time.to_rfc3339(), "2024-01-01T00:00:00+00:00");
        assert!(service.pending().is_empty());
    }

    #[tokio::test]
    async fn test_protocol_error_is_swallowed() {
        let transport = Arc::new(RecordingTransport::default());
        let service = Arc::new(RequestService::new(test_station(test_info()), transport.clone()));

        let task = {
            let service = service.clone();
            tokio::spawn(async move { service.send_authorize(None).await })
        };
        let frames = wait_for_frames(&transport, 1).await;
        assert_eq!(frames[0][3], json!({"idTag": "00000000"}));
        let message_id = frames[0][1].as_str().unwrap().to_string();

        service
            .handle_message(&format!(
                r#"[4,"{message_id}","SecurityError","Unknown tag",{{}}]"#
            ))
            .await;
        assert_eq!(task.await.unwrap(), None);
        assert!(service.pending().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_removes_pending_entry() {
        let transport = Arc::new(RecordingTransport::default());
        let service = RequestService::new(test_station(test_info()), transport.clone())
            .with_timeout(Duration::from_millis(20));

        match service
            .send_request::<_, HeartbeatResponse>(RequestCommand::Heartbeat, &HeartbeatRequest {})
            .await
        {
            Err(RequestError::Timeout { command, after }) => {
                assert_eq!(command, RequestCommand::Heartbeat);
                assert_eq!(after, Duration::from_millis(20));
            }
            other => panic!("Expected Timeout error, got {other:?}"),
        }
        assert!(service.pending().is_empty());
        assert_eq!(service.send_heartbeat().await, None);
    }

    #[tokio::test]
    async fn test_transport_failure_is_reported() {
        let transport = Arc::new(RecordingTransport {
            fail: true,
            ..Default::default()
        });
        let service = RequestService::new(test_station(test_info()), transport);

        let result = service
            .send_request::<_, HeartbeatResponse>(RequestCommand::Heartbeat, &HeartbeatRequest {})
            .await;
        assert!(matches!(result, Err(RequestError::Transport(_))));
        assert!(service.pending().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_requests_get_unique_ids() {
        let transport = Arc::new(RecordingTransport::default());
        let service = Arc::new(
            RequestService::new(test_station(test_info()), transport.clone())
                .with_timeout(Duration::from_secs(5)),
        );

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let service = service.clone();
                tokio::spawn(async move { service.send_heartbeat().await })
            })
            .collect();
        let frames = wait_for_frames(&transport, 50).await;
        let ids: HashSet<String> = frames
            .iter()
            .map(|frame| frame[1].as_str().unwrap().to_string())
            .collect();
        assert_eq!(ids.len(), 50);
        assert_eq!(service.pending().len(), 50);

        for id in &ids {
            service
                .handle_message(&format!(
                    r#"[3,"{id}",{{"currentTime":"2024-01-01T00:00:00Z"}}]"#
                ))
                .await;
        }
        for task in tasks {
            assert!(task.await.unwrap().is_some());
        }
        assert!(service.pending().is_empty());
    }

    #[tokio::test]
    async fn test_boot_notification_omits_absent_fields() {
        let (service, transport) = loopback_service(test_info());

        let response = service
            .send_boot_notification()
            .await
            .expect("Could not boot");
        assert_eq!(response.status, RegistrationStatus::Accepted);
        assert_eq!(response.interval, 300);

        let frames = transport.recorder.frames();
        assert_eq!(
            frames[0][3],
            json!({
                "chargePointModel": "SIM-AC-22",
                "chargePointVendor": "Simulated",
                "chargePointSerialNumber": "CP-0001"
            })
        );
    }

    #[tokio::test]
    async fn test_start_then_stop_transaction() {
        let (service, transport) = loopback_service(test_info());

        let started = service
            .send_start_transaction(2, Some("TAG-1"))
            .await
            .unwrap()
            .expect("Could not start transaction");
        assert_eq!(started.transaction_id, 1);
        {
            let station = lock_station(service.station());
            assert_eq!(station.connector_id_by_transaction(1), Ok(2));
            assert!(station.connector(2).unwrap().transaction_begin_meter_value.is_some());
        }

        service
            .send_meter_values(2, Some(1), Duration::from_secs(60), false)
            .await
            .unwrap()
            .expect("Could not send meter values");

        let stopped = service
            .send_stop_transaction(1, Some(StopTransactionReason::Local))
            .await
            .unwrap();
        assert!(stopped.is_some());

        let frames = transport.recorder.frames();
        let actions = transport.recorder.actions();
        assert_eq!(actions, vec!["StartTransaction", "MeterValues", "StopTransaction"]);
        let start = &frames[0][3];
        assert_eq!(start["connectorId"], 2);
        assert_eq!(start["idTag"], "TAG-1");
        assert_eq!(start["meterStart"], 0);
        let stop = &frames[2][3];
        assert_eq!(stop["transactionId"], 1);
        assert_eq!(stop["idTag"], "TAG-1");
        assert_eq!(stop["reason"], "Local");
        assert!(stop.get("transactionData").is_none());

        let station = lock_station(service.station());
        assert!(station.connector_id_by_transaction(1).is_err());
        assert!(!station.connector(2).unwrap().transaction_started);
    }

    #[tokio::test]
    async fn test_stop_unknown_transaction_is_a_lookup_error() {
        let mut info = test_info();
        info.begin_end_meter_values = true;
        let (service, transport) = loopback_service(info);

        match service.send_stop_transaction(99, None).await {
            Err(RequestError::Station(StationError::TransactionNotFound { transaction_id })) => {
                assert_eq!(transaction_id, 99)
            }
            other => panic!("Expected TransactionNotFound error, got {other:?}"),
        }
        assert!(transport.recorder.frames().is_empty());
    }

    #[tokio::test]
    async fn test_begin_end_meter_values_precede_stop() {
        let mut info = test_info();
        info.begin_end_meter_values = true;
        info.transaction_data_meter_values = true;
        let (service, transport) = loopback_service(info);

        service
            .send_start_transaction(1, None)
            .await
            .unwrap()
            .expect("Could not start transaction");
        service
            .send_stop_transaction(1, None)
            .await
            .unwrap()
            .expect("Could not stop transaction");

        let actions = transport.recorder.actions();
        assert_eq!(
            actions,
            vec!["StartTransaction", "MeterValues", "MeterValues", "StopTransaction"]
        );
        let frames = transport.recorder.frames();
        assert_eq!(frames[0][3]["idTag"], DEFAULT_ID_TAG);
        let begin = &frames[1][3]["meterValue"][0]["sampledValue"][0];
        assert_eq!(begin["context"], "Transaction.Begin");
        let end = &frames[2][3]["meterValue"][0]["sampledValue"][0];
        assert_eq!(end["context"], "Transaction.End");

        let transaction_data = frames[3][3]["transactionData"].as_array().unwrap();
        assert_eq!(transaction_data.len(), 2);
        assert_eq!(transaction_data[0]["sampledValue"][0]["context"], "Transaction.Begin");
        assert_eq!(transaction_data[1]["sampledValue"][0]["context"], "Transaction.End");
    }

    #[tokio::test]
    async fn test_out_of_order_end_meter_values_are_not_sent() {
        let mut info = test_info();
        info.begin_end_meter_values = true;
        info.out_of_order_end_meter_values = true;
        let (service, transport) = loopback_service(info);

        service.send_start_transaction(1, None).await.unwrap();
        service.send_stop_transaction(1, None).await.unwrap();

        assert_eq!(
            transport.recorder.actions(),
            vec!["StartTransaction", "MeterValues", "StopTransaction"]
        );
    }

    #[tokio::test]
    async fn test_unanswered_stop_still_frees_the_connector() {
        let (inner, inbound) = LoopbackCentralSystem::new(300);
        let transport = Arc::new(RecordingLoopback {
            inner,
            recorder: RecordingTransport::default(),
            unanswered: Some("StopTransaction"),
        });
        let service = Arc::new(
            RequestService::new(test_station(test_info()), transport.clone())
                .with_timeout(Duration::from_millis(20)),
        );
        spawn_router(service.clone(), inbound);

        service.send_start_transaction(1, None).await.unwrap();
        let stopped = service.send_stop_transaction(1, None).await.unwrap();
        assert_eq!(stopped, None);
        {
            let station = lock_station(service.station());
            assert_eq!(station.connector(1).unwrap().transaction_id, None);
            assert!(station.connector_id_by_transaction(1).is_err());
        }

        let restarted = service
            .send_start_transaction(1, None)
            .await
            .unwrap()
            .expect("Could not restart transaction");
        assert_eq!(restarted.transaction_id, 2);
        assert_eq!(
            transport.recorder.actions(),
            vec!["StartTransaction", "StopTransaction", "StartTransaction"]
        );
    }

    #[tokio::test]
    async fn test_telemetry_errors_escalate() {
        let mut info = test_info();
        info.current_out_type = CurrentOutType::Unsupported("HVDC".into());
        let (service, transport) = loopback_service(info);

        match service
            .send_meter_values(1, None, Duration::from_secs(60), false)
            .await
        {
            Err(RequestError::Telemetry(TelemetryError::UnsupportedCurrentOutType { .. })) => {}
            other => panic!("Expected UnsupportedCurrentOutType error, got {other:?}"),
        }
        assert!(transport.recorder.frames().is_empty());
    }

    #[tokio::test]
    async fn test_remote_calls_are_answered_not_implemented() {
        let transport = Arc::new(RecordingTransport::default());
        let service = RequestService::new(test_station(test_info()), transport.clone());

        service
            .handle_message(r#"[2,"remote-1","Reset",{"type":"Soft"}]"#)
            .await;
        service.handle_message("garbage").await;

        let frames = transport.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0][0], 4);
        assert_eq!(frames[0][1], "remote-1");
        assert_eq!(frames[0][2], "NotImplemented");
        assert!(service.pending().is_empty());
    }
}
