use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use evsim_core::RegistrationStatus;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use crate::{ErrorType, Frame, IdTagInfo, OcppError, TransportError};

/// Outbound half of a station connection. Inbound frames are fed to
/// [`crate::RequestService::handle_message`] by whoever owns the socket.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, frame: String) -> Result<(), TransportError>;
}

/// In-process central system answering every CALL with a RESULT.
///
/// Replies are pushed to the inbound channel returned by [`LoopbackCentralSystem::new`].
#[derive(Debug)]
pub struct LoopbackCentralSystem {
    inbound: mpsc::UnboundedSender<String>,
    registration_status: RegistrationStatus,
    heartbeat_interval: u64,
    /// Next transaction id, possibly shared with other central systems
    next_transaction_id: Arc<AtomicI32>,
}

impl LoopbackCentralSystem {
    pub fn new(heartbeat_interval: u64) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (inbound, receiver) = mpsc::unbounded_channel();
        let central_system = LoopbackCentralSystem {
            inbound,
            registration_status: RegistrationStatus::Accepted,
            heartbeat_interval,
            next_transaction_id: Arc::new(AtomicI32::new(1)),
        };
        (central_system, receiver)
    }

    pub fn with_registration_status(mut self, status: RegistrationStatus) -> Self {
        self.registration_status = status;
        self
    }

    /// Allocate transaction ids from a counter shared across stations.
    pub fn with_transaction_ids(mut self, next_transaction_id: Arc<AtomicI32>) -> Self {
        self.next_transaction_id = next_transaction_id;
        self
    }

    fn answer(&self, action: &str) -> Result<Value, OcppError> {
        let current_time = Utc::now();
        match action {
            "BootNotification" => Ok(json!({
                "status": self.registration_status,
                "currentTime": current_time,
                "interval": self.heartbeat_interval,
            })),
            "Heartbeat" => Ok(json!({ "currentTime": current_time })),
            "Authorize" => Ok(json!({ "idTagInfo": IdTagInfo::accepted() })),
            "StartTransaction" => Ok(json!({
                "transactionId": self.next_transaction_id.fetch_add(1, Ordering::Relaxed),
                "idTagInfo": IdTagInfo::accepted(),
            })),
            "StopTransaction" => Ok(json!({ "idTagInfo": IdTagInfo::accepted() })),
            "MeterValues" | "StatusNotification" => Ok(json!({})),
            other => Err(OcppError::new(
                ErrorType::NotImplemented,
                format!("{other} is not supported by the loopback central system"),
            )),
        }
    }
}

#[async_trait]
impl Transport for LoopbackCentralSystem {
    async fn send(&self, frame: String) -> Result<(), TransportError> {
        let reply = match Frame::parse(&frame) {
            Ok(Frame::Call {
                message_id, action, ..
            }) => match self.answer(&action) {
                Ok(payload) => Frame::CallResult {
                    message_id,
                    payload,
                },
                Err(error) => Frame::CallError { message_id, error },
            },
            Ok(other) => {
                tracing::debug!("Loopback central system ignoring {:?}", other);
                return Ok(());
            }
            Err(error) => {
                return Err(TransportError::SendFailed(error.to_string()));
            }
        };
        self.inbound
            .send(reply.to_text())
            .map_err(|_| TransportError::Closed)
    }
}
