use std::fmt;
use std::time::Duration;

use evsim_core::{StationError, TelemetryError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::RequestCommand;

/// Error codes carried by CALL_ERROR frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorType {
    NotImplemented,
    NotSupported,
    InternalError,
    ProtocolError,
    SecurityError,
    FormationViolation,
    PropertyConstraintViolation,
    // Spelled as on the wire
    OccurenceConstraintViolation,
    TypeConstraintViolation,
    GenericError,
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl ErrorType {
    pub fn parse(code: &str) -> Self {
        serde_json::from_value(Value::String(code.to_string())).unwrap_or(ErrorType::GenericError)
    }
}

/// Protocol-level error, as received in or sent as a CALL_ERROR frame.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{code}: {description}")]
pub struct OcppError {
    pub code: ErrorType,
    pub description: String,
    pub details: Value,
}

impl OcppError {
    pub fn new(code: ErrorType, description: impl Into<String>) -> Self {
        OcppError {
            code,
            description: description.into(),
            details: Value::Object(Default::default()),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("Connection closed")]
    Closed,
    #[error("Send failed: {0}")]
    SendFailed(String),
}

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("Frame is not a JSON array")]
    NotAnArray,
    #[error("Unknown message type {0}")]
    UnknownMessageType(Value),
    #[error("Malformed frame of type {message_type}: {reason}")]
    Malformed { message_type: u64, reason: String },
}

#[derive(Error, Debug)]
pub enum RequestError {
    #[error(transparent)]
    Protocol(#[from] OcppError),
    #[error("{command} timed out after {after:?}")]
    Timeout {
        command: RequestCommand,
        after: Duration,
    },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("Payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),
    #[error(transparent)]
    Station(#[from] StationError),
}

impl RequestError {
    /// Whether the error points at an unusable station definition or an
    /// unknown entity, and must reach the caller instead of being swallowed.
    pub fn escalates(&self) -> bool {
        matches!(self, RequestError::Telemetry(_) | RequestError::Station(_))
    }
}
