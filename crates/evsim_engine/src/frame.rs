//! OCPP-J message frames.
//!
//! CALL `[2, id, action, payload]`, CALL_RESULT `[3, id, payload]` and
//! CALL_ERROR `[4, id, code, description, details]`.

use serde_json::{Value, json};

use crate::{ErrorType, FrameError, OcppError};

pub const CALL: u64 = 2;
pub const CALL_RESULT: u64 = 3;
pub const CALL_ERROR: u64 = 4;

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Call {
        message_id: String,
        action: String,
        payload: Value,
    },
    CallResult {
        message_id: String,
        payload: Value,
    },
    CallError {
        message_id: String,
        error: OcppError,
    },
}

impl Frame {
    pub fn to_value(&self) -> Value {
        match self {
            Frame::Call {
                message_id,
                action,
                payload,
            } => json!([CALL, message_id, action, payload]),
            Frame::CallResult {
                message_id,
                payload,
            } => json!([CALL_RESULT, message_id, payload]),
            Frame::CallError { message_id, error } => json!([
                CALL_ERROR,
                message_id,
                error.code.to_string(),
                error.description,
                error.details
            ]),
        }
    }

    pub fn to_text(&self) -> String {
        self.to_value().to_string()
    }

    pub fn parse(text: &str) -> Result<Frame, FrameError> {
        let value: Value = serde_json::from_str(text)?;
        let Value::Array(mut items) = value else {
            return Err(FrameError::NotAnArray);
        };
        let Some(message_type) = items.first().and_then(Value::as_u64) else {
            return Err(FrameError::UnknownMessageType(
                items.first().cloned().unwrap_or(Value::Null),
            ));
        };
        let malformed = |reason: &str| FrameError::Malformed {
            message_type,
            reason: reason.to_string(),
        };
        let expected_len = match message_type {
            CALL => 4,
            CALL_RESULT => 3,
            CALL_ERROR => 5,
            _ => return Err(FrameError::UnknownMessageType(items.swap_remove(0))),
        };
        if items.len() != expected_len {
            return Err(malformed("unexpected number of elements"));
        }
        let message_id = items[1]
            .as_str()
            .ok_or_else(|| malformed("message id is not a string"))?
            .to_string();

        match message_type {
            CALL => {
                let action = items[2]
                    .as_str()
                    .ok_or_else(|| malformed("action is not a string"))?
                    .to_string();
                Ok(Frame::Call {
                    message_id,
                    action,
                    payload: items.swap_remove(3),
                })
            }
            CALL_RESULT => Ok(Frame::CallResult {
                message_id,
                payload: items.swap_remove(2),
            }),
            _ => {
                let code = items[2]
                    .as_str()
                    .ok_or_else(|| malformed("error code is not a string"))?;
                let description = items[3].as_str().unwrap_or_default().to_string();
                Ok(Frame::CallError {
                    message_id,
                    error: OcppError {
                        code: ErrorType::parse(code),
                        description,
                        details: items.swap_remove(4),
                    },
                })
            }
        }
    }
}
