//! OCPP-J envelope framing
//!
//! OCPP 2.0.1 uses JSON arrays over WebSocket text frames:
//! - CALL:       [2, uniqueId, action, payload]
//! - CALLRESULT: [3, uniqueId, payload]
//! - CALLERROR:  [4, uniqueId, errorCode, errorDescription, errorDetails]
//!
//! The leading numeric tag fully determines the variant. The codec checks
//! tag, arity and element types only; payloads pass through opaquely.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// OCPP message type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

/// RPC framework error codes carried in a CALLERROR frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    FormatViolation,
    GenericError,
    InternalError,
    MessageTypeNotSupported,
    NotImplemented,
    NotSupported,
    OccurrenceConstraintViolation,
    PropertyConstraintViolation,
    ProtocolError,
    RpcFrameworkError,
    SecurityError,
    TypeConstraintViolation,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// The error triple of a CALLERROR frame.
///
/// Produced by the router when dispatch fails, and handed back to issuing
/// code when the peer rejects one of our calls.
#[derive(Debug, Clone, PartialEq)]
pub struct WireError {
    pub code: ErrorCode,
    pub description: String,
    pub details: Value,
}

impl WireError {
    pub fn new(code: ErrorCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
            details: Value::Object(serde_json::Map::new()),
        }
    }

    pub fn not_implemented(action: &str) -> Self {
        Self::new(
            ErrorCode::NotImplemented,
            format!("action {} is not supported by this role", action),
        )
    }

    pub fn format_violation(description: impl Into<String>) -> Self {
        Self::new(ErrorCode::FormatViolation, description)
    }

    pub fn internal(description: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, description)
    }
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.description)
    }
}

/// Errors raised while decoding a text frame
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unparsable frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("frame is not a JSON array")]
    NotAnArray,

    #[error("message type {type_tag} expects {expected} elements, got {got}")]
    BadArity {
        type_tag: i64,
        expected: usize,
        got: usize,
    },

    #[error("message type {0} is not supported")]
    UnsupportedMessageType(i64),

    #[error("frame element `{0}` has the wrong type")]
    BadField(&'static str),
}

/// A decoded OCPP-J envelope.
///
/// The action travels as an opaque string; it is only parsed into an
/// enumerated action at the role layer, so a call naming an unknown
/// action still decodes and can be answered with NotImplemented.
#[derive(Debug, Clone)]
pub enum Envelope {
    Call {
        unique_id: String,
        action: String,
        payload: Value,
    },
    CallResult {
        unique_id: String,
        payload: Value,
    },
    CallError {
        unique_id: String,
        error: WireError,
    },
}

impl Envelope {
    /// The correlation id, whatever the variant.
    pub fn unique_id(&self) -> &str {
        match self {
            Envelope::Call { unique_id, .. } => unique_id,
            Envelope::CallResult { unique_id, .. } => unique_id,
            Envelope::CallError { unique_id, .. } => unique_id,
        }
    }

    /// Serialize to the wire array for this variant.
    pub fn encode(&self) -> String {
        let array = match self {
            Envelope::Call {
                unique_id,
                action,
                payload,
            } => serde_json::json!([MessageType::Call as i64, unique_id, action, payload]),
            Envelope::CallResult { unique_id, payload } => {
                serde_json::json!([MessageType::CallResult as i64, unique_id, payload])
            }
            Envelope::CallError { unique_id, error } => serde_json::json!([
                MessageType::CallError as i64,
                unique_id,
                error.code.to_string(),
                error.description,
                error.details
            ]),
        };
        array.to_string()
    }

    /// Parse a text frame, validating tag, arity and element types.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text)?;
        let array = value.as_array().ok_or(ProtocolError::NotAnArray)?;

        let type_tag = array
            .first()
            .and_then(|v| v.as_i64())
            .ok_or(ProtocolError::BadField("messageTypeId"))?;

        match type_tag {
            2 => {
                if array.len() != 4 {
                    return Err(ProtocolError::BadArity {
                        type_tag,
                        expected: 4,
                        got: array.len(),
                    });
                }
                Ok(Envelope::Call {
                    unique_id: string_at(array, 1, "uniqueId")?,
                    action: string_at(array, 2, "action")?,
                    payload: array[3].clone(),
                })
            }
            3 => {
                if array.len() != 3 {
                    return Err(ProtocolError::BadArity {
                        type_tag,
                        expected: 3,
                        got: array.len(),
                    });
                }
                Ok(Envelope::CallResult {
                    unique_id: string_at(array, 1, "uniqueId")?,
                    payload: array[2].clone(),
                })
            }
            4 => {
                if array.len() != 5 {
                    return Err(ProtocolError::BadArity {
                        type_tag,
                        expected: 5,
                        got: array.len(),
                    });
                }
                let code_str = string_at(array, 2, "errorCode")?;
                // Unknown code strings degrade to GenericError rather than
                // dropping an otherwise well-formed error frame.
                let code: ErrorCode = serde_json::from_value(Value::String(code_str))
                    .unwrap_or(ErrorCode::GenericError);
                Ok(Envelope::CallError {
                    unique_id: string_at(array, 1, "uniqueId")?,
                    error: WireError {
                        code,
                        description: string_at(array, 3, "errorDescription")?,
                        details: array[4].clone(),
                    },
                })
            }
            other => Err(ProtocolError::UnsupportedMessageType(other)),
        }
    }
}

fn string_at(array: &[Value], idx: usize, name: &'static str) -> Result<String, ProtocolError> {
    array
        .get(idx)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or(ProtocolError::BadField(name))
}
