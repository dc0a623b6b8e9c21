//! OCPP-J framing.
//!
//! Every OCPP-J message is a JSON array whose first element is the message
//! type:
//!
//! - Call: `[2, messageId, action, payload]`
//! - CallResult: `[3, messageId, payload]`
//! - CallError: `[4, messageId, errorCode, errorDescription, errorDetails]`
//!
//! Decoding never panics: anything that does not fit one of the three shapes
//! is a [`DecodeError`], and the relay forwards such text untouched.

use std::fmt;

use serde_json::value::RawValue;
use serde_json::{Map, Value};
use thiserror::Error;

use super::action::Action;

/// Numeric message type discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

impl MessageType {
    /// Number of array elements a frame of this type carries.
    pub fn arity(self) -> usize {
        match self {
            Self::Call => 4,
            Self::CallResult => 3,
            Self::CallError => 5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Call => "Call",
            Self::CallResult => "CallResult",
            Self::CallError => "CallError",
        }
    }
}

/// OCPP RPC framework error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallErrorCode {
    NotImplemented,
    NotSupported,
    InternalError,
    ProtocolError,
    SecurityError,
    FormationViolation,
    PropertyConstraintViolation,
    OccurenceConstraintViolation,
    TypeConstraintViolation,
    GenericError,
}

impl CallErrorCode {
    /// Wire spelling (OCPP 1.6 keeps the historical typos).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotImplemented => "NotImplemented",
            Self::NotSupported => "NotSupported",
            Self::InternalError => "InternalError",
            Self::ProtocolError => "ProtocolError",
            Self::SecurityError => "SecurityError",
            Self::FormationViolation => "FormationViolation",
            Self::PropertyConstraintViolation => "PropertyConstraintViolation",
            Self::OccurenceConstraintViolation => "OccurenceConstraintViolation",
            Self::TypeConstraintViolation => "TypeConstraintViolation",
            Self::GenericError => "GenericError",
        }
    }
}

/// Errors produced while decoding a text frame.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame is not a JSON array")]
    NotAnArray,

    #[error("missing or non-numeric message type")]
    MissingType,

    #[error("unknown message type {0}")]
    UnknownType(Value),

    #[error("{kind} frame must have {expected} elements, got {found}")]
    Arity {
        kind: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("message id must be a string or a number")]
    InvalidId,

    #[error("action must be a string")]
    InvalidAction,

    #[error("error code must be a string")]
    InvalidErrorCode,
}

/// Correlation id linking a Call to its response.
///
/// Kept in the JSON type it arrived in, so `7` and `"7"` are distinct. Numbers
/// hold their source text, so `1e3` or `1.50` re-encode exactly as received
/// even when the rest of the frame was rewritten.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CorrelationId {
    Text(String),
    Number(String),
}

impl CorrelationId {
    pub fn to_value(&self) -> Value {
        match self {
            Self::Text(s) => Value::String(s.clone()),
            Self::Number(n) => serde_json::from_str(n).unwrap_or_else(|_| Value::String(n.clone())),
        }
    }

    /// JSON text of the id.
    fn to_json(&self) -> String {
        match self {
            Self::Text(s) => Value::String(s.clone()).to_string(),
            Self::Number(n) => n.clone(),
        }
    }
}

/// Source text of the `index`th element of a JSON array.
fn raw_element(text: &str, index: usize) -> Result<String, DecodeError> {
    let items: Vec<&RawValue> = serde_json::from_str(text)?;
    items
        .get(index)
        .map(|raw| raw.get().to_string())
        .ok_or(DecodeError::InvalidId)
}

impl From<&str> for CorrelationId {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for CorrelationId {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(s) => f.write_str(s),
            Self::Number(n) => write!(f, "{n}"),
        }
    }
}

/// A request.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub id: CorrelationId,
    pub action: Action,
    pub payload: Value,
}

/// A successful response.
#[derive(Debug, Clone, PartialEq)]
pub struct CallResult {
    pub id: CorrelationId,
    pub payload: Value,
}

/// An error response. The code is kept verbatim, including non-standard
/// codes some peers send.
#[derive(Debug, Clone, PartialEq)]
pub struct CallError {
    pub id: CorrelationId,
    pub code: String,
    pub description: String,
    pub details: Value,
}

/// One decoded OCPP-J message.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Call(Call),
    CallResult(CallResult),
    CallError(CallError),
}

impl Frame {
    /// Build a Call.
    pub fn call(id: impl Into<CorrelationId>, action: Action, payload: Value) -> Self {
        Self::Call(Call {
            id: id.into(),
            action,
            payload,
        })
    }

    /// Build a CallResult.
    pub fn result(id: CorrelationId, payload: Value) -> Self {
        Self::CallResult(CallResult { id, payload })
    }

    /// Build a CallError with empty details.
    pub fn error(id: CorrelationId, code: CallErrorCode, description: impl Into<String>) -> Self {
        Self::CallError(CallError {
            id,
            code: code.as_str().to_string(),
            description: description.into(),
            details: Value::Object(Map::new()),
        })
    }

    /// Parse a text frame.
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        let value: Value = serde_json::from_str(text)?;
        let Value::Array(items) = value else {
            return Err(DecodeError::NotAnArray);
        };

        let type_code = items
            .first()
            .and_then(Value::as_u64)
            .ok_or(DecodeError::MissingType)?;
        let kind = match type_code {
            2 => MessageType::Call,
            3 => MessageType::CallResult,
            4 => MessageType::CallError,
            _ => return Err(DecodeError::UnknownType(items[0].clone())),
        };
        if items.len() != kind.arity() {
            return Err(DecodeError::Arity {
                kind: kind.as_str(),
                expected: kind.arity(),
                found: items.len(),
            });
        }

        let mut items = items.into_iter().skip(1);
        let id = match items.next() {
            Some(Value::String(s)) => CorrelationId::Text(s),
            Some(Value::Number(_)) => CorrelationId::Number(raw_element(text, 1)?),
            _ => return Err(DecodeError::InvalidId),
        };

        match kind {
            MessageType::Call => {
                let action = match items.next() {
                    Some(Value::String(name)) => Action::from(name),
                    _ => return Err(DecodeError::InvalidAction),
                };
                let payload = items.next().unwrap_or(Value::Null);
                Ok(Self::Call(Call {
                    id,
                    action,
                    payload,
                }))
            }
            MessageType::CallResult => Ok(Self::CallResult(CallResult {
                id,
                payload: items.next().unwrap_or(Value::Null),
            })),
            MessageType::CallError => {
                let code = match items.next() {
                    Some(Value::String(code)) => code,
                    _ => return Err(DecodeError::InvalidErrorCode),
                };
                let description = match items.next() {
                    Some(Value::String(desc)) => desc,
                    Some(Value::Null) | None => String::new(),
                    Some(other) => other.to_string(),
                };
                Ok(Self::CallError(CallError {
                    id,
                    code,
                    description,
                    details: items.next().unwrap_or(Value::Null),
                }))
            }
        }
    }

    /// Serialize to the compact canonical array form.
    pub fn encode(&self) -> String {
        match self {
            Self::Call(c) => format!(
                "[{},{},{},{}]",
                MessageType::Call as u8,
                c.id.to_json(),
                Value::String(c.action.to_string()),
                c.payload
            ),
            Self::CallResult(r) => format!(
                "[{},{},{}]",
                MessageType::CallResult as u8,
                r.id.to_json(),
                r.payload
            ),
            Self::CallError(e) => format!(
                "[{},{},{},{},{}]",
                MessageType::CallError as u8,
                e.id.to_json(),
                Value::String(e.code.clone()),
                Value::String(e.description.clone()),
                e.details
            ),
        }
    }

    pub fn id(&self) -> &CorrelationId {
        match self {
            Self::Call(c) => &c.id,
            Self::CallResult(r) => &r.id,
            Self::CallError(e) => &e.id,
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Call(_) => MessageType::Call,
            Self::CallResult(_) => MessageType::CallResult,
            Self::CallError(_) => MessageType::CallError,
        }
    }

    /// The action, for Calls.
    pub fn action(&self) -> Option<&Action> {
        match self {
            Self::Call(c) => Some(&c.action),
            _ => None,
        }
    }

    /// Payload of a Call or CallResult. CallErrors have none.
    pub fn payload(&self) -> Option<&Value> {
        match self {
            Self::Call(c) => Some(&c.payload),
            Self::CallResult(r) => Some(&r.payload),
            Self::CallError(_) => None,
        }
    }

    pub fn payload_mut(&mut self) -> Option<&mut Value> {
        match self {
            Self::Call(c) => Some(&mut c.payload),
            Self::CallResult(r) => Some(&mut r.payload),
            Self::CallError(_) => None,
        }
    }

    pub fn is_call(&self) -> bool {
        matches!(self, Self::Call(_))
    }
}
