//! Classified kernel messages.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// One of the peer's independent message streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Request/reply stream (`shell` and `control` sockets).
    Control,
    /// Side effects published to every client (`iopub`).
    Broadcast,
    /// Input requests raised by the kernel (`stdin`).
    Input,
    /// Heartbeat failures (`hb`).
    Heartbeat,
}

impl Channel {
    /// Every channel, in counter order.
    pub const ALL: [Self; 4] = [Self::Control, Self::Broadcast, Self::Input, Self::Heartbeat];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Control => "control",
            Self::Broadcast => "broadcast",
            Self::Input => "input",
            Self::Heartbeat => "heartbeat",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Channel name error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unknown channel: {0}")]
pub struct UnknownChannel(pub String);

impl FromStr for Channel {
    type Err = UnknownChannel;

    /// Accepts both the relay names and the Jupyter socket names.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "control" | "shell" => Ok(Self::Control),
            "broadcast" | "iopub" => Ok(Self::Broadcast),
            "input" | "stdin" => Ok(Self::Input),
            "heartbeat" | "hb" => Ok(Self::Heartbeat),
            other => Err(UnknownChannel(other.to_string())),
        }
    }
}

/// Identifier shared by a request and every message it causes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CorrelationId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for CorrelationId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Message types the relay knows how to route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    KernelInfoReply,
    ExecuteInput,
    ExecuteResult,
    Stream,
    Error,
    Status,
    /// Any other `*_reply`.
    Reply,
    Other,
}

impl MessageKind {
    #[must_use]
    pub fn classify(msg_type: &str) -> Self {
        match msg_type {
            "kernel_info_reply" => Self::KernelInfoReply,
            "execute_input" => Self::ExecuteInput,
            "execute_result" => Self::ExecuteResult,
            "stream" => Self::Stream,
            "error" => Self::Error,
            "status" => Self::Status,
            t if t.ends_with("_reply") => Self::Reply,
            _ => Self::Other,
        }
    }
}

/// Signals that count towards completing a tracked request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    /// A `*_reply` on the control channel.
    ControlReply,
    /// A `status` message reporting `idle` on the broadcast channel.
    BroadcastIdle,
}

/// Execution state last reported by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelState {
    #[default]
    Unknown,
    Starting,
    Busy,
    Idle,
    /// The heartbeat channel reported a failure.
    Dead,
}

impl KernelState {
    /// Parse a `status` message's `execution_state`.
    #[must_use]
    pub fn from_execution_state(state: &str) -> Option<Self> {
        match state {
            "starting" => Some(Self::Starting),
            "busy" => Some(Self::Busy),
            "idle" => Some(Self::Idle),
            _ => None,
        }
    }
}

/// A message missing a field its type requires.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessageError {
    #[error("{msg_type} message is missing field `{field}`")]
    MissingField {
        msg_type: String,
        field: &'static str,
    },
    #[error("{msg_type} message field `{field}` is not {expected}")]
    WrongType {
        msg_type: String,
        field: &'static str,
        expected: &'static str,
    },
}

/// Inbound kernel message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Channel the message was received on.
    pub channel: Channel,
    /// Protocol type tag, e.g. `execute_result`.
    pub msg_type: String,
    /// Id of the request that caused this message.
    #[serde(default)]
    pub correlation_id: Option<CorrelationId>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    /// Type-dependent content.
    #[serde(default)]
    pub payload: Map<String, Value>,
}

impl Message {
    /// Create a message with an empty payload.
    #[must_use]
    pub fn new(channel: Channel, msg_type: impl Into<String>) -> Self {
        Self {
            channel,
            msg_type: msg_type.into(),
            correlation_id: None,
            timestamp: None,
            payload: Map::new(),
        }
    }

    #[must_use]
    pub fn with_correlation_id(mut self, id: impl Into<CorrelationId>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    #[must_use]
    pub const fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Replace the payload. Non-object values leave the payload empty.
    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = match payload {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        self
    }

    #[must_use]
    pub fn kind(&self) -> MessageKind {
        MessageKind::classify(&self.msg_type)
    }

    /// Completion signal carried by this message, if any.
    #[must_use]
    pub fn signal_kind(&self) -> Option<SignalKind> {
        match (self.channel, self.kind()) {
            (Channel::Control, MessageKind::KernelInfoReply | MessageKind::Reply) => {
                Some(SignalKind::ControlReply)
            }
            (Channel::Broadcast, MessageKind::Status)
                if self.execution_state() == Some("idle") =>
            {
                Some(SignalKind::BroadcastIdle)
            }
            _ => None,
        }
    }

    /// `execution_state` of a `status` message.
    #[must_use]
    pub fn execution_state(&self) -> Option<&str> {
        self.payload.get("execution_state").and_then(Value::as_str)
    }

    fn field(&self, field: &'static str) -> Result<&Value, MessageError> {
        self.payload
            .get(field)
            .ok_or_else(|| MessageError::MissingField {
                msg_type: self.msg_type.clone(),
                field,
            })
    }

    fn wrong_type(&self, field: &'static str, expected: &'static str) -> MessageError {
        MessageError::WrongType {
            msg_type: self.msg_type.clone(),
            field,
            expected,
        }
    }

    /// Required string field.
    ///
    /// # Errors
    /// Returns error if the field is missing or not a string.
    pub fn str_field(&self, field: &'static str) -> Result<&str, MessageError> {
        self.field(field)?
            .as_str()
            .ok_or_else(|| self.wrong_type(field, "a string"))
    }

    /// Required unsigned integer field.
    ///
    /// # Errors
    /// Returns error if the field is missing or not an unsigned integer.
    pub fn u64_field(&self, field: &'static str) -> Result<u64, MessageError> {
        self.field(field)?
            .as_u64()
            .ok_or_else(|| self.wrong_type(field, "an unsigned integer"))
    }

    /// Required object field.
    ///
    /// # Errors
    /// Returns error if the field is missing or not an object.
    pub fn object_field(&self, field: &'static str) -> Result<&Map<String, Value>, MessageError> {
        self.field(field)?
            .as_object()
            .ok_or_else(|| self.wrong_type(field, "an object"))
    }

    /// Optional array field; absent means empty.
    ///
    /// # Errors
    /// Returns error if the field is present but not an array.
    pub fn array_field(&self, field: &'static str) -> Result<&[Value], MessageError> {
        match self.payload.get(field) {
            None | Some(Value::Null) => Ok(&[]),
            Some(Value::Array(items)) => Ok(items),
            Some(_) => Err(self.wrong_type(field, "an array")),
        }
    }

    /// Rough in-memory size, used for backlog budgeting.
    #[must_use]
    pub fn approx_bytes(&self) -> usize {
        const OVERHEAD: usize = 64;
        let payload: usize = self
            .payload
            .iter()
            .map(|(k, v)| k.len() + value_bytes(v))
            .sum();
        OVERHEAD + self.msg_type.len() + payload
    }
}

fn value_bytes(value: &Value) -> usize {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) => 8,
        Value::String(s) => s.len(),
        Value::Array(items) => items.iter().map(value_bytes).sum(),
        Value::Object(map) => map.iter().map(|(k, v)| k.len() + value_bytes(v)).sum(),
    }
}
