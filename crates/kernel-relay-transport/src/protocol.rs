//! Kernel wire protocol: JSON messages with `header`/`parent_header`/`content`.

use chrono::{DateTime, NaiveDateTime, Utc};
use kernel_relay_core::{Channel, CorrelationId, Message, message::UnknownChannel};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Protocol version stamped on outbound requests.
pub const PROTOCOL_VERSION: &str = "5.3";

/// Wire decoding error.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    UnknownChannel(#[from] UnknownChannel),
    #[error("Message carries no channel")]
    MissingChannel,
}

/// Message header.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireHeader {
    #[serde(default)]
    pub msg_id: String,
    pub msg_type: String,
    #[serde(default)]
    pub session: String,
    #[serde(default)]
    pub username: String,
    #[serde(default, deserialize_with = "lenient_date", skip_serializing_if = "Option::is_none")]
    pub date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub version: String,
}

/// Header of the request a message answers. Kernels send `{}` when there is none.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentHeader {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_type: Option<String>,
}

/// One message as it crosses the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub header: WireHeader,
    #[serde(default)]
    pub parent_header: Option<ParentHeader>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub content: Map<String, Value>,
    /// Socket name, present when messages of every channel share one stream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

impl WireMessage {
    /// Correlation id taken from the parent header, if any.
    #[must_use]
    pub fn correlation_id(&self) -> Option<CorrelationId> {
        self.parent_header
            .as_ref()
            .and_then(|p| p.msg_id.as_deref())
            .filter(|id| !id.is_empty())
            .map(CorrelationId::from)
    }

    /// Convert into a relay message delivered on `channel`.
    #[must_use]
    pub fn into_message(self, channel: Channel) -> Message {
        let correlation_id = self.correlation_id();
        Message {
            channel,
            msg_type: self.header.msg_type,
            correlation_id,
            timestamp: self.header.date,
            payload: self.content,
        }
    }
}

/// Decode a message received on a known channel.
///
/// # Errors
/// Returns error if `raw` is not a wire message.
pub fn decode(channel: Channel, raw: &str) -> Result<Message, WireError> {
    let wire: WireMessage = serde_json::from_str(raw)?;
    Ok(wire.into_message(channel))
}

/// Decode a message that names its own channel.
///
/// # Errors
/// Returns error if `raw` is not a wire message or its channel is absent or unknown.
pub fn decode_tagged(raw: &str) -> Result<(Channel, Message), WireError> {
    let wire: WireMessage = serde_json::from_str(raw)?;
    let channel: Channel = wire.channel.as_deref().ok_or(WireError::MissingChannel)?.parse()?;
    Ok((channel, wire.into_message(channel)))
}

/// Accepts RFC 3339 dates and the zone-less form older kernels emit (read as UTC).
/// Anything else becomes `None`.
fn lenient_date<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let Some(raw) = Option::<String>::deserialize(deserializer)? else {
        return Ok(None);
    };
    if let Ok(date) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(Some(date.with_timezone(&Utc)));
    }
    match NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f") {
        Ok(naive) => Ok(Some(naive.and_utc())),
        Err(e) => {
            tracing::debug!(date = %raw, "Ignoring unparseable header date: {e}");
            Ok(None)
        }
    }
}

/// Body of an `execute_request`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteContent {
    pub code: String,
    pub silent: bool,
    pub store_history: bool,
    pub user_expressions: Map<String, Value>,
    pub allow_stdin: bool,
    pub stop_on_error: bool,
}

/// Request sent to the kernel's control channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundRequest {
    pub header: WireHeader,
    pub parent_header: Map<String, Value>,
    pub metadata: Map<String, Value>,
    pub content: ExecuteContent,
    pub channel: String,
}

impl OutboundRequest {
    /// Build an `execute_request` under a fresh message id.
    #[must_use]
    pub fn execute(session: &str, code: &str) -> Self {
        Self {
            header: WireHeader {
                msg_id: Uuid::new_v4().to_string(),
                msg_type: "execute_request".into(),
                session: session.to_string(),
                username: String::new(),
                date: Some(Utc::now()),
                version: PROTOCOL_VERSION.into(),
            },
            parent_header: Map::new(),
            metadata: Map::new(),
            content: ExecuteContent {
                code: code.to_string(),
                silent: false,
                store_history: true,
                user_expressions: Map::new(),
                allow_stdin: false,
                stop_on_error: true,
            },
            channel: "shell".into(),
        }
    }

    /// Id replies to this request will carry in their parent header.
    #[must_use]
    pub fn correlation_id(&self) -> CorrelationId {
        CorrelationId::from(self.header.msg_id.as_str())
    }

    /// Serialize for the wire.
    ///
    /// # Errors
    /// Returns error if serialization fails.
    pub fn to_json(&self) -> Result<String, WireError> {
        Ok(serde_json::to_string(self)?)
    }
}
