//! Seams to the host: sinks, kernel transports and connectors.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{SessionArgs, message::CorrelationId};

/// Opaque, caller-supplied session key (an editor buffer number, a name...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionIdentity(String);

impl SessionIdentity {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionIdentity {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SessionIdentity {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<u64> for SessionIdentity {
    fn from(n: u64) -> Self {
        Self(n.to_string())
    }
}

/// Identity of a sink target; registration is deduplicated on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SinkId(String);

impl fmt::Display for SinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SinkId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SinkId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<u64> for SinkId {
    fn from(n: u64) -> Self {
        Self(n.to_string())
    }
}

/// Role a sink is registered under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkRole {
    /// Receives rendered output.
    Out,
    /// Source of code to execute; never written to.
    In,
    /// Both.
    InOut,
}

impl SinkRole {
    #[must_use]
    pub const fn receives_output(self) -> bool {
        matches!(self, Self::Out | Self::InOut)
    }
}

/// Sink error.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Sink closed: {0}")]
    Closed(SinkId),
    #[error("Sink delivery failed: {0}")]
    Delivery(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Output target for rendered lines.
///
/// Appends for one sink are applied in submission order, one at a time.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Stable identity of the target.
    fn id(&self) -> SinkId;

    /// Append lines to the target.
    async fn append(&self, lines: &[String]) -> Result<(), SinkError>;
}

/// Transport error.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transport closed")]
    Closed,
    #[error("Send failed: {0}")]
    SendFailed(String),
}

/// Outbound half of a kernel connection.
///
/// `send_execute` must only enqueue the request and return the correlation id
/// it was sent under; the session holds its lock across the call so that no
/// reply can be handled before the id is tracked.
pub trait KernelTransport: Send + Sync {
    /// Send an execute request.
    ///
    /// # Errors
    /// Returns error if the request could not be queued.
    fn send_execute(&self, code: &str) -> Result<CorrelationId, TransportError>;
}

/// Connector error.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("Invalid session arguments: {0}")]
    InvalidArgs(String),
    #[error("Connection failed: {0}")]
    Failed(String),
}

/// Produces a transport for each started session.
#[async_trait]
pub trait KernelConnector: Send + Sync {
    /// Connect the session with the given identity.
    async fn connect(
        &self,
        identity: &SessionIdentity,
        args: &SessionArgs,
    ) -> Result<Arc<dyn KernelTransport>, ConnectError>;
}
