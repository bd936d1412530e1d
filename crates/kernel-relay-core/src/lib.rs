//! Core building blocks for relaying kernel session traffic.
//!
//! This crate provides:
//! - `Message` - Classified inbound message and its channel
//! - `format` - Pure line formatting for sinks
//! - `RequestTracker` - Correlation of replies to in-flight requests
//! - `Backlog` - Bounded replay queue for messages that precede any sink
//! - `Sink`, `KernelTransport`, `KernelConnector` traits
//! - `RelayConfig` and, with the `subscriber` feature, logging setup

pub mod args;
pub mod backlog;
pub mod config;
pub mod format;
#[cfg(feature = "subscriber")]
pub mod logging;
pub mod message;
pub mod tracker;
pub mod traits;

pub use args::SessionArgs;
pub use backlog::{Backlog, Push};
pub use config::{LogConfig, RelayConfig};
pub use message::{
    Channel, CorrelationId, KernelState, Message, MessageError, MessageKind, SignalKind,
};
pub use tracker::{RequestState, RequestTracker, TrackerError};
pub use traits::{
    ConnectError, KernelConnector, KernelTransport, SessionIdentity, Sink, SinkError, SinkId,
    SinkRole, TransportError,
};
