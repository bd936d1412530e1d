//! Session routing and lifecycle for kernel relays.
//!
//! Provides:
//! - `SessionContainer` - Start, stop and look up sessions by identity
//! - `Session` - Per-identity counters, request tracking and output routing
//! - `OutputRouter` - Formatting and ordered fan-out to sinks
//! - Sink implementations (writer, in-memory)

pub mod manager;
pub mod router;
pub mod session;
pub mod sinks;
mod worker;

pub use manager::{ContainerError, SessionContainer};
pub use router::{Dispatch, ErrorRecord, OutputRouter};
pub use session::{ChannelCounters, Session, SessionError};
