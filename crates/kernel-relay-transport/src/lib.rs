//! Wire-level plumbing between kernels and relay sessions.
//!
//! Provides:
//! - Wire protocol (kernel JSON messages, `execute_request` encoding)
//! - `ChannelConnector` - In-process transport handing requests to the host
//! - `InboundFeed` - Per-channel pumps decoding raw messages into a session

pub mod channel;
pub mod feed;
pub mod protocol;

pub use channel::{ChannelConnector, ChannelTransport, Outbound};
pub use feed::{FeedError, InboundFeed};
pub use protocol::{OutboundRequest, WireError, WireMessage, decode, decode_tagged};
