//! In-process transport: outbound requests are handed to the host over a channel.
//!
//! The host owns the real kernel sockets; it drains [`Outbound`] requests and
//! feeds replies back through an [`InboundFeed`](crate::InboundFeed).

use std::sync::Arc;

use async_trait::async_trait;
use kernel_relay_core::{
    ConnectError, CorrelationId, KernelConnector, KernelTransport, SessionArgs, SessionIdentity,
    TransportError,
};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::OutboundRequest;

/// Request produced by a session, tagged with the session it belongs to.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub identity: SessionIdentity,
    pub request: OutboundRequest,
}

/// Transport for one session.
pub struct ChannelTransport {
    identity: SessionIdentity,
    /// Kernel-protocol session id stamped on every request.
    session: String,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ChannelTransport {
    #[must_use]
    pub fn new(identity: SessionIdentity, tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self {
            identity,
            session: Uuid::new_v4().to_string(),
            tx,
        }
    }

    #[must_use]
    pub fn session(&self) -> &str {
        &self.session
    }
}

impl KernelTransport for ChannelTransport {
    fn send_execute(&self, code: &str) -> Result<CorrelationId, TransportError> {
        let request = OutboundRequest::execute(&self.session, code);
        let id = request.correlation_id();
        self.tx
            .send(Outbound {
                identity: self.identity.clone(),
                request,
            })
            .map_err(|_| TransportError::Closed)?;
        tracing::debug!(session = %self.identity, correlation_id = %id, "Queued execute_request");
        Ok(id)
    }
}

/// Connector whose sessions all share one outbound queue.
#[derive(Clone)]
pub struct ChannelConnector {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ChannelConnector {
    /// Create the connector and the receiving end of its outbound queue.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl KernelConnector for ChannelConnector {
    async fn connect(
        &self,
        identity: &SessionIdentity,
        args: &SessionArgs,
    ) -> Result<Arc<dyn KernelTransport>, ConnectError> {
        if self.tx.is_closed() {
            return Err(ConnectError::Failed("outbound queue closed".into()));
        }
        let connection_file = args.connection_file();
        if args.attach_existing() && connection_file.is_none() {
            return Err(ConnectError::InvalidArgs(
                "--existing needs a connection file".into(),
            ));
        }

        let transport = ChannelTransport::new(identity.clone(), self.tx.clone());
        tracing::info!(
            session = %identity,
            kernel_session = transport.session(),
            connection_file = connection_file.unwrap_or("<new kernel>"),
            "Connected"
        );
        Ok(Arc::new(transport))
    }
}
