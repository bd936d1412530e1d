//! Inbound feed: one pump task per channel decoding raw messages into a session.

use std::{collections::HashMap, sync::Arc};

use kernel_relay_core::{Channel, KernelConnector, SessionIdentity};
use kernel_relay_session::SessionContainer;
use tokio::{sync::mpsc, task::JoinHandle};

use crate::protocol;

/// Feed error.
#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("Feed for {0} channel closed")]
    Closed(Channel),
}

/// Raw inbound traffic for one session.
///
/// Each channel has its own FIFO queue and task, so messages keep their order
/// within a channel while channels interleave freely.
pub struct InboundFeed {
    identity: SessionIdentity,
    queues: HashMap<Channel, mpsc::UnboundedSender<String>>,
    pumps: Vec<JoinHandle<()>>,
}

impl InboundFeed {
    /// Start a pump for every channel. Must be called within a Tokio runtime.
    #[must_use]
    pub fn spawn<C>(container: Arc<SessionContainer<C>>, identity: SessionIdentity) -> Self
    where
        C: KernelConnector + 'static,
    {
        let mut queues = HashMap::new();
        let mut pumps = Vec::with_capacity(Channel::ALL.len());

        for channel in Channel::ALL {
            let (tx, rx) = mpsc::unbounded_channel();
            queues.insert(channel, tx);
            pumps.push(tokio::spawn(pump(
                Arc::clone(&container),
                identity.clone(),
                channel,
                rx,
            )));
        }

        Self {
            identity,
            queues,
            pumps,
        }
    }

    #[must_use]
    pub const fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    /// Queue one raw wire message received on `channel`.
    ///
    /// # Errors
    /// Returns error if the channel's pump has stopped.
    pub fn push(&self, channel: Channel, raw: impl Into<String>) -> Result<(), FeedError> {
        self.queues
            .get(&channel)
            .ok_or(FeedError::Closed(channel))?
            .send(raw.into())
            .map_err(|_| FeedError::Closed(channel))
    }

    /// Stop accepting messages and wait until every queued one was delivered.
    pub async fn shutdown(mut self) {
        self.queues.clear();
        for pump in self.pumps.drain(..) {
            if let Err(e) = pump.await {
                tracing::error!(session = %self.identity, "Feed pump failed: {e}");
            }
        }
    }
}

async fn pump<C>(
    container: Arc<SessionContainer<C>>,
    identity: SessionIdentity,
    channel: Channel,
    mut rx: mpsc::UnboundedReceiver<String>,
) where
    C: KernelConnector,
{
    while let Some(raw) = rx.recv().await {
        match protocol::decode(channel, &raw) {
            Ok(message) => {
                container.handle_message(&identity, channel, &message).await;
            }
            Err(e) => {
                tracing::warn!(session = %identity, %channel, "Dropping undecodable message: {e}");
            }
        }
    }
    tracing::trace!(session = %identity, %channel, "Feed pump stopped");
}

#[cfg(test)]
mod tests {
    use kernel_relay_core::{RelayConfig, SessionArgs, SinkRole};
    use kernel_relay_session::sinks::MemorySink;
    use serde_json::json;

    use super::*;
    use crate::channel::ChannelConnector;

    fn wire(msg_type: &str, parent: &str, content: serde_json::Value) -> String {
        json!({
            "header": { "msg_id": "k", "msg_type": msg_type },
            "parent_header": { "msg_id": parent },
            "content": content
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_feed_completes_request() {
        let (connector, mut outbound) = ChannelConnector::new();
        let container = Arc::new(SessionContainer::new(connector, &RelayConfig::default()));
        let identity = SessionIdentity::from(3);
        let session = container.start(identity.clone(), SessionArgs::default()).await.unwrap();
        let sink = Arc::new(MemorySink::new("buf"));
        session.register_sink(SinkRole::Out, sink.clone());

        let id = container.execute(&identity, "6 * 7").await.unwrap();
        let request = outbound.recv().await.unwrap().request;
        assert_eq!(request.correlation_id(), id);

        let feed = InboundFeed::spawn(Arc::clone(&container), identity.clone());
        // Reply first on control, output and idle on broadcast.
        feed.push(Channel::Control, wire("execute_reply", id.as_str(), json!({ "status": "ok" })))
            .unwrap();
        feed.push(
            Channel::Broadcast,
            wire("execute_input", id.as_str(), json!({ "execution_count": 1, "code": "6 * 7" })),
        )
        .unwrap();
        feed.push(
            Channel::Broadcast,
            wire(
                "execute_result",
                id.as_str(),
                json!({ "execution_count": 1, "data": { "text/plain": "42" } }),
            ),
        )
        .unwrap();
        let idle = wire("status", id.as_str(), json!({ "execution_state": "idle" }));
        feed.push(Channel::Broadcast, idle).unwrap();
        feed.push(Channel::Broadcast, "{ not json").unwrap();
        feed.shutdown().await;
        session.flush().await;

        assert!(session.pending_requests().is_empty());
        assert_eq!(sink.lines(), vec!["In  [1]: 6 * 7", "Out [1]: 42", ""]);
        let counters = session.counters();
        assert_eq!(counters.control, 1);
        assert_eq!(counters.broadcast, 3);
    }

    #[tokio::test]
    async fn test_feed_for_stopped_session_drops() {
        let (connector, _outbound) = ChannelConnector::new();
        let container = Arc::new(SessionContainer::new(connector, &RelayConfig::default()));
        let identity = SessionIdentity::from("gone");
        let session = container.start(identity.clone(), SessionArgs::default()).await.unwrap();
        container.stop(&identity).await;

        let feed = InboundFeed::spawn(Arc::clone(&container), identity);
        feed.push(Channel::Broadcast, wire("stream", "", json!({ "text": "late" })))
            .unwrap();
        feed.shutdown().await;

        assert_eq!(session.counters().total, 0);
    }
}
