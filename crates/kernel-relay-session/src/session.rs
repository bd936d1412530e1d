//! Per-identity session: counters, request tracking and output routing.

use std::{
    borrow::Cow,
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use chrono::{DateTime, Utc};
use futures::future;
use kernel_relay_core::{
    Channel, CorrelationId, KernelState, KernelTransport, Message, MessageKind, RelayConfig,
    RequestTracker, SessionArgs, SessionIdentity, Sink, SinkId, SinkRole, TrackerError,
    TransportError, format::describe_message,
};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::router::{Dispatch, ErrorRecord, OutputRouter};

/// Session error.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session closed: {0}")]
    Closed(SessionIdentity),
    #[error(transparent)]
    Tracker(#[from] TrackerError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Messages received per channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelCounters {
    pub control: u64,
    pub broadcast: u64,
    pub input: u64,
    pub heartbeat: u64,
    pub total: u64,
    /// Messages whose timestamp was older than their channel's previous one.
    pub reordered: u64,
}

impl ChannelCounters {
    #[must_use]
    pub const fn get(&self, channel: Channel) -> u64 {
        match channel {
            Channel::Control => self.control,
            Channel::Broadcast => self.broadcast,
            Channel::Input => self.input,
            Channel::Heartbeat => self.heartbeat,
        }
    }

    /// Count one message; returns the channel's count and the total.
    fn record(&mut self, channel: Channel) -> (u64, u64) {
        let slot = match channel {
            Channel::Control => &mut self.control,
            Channel::Broadcast => &mut self.broadcast,
            Channel::Input => &mut self.input,
            Channel::Heartbeat => &mut self.heartbeat,
        };
        *slot += 1;
        let count = *slot;
        self.total += 1;
        (count, self.total)
    }
}

struct State {
    counters: ChannelCounters,
    last_seen: HashMap<Channel, DateTime<Utc>>,
    kernel_state: KernelState,
    tracker: RequestTracker,
    router: OutputRouter,
    closed: bool,
}

/// One kernel peer and the sinks rendering its output.
///
/// All mutable state sits behind a single lock that is never held across an
/// `.await`, so `handle_message` may be called concurrently from one task per
/// channel.
pub struct Session {
    identity: SessionIdentity,
    args: SessionArgs,
    transport: Arc<dyn KernelTransport>,
    state: Mutex<State>,
}

impl Session {
    #[must_use]
    pub fn new(
        identity: SessionIdentity,
        args: SessionArgs,
        transport: Arc<dyn KernelTransport>,
        config: &RelayConfig,
    ) -> Self {
        let router = OutputRouter::new(identity.clone(), config);
        Self {
            identity,
            args,
            transport,
            state: Mutex::new(State {
                counters: ChannelCounters::default(),
                last_seen: HashMap::new(),
                kernel_state: KernelState::Unknown,
                tracker: RequestTracker::new(),
                router,
                closed: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub const fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    #[must_use]
    pub const fn args(&self) -> &SessionArgs {
        &self.args
    }

    /// Process one inbound message.
    ///
    /// Never fails: malformed and unsolicited messages are logged and absorbed,
    /// and messages arriving after [`Session::close`] are dropped. The channel
    /// argument is where the transport received the message and overrides
    /// `message.channel`.
    pub fn handle_message(&self, channel: Channel, message: &Message) {
        let message = if message.channel == channel {
            Cow::Borrowed(message)
        } else {
            tracing::debug!(
                session = %self.identity,
                %channel,
                tagged = %message.channel,
                "Message tagged with another channel"
            );
            let mut owned = message.clone();
            owned.channel = channel;
            Cow::Owned(owned)
        };

        let mut state = self.lock();
        if state.closed {
            tracing::debug!(
                session = %self.identity,
                %channel,
                msg_type = %message.msg_type,
                "Dropping message for closed session"
            );
            return;
        }

        let (channel_count, total) = state.counters.record(channel);
        if let Some(ts) = message.timestamp {
            self.note_timestamp(&mut state, channel, ts);
        }
        self.update_kernel_state(&mut state, channel, &message);

        let owner = message
            .correlation_id
            .as_ref()
            .filter(|id| state.tracker.is_tracked(id))
            .cloned();
        match &owner {
            Some(id) => {
                if message.kind() == MessageKind::ExecuteInput {
                    if let Ok(count) = message.u64_field("execution_count") {
                        state.tracker.record_execution_count(id, count);
                    }
                }
                if let Some(signal) = message.signal_kind() {
                    state.tracker.observe(id, signal);
                }
            }
            None => {
                if let Some(id) = &message.correlation_id {
                    tracing::trace!(
                        session = %self.identity,
                        correlation_id = %id,
                        msg_type = %message.msg_type,
                        "Unsolicited message"
                    );
                }
            }
        }

        let handled = match state.router.dispatch(channel, &message) {
            Ok(outcome) => outcome != Dispatch::Ignored,
            Err(e) => {
                tracing::warn!(
                    session = %self.identity,
                    %channel,
                    "Dropping malformed message: {e}"
                );
                false
            }
        };
        if tracing::enabled!(tracing::Level::TRACE) {
            tracing::trace!(
                session = %self.identity,
                "{}",
                describe_message(handled, channel, channel_count, total, &message)
            );
        }

        if let Some(id) = owner {
            if state.tracker.is_complete(&id) {
                if let Some(request) = state.tracker.finish(&id) {
                    tracing::info!(
                        session = %self.identity,
                        correlation_id = %id,
                        execution_count = ?request.execution_count,
                        "Request finished"
                    );
                }
            }
        }
    }

    fn note_timestamp(&self, state: &mut State, channel: Channel, ts: DateTime<Utc>) {
        match state.last_seen.get(&channel).copied() {
            Some(previous) if ts < previous => {
                state.counters.reordered += 1;
                tracing::debug!(
                    session = %self.identity,
                    %channel,
                    %ts,
                    %previous,
                    "Out-of-order or duplicate delivery"
                );
            }
            _ => {
                state.last_seen.insert(channel, ts);
            }
        }
    }

    fn update_kernel_state(&self, state: &mut State, channel: Channel, message: &Message) {
        match channel {
            Channel::Heartbeat => {
                state.kernel_state = KernelState::Dead;
                tracing::warn!(session = %self.identity, "Heartbeat failure, kernel marked dead");
            }
            Channel::Broadcast if message.kind() == MessageKind::Status => {
                if let Some(next) = message
                    .execution_state()
                    .and_then(KernelState::from_execution_state)
                {
                    state.kernel_state = next;
                }
            }
            _ => {}
        }
    }

    /// Send code through the session's transport and track the request.
    ///
    /// # Errors
    /// Returns error if the session is closed, the transport fails, or the
    /// transport hands back an id that is already tracked.
    pub fn execute(&self, code: &str) -> Result<CorrelationId, SessionError> {
        self.track(Some(code), || self.transport.send_execute(code))
    }

    /// Run `send` and track the correlation id it returns.
    ///
    /// The session lock is held for the duration, so no reply to the request
    /// can be processed before it is tracked. `send` must not block.
    ///
    /// # Errors
    /// Returns error if the session is closed, `send` fails, or the id is
    /// already tracked.
    pub fn send_tracked<F>(&self, send: F) -> Result<CorrelationId, SessionError>
    where
        F: FnOnce() -> Result<CorrelationId, TransportError>,
    {
        self.track(None, send)
    }

    fn track<F>(&self, code: Option<&str>, send: F) -> Result<CorrelationId, SessionError>
    where
        F: FnOnce() -> Result<CorrelationId, TransportError>,
    {
        let mut state = self.lock();
        if state.closed {
            return Err(SessionError::Closed(self.identity.clone()));
        }
        let id = send()?;
        state.tracker.begin_request(id.clone())?;
        if let Some(code) = code {
            state.tracker.record_code(&id, code);
        }
        tracing::info!(session = %self.identity, correlation_id = %id, "Waiting for reply");
        Ok(id)
    }

    /// Register a sink. Returns `false` if already registered under `role` or
    /// if the session is closed. Must be called within a Tokio runtime.
    pub fn register_sink(&self, role: SinkRole, sink: Arc<dyn Sink>) -> bool {
        let mut state = self.lock();
        if state.closed {
            tracing::warn!(
                session = %self.identity,
                sink = %sink.id(),
                "Session closed, sink not registered"
            );
            return false;
        }
        state.router.register_sink(role, sink)
    }

    /// Register output sinks; returns whether any of them was new.
    pub fn register_output_sinks<I>(&self, sinks: I) -> bool
    where
        I: IntoIterator<Item = Arc<dyn Sink>>,
    {
        sinks
            .into_iter()
            .fold(false, |added, sink| self.register_sink(SinkRole::Out, sink) || added)
    }

    pub fn unregister_sink(&self, role: SinkRole, id: &SinkId) -> bool {
        self.lock().router.unregister_sink(role, id)
    }

    #[must_use]
    pub fn sinks(&self, role: SinkRole) -> Vec<SinkId> {
        self.lock().router.sinks(role).to_vec()
    }

    #[must_use]
    pub fn counters(&self) -> ChannelCounters {
        self.lock().counters
    }

    /// Latest timestamp seen on any channel.
    #[must_use]
    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        self.lock().last_seen.values().max().copied()
    }

    #[must_use]
    pub fn kernel_state(&self) -> KernelState {
        self.lock().kernel_state
    }

    #[must_use]
    pub fn pending_requests(&self) -> Vec<CorrelationId> {
        self.lock().tracker.pending_ids()
    }

    #[must_use]
    pub fn is_waiting_for(&self, id: &CorrelationId) -> bool {
        self.lock().tracker.is_tracked(id)
    }

    /// Code submitted for a still-pending request, if it was sent through `execute`.
    #[must_use]
    pub fn submitted_code(&self, id: &CorrelationId) -> Option<String> {
        self.lock().tracker.get(id).and_then(|r| r.code.clone())
    }

    /// Execution count the kernel assigned to a still-pending request.
    #[must_use]
    pub fn execution_count(&self, id: &CorrelationId) -> Option<u64> {
        self.lock().tracker.execution_count(id)
    }

    #[must_use]
    pub fn subscribe_errors(&self) -> broadcast::Receiver<ErrorRecord> {
        self.lock().router.subscribe_errors()
    }

    #[must_use]
    pub fn error_stream(&self) -> futures::stream::BoxStream<'static, ErrorRecord> {
        self.lock().router.error_stream()
    }

    /// Wait until every append queued so far has reached its sink.
    pub async fn flush(&self) {
        let barriers = self.lock().router.barriers();
        future::join_all(barriers).await;
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Release all sinks and abandon pending requests.
    ///
    /// Returns the abandoned correlation ids. Later messages are dropped.
    pub fn close(&self) -> Vec<CorrelationId> {
        let mut state = self.lock();
        if state.closed {
            return Vec::new();
        }
        state.closed = true;
        state.router.close();
        let abandoned = state.tracker.abandon_all();
        if abandoned.is_empty() {
            tracing::info!(session = %self.identity, "Session closed");
        } else {
            tracing::info!(
                session = %self.identity,
                abandoned = abandoned.len(),
                "Session closed with pending requests"
            );
        }
        abandoned
    }
}

#[cfg(all(test, feature = "memory"))]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use chrono::TimeZone;
    use serde_json::json;
    use tokio_test::assert_ok;

    use super::*;
    use crate::sinks::MemorySink;

    /// Transport that hands out `req-1`, `req-2`, ...
    #[derive(Default)]
    struct CountingTransport {
        next: AtomicU64,
    }

    impl KernelTransport for CountingTransport {
        fn send_execute(&self, _code: &str) -> Result<CorrelationId, TransportError> {
            let n = self.next.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(CorrelationId::new(format!("req-{n}")))
        }
    }

    fn session() -> Session {
        Session::new(
            SessionIdentity::from(1),
            SessionArgs::default(),
            Arc::new(CountingTransport::default()),
            &RelayConfig::default(),
        )
    }

    fn reply(id: &CorrelationId) -> Message {
        Message::new(Channel::Control, "execute_reply")
            .with_correlation_id(id.clone())
            .with_payload(json!({ "status": "ok" }))
    }

    fn idle(id: &CorrelationId) -> Message {
        Message::new(Channel::Broadcast, "status")
            .with_correlation_id(id.clone())
            .with_payload(json!({ "execution_state": "idle" }))
    }

    #[test]
    fn test_reply_then_idle_finishes() {
        let session = session();
        let id = assert_ok!(session.execute("1+1"));
        assert!(session.is_waiting_for(&id));
        assert_eq!(session.submitted_code(&id).as_deref(), Some("1+1"));

        session.handle_message(Channel::Control, &reply(&id));
        assert!(session.is_waiting_for(&id));
        session.handle_message(Channel::Broadcast, &idle(&id));
        assert!(!session.is_waiting_for(&id));
    }

    #[test]
    fn test_idle_then_reply_finishes() {
        let session = session();
        let id = session.execute("1+1").unwrap();

        session.handle_message(Channel::Broadcast, &idle(&id));
        session.handle_message(Channel::Control, &reply(&id));
        assert!(session.pending_requests().is_empty());

        // A late duplicate does not resurrect the request.
        session.handle_message(Channel::Control, &reply(&id));
        assert!(!session.is_waiting_for(&id));
    }

    #[test]
    fn test_unsolicited_traffic_counts_but_does_not_complete() {
        let session = session();
        let id = session.execute("x").unwrap();
        let foreign = CorrelationId::from("other-client");

        session.handle_message(Channel::Control, &reply(&foreign));
        session.handle_message(Channel::Broadcast, &idle(&foreign));
        // Idle without a correlation id belongs to nobody.
        session.handle_message(
            Channel::Broadcast,
            &Message::new(Channel::Broadcast, "status")
                .with_payload(json!({ "execution_state": "idle" })),
        );

        assert!(session.is_waiting_for(&id));
        assert_eq!(session.counters().total, 3);
    }

    #[test]
    fn test_transport_duplicate_id_rejected() {
        struct FixedTransport;
        impl KernelTransport for FixedTransport {
            fn send_execute(&self, _code: &str) -> Result<CorrelationId, TransportError> {
                Ok(CorrelationId::from("same"))
            }
        }

        let session = Session::new(
            SessionIdentity::from("s"),
            SessionArgs::default(),
            Arc::new(FixedTransport),
            &RelayConfig::default(),
        );
        session.execute("a").unwrap();
        assert!(matches!(
            session.execute("b"),
            Err(SessionError::Tracker(TrackerError::DuplicateRequest(_)))
        ));
        assert_eq!(session.pending_requests().len(), 1);
    }

    #[test]
    fn test_transport_failure_tracks_nothing() {
        let session = session();
        let result = session.send_tracked(|| Err(TransportError::Closed));
        assert!(matches!(result, Err(SessionError::Transport(TransportError::Closed))));
        assert!(session.pending_requests().is_empty());
    }

    #[test]
    fn test_counters_per_channel() {
        let session = session();
        let deliveries = [
            Channel::Broadcast,
            Channel::Control,
            Channel::Broadcast,
            Channel::Input,
            Channel::Heartbeat,
            Channel::Broadcast,
        ];
        for channel in deliveries {
            session.handle_message(channel, &Message::new(channel, "comm_msg"));
        }

        let counters = session.counters();
        assert_eq!(counters.get(Channel::Broadcast), 3);
        assert_eq!(counters.get(Channel::Control), 1);
        assert_eq!(counters.get(Channel::Input), 1);
        assert_eq!(counters.get(Channel::Heartbeat), 1);
        assert_eq!(counters.total, 6);
    }

    #[test]
    fn test_kernel_state_tracking() {
        let session = session();
        assert_eq!(session.kernel_state(), KernelState::Unknown);

        session.handle_message(
            Channel::Broadcast,
            &Message::new(Channel::Broadcast, "status")
                .with_payload(json!({ "execution_state": "busy" })),
        );
        assert_eq!(session.kernel_state(), KernelState::Busy);

        session.handle_message(Channel::Heartbeat, &Message::new(Channel::Heartbeat, "heartbeat"));
        assert_eq!(session.kernel_state(), KernelState::Dead);
    }

    #[test]
    fn test_out_of_order_timestamps_counted() {
        let session = session();
        let t1 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 1).unwrap();
        let t2 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 2).unwrap();

        let status = Message::new(Channel::Broadcast, "status");
        session.handle_message(Channel::Broadcast, &status.clone().with_timestamp(t2));
        session.handle_message(Channel::Broadcast, &status.with_timestamp(t1));
        // Other channels keep their own ordering.
        let other = Message::new(Channel::Control, "x").with_timestamp(t1);
        session.handle_message(Channel::Control, &other);

        assert_eq!(session.counters().reordered, 1);
        assert_eq!(session.last_seen(), Some(t2));
    }

    #[tokio::test]
    async fn test_malformed_message_absorbed() {
        let session = session();
        let sink = Arc::new(MemorySink::new("buf"));
        assert!(session.register_sink(SinkRole::Out, sink.clone()));
        let mut errors = session.subscribe_errors();

        // Routable types missing their required fields.
        session.handle_message(Channel::Broadcast, &Message::new(Channel::Broadcast, "stream"));
        session.handle_message(
            Channel::Broadcast,
            &Message::new(Channel::Broadcast, "error").with_payload(json!({ "ename": "E" })),
        );
        session.handle_message(
            Channel::Broadcast,
            &Message::new(Channel::Broadcast, "stream").with_payload(json!({ "text": "ok\n" })),
        );
        session.flush().await;

        assert_eq!(sink.lines(), vec!["ok"]);
        assert!(errors.try_recv().is_err());
        let counters = session.counters();
        assert_eq!(counters.broadcast, 3);
        assert_eq!(counters.total, 3);
        assert!(!session.is_closed());
    }

    #[tokio::test]
    async fn test_execution_round_trip_renders_output() {
        let session = session();
        let sink = Arc::new(MemorySink::new("buf"));
        assert!(session.register_output_sinks([sink.clone() as Arc<dyn Sink>]));
        assert!(!session.register_output_sinks([sink.clone() as Arc<dyn Sink>]));

        let id = session.execute("40 + 2").unwrap();
        session.handle_message(
            Channel::Broadcast,
            &Message::new(Channel::Broadcast, "execute_input")
                .with_correlation_id(id.clone())
                .with_payload(json!({ "execution_count": 3, "code": "40 + 2" })),
        );
        assert_eq!(session.execution_count(&id), Some(3));
        session.handle_message(
            Channel::Broadcast,
            &Message::new(Channel::Broadcast, "execute_result")
                .with_correlation_id(id.clone())
                .with_payload(json!({ "execution_count": 3, "data": { "text/plain": "42" } })),
        );
        session.handle_message(Channel::Control, &reply(&id));
        session.handle_message(Channel::Broadcast, &idle(&id));
        session.flush().await;

        assert_eq!(sink.lines(), vec!["In  [3]: 40 + 2", "Out [3]: 42", ""]);
        assert!(session.pending_requests().is_empty());
    }

    #[tokio::test]
    async fn test_close_abandons_and_drops() {
        let session = session();
        let sink = Arc::new(MemorySink::new("buf"));
        session.register_sink(SinkRole::Out, sink.clone());
        let id = session.execute("while True: pass").unwrap();

        assert_eq!(session.close(), vec![id.clone()]);
        assert!(session.close().is_empty());
        assert!(session.is_closed());

        session.handle_message(Channel::Control, &reply(&id));
        assert_eq!(session.counters().total, 0);
        assert!(matches!(session.execute("1"), Err(SessionError::Closed(_))));
        assert!(!session.register_sink(SinkRole::Out, sink.clone()));
        assert!(session.sinks(SinkRole::Out).is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_channels() {
        let session = Arc::new(session());
        let mut tasks = Vec::new();
        for channel in Channel::ALL {
            let session = Arc::clone(&session);
            tasks.push(tokio::spawn(async move {
                for _ in 0..50 {
                    session.handle_message(channel, &Message::new(channel, "comm_msg"));
                    tokio::task::yield_now().await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let counters = session.counters();
        for channel in Channel::ALL {
            assert_eq!(counters.get(channel), 50);
        }
        assert_eq!(counters.total, 200);
    }
}
