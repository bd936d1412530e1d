//! Output routing: formats routable messages and fans lines out to sinks.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use futures::future;
use kernel_relay_core::{
    Backlog, Channel, Message, MessageError, MessageKind, Push, RelayConfig, SessionIdentity,
    Sink, SinkId, SinkRole,
    format::{
        clean_traceback, error_summary, extract_plain_text, format_input, format_output,
        split_lines, strip_control_sequences,
    },
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::{StreamExt, wrappers::BroadcastStream};

use crate::worker::SinkWorker;

const ERROR_CHANNEL_CAPACITY: usize = 256;

/// Outcome of dispatching one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Rendered (possibly to zero lines) and handed to the sinks.
    Handled,
    /// Held in the backlog until the first output sink registers.
    Deferred,
    /// No handler for this channel and type.
    Ignored,
}

/// Structured error exported to the host.
///
/// All text is free of control sequences; each traceback entry is split on
/// `\n` with a final empty segment dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub summary: String,
    pub traceback_lines: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Banner,
    Input,
    Result,
    Stream,
    Error,
}

impl Route {
    const fn classify(channel: Channel, kind: MessageKind) -> Option<Self> {
        match (channel, kind) {
            (Channel::Control, MessageKind::KernelInfoReply) => Some(Self::Banner),
            (Channel::Broadcast, MessageKind::ExecuteInput) => Some(Self::Input),
            (Channel::Broadcast, MessageKind::ExecuteResult) => Some(Self::Result),
            (Channel::Broadcast, MessageKind::Stream) => Some(Self::Stream),
            (Channel::Broadcast, MessageKind::Error) => Some(Self::Error),
            _ => None,
        }
    }
}

/// Sinks of one session plus the state needed to replay output to them.
pub struct OutputRouter {
    identity: SessionIdentity,
    workers: HashMap<SinkId, SinkWorker>,
    roles: HashMap<SinkRole, Vec<SinkId>>,
    backlog: Backlog,
    banner_shown: bool,
    errors: broadcast::Sender<ErrorRecord>,
}

impl OutputRouter {
    #[must_use]
    pub fn new(identity: SessionIdentity, config: &RelayConfig) -> Self {
        let (errors, _) = broadcast::channel(ERROR_CHANNEL_CAPACITY);
        Self {
            identity,
            workers: HashMap::new(),
            roles: HashMap::new(),
            backlog: Backlog::new(config.backlog_capacity, config.backlog_bytes),
            banner_shown: false,
            errors,
        }
    }

    /// Register a sink under a role.
    ///
    /// Returns `false` if the same target is already registered under that
    /// role. The first output-capable registration replays the backlog.
    /// Must be called within a Tokio runtime.
    pub fn register_sink(&mut self, role: SinkRole, sink: Arc<dyn Sink>) -> bool {
        let id = sink.id();
        let ids = self.roles.entry(role).or_default();
        if ids.contains(&id) {
            return false;
        }
        ids.push(id.clone());
        self.workers
            .entry(id.clone())
            .or_insert_with(|| SinkWorker::spawn(sink));
        tracing::debug!(session = %self.identity, sink = %id, ?role, "Registered sink");

        if role.receives_output() && !self.backlog.is_drained() {
            self.replay_backlog();
        }
        true
    }

    /// Remove a sink from a role. Its queue closes once no role refers to it.
    pub fn unregister_sink(&mut self, role: SinkRole, id: &SinkId) -> bool {
        let Some(ids) = self.roles.get_mut(&role) else {
            return false;
        };
        let Some(pos) = ids.iter().position(|i| i == id) else {
            return false;
        };
        ids.remove(pos);

        if !self.roles.values().any(|ids| ids.contains(id)) {
            self.workers.remove(id);
        }
        tracing::debug!(session = %self.identity, sink = %id, ?role, "Unregistered sink");
        true
    }

    #[must_use]
    pub fn sinks(&self, role: SinkRole) -> &[SinkId] {
        self.roles.get(&role).map(Vec::as_slice).unwrap_or_default()
    }

    #[must_use]
    pub fn has_output_sinks(&self) -> bool {
        !self.sinks(SinkRole::Out).is_empty() || !self.sinks(SinkRole::InOut).is_empty()
    }

    /// Messages currently held for replay.
    #[must_use]
    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Route a message to its handler.
    ///
    /// Error records are exported as soon as they arrive, even when their
    /// summary lines are held for a sink that does not exist yet.
    ///
    /// # Errors
    /// Returns error if the message lacks a field its type requires. Nothing
    /// has been sent to the sinks in that case.
    pub fn dispatch(
        &mut self,
        channel: Channel,
        message: &Message,
    ) -> Result<Dispatch, MessageError> {
        let Some(route) = Route::classify(channel, message.kind()) else {
            return Ok(Dispatch::Ignored);
        };

        if route == Route::Error {
            let record = error_record(message)?;
            if self.errors.send(record).is_err() {
                tracing::trace!(session = %self.identity, "No error subscribers");
            }
        }

        if !self.backlog.is_drained() && !self.has_output_sinks() {
            let mut held = message.clone();
            held.channel = channel;
            match self.backlog.push(held) {
                Push::Held { evicted } if evicted > 0 => {
                    tracing::warn!(
                        session = %self.identity,
                        evicted,
                        "Backlog full, dropped oldest messages"
                    );
                }
                Push::TooLarge { bytes } => {
                    tracing::warn!(
                        session = %self.identity,
                        bytes,
                        "Message exceeds backlog budget, dropped"
                    );
                }
                Push::Held { .. } | Push::Closed => {}
            }
            return Ok(Dispatch::Deferred);
        }

        self.render(route, message)?;
        Ok(Dispatch::Handled)
    }

    /// Queue the same lines on every distinct output-capable sink.
    ///
    /// Returns the number of sinks the lines were queued for. A sink whose
    /// queue is gone is logged and skipped.
    pub fn append_to_all_sinks(&self, lines: Vec<String>) -> usize {
        if lines.is_empty() {
            return 0;
        }
        let lines: Arc<[String]> = lines.into();

        let mut seen = HashSet::new();
        let mut queued = 0;
        for id in self.sinks(SinkRole::Out).iter().chain(self.sinks(SinkRole::InOut)) {
            if !seen.insert(id) {
                continue;
            }
            let Some(worker) = self.workers.get(id) else {
                continue;
            };
            match worker.submit(Arc::clone(&lines)) {
                Ok(()) => queued += 1,
                Err(e) => tracing::warn!(session = %self.identity, sink = %id, "{e}"),
            }
        }

        if queued == 0 {
            tracing::trace!(
                session = %self.identity,
                "No output sink, dropped {} lines",
                lines.len()
            );
        }
        queued
    }

    /// Receivers for every sink queue; each resolves once prior appends are applied.
    pub(crate) fn barriers(&self) -> Vec<tokio::sync::oneshot::Receiver<()>> {
        self.workers.values().filter_map(SinkWorker::barrier).collect()
    }

    /// Wait until every append queued so far has been applied.
    pub async fn flush(&self) {
        future::join_all(self.barriers()).await;
    }

    /// Subscribe to exported error records.
    #[must_use]
    pub fn subscribe_errors(&self) -> broadcast::Receiver<ErrorRecord> {
        self.errors.subscribe()
    }

    /// Error records as a stream; lagged records are skipped.
    #[must_use]
    pub fn error_stream(&self) -> futures::stream::BoxStream<'static, ErrorRecord> {
        Box::pin(BroadcastStream::new(self.subscribe_errors()).filter_map(Result::ok))
    }

    /// Release every sink. Queued appends still drain.
    pub fn close(&mut self) {
        self.roles.clear();
        self.workers.clear();
        self.backlog.drain();
    }

    fn replay_backlog(&mut self) {
        let mut held = self.backlog.drain();
        if held.is_empty() {
            return;
        }
        tracing::debug!(session = %self.identity, count = held.len(), "Replaying backlog");

        // The banner leads, whatever arrived before it.
        held.sort_by_key(|m| m.kind() != MessageKind::KernelInfoReply);
        for message in &held {
            let Some(route) = Route::classify(message.channel, message.kind()) else {
                continue;
            };
            if let Err(e) = self.render(route, message) {
                tracing::warn!(session = %self.identity, "Dropping malformed message: {e}");
            }
        }
    }

    fn render(&mut self, route: Route, message: &Message) -> Result<(), MessageError> {
        match route {
            Route::Banner => {
                let banner = message.str_field("banner")?;
                if self.banner_shown {
                    tracing::debug!(session = %self.identity, "Banner already shown");
                    return Ok(());
                }
                self.banner_shown = true;
                self.append_to_all_sinks(split_lines(banner));
            }
            Route::Input => {
                let count = message.u64_field("execution_count")?;
                let code = message.str_field("code")?;
                self.append_to_all_sinks(format_input(count, code));
            }
            Route::Result => {
                let count = message.u64_field("execution_count")?;
                let data = message.object_field("data")?;
                match extract_plain_text(data) {
                    Some(text) => {
                        self.append_to_all_sinks(format_output(count, text));
                    }
                    None => tracing::debug!(session = %self.identity, "Result has no text/plain"),
                }
            }
            Route::Stream => {
                let text = message.str_field("text")?;
                self.append_to_all_sinks(split_lines(text));
            }
            Route::Error => {
                let record = error_record(message)?;
                self.append_to_all_sinks(split_lines(&record.summary));
            }
        }
        Ok(())
    }
}

/// Control-sequence-free summary and traceback of an `error` message.
fn error_record(message: &Message) -> Result<ErrorRecord, MessageError> {
    let ename = message.str_field("ename")?;
    let evalue = message.str_field("evalue")?;
    let traceback = message.array_field("traceback")?;
    Ok(ErrorRecord {
        summary: strip_control_sequences(&error_summary(ename, evalue)),
        traceback_lines: clean_traceback(traceback),
    })
}
