//! Correlation of replies to in-flight requests.
//!
//! A request is complete once two independent signals have arrived for its
//! correlation id: a reply on the control channel and an `idle` status on the
//! broadcast channel. They may arrive in either order, or never. Nothing here
//! times out; an incomplete request lives until it is finished or abandoned.

use std::collections::HashMap;

use thiserror::Error;

use crate::message::{CorrelationId, SignalKind};

/// Completion state of a tracked request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// No signal received yet.
    Pending,
    /// One of the two signals received.
    Partial,
    /// Both signals received; the entry is ready to be finished.
    Done,
}

/// Tracker error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrackerError {
    #[error("Request {0} is already being tracked")]
    DuplicateRequest(CorrelationId),
}

/// An in-flight request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub correlation_id: CorrelationId,
    control_reply: bool,
    broadcast_idle: bool,
    /// Execution count echoed back by the kernel's `execute_input`.
    pub execution_count: Option<u64>,
    /// Submitted code, when the request was sent through this session.
    pub code: Option<String>,
}

impl PendingRequest {
    fn new(correlation_id: CorrelationId) -> Self {
        Self {
            correlation_id,
            control_reply: false,
            broadcast_idle: false,
            execution_count: None,
            code: None,
        }
    }

    /// Number of distinct completion signals received.
    #[must_use]
    pub fn signal_count(&self) -> u8 {
        u8::from(self.control_reply) + u8::from(self.broadcast_idle)
    }

    #[must_use]
    pub fn state(&self) -> RequestState {
        match self.signal_count() {
            0 => RequestState::Pending,
            1 => RequestState::Partial,
            _ => RequestState::Done,
        }
    }

    fn record(&mut self, signal: SignalKind) {
        match signal {
            SignalKind::ControlReply => self.control_reply = true,
            SignalKind::BroadcastIdle => self.broadcast_idle = true,
        }
    }
}

/// Per-session map of in-flight requests.
#[derive(Debug, Default)]
pub struct RequestTracker {
    pending: HashMap<CorrelationId, PendingRequest>,
}

impl RequestTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a request.
    ///
    /// # Errors
    /// Returns error if the id is already tracked.
    pub fn begin_request(&mut self, id: CorrelationId) -> Result<(), TrackerError> {
        if self.pending.contains_key(&id) {
            return Err(TrackerError::DuplicateRequest(id));
        }
        self.pending.insert(id.clone(), PendingRequest::new(id));
        Ok(())
    }

    /// Record a completion signal.
    ///
    /// Returns the request's new state, or `None` if the id is not tracked.
    /// Repeating a signal kind does not advance the state.
    pub fn observe(&mut self, id: &CorrelationId, signal: SignalKind) -> Option<RequestState> {
        let request = self.pending.get_mut(id)?;
        request.record(signal);
        Some(request.state())
    }

    #[must_use]
    pub fn is_complete(&self, id: &CorrelationId) -> bool {
        self.pending
            .get(id)
            .is_some_and(|r| r.state() == RequestState::Done)
    }

    /// Stop tracking a request. No-op if it is already gone.
    pub fn finish(&mut self, id: &CorrelationId) -> Option<PendingRequest> {
        self.pending.remove(id)
    }

    #[must_use]
    pub fn is_tracked(&self, id: &CorrelationId) -> bool {
        self.pending.contains_key(id)
    }

    #[must_use]
    pub fn get(&self, id: &CorrelationId) -> Option<&PendingRequest> {
        self.pending.get(id)
    }

    pub fn record_execution_count(&mut self, id: &CorrelationId, execution_count: u64) {
        if let Some(request) = self.pending.get_mut(id) {
            request.execution_count = Some(execution_count);
        }
    }

    pub fn record_code(&mut self, id: &CorrelationId, code: impl Into<String>) {
        if let Some(request) = self.pending.get_mut(id) {
            request.code = Some(code.into());
        }
    }

    #[must_use]
    pub fn execution_count(&self, id: &CorrelationId) -> Option<u64> {
        self.pending.get(id).and_then(|r| r.execution_count)
    }

    /// Ids still waiting, sorted.
    #[must_use]
    pub fn pending_ids(&self) -> Vec<CorrelationId> {
        let mut ids: Vec<CorrelationId> = self.pending.keys().cloned().collect();
        ids.sort();
        ids
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drop every pending and partial request without completing it.
    pub fn abandon_all(&mut self) -> Vec<CorrelationId> {
        let mut ids: Vec<CorrelationId> = self.pending.drain().map(|(id, _)| id).collect();
        ids.sort();
        ids
    }
}
