//! In-memory capture sink.

use std::sync::{
    RwLock,
    atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use kernel_relay_core::{Sink, SinkError, SinkId};

/// Sink that records every append.
///
/// Useful for tests and headless hosts. A closed sink rejects appends the
/// way a wiped editor buffer would.
pub struct MemorySink {
    id: SinkId,
    appends: RwLock<Vec<Vec<String>>>,
    closed: AtomicBool,
}

impl MemorySink {
    #[must_use]
    pub fn new(id: impl Into<SinkId>) -> Self {
        Self {
            id: id.into(),
            appends: RwLock::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Every append so far, in order.
    #[must_use]
    pub fn appends(&self) -> Vec<Vec<String>> {
        self.appends.read().map(|a| a.clone()).unwrap_or_default()
    }

    /// All appended lines, flattened.
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        self.appends().into_iter().flatten().collect()
    }

    /// Make further appends fail.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Sink for MemorySink {
    fn id(&self) -> SinkId {
        self.id.clone()
    }

    async fn append(&self, lines: &[String]) -> Result<(), SinkError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SinkError::Closed(self.id.clone()));
        }
        self.appends
            .write()
            .map_err(|e| SinkError::Delivery(e.to_string()))?
            .push(lines.to_vec());
        Ok(())
    }
}
