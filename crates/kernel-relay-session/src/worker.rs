//! Per-sink delivery queue.
//!
//! Each registered target gets one task that applies appends in submission
//! order. Submitting never waits for the sink; a failing append is logged and
//! the queue moves on.

use std::sync::Arc;

use kernel_relay_core::{Sink, SinkError, SinkId};
use tokio::sync::{mpsc, oneshot};

enum SinkCommand {
    Append(Arc<[String]>),
    Barrier(oneshot::Sender<()>),
}

/// Handle to a sink's delivery task.
///
/// Dropping the handle closes the queue; the task finishes the appends
/// already submitted and exits.
pub(crate) struct SinkWorker {
    id: SinkId,
    tx: mpsc::UnboundedSender<SinkCommand>,
}

impl SinkWorker {
    /// Spawn the delivery task. Must be called within a Tokio runtime.
    pub(crate) fn spawn(sink: Arc<dyn Sink>) -> Self {
        let id = sink.id();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let task_id = id.clone();
        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                match command {
                    SinkCommand::Append(lines) => {
                        if let Err(e) = sink.append(&lines).await {
                            tracing::warn!(sink = %task_id, "Sink delivery failed: {e}");
                        }
                    }
                    SinkCommand::Barrier(done) => {
                        let _ = done.send(());
                    }
                }
            }
            tracing::trace!(sink = %task_id, "Sink worker stopped");
        });

        Self { id, tx }
    }

    /// Queue lines for the sink.
    pub(crate) fn submit(&self, lines: Arc<[String]>) -> Result<(), SinkError> {
        self.tx
            .send(SinkCommand::Append(lines))
            .map_err(|_| SinkError::Closed(self.id.clone()))
    }

    /// Receiver that resolves once everything queued before it was applied.
    pub(crate) fn barrier(&self) -> Option<oneshot::Receiver<()>> {
        let (done, wait) = oneshot::channel();
        self.tx.send(SinkCommand::Barrier(done)).ok()?;
        Some(wait)
    }
}
