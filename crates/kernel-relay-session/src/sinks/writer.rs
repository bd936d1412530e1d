//! Sink over any async writer (stdout, a file, a socket).

use std::sync::Arc;

use async_trait::async_trait;
use kernel_relay_core::{Sink, SinkError, SinkId};
use tokio::{
    io::{AsyncWrite, AsyncWriteExt, BufWriter},
    sync::Mutex,
};

/// Writes each line followed by `\n` and flushes after every append.
#[derive(Clone)]
pub struct WriterSink {
    id: SinkId,
    writer: Arc<Mutex<BufWriter<Box<dyn AsyncWrite + Send + Unpin>>>>,
}

impl WriterSink {
    #[must_use]
    pub fn new(id: impl Into<SinkId>, writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self {
            id: id.into(),
            writer: Arc::new(Mutex::new(BufWriter::new(Box::new(writer)))),
        }
    }
}

#[async_trait]
impl Sink for WriterSink {
    fn id(&self) -> SinkId {
        self.id.clone()
    }

    async fn append(&self, lines: &[String]) -> Result<(), SinkError> {
        let mut guard = self.writer.lock().await;
        for line in lines {
            guard.write_all(line.as_bytes()).await?;
            guard.write_all(b"\n").await?;
        }
        guard.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;

    use super::*;

    #[tokio::test]
    async fn test_writer_sink_writes_lines() {
        let (client, mut server) = tokio::io::duplex(1024);
        let sink = WriterSink::new("pipe", client);

        sink.append(&["Out [1]: 2".to_string(), String::new()])
            .await
            .unwrap();
        drop(sink);

        let mut written = String::new();
        server.read_to_string(&mut written).await.unwrap();
        assert_eq!(written, "Out [1]: 2\n\n");
    }
}
