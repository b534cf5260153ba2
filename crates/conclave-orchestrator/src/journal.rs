use async_trait::async_trait;
use conclave_core::{BusMessage, ConclaveResult, EventEnvelope, EventSubscription};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const MAX_BATCH: usize = 256;

/// Persistence collaborator receiving batches of event envelopes.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Persist `batch` in order. A failed batch is logged and dropped.
    async fn write_batch(&self, batch: &[EventEnvelope]) -> ConclaveResult<()>;
}

/// Appends one JSON object per line.
pub struct JsonlEventSink {
    path: PathBuf,
}

impl JsonlEventSink {
    /// Sink appending to `path`, created on first write.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// File being appended to.
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[async_trait]
impl EventSink for JsonlEventSink {
    async fn write_batch(&self, batch: &[EventEnvelope]) -> ConclaveResult<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut buf = String::new();
        for envelope in batch {
            buf.push_str(&serde_json::to_string(envelope)?);
            buf.push('\n');
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(buf.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Feeds an [`EventSink`] from its own bus subscription so that a slow or
/// failing sink never blocks the engine.
pub struct EventJournal;

impl EventJournal {
    /// Spawn the journal loop. The handle resolves to the number of envelopes
    /// written once the bus closes or `shutdown` flips.
    pub fn spawn(
        mut subscription: EventSubscription,
        sink: Arc<dyn EventSink>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<u64> {
        tokio::spawn(async move {
            let mut written = 0u64;
            loop {
                let first = tokio::select! {
                    message = subscription.recv() => match message {
                        Some(message) => message,
                        None => break,
                    },
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                };
                let mut batch = Vec::new();
                collect(first, &mut batch);
                while batch.len() < MAX_BATCH {
                    match subscription.try_recv() {
                        Some(message) => collect(message, &mut batch),
                        None => break,
                    }
                }
                written += flush(sink.as_ref(), &batch).await;
            }

            let mut rest = Vec::new();
            while let Some(message) = subscription.try_recv() {
                collect(message, &mut rest);
            }
            written += flush(sink.as_ref(), &rest).await;
            info!(written, "event journal stopped");
            written
        })
    }
}

fn collect(message: BusMessage, batch: &mut Vec<EventEnvelope>) {
    match message {
        BusMessage::Event(envelope) => batch.push(envelope),
        BusMessage::Lagged(n) => warn!(dropped = n, "event journal lagged"),
    }
}

async fn flush(sink: &dyn EventSink, batch: &[EventEnvelope]) -> u64 {
    if batch.is_empty() {
        return 0;
    }
    match sink.write_batch(batch).await {
        Ok(()) => {
            debug!(count = batch.len(), "journal batch written");
            batch.len() as u64
        }
        Err(e) => {
            warn!(error = %e, count = batch.len(), "journal write failed");
            0
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use conclave_core::{ConclaveError, CoordinationEvent, EventBus, TaskId};

    struct FailingSink;

    #[async_trait]
    impl EventSink for FailingSink {
        async fn write_batch(&self, _batch: &[EventEnvelope]) -> ConclaveResult<()> {
            Err(ConclaveError::Io("disk full".into()))
        }
    }

    #[tokio::test]
    async fn test_jsonl_journal_writes_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events").join("journal.jsonl");
        let bus = EventBus::new(64);
        let (tx, rx) = watch::channel(false);
        let handle = EventJournal::spawn(
            bus.subscribe(),
            Arc::new(JsonlEventSink::new(&path)),
            rx,
        );

        for _ in 0..3 {
            bus.publish(CoordinationEvent::TaskReady {
                task_id: TaskId::new(),
            });
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        assert_eq!(handle.await.unwrap(), 3);

        let raw = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 3);
        let first: EventEnvelope = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.seq, 1);
    }

    #[tokio::test]
    async fn test_failing_sink_does_not_stop_journal() {
        let bus = EventBus::new(64);
        let (tx, rx) = watch::channel(false);
        let handle = EventJournal::spawn(bus.subscribe(), Arc::new(FailingSink), rx);
        bus.publish(CoordinationEvent::TaskReady {
            task_id: TaskId::new(),
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!handle.is_finished());
        tx.send(true).unwrap();
        assert_eq!(handle.await.unwrap(), 0);
    }
}
