//! Advisory audit trail.
//!
//! Audit writes are fire-and-forget: they ride a bounded channel to a
//! background writer and must never block or fail step execution. A
//! full buffer drops the record with a warning.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use crate::error::EngineResult;
use crate::model::AuditRecord;

/// Destination for audit records.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: AuditRecord) -> EngineResult<()>;
}

/// Bounded, non-blocking outbox in front of an [`AuditSink`].
pub struct AuditOutbox {
    tx: mpsc::Sender<AuditRecord>,
    close: Arc<Notify>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl AuditOutbox {
    /// Spawn the background writer draining into `sink`.
    pub fn spawn(sink: Arc<dyn AuditSink>, buffer: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<AuditRecord>(buffer.max(1));
        let close = Arc::new(Notify::new());
        let closed = close.clone();
        let writer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    maybe = rx.recv() => match maybe {
                        Some(record) => {
                            if let Err(err) = sink.record(record).await {
                                tracing::warn!(error = %err, "Audit record write failed");
                            }
                        }
                        None => break,
                    },
                    _ = closed.notified() => {
                        // Refuse new records; recv keeps yielding the
                        // buffered ones until the channel is drained.
                        rx.close();
                    }
                }
            }
        });
        Self {
            tx,
            close,
            writer: Mutex::new(Some(writer)),
        }
    }

    /// Submit a record without waiting. Drops on a full buffer or after
    /// shutdown.
    pub fn submit(&self, record: AuditRecord) {
        if let Err(err) = self.tx.try_send(record) {
            tracing::warn!(error = %err, "Audit record dropped");
        }
    }

    /// Stop accepting records and wait for the writer to drain. Works
    /// through shared handles; later calls are no-ops.
    pub async fn shutdown(&self) {
        self.close.notify_one();
        let writer = self.writer.lock().await.take();
        if let Some(writer) = writer {
            if let Err(err) = writer.await {
                tracing::warn!(error = %err, "Audit writer task failed");
            }
        }
    }
}

/// Sink collecting records in memory, for embedding and tests.
#[derive(Default)]
pub struct InMemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn record(&self, record: AuditRecord) -> EngineResult<()> {
        self.records.lock().await.push(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_outbox_drains_on_shutdown() {
        let sink = Arc::new(InMemoryAuditSink::new());
        let outbox = AuditOutbox::spawn(sink.clone(), 16);

        outbox.submit(AuditRecord::new(
            Uuid::new_v4(),
            "workflow_created",
            "Workflow created",
            None,
        ));
        outbox.submit(AuditRecord::new(
            Uuid::new_v4(),
            "workflow_started",
            "Workflow started",
            None,
        ));
        outbox.shutdown().await;

        let records = sink.records().await;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].action_type, "workflow_created");
    }

    #[tokio::test]
    async fn test_shutdown_drains_through_shared_handle() {
        let sink = Arc::new(InMemoryAuditSink::new());
        let outbox = Arc::new(AuditOutbox::spawn(sink.clone(), 16));

        let submitter = outbox.clone();
        submitter.submit(AuditRecord::new(
            Uuid::new_v4(),
            "workflow_step_execution",
            "Step executed",
            None,
        ));
        outbox.shutdown().await;
        // A second shutdown through another clone is a no-op.
        submitter.shutdown().await;

        let records = sink.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].action_type, "workflow_step_execution");
    }

    #[tokio::test]
    async fn test_submit_never_blocks_when_full() {
        struct StallSink;

        #[async_trait]
        impl AuditSink for StallSink {
            async fn record(&self, _record: AuditRecord) -> EngineResult<()> {
                tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
                Ok(())
            }
        }

        let outbox = AuditOutbox::spawn(Arc::new(StallSink), 1);
        for _ in 0..10 {
            outbox.submit(AuditRecord::new(Uuid::new_v4(), "noop", "noop", None));
        }
        // Reaching here without awaiting the writer is the assertion.
        if let Some(writer) = outbox.writer.lock().await.take() {
            writer.abort();
        };
    }
}
