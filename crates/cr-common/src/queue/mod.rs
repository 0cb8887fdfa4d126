//! Work queue model for the document pipeline.
//!
//! The queue's lease mechanism is the only cross-instance concurrency
//! boundary: delivery is at-least-once, and every downstream write is
//! idempotent to tolerate re-processing. The Postgres implementation lives
//! in `db::queue`; the in-memory implementation backs tests and local runs.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingType {
    /// Run the whole pipeline: extract, embed, library-match, reconcile.
    Full,
    /// Re-run reconciliation only, e.g. after pre-agreed terms changed.
    ReconcileOnly,
}

impl ProcessingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingType::Full => "full",
            ProcessingType::ReconcileOnly => "reconcile_only",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "full" => Some(ProcessingType::Full),
            "reconcile_only" => Some(ProcessingType::ReconcileOnly),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueMessage {
    pub id: i64,
    pub document_id: i64,
    pub tenant_id: i64,
    pub object_path: String,
    pub processing_type: ProcessingType,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue storage error: {0}")]
    Storage(String),
}

#[allow(async_fn_in_trait)]
pub trait WorkQueue {
    /// Lease up to `max` pending messages for `worker_id`.
    async fn dequeue(
        &self,
        worker_id: &str,
        max: usize,
    ) -> Result<Vec<QueueMessage>, QueueError>;

    /// Acknowledge a processed message. Returns the number of rows removed
    /// (0 when the message was already gone).
    async fn delete(&self, message_id: i64) -> Result<u64, QueueError>;

    /// Move a failed message to the dead-letter area for inspection.
    async fn archive(&self, message_id: i64, error: &str) -> Result<(), QueueError>;

    /// Return messages stuck in `processing` past the lease window back to
    /// `pending`. Returns how many were recovered.
    async fn recover_stale(
        &self,
        now: DateTime<Utc>,
        max_processing: Duration,
    ) -> Result<u64, QueueError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MessageState {
    Pending,
    Processing,
}

#[derive(Debug)]
struct StoredMessage {
    message: QueueMessage,
    state: MessageState,
    locked_by: Option<String>,
    processing_started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct MemoryQueueInner {
    next_id: i64,
    messages: Vec<StoredMessage>,
    archived: Vec<(QueueMessage, String)>,
}

/// In-memory queue with the same lease semantics as the Postgres one.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    inner: Mutex<MemoryQueueInner>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a document. Duplicate enqueues for a document already in the
    /// queue are dropped.
    pub fn enqueue(
        &self,
        document_id: i64,
        tenant_id: i64,
        object_path: impl Into<String>,
        processing_type: ProcessingType,
    ) -> Option<i64> {
        let mut inner = self.inner.lock().unwrap();
        if inner
            .messages
            .iter()
            .any(|stored| stored.message.document_id == document_id)
        {
            return None;
        }

        inner.next_id += 1;
        let id = inner.next_id;
        inner.messages.push(StoredMessage {
            message: QueueMessage {
                id,
                document_id,
                tenant_id,
                object_path: object_path.into(),
                processing_type,
                enqueued_at: Utc::now(),
            },
            state: MessageState::Pending,
            locked_by: None,
            processing_started_at: None,
        });
        Some(id)
    }

    pub fn pending_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .messages
            .iter()
            .filter(|stored| stored.state == MessageState::Pending)
            .count()
    }

    pub fn archived(&self) -> Vec<(QueueMessage, String)> {
        self.inner.lock().unwrap().archived.clone()
    }
}

impl WorkQueue for MemoryQueue {
    async fn dequeue(
        &self,
        worker_id: &str,
        max: usize,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        let mut leased = Vec::new();

        for stored in inner.messages.iter_mut() {
            if leased.len() >= max {
                break;
            }
            if stored.state == MessageState::Pending {
                stored.state = MessageState::Processing;
                stored.locked_by = Some(worker_id.to_string());
                stored.processing_started_at = Some(now);
                leased.push(stored.message.clone());
            }
        }

        Ok(leased)
    }

    async fn delete(&self, message_id: i64) -> Result<u64, QueueError> {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.messages.len();
        inner.messages.retain(|stored| stored.message.id != message_id);
        Ok((before - inner.messages.len()) as u64)
    }

    async fn archive(&self, message_id: i64, error: &str) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(pos) = inner
            .messages
            .iter()
            .position(|stored| stored.message.id == message_id)
        {
            let stored = inner.messages.remove(pos);
            inner.archived.push((stored.message, error.to_string()));
        }
        Ok(())
    }

    async fn recover_stale(
        &self,
        now: DateTime<Utc>,
        max_processing: Duration,
    ) -> Result<u64, QueueError> {
        let cutoff = now - max_processing;
        let mut inner = self.inner.lock().unwrap();
        let mut recovered = 0;

        for stored in inner.messages.iter_mut() {
            let started = stored.processing_started_at.unwrap_or(now);
            if stored.state == MessageState::Processing && started <= cutoff {
                stored.state = MessageState::Pending;
                stored.locked_by = None;
                stored.processing_started_at = None;
                recovered += 1;
            }
        }

        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn processing_type_round_trips() {
        for pt in [ProcessingType::Full, ProcessingType::ReconcileOnly] {
            assert_eq!(ProcessingType::parse(pt.as_str()), Some(pt));
        }
        assert_eq!(ProcessingType::parse("partial"), None);
    }

    #[tokio::test]
    async fn dequeue_leases_a_bounded_batch() {
        let queue = MemoryQueue::new();
        for doc in 1..=8 {
            queue.enqueue(doc, 1, format!("tenant-1/doc-{doc}.pdf"), ProcessingType::Full);
        }

        let batch = queue.dequeue("worker-a", 5).await.unwrap();
        assert_eq!(batch.len(), 5);
        assert_eq!(queue.pending_count(), 3);

        // Leased messages are invisible to a second worker.
        let second = queue.dequeue("worker-b", 5).await.unwrap();
        assert_eq!(second.len(), 3);
    }

    #[tokio::test]
    async fn duplicate_document_enqueue_is_dropped() {
        let queue = MemoryQueue::new();
        assert!(queue.enqueue(7, 1, "a.pdf", ProcessingType::Full).is_some());
        assert!(queue.enqueue(7, 1, "a.pdf", ProcessingType::Full).is_none());
        assert_eq!(queue.pending_count(), 1);
    }

    #[tokio::test]
    async fn delete_acknowledges_and_is_idempotent() {
        let queue = MemoryQueue::new();
        let id = queue.enqueue(1, 1, "a.pdf", ProcessingType::Full).unwrap();
        queue.dequeue("w", 1).await.unwrap();

        assert_eq!(queue.delete(id).await.unwrap(), 1);
        assert_eq!(queue.delete(id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn archive_moves_message_to_dead_letter() {
        let queue = MemoryQueue::new();
        let id = queue.enqueue(1, 1, "a.pdf", ProcessingType::Full).unwrap();
        queue.dequeue("w", 1).await.unwrap();

        queue.archive(id, "extraction failed").await.unwrap();

        assert_eq!(queue.pending_count(), 0);
        let archived = queue.archived();
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].0.document_id, 1);
        assert_eq!(archived[0].1, "extraction failed");
    }

    #[tokio::test]
    async fn stale_leases_are_recovered() {
        let queue = MemoryQueue::new();
        queue.enqueue(1, 1, "a.pdf", ProcessingType::Full);
        queue.dequeue("w", 1).await.unwrap();

        // Not yet stale.
        let recovered = queue
            .recover_stale(Utc::now(), Duration::minutes(15))
            .await
            .unwrap();
        assert_eq!(recovered, 0);

        let recovered = queue
            .recover_stale(Utc::now() + Duration::minutes(16), Duration::minutes(15))
            .await
            .unwrap();
        assert_eq!(recovered, 1);
        assert_eq!(queue.pending_count(), 1);
    }
}
