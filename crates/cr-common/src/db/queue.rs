use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use deadpool_postgres::PoolError;
use tokio_postgres::Error as PgError;
use tokio_postgres::Row;
use tracing::instrument;

use crate::db::PgPool;
use crate::db::util::maybe_log_slow_query;
use crate::queue::{ProcessingType, QueueError, QueueMessage, WorkQueue};

#[derive(Debug, thiserror::Error)]
pub enum QueueStorageError {
    #[error("failed to get postgres connection: {0}")]
    Pool(#[from] PoolError),
    #[error("postgres error: {0}")]
    Postgres(#[from] PgError),
    #[error("failed to map queue row: {0}")]
    Mapping(String),
}

impl From<QueueStorageError> for QueueError {
    fn from(value: QueueStorageError) -> Self {
        QueueError::Storage(value.to_string())
    }
}

fn parse_processing_type(value: &str) -> Result<ProcessingType, QueueStorageError> {
    ProcessingType::parse(value)
        .ok_or_else(|| QueueStorageError::Mapping(format!("unknown processing_type: {value}")))
}

fn row_to_message(row: &Row) -> Result<QueueMessage, QueueStorageError> {
    Ok(QueueMessage {
        id: row.try_get("id")?,
        document_id: row.try_get("document_id")?,
        tenant_id: row.try_get("tenant_id")?,
        object_path: row.try_get("object_path")?,
        processing_type: parse_processing_type(
            row.try_get::<_, String>("processing_type")?.as_str(),
        )?,
        enqueued_at: row.try_get("enqueued_at")?,
    })
}

/// Postgres-backed work queue. `FOR UPDATE SKIP LOCKED` is the lease: two
/// workers polling the same table never see the same pending message.
#[derive(Clone)]
pub struct PgWorkQueue {
    pool: PgPool,
}

impl PgWorkQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[instrument(skip(self))]
    async fn dequeue_batch(
        &self,
        worker_id: &str,
        max: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueMessage>, QueueStorageError> {
        let client = self.pool.get().await?;
        let stmt = client
            .prepare(
                "UPDATE recon.document_queue
SET
    status = 'processing',
    locked_by = $1,
    processing_started_at = $2,
    updated_at = $2
WHERE id IN (
    SELECT id
    FROM recon.document_queue
    WHERE status = 'pending'
    ORDER BY enqueued_at
    LIMIT $3
    FOR UPDATE SKIP LOCKED
)
RETURNING id, document_id, tenant_id, object_path, processing_type, enqueued_at;",
            )
            .await?;

        let started = Instant::now();
        let rows = client.query(&stmt, &[&worker_id, &now, &max]).await?;
        maybe_log_slow_query("dequeue_document_queue", started);
        rows.iter().map(row_to_message).collect()
    }

    #[instrument(skip(self))]
    async fn delete_message(&self, message_id: i64) -> Result<u64, QueueStorageError> {
        let client = self.pool.get().await?;
        let rows = client
            .execute(
                "DELETE FROM recon.document_queue WHERE id = $1",
                &[&message_id],
            )
            .await?;
        Ok(rows)
    }

    /// Move a message to the dead-letter table in one transaction so it is
    /// never both active and archived, and never silently lost.
    #[instrument(skip(self, error))]
    async fn archive_message(
        &self,
        message_id: i64,
        error: &str,
    ) -> Result<(), QueueStorageError> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        tx.execute(
            "INSERT INTO recon.document_queue_archive (
                document_id, tenant_id, object_path, processing_type, enqueued_at, error_message
            )
            SELECT document_id, tenant_id, object_path, processing_type, enqueued_at, $2
            FROM recon.document_queue
            WHERE id = $1",
            &[&message_id, &error],
        )
        .await?;
        tx.execute(
            "DELETE FROM recon.document_queue WHERE id = $1",
            &[&message_id],
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn recover_stale_messages(
        &self,
        now: DateTime<Utc>,
        max_processing: Duration,
    ) -> Result<u64, QueueStorageError> {
        let client = self.pool.get().await?;
        let cutoff = now - max_processing;

        let rows = client
            .execute(
                "UPDATE recon.document_queue SET
                    status = 'pending',
                    locked_by = NULL,
                    processing_started_at = NULL,
                    updated_at = $1
                WHERE status = 'processing'
                  AND COALESCE(processing_started_at, updated_at) <= $2",
                &[&now, &cutoff],
            )
            .await?;
        Ok(rows)
    }
}

impl WorkQueue for PgWorkQueue {
    async fn dequeue(
        &self,
        worker_id: &str,
        max: usize,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        let max = i64::try_from(max).unwrap_or(i64::MAX);
        Ok(self.dequeue_batch(worker_id, max, Utc::now()).await?)
    }

    async fn delete(&self, message_id: i64) -> Result<u64, QueueError> {
        Ok(self.delete_message(message_id).await?)
    }

    async fn archive(&self, message_id: i64, error: &str) -> Result<(), QueueError> {
        Ok(self.archive_message(message_id, error).await?)
    }

    async fn recover_stale(
        &self,
        now: DateTime<Utc>,
        max_processing: Duration,
    ) -> Result<u64, QueueError> {
        Ok(self.recover_stale_messages(now, max_processing).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_processing_type_rejects_unknown_values() {
        assert_eq!(
            parse_processing_type("full").unwrap(),
            ProcessingType::Full
        );
        assert_eq!(
            parse_processing_type("reconcile_only").unwrap(),
            ProcessingType::ReconcileOnly
        );
        let err = parse_processing_type("half").unwrap_err();
        assert!(format!("{err}").contains("unknown processing_type"));
    }
}
