use chrono::{DateTime, Utc};
use deadpool_postgres::PoolError;
use tokio_postgres::Error as PgError;
use tokio_postgres::Row;
use tracing::instrument;

use crate::db::PgPool;
use crate::schema::{Document, DocumentStatus};

#[derive(Debug, thiserror::Error)]
pub enum DocumentStorageError {
    #[error("failed to get postgres connection: {0}")]
    Pool(#[from] PoolError),
    #[error("postgres error: {0}")]
    Postgres(#[from] PgError),
    #[error("failed to map document row: {0}")]
    Mapping(String),
}

fn parse_status(value: &str) -> Result<DocumentStatus, DocumentStorageError> {
    DocumentStatus::parse(value)
        .ok_or_else(|| DocumentStorageError::Mapping(format!("unknown document status: {value}")))
}

fn row_to_document(row: &Row) -> Result<Document, DocumentStorageError> {
    Ok(Document {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        deal_id: row.try_get("deal_id")?,
        object_path: row.try_get("object_path")?,
        full_text: row.try_get("full_text")?,
        status: parse_status(row.try_get::<_, String>("status")?.as_str())?,
        error_message: row.try_get("error_message")?,
        reconciled_at: row.try_get("reconciled_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[instrument(skip(pool))]
pub async fn fetch_document(
    pool: &PgPool,
    document_id: i64,
) -> Result<Option<Document>, DocumentStorageError> {
    let client = pool.get().await?;
    let row = client
        .query_opt(
            "SELECT id, tenant_id, deal_id, object_path, full_text, status, error_message, reconciled_at, created_at, updated_at FROM recon.documents WHERE id = $1",
            &[&document_id],
        )
        .await?;

    row.map(|r| row_to_document(&r)).transpose()
}

/// Set the overall processing status and (for failures) the error message.
#[instrument(skip(pool, error_message))]
pub async fn set_document_status(
    pool: &PgPool,
    document_id: i64,
    status: DocumentStatus,
    error_message: Option<&str>,
) -> Result<u64, DocumentStorageError> {
    let client = pool.get().await?;
    let rows = client
        .execute(
            "UPDATE recon.documents SET status = $2, error_message = $3, updated_at = NOW() WHERE id = $1",
            &[&document_id, &status.as_str(), &error_message],
        )
        .await?;
    Ok(rows)
}

/// Stamp the reconciliation completion marker. A later run treats a stamped
/// document as already reconciled (but still re-processable).
#[instrument(skip(pool))]
pub async fn set_document_reconciled(
    pool: &PgPool,
    document_id: i64,
    at: DateTime<Utc>,
) -> Result<u64, DocumentStorageError> {
    let client = pool.get().await?;
    let rows = client
        .execute(
            "UPDATE recon.documents SET reconciled_at = $2, updated_at = $2 WHERE id = $1",
            &[&document_id, &at],
        )
        .await?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_status_accepts_known_values_only() {
        assert!(parse_status("pending").is_ok());
        assert!(parse_status("processing").is_ok());
        assert!(parse_status("completed").is_ok());
        assert!(parse_status("failed").is_ok());

        let err = parse_status("archived").unwrap_err();
        assert!(format!("{err}").contains("unknown document status"));
    }
}
