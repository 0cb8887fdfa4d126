use chrono::Utc;
use deadpool_postgres::PoolError;
use tokio_postgres::Error as PgError;
use tracing::instrument;

use crate::db::PgPool;
use crate::db::util::normalize_json;
use crate::schema::ReviewQueueItem;

#[derive(Debug, thiserror::Error)]
pub enum ReviewQueueStorageError {
    #[error("failed to get postgres connection: {0}")]
    Pool(#[from] PoolError),
    #[error("postgres error: {0}")]
    Postgres(#[from] PgError),
}

/// Insert a review-queue entry. A duplicate for the same (document,
/// clause?, term?, reason) scope is a successful no-op.
#[instrument(skip(pool, item))]
pub async fn insert_review_item(
    pool: &PgPool,
    item: &ReviewQueueItem,
) -> Result<u64, ReviewQueueStorageError> {
    let client = pool.get().await?;

    let stmt = client
        .prepare(
            "INSERT INTO recon.review_queue (
                document_id,
                clause_boundary_id,
                term_id,
                reason,
                priority,
                metadata,
                created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT DO NOTHING;",
        )
        .await?;

    let created_at = item.created_at.unwrap_or_else(Utc::now);
    let rows = client
        .execute(
            &stmt,
            &[
                &item.document_id,
                &item.clause_boundary_id,
                &item.term_id,
                &item.reason.as_str(),
                &item.priority,
                &normalize_json(&item.metadata),
                &created_at,
            ],
        )
        .await?;

    Ok(rows)
}
