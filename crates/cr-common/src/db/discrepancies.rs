use chrono::Utc;
use deadpool_postgres::PoolError;
use tokio_postgres::Error as PgError;
use tracing::instrument;

use crate::db::PgPool;
use crate::schema::Discrepancy;

#[derive(Debug, thiserror::Error)]
pub enum DiscrepancyStorageError {
    #[error("failed to get postgres connection: {0}")]
    Pool(#[from] PoolError),
    #[error("postgres error: {0}")]
    Postgres(#[from] PgError),
}

/// Insert a discrepancy. A duplicate for the same (document, clause?, term?,
/// kind) scope is a successful no-op; returns how many rows were written.
#[instrument(skip(pool, discrepancy))]
pub async fn insert_discrepancy(
    pool: &PgPool,
    discrepancy: &Discrepancy,
) -> Result<u64, DiscrepancyStorageError> {
    let client = pool.get().await?;

    let stmt = client
        .prepare(
            "INSERT INTO recon.discrepancies (
                document_id,
                clause_boundary_id,
                term_id,
                kind,
                severity,
                description,
                created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT DO NOTHING;",
        )
        .await?;

    let created_at = discrepancy.created_at.unwrap_or_else(Utc::now);
    let rows = client
        .execute(
            &stmt,
            &[
                &discrepancy.document_id,
                &discrepancy.clause_boundary_id,
                &discrepancy.term_id,
                &discrepancy.kind.as_str(),
                &discrepancy.severity.as_str(),
                &discrepancy.description,
                &created_at,
            ],
        )
        .await?;

    Ok(rows)
}
