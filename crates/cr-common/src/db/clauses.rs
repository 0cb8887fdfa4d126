use deadpool_postgres::PoolError;
use tokio_postgres::Error as PgError;
use tokio_postgres::Row;
use tracing::instrument;

use crate::db::PgPool;
use crate::schema::ClauseBoundary;

#[derive(Debug, thiserror::Error)]
pub enum ClauseStorageError {
    #[error("failed to get postgres connection: {0}")]
    Pool(#[from] PoolError),
    #[error("postgres error: {0}")]
    Postgres(#[from] PgError),
    #[error("failed to map clause boundary row: {0}")]
    Mapping(String),
}

fn char_offset(row: &Row, column: &str) -> Result<usize, ClauseStorageError> {
    let raw: i64 = row.try_get(column)?;
    usize::try_from(raw).map_err(|e| ClauseStorageError::Mapping(format!("{column}: {e}")))
}

fn row_to_clause(row: &Row) -> Result<ClauseBoundary, ClauseStorageError> {
    Ok(ClauseBoundary {
        id: row.try_get("id")?,
        document_id: row.try_get("document_id")?,
        clause_type: row.try_get("clause_type")?,
        content: row.try_get("content")?,
        confidence: row.try_get("confidence")?,
        start_char: char_offset(row, "start_char")?,
        end_char: char_offset(row, "end_char")?,
        section_title: row.try_get("section_title")?,
        library_similarity: row.try_get("library_similarity")?,
    })
}

#[instrument(skip(pool))]
pub async fn fetch_clause_boundaries(
    pool: &PgPool,
    document_id: i64,
) -> Result<Vec<ClauseBoundary>, ClauseStorageError> {
    let client = pool.get().await?;
    let rows = client
        .query(
            "SELECT id, document_id, clause_type, content, confidence, start_char, end_char, section_title, library_similarity FROM recon.clause_boundaries WHERE document_id = $1 ORDER BY start_char",
            &[&document_id],
        )
        .await?;

    rows.iter().map(row_to_clause).collect()
}
