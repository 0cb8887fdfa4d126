use deadpool_postgres::PoolError;
use serde_json::Value;
use tokio_postgres::Error as PgError;
use tokio_postgres::Row;
use tracing::instrument;

use crate::db::PgPool;
use crate::schema::PreAgreedTerm;

#[derive(Debug, thiserror::Error)]
pub enum TermStorageError {
    #[error("failed to get postgres connection: {0}")]
    Pool(#[from] PoolError),
    #[error("postgres error: {0}")]
    Postgres(#[from] PgError),
    #[error("failed to map pre-agreed term row: {0}")]
    Mapping(String),
}

fn parse_related_types(value: Value) -> Result<Vec<String>, TermStorageError> {
    serde_json::from_value(value)
        .map_err(|e| TermStorageError::Mapping(format!("related_clause_types: {e}")))
}

fn row_to_term(row: &Row) -> Result<PreAgreedTerm, TermStorageError> {
    Ok(PreAgreedTerm {
        id: row.try_get("id")?,
        deal_id: row.try_get("deal_id")?,
        category: row.try_get("category")?,
        expected_value: row.try_get("expected_value")?,
        mandatory: row.try_get("mandatory")?,
        related_clause_types: parse_related_types(
            row.try_get::<_, Value>("related_clause_types")?,
        )?,
    })
}

#[instrument(skip(pool))]
pub async fn fetch_terms_for_deal(
    pool: &PgPool,
    deal_id: i64,
) -> Result<Vec<PreAgreedTerm>, TermStorageError> {
    let client = pool.get().await?;
    let rows = client
        .query(
            "SELECT id, deal_id, category, expected_value, mandatory, related_clause_types FROM recon.pre_agreed_terms WHERE deal_id = $1 ORDER BY id",
            &[&deal_id],
        )
        .await?;

    rows.iter().map(row_to_term).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn related_types_parse_from_json_arrays() {
        let parsed = parse_related_types(serde_json::json!(["payment", "fees"])).unwrap();
        assert_eq!(parsed, vec!["payment".to_string(), "fees".to_string()]);

        let parsed = parse_related_types(serde_json::json!([])).unwrap();
        assert!(parsed.is_empty());

        let err = parse_related_types(serde_json::json!({"not": "a list"})).unwrap_err();
        assert!(format!("{err}").contains("related_clause_types"));
    }
}
