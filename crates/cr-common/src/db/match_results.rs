use std::time::Instant;

use chrono::Utc;
use deadpool_postgres::PoolError;
use serde_json::Value;
use tokio_postgres::Error as PgError;
use tokio_postgres::Row;
use tokio_postgres::types::{Json, ToSql};
use tracing::instrument;

use crate::db::PgPool;
use crate::db::util::maybe_log_slow_query;
use crate::schema::{ClauseMatchResult, MatchAnalysis, RagStatus};

/// Columns written per result row; placeholders are generated from this.
const UPSERT_COLUMNS: usize = 12;

const UPSERT_CONFLICT_CLAUSE: &str = "ON CONFLICT (document_id, COALESCE(clause_boundary_id, -1), COALESCE(term_id, -1)) DO UPDATE SET
    rag_risk = EXCLUDED.rag_risk,
    rag_parsing = EXCLUDED.rag_parsing,
    rag_status = EXCLUDED.rag_status,
    discrepancy_count = EXCLUDED.discrepancy_count,
    analysis = EXCLUDED.analysis,
    match_run_id = EXCLUDED.match_run_id,
    engine_version = EXCLUDED.engine_version,
    updated_at = EXCLUDED.updated_at";

const UPSERT_COLUMN_LIST: &str = "document_id, clause_boundary_id, term_id, rag_risk, rag_parsing, rag_status, discrepancy_count, analysis, match_run_id, engine_version, created_at, updated_at";

#[derive(Debug, thiserror::Error)]
pub enum MatchResultStorageError {
    #[error("failed to get postgres connection: {0}")]
    Pool(#[from] PoolError),
    #[error("postgres error: {0}")]
    Postgres(#[from] PgError),
    #[error("failed to map match result row: {0}")]
    Mapping(String),
}

fn rag_param(status: &Option<RagStatus>) -> Option<&'static str> {
    status.as_ref().map(RagStatus::as_str)
}

fn parse_rag(
    value: Option<String>,
    column: &str,
) -> Result<Option<RagStatus>, MatchResultStorageError> {
    value
        .map(|raw| {
            RagStatus::parse(&raw).ok_or_else(|| {
                MatchResultStorageError::Mapping(format!("unknown {column}: {raw}"))
            })
        })
        .transpose()
}

fn analysis_param(
    analysis: &Option<MatchAnalysis>,
) -> Result<Option<Json<Value>>, MatchResultStorageError> {
    analysis
        .as_ref()
        .map(|a| {
            serde_json::to_value(a)
                .map(Json)
                .map_err(|e| MatchResultStorageError::Mapping(format!("analysis: {e}")))
        })
        .transpose()
}

fn parse_analysis(
    value: Option<Value>,
) -> Result<Option<MatchAnalysis>, MatchResultStorageError> {
    value
        .map(|raw| {
            serde_json::from_value(raw)
                .map_err(|e| MatchResultStorageError::Mapping(format!("analysis: {e}")))
        })
        .transpose()
}

fn row_to_match_result(row: &Row) -> Result<ClauseMatchResult, MatchResultStorageError> {
    Ok(ClauseMatchResult {
        id: Some(row.try_get("id")?),
        document_id: row.try_get("document_id")?,
        clause_boundary_id: row.try_get("clause_boundary_id")?,
        term_id: row.try_get("term_id")?,
        rag_risk: parse_rag(row.try_get("rag_risk")?, "rag_risk")?,
        rag_parsing: parse_rag(row.try_get("rag_parsing")?, "rag_parsing")?,
        rag_status: parse_rag(row.try_get("rag_status")?, "rag_status")?,
        discrepancy_count: row.try_get("discrepancy_count")?,
        analysis: parse_analysis(row.try_get("analysis")?)?,
        match_run_id: row.try_get("match_run_id")?,
        engine_version: row.try_get("engine_version")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn push_row_params(
    params: &mut Vec<Box<dyn ToSql + Sync + Send>>,
    result: &ClauseMatchResult,
) -> Result<(), MatchResultStorageError> {
    params.push(Box::new(result.document_id));
    params.push(Box::new(result.clause_boundary_id));
    params.push(Box::new(result.term_id));
    params.push(Box::new(rag_param(&result.rag_risk)));
    params.push(Box::new(rag_param(&result.rag_parsing)));
    params.push(Box::new(rag_param(&result.rag_status)));
    params.push(Box::new(result.discrepancy_count));
    params.push(Box::new(analysis_param(&result.analysis)?));
    params.push(Box::new(result.match_run_id.clone()));
    params.push(Box::new(result.engine_version.clone()));
    params.push(Box::new(result.created_at.unwrap_or_else(Utc::now)));
    params.push(Box::new(result.updated_at.unwrap_or_else(Utc::now)));
    Ok(())
}

fn values_group(row_index: usize) -> String {
    let base = row_index * UPSERT_COLUMNS;
    let placeholders: Vec<String> = (1..=UPSERT_COLUMNS)
        .map(|offset| format!("${}", base + offset))
        .collect();
    format!("({})", placeholders.join(", "))
}

#[instrument(skip(pool))]
pub async fn fetch_match_results(
    pool: &PgPool,
    document_id: i64,
) -> Result<Vec<ClauseMatchResult>, MatchResultStorageError> {
    let client = pool.get().await?;
    let started = Instant::now();
    let rows = client
        .query(
            "SELECT id, document_id, clause_boundary_id, term_id, rag_risk, rag_parsing, rag_status, discrepancy_count, analysis, match_run_id, engine_version, created_at, updated_at FROM recon.clause_match_results WHERE document_id = $1 ORDER BY id",
            &[&document_id],
        )
        .await?;
    maybe_log_slow_query("fetch_match_results", started);

    rows.iter().map(row_to_match_result).collect()
}

/// Upsert one result row, keyed by its (document, clause?, term?) scope.
#[instrument(skip(pool, result))]
pub async fn upsert_match_result(
    pool: &PgPool,
    result: &ClauseMatchResult,
) -> Result<u64, MatchResultStorageError> {
    let client = pool.get().await?;

    let query = format!(
        "INSERT INTO recon.clause_match_results ({UPSERT_COLUMN_LIST}) VALUES {} {UPSERT_CONFLICT_CLAUSE}",
        values_group(0)
    );
    let stmt = client.prepare(&query).await?;

    let mut params: Vec<Box<dyn ToSql + Sync + Send>> = Vec::with_capacity(UPSERT_COLUMNS);
    push_row_params(&mut params, result)?;
    let refs: Vec<&(dyn ToSql + Sync)> = params
        .iter()
        .map(|p| p.as_ref() as &(dyn ToSql + Sync))
        .collect();

    let rows = client.execute(&stmt, &refs).await?;
    Ok(rows)
}

/// Bulk upsert in one statement. The engine falls back to per-row
/// [`upsert_match_result`] calls when this fails, counting successes so a
/// partial write stays observable.
#[instrument(skip(pool, results), fields(count = results.len()))]
pub async fn upsert_match_results_bulk(
    pool: &PgPool,
    results: &[ClauseMatchResult],
) -> Result<u64, MatchResultStorageError> {
    if results.is_empty() {
        return Ok(0);
    }

    let client = pool.get().await?;

    let groups: Vec<String> = (0..results.len()).map(values_group).collect();
    let query = format!(
        "INSERT INTO recon.clause_match_results ({UPSERT_COLUMN_LIST}) VALUES {} {UPSERT_CONFLICT_CLAUSE}",
        groups.join(", ")
    );

    let mut params: Vec<Box<dyn ToSql + Sync + Send>> =
        Vec::with_capacity(results.len() * UPSERT_COLUMNS);
    for result in results {
        push_row_params(&mut params, result)?;
    }
    let refs: Vec<&(dyn ToSql + Sync)> = params
        .iter()
        .map(|p| p.as_ref() as &(dyn ToSql + Sync))
        .collect();

    let started = Instant::now();
    let rows = client.execute(query.as_str(), &refs).await?;
    maybe_log_slow_query("upsert_match_results_bulk", started);
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{IdentityMatchType, Severity};

    #[test]
    fn rag_param_maps_statuses_to_strings() {
        assert_eq!(rag_param(&Some(RagStatus::Red)), Some("red"));
        assert_eq!(rag_param(&None), None);
    }

    #[test]
    fn parse_rag_rejects_unknown_values() {
        assert_eq!(parse_rag(None, "rag_risk").unwrap(), None);
        assert_eq!(
            parse_rag(Some("amber".into()), "rag_risk").unwrap(),
            Some(RagStatus::Amber)
        );
        let err = parse_rag(Some("blue".into()), "rag_risk").unwrap_err();
        assert!(format!("{err}").contains("unknown rag_risk"));
    }

    #[test]
    fn analysis_round_trips_through_json() {
        let analysis = Some(MatchAnalysis::Identity {
            term_id: 1,
            category: "counterparty_name".into(),
            expected_value: "Acme Inc.".into(),
            match_type: IdentityMatchType::Exact,
            confidence: 1.0,
            found_value: Some("Acme Inc.".into()),
        });

        let param = analysis_param(&analysis).unwrap().unwrap();
        let parsed = parse_analysis(Some(param.0)).unwrap();
        assert_eq!(parsed, analysis);

        assert!(analysis_param(&None).unwrap().is_none());
        assert!(parse_analysis(None).unwrap().is_none());
    }

    #[test]
    fn parse_analysis_rejects_foreign_shapes() {
        let err = parse_analysis(Some(serde_json::json!({"kind": "vibes"}))).unwrap_err();
        assert!(format!("{err}").contains("analysis"));
    }

    #[test]
    fn values_groups_use_disjoint_placeholders() {
        assert!(values_group(0).starts_with("($1, $2,"));
        assert!(values_group(0).ends_with("$12)"));
        assert!(values_group(1).starts_with("($13, $14,"));
        assert!(values_group(1).ends_with("$24)"));
    }

    #[test]
    fn severity_is_preserved_inside_comparison_analysis() {
        let analysis = Some(MatchAnalysis::Comparisons {
            entries: vec![crate::schema::TermComparison {
                term_id: 2,
                category: "payment_terms".into(),
                strategy: crate::schema::SelectionStrategy::FallbackType,
                verdict: crate::schema::TermVerdict::Resolved {
                    matches: false,
                    severity: Severity::Major,
                    confidence: 0.7,
                    explanation: "Net 60 in the clause".into(),
                    differences: vec!["Net 30 vs Net 60".into()],
                },
            }],
        });

        let param = analysis_param(&analysis).unwrap().unwrap();
        assert_eq!(param.0["entries"][0]["verdict"]["severity"], "major");
        let parsed = parse_analysis(Some(param.0)).unwrap();
        assert_eq!(parsed, analysis);
    }
}
