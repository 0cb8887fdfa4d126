//! Semantic batch comparison against the generative comparison service.
//!
//! Pairs that survive the identity short-circuit are submitted in bounded
//! batches. Each batch gets a size-scaled timeout and bounded retries with
//! exponential backoff; a schema-invalid response is a hard failure for
//! that batch and is never patched up. Failed batches leave their pairs
//! unresolved — the orchestrator downgrades those to amber and flags them
//! for review instead of failing the document.

pub mod http;

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::sleep;
use tracing::warn;

use crate::schema::Severity;

pub use http::HttpComparisonClient;

/// One (term, clause) pair submitted for comparison.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComparisonRequestItem {
    pub idx: usize,
    #[serde(rename = "termText")]
    pub term_text: String,
    #[serde(rename = "clauseText")]
    pub clause_text: String,
}

/// One entry of the strict response schema. Unknown fields are rejected:
/// the contract is a single authoritative shape, not a family of them.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ComparisonOutcome {
    pub idx: usize,
    pub matches: bool,
    pub severity: Severity,
    pub explanation: String,
    pub differences: Vec<String>,
    pub confidence: f64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ComparisonResponse {
    pub results: Vec<ComparisonOutcome>,
}

#[derive(Debug, Error)]
pub enum CompareError {
    #[error("comparison request failed: {0}")]
    Transport(String),
    #[error("comparison service returned {status}: {body}")]
    Server { status: u16, body: String },
    #[error("comparison response violated the schema: {0}")]
    Schema(String),
}

impl CompareError {
    /// Schema violations are deterministic; only transport and server
    /// errors are worth another attempt.
    fn is_retryable(&self) -> bool {
        !matches!(self, CompareError::Schema(_))
    }
}

#[allow(async_fn_in_trait)]
pub trait ComparisonClient {
    async fn compare_batch(
        &self,
        items: &[ComparisonRequestItem],
        timeout: Duration,
    ) -> Result<Vec<ComparisonOutcome>, CompareError>;
}

#[derive(Debug, Clone)]
pub struct ComparisonConfig {
    /// Maximum pairs per request, bounded by service payload limits.
    pub batch_size: usize,
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub base_timeout_ms: u64,
    pub per_comparison_ms: u64,
    pub max_timeout_ms: u64,
}

impl Default for ComparisonConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            max_attempts: 3,
            backoff_ms: 2_000,
            base_timeout_ms: 10_000,
            per_comparison_ms: 1_000,
            max_timeout_ms: 120_000,
        }
    }
}

impl ComparisonConfig {
    pub fn from_env() -> Self {
        fn parse_u64(key: &str, default: u64) -> u64 {
            std::env::var(key)
                .ok()
                .and_then(|raw| raw.parse::<u64>().ok())
                .unwrap_or(default)
        }

        fn parse_usize(key: &str, default: usize) -> usize {
            std::env::var(key)
                .ok()
                .and_then(|raw| raw.parse::<usize>().ok())
                .unwrap_or(default)
        }

        let defaults = Self::default();
        Self {
            batch_size: parse_usize("CR_COMPARE_BATCH_SIZE", defaults.batch_size).max(1),
            max_attempts: parse_u64("CR_COMPARE_MAX_ATTEMPTS", defaults.max_attempts as u64)
                .max(1) as u32,
            backoff_ms: parse_u64("CR_COMPARE_BACKOFF_MS", defaults.backoff_ms),
            base_timeout_ms: parse_u64("CR_COMPARE_BASE_TIMEOUT_MS", defaults.base_timeout_ms),
            per_comparison_ms: parse_u64(
                "CR_COMPARE_PER_COMPARISON_MS",
                defaults.per_comparison_ms,
            ),
            max_timeout_ms: parse_u64("CR_COMPARE_MAX_TIMEOUT_MS", defaults.max_timeout_ms),
        }
    }

    /// Larger batches get proportionally more time, bounded by the cap.
    pub fn batch_timeout(&self, batch_len: usize) -> Duration {
        let scaled = self
            .base_timeout_ms
            .saturating_add(self.per_comparison_ms.saturating_mul(batch_len as u64));
        Duration::from_millis(scaled.min(self.max_timeout_ms))
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self.backoff_ms.saturating_mul(1u64 << (attempt - 1).min(16));
        let jitter = if self.backoff_ms >= 4 {
            rand::thread_rng().gen_range(0..self.backoff_ms / 4)
        } else {
            0
        };
        Duration::from_millis(exp.saturating_add(jitter))
    }
}

/// Outcome of running every batch for one document. `outcomes[i]` is `None`
/// when the batch carrying pair `i` failed.
#[derive(Debug)]
pub struct BatchReport {
    pub outcomes: Vec<Option<ComparisonOutcome>>,
    pub failed_batches: usize,
}

/// Reject responses with the wrong length, out-of-range or duplicate `idx`,
/// and return outcomes ordered by submission position.
fn validate_batch(
    expected_len: usize,
    raw: Vec<ComparisonOutcome>,
) -> Result<Vec<ComparisonOutcome>, CompareError> {
    if raw.len() != expected_len {
        return Err(CompareError::Schema(format!(
            "expected {expected_len} results, got {}",
            raw.len()
        )));
    }

    let mut ordered: Vec<Option<ComparisonOutcome>> = vec![None; expected_len];
    for outcome in raw {
        if outcome.idx >= expected_len {
            return Err(CompareError::Schema(format!(
                "result idx {} out of range for batch of {expected_len}",
                outcome.idx
            )));
        }
        if ordered[outcome.idx].is_some() {
            return Err(CompareError::Schema(format!(
                "duplicate result idx {}",
                outcome.idx
            )));
        }
        let idx = outcome.idx;
        ordered[idx] = Some(outcome);
    }

    // Length + uniqueness + range imply totality, so unwrapping is safe,
    // but keep it explicit instead of relying on that chain of reasoning.
    ordered
        .into_iter()
        .enumerate()
        .map(|(idx, slot)| {
            slot.ok_or_else(|| CompareError::Schema(format!("missing result for idx {idx}")))
        })
        .collect()
}

/// Run all pairs through the comparison service in `batch_size` chunks.
///
/// Never fails as a whole: each batch either resolves its pairs or leaves
/// them `None` after logging why.
pub async fn run_batches<C: ComparisonClient>(
    client: &C,
    items: &[ComparisonRequestItem],
    config: &ComparisonConfig,
) -> BatchReport {
    let mut outcomes: Vec<Option<ComparisonOutcome>> = vec![None; items.len()];
    let mut failed_batches = 0usize;
    let batch_size = config.batch_size.max(1);

    for (batch_no, chunk) in items.chunks(batch_size).enumerate() {
        let offset = batch_no * batch_size;
        // Re-index per batch: the service contract is per-submission order.
        let batch_items: Vec<ComparisonRequestItem> = chunk
            .iter()
            .enumerate()
            .map(|(i, item)| ComparisonRequestItem {
                idx: i,
                term_text: item.term_text.clone(),
                clause_text: item.clause_text.clone(),
            })
            .collect();
        let timeout = config.batch_timeout(batch_items.len());

        let mut resolved = false;
        for attempt in 1..=config.max_attempts {
            match client.compare_batch(&batch_items, timeout).await {
                Ok(raw) => match validate_batch(batch_items.len(), raw) {
                    Ok(ordered) => {
                        for (i, outcome) in ordered.into_iter().enumerate() {
                            outcomes[offset + i] = Some(outcome);
                        }
                        resolved = true;
                    }
                    Err(err) => {
                        warn!(batch = batch_no, error = %err, "comparison batch rejected");
                    }
                },
                Err(err) if err.is_retryable() && attempt < config.max_attempts => {
                    let delay = config.backoff_delay(attempt);
                    warn!(
                        batch = batch_no,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "comparison batch attempt failed; backing off"
                    );
                    sleep(delay).await;
                    continue;
                }
                Err(err) => {
                    warn!(batch = batch_no, attempt, error = %err, "comparison batch failed");
                }
            }
            break;
        }

        if !resolved {
            failed_batches += 1;
        }
    }

    BatchReport {
        outcomes,
        failed_batches,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn item(idx: usize) -> ComparisonRequestItem {
        ComparisonRequestItem {
            idx,
            term_text: format!("term {idx}"),
            clause_text: format!("clause {idx}"),
        }
    }

    fn outcome(idx: usize, matches: bool, severity: Severity) -> ComparisonOutcome {
        ComparisonOutcome {
            idx,
            matches,
            severity,
            explanation: "checked".into(),
            differences: vec![],
            confidence: 0.9,
        }
    }

    fn fast_config() -> ComparisonConfig {
        ComparisonConfig {
            backoff_ms: 1,
            ..ComparisonConfig::default()
        }
    }

    /// Records the size and timeout of every call; responds per a script.
    struct ScriptedClient {
        calls: Mutex<Vec<(usize, Duration)>>,
        script: Mutex<Vec<Result<Vec<ComparisonOutcome>, CompareError>>>,
    }

    impl ScriptedClient {
        fn new(script: Vec<Result<Vec<ComparisonOutcome>, CompareError>>) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                script: Mutex::new(script),
            }
        }

        fn echo(len: usize) -> Result<Vec<ComparisonOutcome>, CompareError> {
            Ok((0..len).map(|i| outcome(i, true, Severity::None)).collect())
        }
    }

    impl ComparisonClient for ScriptedClient {
        async fn compare_batch(
            &self,
            items: &[ComparisonRequestItem],
            timeout: Duration,
        ) -> Result<Vec<ComparisonOutcome>, CompareError> {
            self.calls.lock().unwrap().push((items.len(), timeout));
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                Self::echo(items.len())
            } else {
                script.remove(0)
            }
        }
    }

    #[tokio::test]
    async fn splits_120_pairs_into_three_batches() {
        let items: Vec<_> = (0..120).map(item).collect();
        let client = ScriptedClient::new(vec![]);
        let config = fast_config();

        let report = run_batches(&client, &items, &config).await;

        let calls = client.calls.lock().unwrap();
        let sizes: Vec<usize> = calls.iter().map(|(len, _)| *len).collect();
        assert_eq!(sizes, vec![50, 50, 20]);
        assert_eq!(report.failed_batches, 0);
        assert!(report.outcomes.iter().all(Option::is_some));
    }

    #[tokio::test]
    async fn batch_timeout_grows_with_size_up_to_the_cap() {
        let config = ComparisonConfig::default();
        assert_eq!(config.batch_timeout(20), Duration::from_millis(30_000));
        assert_eq!(config.batch_timeout(50), Duration::from_millis(60_000));
        // 200 pairs would want 210 s; the cap holds at 120 s.
        assert_eq!(config.batch_timeout(200), Duration::from_millis(120_000));

        let items: Vec<_> = (0..70).map(item).collect();
        let client = ScriptedClient::new(vec![]);
        let report = run_batches(&client, &items, &fast_config()).await;
        assert_eq!(report.failed_batches, 0);

        let calls = client.calls.lock().unwrap();
        assert_eq!(calls[0].1, Duration::from_millis(60_000));
        assert_eq!(calls[1].1, Duration::from_millis(30_000));
    }

    #[tokio::test]
    async fn transient_failures_are_retried_then_succeed() {
        let items: Vec<_> = (0..3).map(item).collect();
        let client = ScriptedClient::new(vec![
            Err(CompareError::Transport("connection reset".into())),
            ScriptedClient::echo(3),
        ]);

        let report = run_batches(&client, &items, &fast_config()).await;

        assert_eq!(report.failed_batches, 0);
        assert!(report.outcomes.iter().all(Option::is_some));
        assert_eq!(client.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn exhausted_retries_leave_pairs_unresolved() {
        let items: Vec<_> = (0..2).map(item).collect();
        let client = ScriptedClient::new(vec![
            Err(CompareError::Transport("boom".into())),
            Err(CompareError::Transport("boom".into())),
            Err(CompareError::Transport("boom".into())),
        ]);

        let report = run_batches(&client, &items, &fast_config()).await;

        assert_eq!(report.failed_batches, 1);
        assert!(report.outcomes.iter().all(Option::is_none));
        assert_eq!(client.calls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn schema_violations_fail_the_batch_without_retry() {
        // Wrong length.
        let items: Vec<_> = (0..3).map(item).collect();
        let client = ScriptedClient::new(vec![Ok(vec![outcome(0, true, Severity::None)])]);
        let report = run_batches(&client, &items, &fast_config()).await;
        assert_eq!(report.failed_batches, 1);
        assert_eq!(client.calls.lock().unwrap().len(), 1);

        // Duplicate idx.
        let client = ScriptedClient::new(vec![Ok(vec![
            outcome(0, true, Severity::None),
            outcome(0, false, Severity::Major),
            outcome(2, true, Severity::None),
        ])]);
        let report = run_batches(&client, &items, &fast_config()).await;
        assert_eq!(report.failed_batches, 1);
        assert_eq!(client.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn out_of_order_results_are_reordered_by_idx() {
        let items: Vec<_> = (0..3).map(item).collect();
        let client = ScriptedClient::new(vec![Ok(vec![
            outcome(2, false, Severity::Major),
            outcome(0, true, Severity::None),
            outcome(1, true, Severity::Minor),
        ])]);

        let report = run_batches(&client, &items, &fast_config()).await;

        assert_eq!(report.failed_batches, 0);
        assert!(report.outcomes[0].as_ref().unwrap().matches);
        assert_eq!(report.outcomes[1].as_ref().unwrap().severity, Severity::Minor);
        assert!(!report.outcomes[2].as_ref().unwrap().matches);
    }

    #[tokio::test]
    async fn one_failed_batch_does_not_poison_the_others() {
        let items: Vec<_> = (0..60).map(item).collect();
        // First batch (50) fails schema validation; second batch succeeds.
        let client = ScriptedClient::new(vec![Ok(vec![]), ScriptedClient::echo(10)]);

        let report = run_batches(&client, &items, &fast_config()).await;

        assert_eq!(report.failed_batches, 1);
        assert!(report.outcomes[..50].iter().all(Option::is_none));
        assert!(report.outcomes[50..].iter().all(Option::is_some));
    }

    #[test]
    fn strict_response_schema_rejects_unknown_fields() {
        let good = r#"{"results":[{"idx":0,"matches":true,"severity":"none","explanation":"ok","differences":[],"confidence":0.95}]}"#;
        assert!(serde_json::from_str::<ComparisonResponse>(good).is_ok());

        let extra_field = r#"{"results":[{"idx":0,"matches":true,"severity":"none","explanation":"ok","differences":[],"confidence":0.95,"vibe":"fine"}]}"#;
        assert!(serde_json::from_str::<ComparisonResponse>(extra_field).is_err());

        let bad_severity = r#"{"results":[{"idx":0,"matches":true,"severity":"catastrophic","explanation":"ok","differences":[],"confidence":0.95}]}"#;
        assert!(serde_json::from_str::<ComparisonResponse>(bad_severity).is_err());
    }
}
