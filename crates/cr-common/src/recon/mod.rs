//! Reconciliation orchestrator.
//!
//! Per-document state machine: fetch → identity-resolve →
//! missing-term-detect → semantic-batch → rag-calculate → persist →
//! mark-complete. This stage is an enhancement on top of the library
//! verdicts: the worker treats its failure as non-fatal, but within one run
//! every persistence step is attempted so no partially-updated state is
//! left behind silently.

pub mod store;

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use ulid::Ulid;

use crate::cache::TtlCache;
use crate::compare::{
    self, ComparisonClient, ComparisonConfig, ComparisonOutcome, ComparisonRequestItem,
};
use crate::identity::{identity_rag, is_identity_category, match_identity};
use crate::rag;
use crate::schema::{
    ClauseMatchResult, Discrepancy, DiscrepancyKind, IdentityMatchType, MatchAnalysis,
    PreAgreedTerm, RagStatus, ReviewQueueItem, ReviewReason, Severity, TermComparison,
    TermVerdict,
};
use crate::selection::{ClauseIndex, ClauseSelector};

pub use store::{MemoryStore, ReconStore, StoreError};

const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

const PRIORITY_MISSING_MANDATORY: i32 = 90;
const PRIORITY_MAJOR_SEVERITY: i32 = 80;
const PRIORITY_UNRESOLVED: i32 = 70;
const PRIORITY_LOW_CONFIDENCE: i32 = 60;

/// Process-level reconcile run id; ULIDs sort by creation time, which keeps
/// audit queries over `match_run_id` cheap.
static RUN_ID: Lazy<String> = Lazy::new(|| Ulid::new().to_string());

pub fn run_id() -> &'static str {
    &RUN_ID
}

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Resolved comparisons below this confidence are flagged for review.
    pub low_confidence_threshold: f64,
    pub terms_cache_ttl: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            low_confidence_threshold: 0.5,
            terms_cache_ttl: Duration::minutes(10),
        }
    }
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("document {0} not found")]
    DocumentNotFound(i64),
    #[error("document {0} has no extracted text")]
    MissingText(i64),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ReconcileSummary {
    pub results_attempted: usize,
    pub results_written: u64,
    pub discrepancies_created: u64,
    pub review_items_created: u64,
    pub comparison_pairs: usize,
    pub unresolved_pairs: usize,
    pub failed_batches: usize,
}

struct Pair<'a> {
    term: &'a PreAgreedTerm,
    clause_id: i64,
    strategy: crate::schema::SelectionStrategy,
}

pub struct Reconciler<'a, S, C> {
    store: &'a S,
    compare_client: &'a C,
    selector: ClauseSelector,
    config: ReconcileConfig,
    compare_config: ComparisonConfig,
    terms_cache: TtlCache<i64, Vec<PreAgreedTerm>>,
}

impl<'a, S, C> Reconciler<'a, S, C>
where
    S: ReconStore,
    C: ComparisonClient,
{
    pub fn new(
        store: &'a S,
        compare_client: &'a C,
        config: ReconcileConfig,
        compare_config: ComparisonConfig,
    ) -> Self {
        let terms_cache = TtlCache::with_system_clock(config.terms_cache_ttl);
        Self {
            store,
            compare_client,
            selector: ClauseSelector::default(),
            config,
            compare_config,
            terms_cache,
        }
    }

    /// Reconcile one document. Safe to re-run: result rows are updated in
    /// place and discrepancy/review inserts are conflict-tolerant no-ops.
    #[instrument(skip(self), fields(run_id = run_id()))]
    pub async fn run(&self, document_id: i64) -> Result<ReconcileSummary, ReconcileError> {
        let document = self
            .store
            .fetch_document(document_id)
            .await?
            .ok_or(ReconcileError::DocumentNotFound(document_id))?;
        let text = document
            .full_text
            .clone()
            .ok_or(ReconcileError::MissingText(document_id))?;

        if document.reconciled_at.is_some() {
            info!(document_id, "document was reconciled before; re-running");
        }

        let cached_terms = self.terms_cache.get(&document.deal_id);
        let (terms, clauses, existing) = {
            let terms_fut = async {
                match &cached_terms {
                    Some(terms) => Ok(terms.clone()),
                    None => self.store.fetch_terms(document.deal_id).await,
                }
            };
            let (terms, clauses, existing) = tokio::join!(
                terms_fut,
                self.store.fetch_clauses(document_id),
                self.store.fetch_match_results(document_id),
            );
            (terms?, clauses?, existing?)
        };
        if cached_terms.is_none() {
            self.terms_cache.insert(document.deal_id, terms.clone());
        }

        let index = ClauseIndex::build(&clauses);
        let mut existing_by_clause: HashMap<i64, ClauseMatchResult> = HashMap::new();
        let mut existing_virtual: HashMap<i64, ClauseMatchResult> = HashMap::new();
        for row in existing {
            match (row.clause_boundary_id, row.term_id) {
                (Some(clause_id), _) => {
                    existing_by_clause.insert(clause_id, row);
                }
                (None, Some(term_id)) => {
                    existing_virtual.insert(term_id, row);
                }
                (None, None) => {
                    warn!(document_id, "ignoring match result with neither clause nor term scope");
                }
            }
        }

        let now = Utc::now();
        let mut updates: Vec<ClauseMatchResult> = Vec::new();
        let mut discrepancies: Vec<Discrepancy> = Vec::new();
        let mut reviews: Vec<ReviewQueueItem> = Vec::new();
        let mut pairs: Vec<Pair<'_>> = Vec::new();
        let mut items: Vec<ComparisonRequestItem> = Vec::new();

        for term in &terms {
            if is_identity_category(&term.category) {
                self.resolve_identity_term(
                    document_id,
                    term,
                    &text,
                    &mut existing_virtual,
                    &mut updates,
                    &mut discrepancies,
                    &mut reviews,
                    now,
                );
                continue;
            }

            let candidates = self.selector.select(term, &index);
            if candidates.is_empty() {
                if term.mandatory {
                    self.record_missing_term(
                        document_id,
                        term,
                        &mut existing_virtual,
                        &mut updates,
                        &mut discrepancies,
                        &mut reviews,
                        now,
                    );
                } else {
                    debug!(
                        document_id,
                        term_id = term.id,
                        category = %term.category,
                        "optional term has no candidate clauses; skipping"
                    );
                }
                continue;
            }

            for candidate in candidates {
                items.push(ComparisonRequestItem {
                    idx: items.len(),
                    term_text: format!("{}: {}", term.category, term.expected_value),
                    clause_text: candidate.clause.content.clone(),
                });
                pairs.push(Pair {
                    term,
                    clause_id: candidate.clause.id,
                    strategy: candidate.strategy,
                });
            }
        }

        let report = compare::run_batches(self.compare_client, &items, &self.compare_config).await;
        let unresolved_pairs = report.outcomes.iter().filter(|o| o.is_none()).count();
        if report.failed_batches > 0 {
            warn!(
                document_id,
                failed_batches = report.failed_batches,
                unresolved_pairs,
                "some comparison batches failed; affected pairs fall back to amber"
            );
        }

        self.fold_comparisons(
            document_id,
            &pairs,
            report.outcomes,
            &mut existing_by_clause,
            &mut updates,
            &mut discrepancies,
            &mut reviews,
            now,
        );

        let results_attempted = updates.len();
        let results_written = self.persist_results(&updates).await;

        let mut discrepancies_created = 0;
        for discrepancy in &discrepancies {
            match self.store.insert_discrepancy(discrepancy).await {
                Ok(rows) => discrepancies_created += rows,
                Err(err) => warn!(document_id, error = %err, "failed to insert discrepancy"),
            }
        }

        let mut review_items_created = 0;
        for review in &reviews {
            match self.store.insert_review_item(review).await {
                Ok(rows) => review_items_created += rows,
                Err(err) => warn!(document_id, error = %err, "failed to insert review item"),
            }
        }

        if results_written == results_attempted as u64 {
            self.store.set_document_reconciled(document_id, now).await?;
        } else {
            warn!(
                document_id,
                results_written,
                results_attempted,
                "partial match-result persistence; leaving document re-processable"
            );
        }

        let summary = ReconcileSummary {
            results_attempted,
            results_written,
            discrepancies_created,
            review_items_created,
            comparison_pairs: pairs.len(),
            unresolved_pairs,
            failed_batches: report.failed_batches,
        };
        info!(
            document_id,
            results = summary.results_written,
            discrepancies = summary.discrepancies_created,
            reviews = summary.review_items_created,
            pairs = summary.comparison_pairs,
            unresolved = summary.unresolved_pairs,
            "reconciliation finished"
        );
        Ok(summary)
    }

    #[allow(clippy::too_many_arguments)]
    fn resolve_identity_term(
        &self,
        document_id: i64,
        term: &PreAgreedTerm,
        text: &str,
        existing_virtual: &mut HashMap<i64, ClauseMatchResult>,
        updates: &mut Vec<ClauseMatchResult>,
        discrepancies: &mut Vec<Discrepancy>,
        reviews: &mut Vec<ReviewQueueItem>,
        now: DateTime<Utc>,
    ) {
        let result = match_identity(&term.expected_value, text);
        let parsing = identity_rag(&result, term.mandatory);

        let mut row = existing_virtual
            .remove(&term.id)
            .unwrap_or_else(|| ClauseMatchResult::virtual_for_term(document_id, term.id));
        row.rag_parsing = Some(parsing);
        row.rag_status = Some(rag::combine_opt(row.rag_risk, parsing));
        row.discrepancy_count = i32::from(parsing != RagStatus::Green);
        row.analysis = Some(MatchAnalysis::Identity {
            term_id: term.id,
            category: term.category.clone(),
            expected_value: term.expected_value.clone(),
            match_type: result.match_type,
            confidence: result.confidence,
            found_value: result.found_value.clone(),
        });
        stamp(&mut row, now);
        updates.push(row);

        match result.match_type {
            IdentityMatchType::Absent => {
                discrepancies.push(Discrepancy {
                    id: None,
                    document_id,
                    clause_boundary_id: None,
                    term_id: Some(term.id),
                    kind: DiscrepancyKind::Missing,
                    severity: if term.mandatory { Severity::Major } else { Severity::Minor },
                    description: format!(
                        "expected {} '{}' does not appear in the document",
                        term.category, term.expected_value
                    ),
                    created_at: None,
                });
                if term.mandatory {
                    reviews.push(ReviewQueueItem {
                        id: None,
                        document_id,
                        clause_boundary_id: None,
                        term_id: Some(term.id),
                        reason: ReviewReason::MissingMandatoryTerm,
                        priority: PRIORITY_MISSING_MANDATORY,
                        metadata: Some(serde_json::json!({
                            "category": term.category,
                            "expected_value": term.expected_value,
                        })),
                        created_at: None,
                    });
                }
            }
            IdentityMatchType::Partial => {
                discrepancies.push(Discrepancy {
                    id: None,
                    document_id,
                    clause_boundary_id: None,
                    term_id: Some(term.id),
                    kind: DiscrepancyKind::Modified,
                    severity: Severity::Minor,
                    description: format!(
                        "document names something close to, but not exactly, {} '{}'",
                        term.category, term.expected_value
                    ),
                    created_at: None,
                });
            }
            IdentityMatchType::Exact | IdentityMatchType::Normalized => {}
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn record_missing_term(
        &self,
        document_id: i64,
        term: &PreAgreedTerm,
        existing_virtual: &mut HashMap<i64, ClauseMatchResult>,
        updates: &mut Vec<ClauseMatchResult>,
        discrepancies: &mut Vec<Discrepancy>,
        reviews: &mut Vec<ReviewQueueItem>,
        now: DateTime<Utc>,
    ) {
        let mut row = existing_virtual
            .remove(&term.id)
            .unwrap_or_else(|| ClauseMatchResult::virtual_for_term(document_id, term.id));
        row.rag_parsing = Some(RagStatus::Red);
        row.rag_status = Some(rag::combine_opt(row.rag_risk, RagStatus::Red));
        row.discrepancy_count = 1;
        row.analysis = Some(MatchAnalysis::MissingTerm {
            term_id: term.id,
            category: term.category.clone(),
            expected_value: term.expected_value.clone(),
            mandatory: term.mandatory,
        });
        stamp(&mut row, now);
        updates.push(row);

        discrepancies.push(Discrepancy {
            id: None,
            document_id,
            clause_boundary_id: None,
            term_id: Some(term.id),
            kind: DiscrepancyKind::Missing,
            severity: Severity::Major,
            description: format!(
                "no clause in the document covers mandatory term {} '{}'",
                term.category, term.expected_value
            ),
            created_at: None,
        });
        reviews.push(ReviewQueueItem {
            id: None,
            document_id,
            clause_boundary_id: None,
            term_id: Some(term.id),
            reason: ReviewReason::MissingMandatoryTerm,
            priority: PRIORITY_MISSING_MANDATORY,
            metadata: Some(serde_json::json!({
                "category": term.category,
                "expected_value": term.expected_value,
            })),
            created_at: None,
        });
    }

    /// Fold per-pair outcomes into one update per clause, with discrepancies
    /// and review entries where the combined verdict indicates a problem.
    #[allow(clippy::too_many_arguments)]
    fn fold_comparisons(
        &self,
        document_id: i64,
        pairs: &[Pair<'_>],
        outcomes: Vec<Option<ComparisonOutcome>>,
        existing_by_clause: &mut HashMap<i64, ClauseMatchResult>,
        updates: &mut Vec<ClauseMatchResult>,
        discrepancies: &mut Vec<Discrepancy>,
        reviews: &mut Vec<ReviewQueueItem>,
        now: DateTime<Utc>,
    ) {
        let mut per_clause: BTreeMap<i64, Vec<usize>> = BTreeMap::new();
        for (position, pair) in pairs.iter().enumerate() {
            per_clause.entry(pair.clause_id).or_default().push(position);
        }

        for (clause_id, positions) in per_clause {
            let mut entries: Vec<TermComparison> = Vec::new();
            let mut verdicts: Vec<RagStatus> = Vec::new();
            let mut first_mismatch: Option<String> = None;
            let mut first_modification: Option<String> = None;
            let mut any_major = false;
            let mut any_minor = false;
            let mut any_mismatch = false;

            for position in positions {
                let pair = &pairs[position];
                match &outcomes[position] {
                    Some(outcome) => {
                        let verdict =
                            rag::term_rag(outcome.matches, outcome.severity, pair.term.mandatory);
                        verdicts.push(verdict);

                        if !outcome.matches {
                            any_mismatch = true;
                            first_mismatch
                                .get_or_insert_with(|| outcome.explanation.clone());
                        } else if outcome.severity != Severity::None {
                            first_modification
                                .get_or_insert_with(|| outcome.explanation.clone());
                        }
                        any_major |= outcome.severity == Severity::Major;
                        any_minor |= outcome.severity == Severity::Minor;

                        if outcome.severity == Severity::Major {
                            reviews.push(ReviewQueueItem {
                                id: None,
                                document_id,
                                clause_boundary_id: Some(clause_id),
                                term_id: Some(pair.term.id),
                                reason: ReviewReason::MajorSeverity,
                                priority: PRIORITY_MAJOR_SEVERITY,
                                metadata: Some(serde_json::json!({
                                    "category": pair.term.category,
                                    "explanation": outcome.explanation,
                                })),
                                created_at: None,
                            });
                        } else if outcome.confidence < self.config.low_confidence_threshold {
                            reviews.push(ReviewQueueItem {
                                id: None,
                                document_id,
                                clause_boundary_id: Some(clause_id),
                                term_id: Some(pair.term.id),
                                reason: ReviewReason::LowConfidence,
                                priority: PRIORITY_LOW_CONFIDENCE,
                                metadata: Some(serde_json::json!({
                                    "category": pair.term.category,
                                    "confidence": outcome.confidence,
                                })),
                                created_at: None,
                            });
                        }

                        entries.push(TermComparison {
                            term_id: pair.term.id,
                            category: pair.term.category.clone(),
                            strategy: pair.strategy,
                            verdict: TermVerdict::Resolved {
                                matches: outcome.matches,
                                severity: outcome.severity,
                                confidence: outcome.confidence,
                                explanation: outcome.explanation.clone(),
                                differences: outcome.differences.clone(),
                            },
                        });
                    }
                    None => {
                        verdicts.push(RagStatus::Amber);
                        entries.push(TermComparison {
                            term_id: pair.term.id,
                            category: pair.term.category.clone(),
                            strategy: pair.strategy,
                            verdict: TermVerdict::Unresolved {
                                reason: "comparison service unavailable for this batch".into(),
                            },
                        });
                        reviews.push(ReviewQueueItem {
                            id: None,
                            document_id,
                            clause_boundary_id: Some(clause_id),
                            term_id: Some(pair.term.id),
                            reason: ReviewReason::ComparisonUnresolved,
                            priority: PRIORITY_UNRESOLVED,
                            metadata: Some(serde_json::json!({
                                "category": pair.term.category,
                            })),
                            created_at: None,
                        });
                    }
                }
            }

            let parsing = rag::aggregate_parsing(verdicts.iter().copied());
            let discrepancy_count =
                verdicts.iter().filter(|v| **v != RagStatus::Green).count() as i32;

            let mut row = existing_by_clause
                .remove(&clause_id)
                .unwrap_or_else(|| ClauseMatchResult::for_clause(document_id, clause_id));
            row.rag_parsing = Some(parsing);
            row.rag_status = Some(rag::combine_opt(row.rag_risk, parsing));
            row.discrepancy_count = discrepancy_count;
            row.analysis = Some(MatchAnalysis::Comparisons { entries });
            stamp(&mut row, now);
            updates.push(row);

            if any_mismatch {
                discrepancies.push(Discrepancy {
                    id: None,
                    document_id,
                    clause_boundary_id: Some(clause_id),
                    term_id: None,
                    kind: DiscrepancyKind::Conflicting,
                    severity: if parsing == RagStatus::Red { Severity::Major } else { Severity::Minor },
                    description: first_mismatch
                        .unwrap_or_else(|| "clause conflicts with a pre-agreed term".into()),
                    created_at: None,
                });
            } else if any_major || any_minor {
                discrepancies.push(Discrepancy {
                    id: None,
                    document_id,
                    clause_boundary_id: Some(clause_id),
                    term_id: None,
                    kind: DiscrepancyKind::Modified,
                    severity: if any_major { Severity::Major } else { Severity::Minor },
                    description: first_modification
                        .unwrap_or_else(|| "clause deviates from a pre-agreed term".into()),
                    created_at: None,
                });
            }
        }
    }

    /// Bulk-first persistence with a sequential per-row fallback whose
    /// success count keeps partial failures observable.
    async fn persist_results(&self, updates: &[ClauseMatchResult]) -> u64 {
        if updates.is_empty() {
            return 0;
        }

        match self.store.upsert_match_results(updates).await {
            Ok(written) => written,
            Err(err) => {
                warn!(error = %err, "bulk match-result update failed; falling back to per-row writes");
                let mut written = 0;
                for row in updates {
                    match self.store.upsert_match_result(row).await {
                        Ok(rows) => written += rows,
                        Err(err) => warn!(
                            clause_boundary_id = row.clause_boundary_id,
                            term_id = row.term_id,
                            error = %err,
                            "per-row match-result update failed"
                        ),
                    }
                }
                info!(written, total = updates.len(), "sequential fallback finished");
                written
            }
        }
    }
}

fn stamp(row: &mut ClauseMatchResult, now: DateTime<Utc>) {
    row.match_run_id = Some(run_id().to_string());
    row.engine_version = Some(ENGINE_VERSION.to_string());
    row.updated_at = Some(now);
    if row.created_at.is_none() {
        row.created_at = Some(now);
    }
}
