use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Traffic-light risk verdict attached to a clause or term comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RagStatus {
    Green,
    Amber,
    Red,
}

impl RagStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RagStatus::Green => "green",
            RagStatus::Amber => "amber",
            RagStatus::Red => "red",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "green" => Some(RagStatus::Green),
            "amber" => Some(RagStatus::Amber),
            "red" => Some(RagStatus::Red),
            _ => None,
        }
    }
}

/// Severity reported by the comparison service for a single (term, clause) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    None,
    Minor,
    Major,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::None => "none",
            Severity::Minor => "minor",
            Severity::Major => "major",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "none" => Some(Severity::None),
            "minor" => Some(Severity::Minor),
            "major" => Some(Severity::Major),
            _ => None,
        }
    }
}

/// Overall document processing status, set by the pipeline driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Processing => "processing",
            DocumentStatus::Completed => "completed",
            DocumentStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(DocumentStatus::Pending),
            "processing" => Some(DocumentStatus::Processing),
            "completed" => Some(DocumentStatus::Completed),
            "failed" => Some(DocumentStatus::Failed),
            _ => None,
        }
    }
}

/// An uploaded contract. Extraction fills `full_text`; the reconciliation
/// engine sets `reconciled_at`; the worker owns `status`/`error_message`.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: i64,
    pub tenant_id: i64,
    pub deal_id: i64,
    pub object_path: String,
    pub full_text: Option<String>,
    pub status: DocumentStatus,
    pub error_message: Option<String>,
    pub reconciled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One extracted clause. Read-only to the reconciliation engine.
///
/// `library_similarity` is the precomputed vector-search score from the
/// library-matching stage, used only by the embedding-fallback selector.
#[derive(Debug, Clone, PartialEq)]
pub struct ClauseBoundary {
    pub id: i64,
    pub document_id: i64,
    pub clause_type: String,
    pub content: String,
    pub confidence: f64,
    pub start_char: usize,
    pub end_char: usize,
    pub section_title: Option<String>,
    pub library_similarity: Option<f64>,
}

/// One negotiated commercial term for a deal. Read-only to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreAgreedTerm {
    pub id: i64,
    pub deal_id: i64,
    pub category: String,
    pub expected_value: String,
    pub mandatory: bool,
    pub related_clause_types: Vec<String>,
}

/// Which selector proposed a candidate clause for a term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    TypeMatch,
    FallbackType,
    Keyword,
    EmbeddingSimilarity,
}

impl SelectionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionStrategy::TypeMatch => "type_match",
            SelectionStrategy::FallbackType => "fallback_type",
            SelectionStrategy::Keyword => "keyword",
            SelectionStrategy::EmbeddingSimilarity => "embedding_similarity",
        }
    }
}

/// How an identity-category term was located in the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityMatchType {
    Exact,
    Normalized,
    Partial,
    Absent,
}

impl IdentityMatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentityMatchType::Exact => "exact",
            IdentityMatchType::Normalized => "normalized",
            IdentityMatchType::Partial => "partial",
            IdentityMatchType::Absent => "absent",
        }
    }
}

/// Outcome of one (term, clause) comparison, as recorded in the analysis blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TermVerdict {
    Resolved {
        matches: bool,
        severity: Severity,
        confidence: f64,
        explanation: String,
        differences: Vec<String>,
    },
    /// The comparison batch carrying this pair failed; verdict downgraded
    /// to amber and flagged for review.
    Unresolved { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TermComparison {
    pub term_id: i64,
    pub category: String,
    pub strategy: SelectionStrategy,
    pub verdict: TermVerdict,
}

/// Structured analysis payload stored on a match result. One tag per
/// originating path; serialized uniformly into a single JSONB column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MatchAnalysis {
    Identity {
        term_id: i64,
        category: String,
        expected_value: String,
        match_type: IdentityMatchType,
        confidence: f64,
        found_value: Option<String>,
    },
    MissingTerm {
        term_id: i64,
        category: String,
        expected_value: String,
        mandatory: bool,
    },
    Comparisons { entries: Vec<TermComparison> },
}

/// Central output record. `clause_boundary_id = None` marks a virtual row
/// (missing mandatory term or whole-document identity check), in which case
/// `term_id` identifies the term the row stands for.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClauseMatchResult {
    pub id: Option<i64>,
    pub document_id: i64,
    pub clause_boundary_id: Option<i64>,
    pub term_id: Option<i64>,
    pub rag_risk: Option<RagStatus>,
    pub rag_parsing: Option<RagStatus>,
    pub rag_status: Option<RagStatus>,
    pub discrepancy_count: i32,
    pub analysis: Option<MatchAnalysis>,
    pub match_run_id: Option<String>,
    pub engine_version: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl ClauseMatchResult {
    pub fn for_clause(document_id: i64, clause_boundary_id: i64) -> Self {
        Self {
            document_id,
            clause_boundary_id: Some(clause_boundary_id),
            ..Self::default()
        }
    }

    pub fn virtual_for_term(document_id: i64, term_id: i64) -> Self {
        Self {
            document_id,
            term_id: Some(term_id),
            ..Self::default()
        }
    }

    pub fn is_virtual(&self) -> bool {
        self.clause_boundary_id.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscrepancyKind {
    Missing,
    Conflicting,
    Modified,
}

impl DiscrepancyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscrepancyKind::Missing => "missing",
            DiscrepancyKind::Conflicting => "conflicting",
            DiscrepancyKind::Modified => "modified",
        }
    }
}

/// Typed record explaining why a match failed. Keyed by
/// (document, clause?, term?, kind); duplicate inserts are no-ops.
#[derive(Debug, Clone, PartialEq)]
pub struct Discrepancy {
    pub id: Option<i64>,
    pub document_id: i64,
    pub clause_boundary_id: Option<i64>,
    pub term_id: Option<i64>,
    pub kind: DiscrepancyKind,
    pub severity: Severity,
    pub description: String,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewReason {
    MissingMandatoryTerm,
    LowConfidence,
    MajorSeverity,
    ComparisonUnresolved,
}

impl ReviewReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewReason::MissingMandatoryTerm => "missing_mandatory_term",
            ReviewReason::LowConfidence => "low_confidence",
            ReviewReason::MajorSeverity => "major_severity",
            ReviewReason::ComparisonUnresolved => "comparison_unresolved",
        }
    }
}

/// Flagged-for-human-review record. Duplicate inserts for the same
/// clause/term/reason are no-ops.
#[derive(Debug, Clone, PartialEq)]
pub struct ReviewQueueItem {
    pub id: Option<i64>,
    pub document_id: i64,
    pub clause_boundary_id: Option<i64>,
    pub term_id: Option<i64>,
    pub reason: ReviewReason,
    pub priority: i32,
    pub metadata: Option<Value>,
    pub created_at: Option<DateTime<Utc>>,
}

/// DDL for the tables this core owns or writes to. Documents, clause
/// boundaries, and pre-agreed terms are created by collaborator services;
/// the definitions are kept here so the whole storage contract is visible
/// in one place.
pub const RECON_DDL: &str = r#"
CREATE SCHEMA IF NOT EXISTS recon;

CREATE TABLE recon.documents (
    id BIGSERIAL PRIMARY KEY,
    tenant_id BIGINT NOT NULL,
    deal_id BIGINT NOT NULL,
    object_path TEXT NOT NULL,
    full_text TEXT,
    status VARCHAR(20) NOT NULL DEFAULT 'pending',
    error_message TEXT,
    reconciled_at TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),

    CONSTRAINT chk_document_status
        CHECK (status IN ('pending', 'processing', 'completed', 'failed'))
);

CREATE TABLE recon.clause_boundaries (
    id BIGSERIAL PRIMARY KEY,
    document_id BIGINT NOT NULL REFERENCES recon.documents(id),
    clause_type VARCHAR(100) NOT NULL,
    content TEXT NOT NULL,
    confidence DOUBLE PRECISION NOT NULL DEFAULT 0,
    start_char BIGINT NOT NULL,
    end_char BIGINT NOT NULL,
    section_title TEXT,
    library_similarity DOUBLE PRECISION,

    CONSTRAINT chk_clause_span CHECK (start_char >= 0 AND end_char >= start_char)
);

CREATE INDEX idx_clause_boundaries_document ON recon.clause_boundaries(document_id);

CREATE TABLE recon.pre_agreed_terms (
    id BIGSERIAL PRIMARY KEY,
    deal_id BIGINT NOT NULL,
    category VARCHAR(100) NOT NULL,
    expected_value TEXT NOT NULL,
    mandatory BOOLEAN NOT NULL DEFAULT false,
    related_clause_types JSONB NOT NULL DEFAULT '[]'
);

CREATE INDEX idx_pre_agreed_terms_deal ON recon.pre_agreed_terms(deal_id);

CREATE TABLE recon.clause_match_results (
    id BIGSERIAL PRIMARY KEY,
    document_id BIGINT NOT NULL REFERENCES recon.documents(id),
    clause_boundary_id BIGINT REFERENCES recon.clause_boundaries(id),
    term_id BIGINT,
    rag_risk VARCHAR(10),
    rag_parsing VARCHAR(10),
    rag_status VARCHAR(10),
    discrepancy_count INTEGER NOT NULL DEFAULT 0,
    analysis JSONB,
    match_run_id VARCHAR(26),
    engine_version VARCHAR(20),
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE UNIQUE INDEX uq_clause_match_results_scope
    ON recon.clause_match_results(
        document_id,
        COALESCE(clause_boundary_id, -1),
        COALESCE(term_id, -1)
    );

CREATE TABLE recon.discrepancies (
    id BIGSERIAL PRIMARY KEY,
    document_id BIGINT NOT NULL REFERENCES recon.documents(id),
    clause_boundary_id BIGINT,
    term_id BIGINT,
    kind VARCHAR(20) NOT NULL,
    severity VARCHAR(10) NOT NULL,
    description TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),

    CONSTRAINT chk_discrepancy_kind CHECK (kind IN ('missing', 'conflicting', 'modified'))
);

CREATE UNIQUE INDEX uq_discrepancies_scope
    ON recon.discrepancies(
        document_id,
        COALESCE(clause_boundary_id, -1),
        COALESCE(term_id, -1),
        kind
    );

CREATE TABLE recon.review_queue (
    id BIGSERIAL PRIMARY KEY,
    document_id BIGINT NOT NULL REFERENCES recon.documents(id),
    clause_boundary_id BIGINT,
    term_id BIGINT,
    reason VARCHAR(40) NOT NULL,
    priority INTEGER NOT NULL DEFAULT 50,
    metadata JSONB,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),

    CONSTRAINT chk_review_priority CHECK (priority >= 0 AND priority <= 100)
);

CREATE UNIQUE INDEX uq_review_queue_scope
    ON recon.review_queue(
        document_id,
        COALESCE(clause_boundary_id, -1),
        COALESCE(term_id, -1),
        reason
    );

CREATE TABLE recon.document_queue (
    id BIGSERIAL PRIMARY KEY,
    document_id BIGINT NOT NULL UNIQUE,
    tenant_id BIGINT NOT NULL,
    object_path TEXT NOT NULL,
    processing_type VARCHAR(20) NOT NULL DEFAULT 'full',
    status VARCHAR(20) NOT NULL DEFAULT 'pending',
    locked_by VARCHAR(100),
    enqueued_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    processing_started_at TIMESTAMPTZ,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),

    CONSTRAINT chk_queue_status CHECK (status IN ('pending', 'processing')),
    CONSTRAINT chk_processing_type CHECK (processing_type IN ('full', 'reconcile_only'))
);

CREATE INDEX idx_document_queue_status ON recon.document_queue(status, enqueued_at);

CREATE TABLE recon.document_queue_archive (
    id BIGSERIAL PRIMARY KEY,
    document_id BIGINT NOT NULL,
    tenant_id BIGINT NOT NULL,
    object_path TEXT NOT NULL,
    processing_type VARCHAR(20) NOT NULL,
    enqueued_at TIMESTAMPTZ NOT NULL,
    archived_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    error_message TEXT
);
"#;
