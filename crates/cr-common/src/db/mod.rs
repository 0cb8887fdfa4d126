//! Postgres persistence layer: pool construction, per-table accessors, the
//! lease-based work queue, and `PgStore`, the production implementation of
//! the reconciliation engine's storage seam.

pub mod clauses;
pub mod discrepancies;
pub mod documents;
pub mod match_results;
pub mod pool;
pub mod queue;
pub mod review_queue;
pub mod terms;
pub mod util;

use chrono::{DateTime, Utc};

use crate::recon::store::{ReconStore, StoreError};
use crate::schema::{
    ClauseBoundary, ClauseMatchResult, Discrepancy, Document, DocumentStatus, PreAgreedTerm,
    ReviewQueueItem,
};

pub use clauses::{ClauseStorageError, fetch_clause_boundaries};
pub use discrepancies::{DiscrepancyStorageError, insert_discrepancy};
pub use documents::{
    DocumentStorageError, fetch_document, set_document_reconciled, set_document_status,
};
pub use match_results::{
    MatchResultStorageError, fetch_match_results, upsert_match_result, upsert_match_results_bulk,
};
pub use pool::{DbPoolError, PgPool, create_pool_from_url};
pub use queue::{PgWorkQueue, QueueStorageError};
pub use review_queue::{ReviewQueueStorageError, insert_review_item};
pub use terms::{TermStorageError, fetch_terms_for_deal};

/// Postgres-backed [`ReconStore`].
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn backend<E: std::fmt::Display>(err: E) -> StoreError {
    StoreError::Backend(err.to_string())
}

impl ReconStore for PgStore {
    async fn fetch_document(&self, document_id: i64) -> Result<Option<Document>, StoreError> {
        documents::fetch_document(&self.pool, document_id)
            .await
            .map_err(backend)
    }

    async fn fetch_terms(&self, deal_id: i64) -> Result<Vec<PreAgreedTerm>, StoreError> {
        terms::fetch_terms_for_deal(&self.pool, deal_id)
            .await
            .map_err(backend)
    }

    async fn fetch_clauses(&self, document_id: i64) -> Result<Vec<ClauseBoundary>, StoreError> {
        clauses::fetch_clause_boundaries(&self.pool, document_id)
            .await
            .map_err(backend)
    }

    async fn fetch_match_results(
        &self,
        document_id: i64,
    ) -> Result<Vec<ClauseMatchResult>, StoreError> {
        match_results::fetch_match_results(&self.pool, document_id)
            .await
            .map_err(backend)
    }

    async fn upsert_match_results(
        &self,
        results: &[ClauseMatchResult],
    ) -> Result<u64, StoreError> {
        match_results::upsert_match_results_bulk(&self.pool, results)
            .await
            .map_err(backend)
    }

    async fn upsert_match_result(&self, result: &ClauseMatchResult) -> Result<u64, StoreError> {
        match_results::upsert_match_result(&self.pool, result)
            .await
            .map_err(backend)
    }

    async fn insert_discrepancy(&self, discrepancy: &Discrepancy) -> Result<u64, StoreError> {
        discrepancies::insert_discrepancy(&self.pool, discrepancy)
            .await
            .map_err(backend)
    }

    async fn insert_review_item(&self, item: &ReviewQueueItem) -> Result<u64, StoreError> {
        review_queue::insert_review_item(&self.pool, item)
            .await
            .map_err(backend)
    }

    async fn set_document_reconciled(
        &self,
        document_id: i64,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        documents::set_document_reconciled(&self.pool, document_id, at)
            .await
            .map(|_| ())
            .map_err(backend)
    }

    async fn set_document_status(
        &self,
        document_id: i64,
        status: DocumentStatus,
        error_message: Option<&str>,
    ) -> Result<(), StoreError> {
        documents::set_document_status(&self.pool, document_id, status, error_message)
            .await
            .map(|_| ())
            .map_err(backend)
    }
}
