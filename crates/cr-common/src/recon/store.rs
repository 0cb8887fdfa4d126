//! Persistence seam for the reconciliation engine.
//!
//! The Postgres implementation lives in `db::PgStore`; `MemoryStore` backs
//! the engine and worker tests with the same conflict semantics (one result
//! row per clause/virtual-term scope, no-op duplicate inserts).

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::schema::{
    ClauseBoundary, ClauseMatchResult, Discrepancy, Document, DocumentStatus, PreAgreedTerm,
    ReviewQueueItem,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store error: {0}")]
    Backend(String),
}

#[allow(async_fn_in_trait)]
pub trait ReconStore {
    async fn fetch_document(&self, document_id: i64) -> Result<Option<Document>, StoreError>;
    async fn fetch_terms(&self, deal_id: i64) -> Result<Vec<PreAgreedTerm>, StoreError>;
    async fn fetch_clauses(&self, document_id: i64) -> Result<Vec<ClauseBoundary>, StoreError>;
    async fn fetch_match_results(
        &self,
        document_id: i64,
    ) -> Result<Vec<ClauseMatchResult>, StoreError>;

    /// Bulk upsert; returns rows written. The engine falls back to
    /// [`Self::upsert_match_result`] per row when this call fails.
    async fn upsert_match_results(&self, results: &[ClauseMatchResult])
    -> Result<u64, StoreError>;
    async fn upsert_match_result(&self, result: &ClauseMatchResult) -> Result<u64, StoreError>;

    /// Insert, treating a unique-constraint conflict as a successful no-op.
    /// Returns 1 for a new row, 0 for a conflict.
    async fn insert_discrepancy(&self, discrepancy: &Discrepancy) -> Result<u64, StoreError>;
    async fn insert_review_item(&self, item: &ReviewQueueItem) -> Result<u64, StoreError>;

    async fn set_document_reconciled(
        &self,
        document_id: i64,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
    async fn set_document_status(
        &self,
        document_id: i64,
        status: DocumentStatus,
        error_message: Option<&str>,
    ) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
struct MemoryStoreInner {
    documents: HashMap<i64, Document>,
    terms: HashMap<i64, Vec<PreAgreedTerm>>,
    clauses: HashMap<i64, Vec<ClauseBoundary>>,
    results: Vec<ClauseMatchResult>,
    discrepancies: Vec<Discrepancy>,
    reviews: Vec<ReviewQueueItem>,
    next_result_id: i64,
}

/// In-memory store mirroring the Postgres conflict behaviour.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryStoreInner>,
    fail_bulk_upsert: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_document(&self, document: Document) {
        let mut inner = self.inner.lock().unwrap();
        inner.documents.insert(document.id, document);
    }

    pub fn insert_terms(&self, deal_id: i64, terms: Vec<PreAgreedTerm>) {
        let mut inner = self.inner.lock().unwrap();
        inner.terms.insert(deal_id, terms);
    }

    pub fn insert_clauses(&self, document_id: i64, clauses: Vec<ClauseBoundary>) {
        let mut inner = self.inner.lock().unwrap();
        inner.clauses.insert(document_id, clauses);
    }

    /// Seed a pre-existing match result, e.g. one written by the
    /// library-matching stage with only `rag_risk` set.
    pub fn seed_match_result(&self, mut result: ClauseMatchResult) {
        let mut inner = self.inner.lock().unwrap();
        inner.next_result_id += 1;
        result.id = Some(inner.next_result_id);
        inner.results.push(result);
    }

    /// Make the next bulk upserts fail, to exercise the sequential fallback.
    pub fn fail_bulk_upserts(&self, fail: bool) {
        self.fail_bulk_upsert.store(fail, Ordering::SeqCst);
    }

    pub fn results(&self) -> Vec<ClauseMatchResult> {
        self.inner.lock().unwrap().results.clone()
    }

    pub fn discrepancies(&self) -> Vec<Discrepancy> {
        self.inner.lock().unwrap().discrepancies.clone()
    }

    pub fn reviews(&self) -> Vec<ReviewQueueItem> {
        self.inner.lock().unwrap().reviews.clone()
    }

    pub fn document(&self, document_id: i64) -> Option<Document> {
        self.inner.lock().unwrap().documents.get(&document_id).cloned()
    }

    fn upsert_locked(inner: &mut MemoryStoreInner, result: &ClauseMatchResult) -> u64 {
        let scope = (
            result.document_id,
            result.clause_boundary_id,
            result.term_id,
        );
        if let Some(existing) = inner.results.iter_mut().find(|row| {
            (row.document_id, row.clause_boundary_id, row.term_id) == scope
        }) {
            let id = existing.id;
            let created_at = existing.created_at;
            *existing = result.clone();
            existing.id = id;
            existing.created_at = created_at;
        } else {
            inner.next_result_id += 1;
            let mut row = result.clone();
            row.id = Some(inner.next_result_id);
            inner.results.push(row);
        }
        1
    }
}

impl ReconStore for MemoryStore {
    async fn fetch_document(&self, document_id: i64) -> Result<Option<Document>, StoreError> {
        Ok(self.inner.lock().unwrap().documents.get(&document_id).cloned())
    }

    async fn fetch_terms(&self, deal_id: i64) -> Result<Vec<PreAgreedTerm>, StoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .terms
            .get(&deal_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn fetch_clauses(&self, document_id: i64) -> Result<Vec<ClauseBoundary>, StoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .clauses
            .get(&document_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn fetch_match_results(
        &self,
        document_id: i64,
    ) -> Result<Vec<ClauseMatchResult>, StoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .results
            .iter()
            .filter(|row| row.document_id == document_id)
            .cloned()
            .collect())
    }

    async fn upsert_match_results(
        &self,
        results: &[ClauseMatchResult],
    ) -> Result<u64, StoreError> {
        if self.fail_bulk_upsert.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("bulk update rpc unavailable".into()));
        }

        let mut inner = self.inner.lock().unwrap();
        let mut written = 0;
        for result in results {
            written += Self::upsert_locked(&mut inner, result);
        }
        Ok(written)
    }

    async fn upsert_match_result(&self, result: &ClauseMatchResult) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        Ok(Self::upsert_locked(&mut inner, result))
    }

    async fn insert_discrepancy(&self, discrepancy: &Discrepancy) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let conflict = inner.discrepancies.iter().any(|row| {
            row.document_id == discrepancy.document_id
                && row.clause_boundary_id == discrepancy.clause_boundary_id
                && row.term_id == discrepancy.term_id
                && row.kind == discrepancy.kind
        });
        if conflict {
            return Ok(0);
        }
        inner.discrepancies.push(discrepancy.clone());
        Ok(1)
    }

    async fn insert_review_item(&self, item: &ReviewQueueItem) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let conflict = inner.reviews.iter().any(|row| {
            row.document_id == item.document_id
                && row.clause_boundary_id == item.clause_boundary_id
                && row.term_id == item.term_id
                && row.reason == item.reason
        });
        if conflict {
            return Ok(0);
        }
        inner.reviews.push(item.clone());
        Ok(1)
    }

    async fn set_document_reconciled(
        &self,
        document_id: i64,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(document) = inner.documents.get_mut(&document_id) {
            document.reconciled_at = Some(at);
            document.updated_at = at;
        }
        Ok(())
    }

    async fn set_document_status(
        &self,
        document_id: i64,
        status: DocumentStatus,
        error_message: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(document) = inner.documents.get_mut(&document_id) {
            document.status = status;
            document.error_message = error_message.map(str::to_string);
            document.updated_at = Utc::now();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn document(id: i64) -> Document {
        Document {
            id,
            tenant_id: 1,
            deal_id: 1,
            object_path: format!("tenant-1/doc-{id}.pdf"),
            full_text: Some("text".into()),
            status: DocumentStatus::Pending,
            error_message: None,
            reconciled_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn upsert_keeps_one_row_per_scope() {
        let store = MemoryStore::new();
        let row = ClauseMatchResult::for_clause(1, 10);

        assert_eq!(store.upsert_match_results(&[row.clone()]).await.unwrap(), 1);
        assert_eq!(store.upsert_match_results(&[row]).await.unwrap(), 1);
        assert_eq!(store.results().len(), 1);

        let virtual_row = ClauseMatchResult::virtual_for_term(1, 5);
        store.upsert_match_result(&virtual_row).await.unwrap();
        store.upsert_match_result(&virtual_row).await.unwrap();
        assert_eq!(store.results().len(), 2);
    }

    #[tokio::test]
    async fn upsert_preserves_row_identity_and_created_at() {
        let store = MemoryStore::new();
        let mut seeded = ClauseMatchResult::for_clause(1, 10);
        seeded.created_at = Some(Utc::now());
        store.seed_match_result(seeded);
        let original = store.results().pop().unwrap();

        let update = ClauseMatchResult::for_clause(1, 10);
        store.upsert_match_result(&update).await.unwrap();

        let updated = store.results().pop().unwrap();
        assert_eq!(updated.id, original.id);
        assert_eq!(updated.created_at, original.created_at);
    }

    #[tokio::test]
    async fn duplicate_discrepancies_are_noops() {
        let store = MemoryStore::new();
        let discrepancy = Discrepancy {
            id: None,
            document_id: 1,
            clause_boundary_id: None,
            term_id: Some(2),
            kind: crate::schema::DiscrepancyKind::Missing,
            severity: crate::schema::Severity::Major,
            description: "missing".into(),
            created_at: None,
        };

        assert_eq!(store.insert_discrepancy(&discrepancy).await.unwrap(), 1);
        assert_eq!(store.insert_discrepancy(&discrepancy).await.unwrap(), 0);
        assert_eq!(store.discrepancies().len(), 1);
    }

    #[tokio::test]
    async fn status_setter_records_error_message() {
        let store = MemoryStore::new();
        store.insert_document(document(1));

        store
            .set_document_status(1, DocumentStatus::Failed, Some("extraction failed"))
            .await
            .unwrap();

        let doc = store.document(1).unwrap();
        assert_eq!(doc.status, DocumentStatus::Failed);
        assert_eq!(doc.error_message.as_deref(), Some("extraction failed"));
    }
}
