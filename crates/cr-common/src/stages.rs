//! Invocation contracts for the collaborator stages that precede
//! reconciliation: text extraction, embedding generation, and
//! library matching. Each is a request/response call over HTTP; this core
//! never implements them, only drives them in order.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractionRequest {
    pub document_id: i64,
    pub tenant_id: i64,
    pub object_path: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExtractionResponse {
    pub success: bool,
    pub clauses_extracted: Option<u32>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmbeddingRequest {
    pub document_id: i64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EmbeddingResponse {
    pub success: bool,
    pub embeddings_generated: Option<u32>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LibraryMatchRequest {
    pub document_id: i64,
    pub tenant_id: i64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LibraryMatchResponse {
    pub success: bool,
    pub clauses_reconciled: Option<u32>,
    pub error: Option<String>,
}

#[derive(Debug, Error)]
pub enum StageError {
    #[error("{stage} request failed: {message}")]
    Transport { stage: &'static str, message: String },
    #[error("{stage} service returned {status}: {body}")]
    Server {
        stage: &'static str,
        status: u16,
        body: String,
    },
    /// The stage ran and reported `success: false`. Fatal to the document.
    #[error("{stage} failed: {message}")]
    Failed { stage: &'static str, message: String },
}

/// Fold a stage response's `success`/`error` pair into a `StageError`.
pub fn ensure_success(
    stage: &'static str,
    success: bool,
    error: Option<String>,
) -> Result<(), StageError> {
    if success {
        Ok(())
    } else {
        Err(StageError::Failed {
            stage,
            message: error.unwrap_or_else(|| "no error reported".into()),
        })
    }
}

#[allow(async_fn_in_trait)]
pub trait StageClient {
    async fn extract(&self, request: &ExtractionRequest) -> Result<ExtractionResponse, StageError>;
    async fn embed(&self, request: &EmbeddingRequest) -> Result<EmbeddingResponse, StageError>;
    async fn match_library(
        &self,
        request: &LibraryMatchRequest,
    ) -> Result<LibraryMatchResponse, StageError>;
}

#[derive(Debug, Clone)]
pub struct StageEndpoints {
    pub extraction_url: String,
    pub embedding_url: String,
    pub library_url: String,
}

impl StageEndpoints {
    pub fn from_env() -> Self {
        fn var_or(key: &str, default: &str) -> String {
            std::env::var(key).unwrap_or_else(|_| default.to_string())
        }

        Self {
            extraction_url: var_or("CR_EXTRACTION_URL", "http://localhost:8101/extract"),
            embedding_url: var_or("CR_EMBEDDING_URL", "http://localhost:8102/embed"),
            library_url: var_or("CR_LIBRARY_MATCH_URL", "http://localhost:8103/match"),
        }
    }
}

/// JSON-over-HTTP stage client.
pub struct HttpStageClient {
    client: reqwest::Client,
    endpoints: StageEndpoints,
}

impl HttpStageClient {
    pub fn new(endpoints: StageEndpoints) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoints,
        }
    }

    async fn post<Req, Resp>(
        &self,
        stage: &'static str,
        url: &str,
        request: &Req,
    ) -> Result<Resp, StageError>
    where
        Req: Serialize,
        Resp: for<'de> Deserialize<'de>,
    {
        debug!(stage, url, "invoking pipeline stage");

        let response = self
            .client
            .post(url)
            .json(request)
            .send()
            .await
            .map_err(|err| StageError::Transport {
                stage,
                message: err.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StageError::Server {
                stage,
                status: status.as_u16(),
                body,
            });
        }

        response.json().await.map_err(|err| StageError::Transport {
            stage,
            message: err.to_string(),
        })
    }
}

impl StageClient for HttpStageClient {
    async fn extract(&self, request: &ExtractionRequest) -> Result<ExtractionResponse, StageError> {
        self.post("extraction", &self.endpoints.extraction_url, request)
            .await
    }

    async fn embed(&self, request: &EmbeddingRequest) -> Result<EmbeddingResponse, StageError> {
        self.post("embedding", &self.endpoints.embedding_url, request)
            .await
    }

    async fn match_library(
        &self,
        request: &LibraryMatchRequest,
    ) -> Result<LibraryMatchResponse, StageError> {
        self.post("library_matching", &self.endpoints.library_url, request)
            .await
    }
}
