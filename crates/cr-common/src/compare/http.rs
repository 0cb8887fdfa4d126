//! HTTP transport for the comparison service.

use std::time::Duration;

use tracing::debug;

use super::{CompareError, ComparisonClient, ComparisonOutcome, ComparisonRequestItem, ComparisonResponse};

/// JSON-over-HTTP comparison client. The per-call timeout is decided by the
/// batch runner from the batch size, not baked into the client.
pub struct HttpComparisonClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpComparisonClient {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            api_key: api_key.filter(|key| !key.is_empty()),
        }
    }
}

impl ComparisonClient for HttpComparisonClient {
    async fn compare_batch(
        &self,
        items: &[ComparisonRequestItem],
        timeout: Duration,
    ) -> Result<Vec<ComparisonOutcome>, CompareError> {
        debug!(
            pairs = items.len(),
            timeout_ms = timeout.as_millis() as u64,
            "submitting comparison batch"
        );

        let mut request = self.client.post(&self.endpoint).timeout(timeout).json(items);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|err| CompareError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CompareError::Server {
                status: status.as_u16(),
                body,
            });
        }

        let body = response
            .text()
            .await
            .map_err(|err| CompareError::Transport(err.to_string()))?;
        let parsed: ComparisonResponse = serde_json::from_str(&body)
            .map_err(|err| CompareError::Schema(err.to_string()))?;
        Ok(parsed.results)
    }
}
