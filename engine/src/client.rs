//! HTTP client for the control service, used by the orchestrator and the
//! in-environment runner to report progress.

use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::contracts::{CreateRunRequest, PatchResponse, TestPatch};
use crate::events::RunEvent;
use crate::store::RunRecord;

/// Error type for control-service calls
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("server returned {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
}

/// Result type for control-service calls
pub type ClientResult<T> = Result<T, ClientError>;

/// Client bound to one control-service base URL.
#[derive(Debug, Clone)]
pub struct ControlClient {
    base: String,
    http: reqwest::Client,
}

impl ControlClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base: base_url.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    async fn expect_json<T: DeserializeOwned>(response: reqwest::Response) -> ClientResult<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Status { status, body });
        }
        Ok(response.json().await?)
    }

    /// Create a run row and pre-populate its test rows.
    pub async fn create_run(&self, request: &CreateRunRequest) -> ClientResult<RunRecord> {
        let response = self
            .http
            .post(format!("{}/api/runs", self.base))
            .json(request)
            .send()
            .await?;
        Self::expect_json(response).await
    }

    pub async fn get_run(&self, run_id: &str) -> ClientResult<RunRecord> {
        let response = self
            .http
            .get(format!("{}/api/runs/{run_id}", self.base))
            .send()
            .await?;
        Self::expect_json(response).await
    }

    /// Idempotent status/step upload for one test.
    pub async fn patch_test(
        &self,
        run_id: &str,
        test_id: &str,
        patch: &TestPatch,
    ) -> ClientResult<PatchResponse> {
        let response = self
            .http
            .patch(format!("{}/api/runs/{run_id}/test/{test_id}", self.base))
            .json(patch)
            .send()
            .await?;
        Self::expect_json(response).await
    }

    /// Like [`patch_test`], but only logs on failure. Used mid-test where a
    /// reporting hiccup must not fail the run.
    pub async fn patch_test_best_effort(&self, run_id: &str, test_id: &str, patch: &TestPatch) {
        if let Err(e) = self.patch_test(run_id, test_id, patch).await {
            warn!(run_id, test_id, error = %e, "progress report failed");
        }
    }

    pub async fn complete_run(&self, run_id: &str) -> ClientResult<RunRecord> {
        let response = self
            .http
            .post(format!("{}/api/runs/{run_id}/complete", self.base))
            .send()
            .await?;
        Self::expect_json(response).await
    }

    pub async fn cancel_run(&self, run_id: &str) -> ClientResult<RunRecord> {
        let response = self
            .http
            .post(format!("{}/api/runs/{run_id}/cancel", self.base))
            .send()
            .await?;
        Self::expect_json(response).await
    }

    /// Forward an event from an out-of-process runner to the hub.
    pub async fn emit_event(&self, event: &RunEvent) -> ClientResult<()> {
        debug!(event_type = event.event_type(), "forwarding event");
        let response = self
            .http
            .post(format!("{}/api/events/emit", self.base))
            .json(event)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Status { status, body });
        }
        Ok(())
    }

    /// True when the service answers its health probe.
    pub async fn is_reachable(&self) -> bool {
        self.http
            .get(format!("{}/api/health", self.base))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_normalized() {
        let client = ControlClient::new("http://localhost:9000/");
        assert_eq!(client.base_url(), "http://localhost:9000");
    }

    #[tokio::test]
    async fn test_unreachable_is_false() {
        let client = ControlClient::new("http://127.0.0.1:59997");
        assert!(!client.is_reachable().await);
    }
}
