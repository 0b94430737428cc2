//! HTTP client for the TES submission layer.

use super::{ExecutionService, SubmissionMessage};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Timeout applied to every request against the submission layer.
const REQUEST_TIMEOUT_SECS: u64 = 60;

/// Talks to `POST {base}/v1/tasks` and `GET {base}/api/Submission/GetASubmission/{id}`.
pub struct HttpExecutionService {
    base_url: String,
    token: Option<String>,
    http_client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct SubmissionStatus {
    status: i64,
}

impl HttpExecutionService {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            http_client,
        })
    }

    pub fn tasks_url(&self) -> String {
        format!("{}/v1/tasks", self.base_url)
    }

    pub fn status_url(&self, task_id: u64) -> String {
        format!("{}/api/Submission/GetASubmission/{}", self.base_url, task_id)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn describe(&self, e: reqwest::Error) -> anyhow::Error {
        if e.is_timeout() {
            anyhow::anyhow!("Request timed out after {}s", REQUEST_TIMEOUT_SECS)
        } else if e.is_connect() {
            anyhow::anyhow!("Cannot connect to submission layer at {}", self.base_url)
        } else {
            anyhow::anyhow!("Failed to send request: {}", e)
        }
    }
}

#[async_trait]
impl ExecutionService for HttpExecutionService {
    async fn submit(&self, message: &SubmissionMessage) -> Result<Value> {
        let url = self.tasks_url();
        debug!("POST {}", url);

        let response = self
            .authorized(self.http_client.post(&url))
            .header("accept", "text/plain")
            .json(message)
            .send()
            .await
            .map_err(|e| self.describe(e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("Submission API error {}: {}", status, body));
        }

        response
            .json()
            .await
            .context("Failed to parse submission response")
    }

    async fn status(&self, task_id: u64) -> Result<i64> {
        let url = self.status_url(task_id);

        let response = self
            .authorized(self.http_client.get(&url))
            .send()
            .await
            .map_err(|e| self.describe(e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("Status API error {}: {}", status, body));
        }

        let submission: SubmissionStatus = response
            .json()
            .await
            .context("Failed to parse submission status")?;
        Ok(submission.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls() {
        let service = HttpExecutionService::new("https://tre.example.org/", None).unwrap();
        assert_eq!(service.tasks_url(), "https://tre.example.org/v1/tasks");
        assert_eq!(
            service.status_url(179),
            "https://tre.example.org/api/Submission/GetASubmission/179"
        );
    }

    #[test]
    fn test_status_body() {
        let parsed: SubmissionStatus =
            serde_json::from_str(r#"{"id": 180, "status": 49, "tres": []}"#).unwrap();
        assert_eq!(parsed.status, 49);
    }

    #[tokio::test]
    async fn test_unreachable_service_is_error() {
        let service = HttpExecutionService::new("http://127.0.0.1:9", None).unwrap();
        assert!(service.status(1).await.is_err());
    }
}
