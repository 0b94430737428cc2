//! Access to per-TRE result objects.
//!
//! Results are egressed by each TRE to `{bucket}/{task_id}/{subtask_id}/{object}`.
//! An absent object is not an error here; the caller decides what a missing
//! TRE means for completeness.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Raw object contents, or `None` when nothing is stored at `path`.
    async fn fetch(&self, bucket: &str, path: &str) -> Result<Option<String>>;
}

/// Reads a bucket mirrored onto the local filesystem.
#[derive(Debug, Clone)]
pub struct FsResultStore {
    root: PathBuf,
}

impl FsResultStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, bucket: &str, path: &str) -> PathBuf {
        path.split('/')
            .filter(|part| !part.is_empty() && *part != "..")
            .fold(self.root.join(bucket), |acc, part| acc.join(part))
    }
}

#[async_trait]
impl ResultStore for FsResultStore {
    async fn fetch(&self, bucket: &str, path: &str) -> Result<Option<String>> {
        let file = self.object_path(bucket, path);
        debug!("Reading result object {}", file.display());

        match tokio::fs::read_to_string(&file).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => {
                Err(e).with_context(|| format!("Failed to read result file: {}", file.display()))
            }
        }
    }
}

/// Reads objects over plain HTTP from an S3-compatible endpoint.
pub struct HttpResultStore {
    endpoint: String,
    token: Option<String>,
    http_client: reqwest::Client,
}

impl HttpResultStore {
    pub fn new(endpoint: &str, token: Option<String>) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token,
            http_client,
        })
    }

    pub fn object_url(&self, bucket: &str, path: &str) -> String {
        format!("{}/{}/{}", self.endpoint, bucket, path.trim_start_matches('/'))
    }
}

#[async_trait]
impl ResultStore for HttpResultStore {
    async fn fetch(&self, bucket: &str, path: &str) -> Result<Option<String>> {
        let url = self.object_url(bucket, path);
        debug!("GET {}", url);

        let mut request = self.http_client.get(&url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("Cannot reach object storage at {}", self.endpoint))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("Object storage error {}: {}", status, body));
        }

        let body = response
            .text()
            .await
            .context("Failed to read object body")?;
        Ok(Some(body))
    }
}
