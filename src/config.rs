//! Configuration file handling.
//!
//! This module handles loading and merging configuration from
//! `.fedstats.toml` files. The resulting [`Config`] is passed explicitly to
//! the orchestrator; nothing below the binary reads the environment.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = ".fedstats.toml";

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Task execution service settings.
    #[serde(default)]
    pub service: ServiceConfig,

    /// Database the TRE containers connect to.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Object storage holding per-TRE results.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Status polling budget.
    #[serde(default)]
    pub polling: PollingConfig,

    /// Analysis finalization settings.
    #[serde(default)]
    pub analysis: AnalysisConfig,

    /// Credentials passed through to collaborators.
    #[serde(default)]
    pub auth: AuthConfig,
}

/// Task execution service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Base URL of the submission layer (TES lives under `/v1`).
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Container image that runs the query inside each TRE.
    #[serde(default = "default_docker_image")]
    pub docker_image: String,

    /// Project the tasks are submitted under.
    #[serde(default = "default_project")]
    pub project: String,

    /// Output directory inside the container.
    #[serde(default = "default_output_path")]
    pub output_path: String,

    /// Result format requested from the container (json or csv).
    #[serde(default = "default_output_format")]
    pub output_format: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            docker_image: default_docker_image(),
            project: default_project(),
            output_path: default_output_path(),
            output_format: default_output_format(),
        }
    }
}

fn default_base_url() -> String {
    "http://localhost:5034".to_string()
}

fn default_docker_image() -> String {
    "ghcr.io/fedstats/local-processing:latest".to_string()
}

fn default_project() -> String {
    "fedstats".to_string()
}

fn default_output_path() -> String {
    "/outputs".to_string()
}

fn default_output_format() -> String {
    "json".to_string()
}

/// Database connection handed to the TRE containers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_host")]
    pub host: String,

    #[serde(default = "default_db_port")]
    pub port: u16,

    #[serde(default = "default_db_username")]
    pub username: String,

    #[serde(default)]
    pub password: String,

    #[serde(default = "default_db_name")]
    pub name: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: default_db_host(),
            port: default_db_port(),
            username: default_db_username(),
            password: String::new(),
            name: default_db_name(),
        }
    }
}

fn default_db_host() -> String {
    "localhost".to_string()
}

fn default_db_port() -> u16 {
    5432
}

fn default_db_username() -> String {
    "postgres".to_string()
}

fn default_db_name() -> String {
    "omop".to_string()
}

impl DatabaseConfig {
    /// Connection string passed on the container command line.
    pub fn connection_string(&self) -> String {
        format!(
            "postgresql://{}:{}@{}:{}/{}",
            self.username, self.password, self.host, self.port, self.name
        )
    }
}

/// Object storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Object storage endpoint URL.
    #[serde(default = "default_storage_endpoint")]
    pub endpoint: String,

    /// Bucket TRE outputs are egressed to.
    #[serde(default = "default_bucket")]
    pub bucket: String,

    /// Object name under each `{task_id}/{subtask_id}/` prefix.
    #[serde(default = "default_result_object")]
    pub result_object: String,

    /// Read results from a local directory mirror instead of the endpoint.
    #[serde(default)]
    pub local_root: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            endpoint: default_storage_endpoint(),
            bucket: default_bucket(),
            result_object: default_result_object(),
            local_root: None,
        }
    }
}

fn default_storage_endpoint() -> String {
    "http://localhost:9000".to_string()
}

fn default_bucket() -> String {
    "fedstats-results".to_string()
}

fn default_result_object() -> String {
    "output.json".to_string()
}

/// Polling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Seconds between status polls.
    #[serde(default = "default_interval")]
    pub interval_seconds: u64,

    /// Multiplier applied to the interval after each waiting poll (1.0 = fixed).
    #[serde(default = "default_backoff")]
    pub backoff_factor: f64,

    /// Upper bound for the interval when backing off.
    #[serde(default = "default_max_interval")]
    pub max_interval_seconds: u64,

    /// Give up after this many polls.
    #[serde(default)]
    pub max_attempts: Option<u32>,

    /// Give up after waiting this long in total.
    #[serde(default = "default_max_wait")]
    pub max_wait_seconds: Option<u64>,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_interval(),
            backoff_factor: default_backoff(),
            max_interval_seconds: default_max_interval(),
            max_attempts: None,
            max_wait_seconds: default_max_wait(),
        }
    }
}

fn default_interval() -> u64 {
    10
}

fn default_backoff() -> f64 {
    1.0
}

fn default_max_interval() -> u64 {
    120
}

fn default_max_wait() -> Option<u64> {
    Some(6 * 60 * 60) // egress review can take hours
}

/// Finalization settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Quantiles reported for percentile sketches.
    #[serde(default = "default_quantiles")]
    pub quantiles: Vec<f64>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            quantiles: default_quantiles(),
        }
    }
}

fn default_quantiles() -> Vec<f64> {
    vec![0.05, 0.25, 0.5, 0.75, 0.95]
}

/// Opaque credentials.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Bearer token for the submission layer and object storage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Try to load configuration from the default location.
    ///
    /// Returns `Ok(None)` if the file doesn't exist, `Err` if it exists but can't be parsed.
    pub fn load_default() -> Result<Option<Self>> {
        let default_path = Path::new(CONFIG_FILE);

        if default_path.exists() {
            Ok(Some(Self::load(default_path)?))
        } else {
            Ok(None)
        }
    }

    /// Merge this configuration with CLI arguments.
    ///
    /// CLI arguments take precedence over config file settings, and only
    /// when they were given.
    pub fn merge_with_args(&mut self, args: &crate::cli::Args) {
        if let Some(ref base_url) = args.base_url {
            self.service.base_url = base_url.clone();
        }
        if let Some(ref image) = args.image {
            self.service.docker_image = image.clone();
        }
        if let Some(ref bucket) = args.bucket {
            self.storage.bucket = bucket.clone();
        }
        if let Some(ref root) = args.results_dir {
            self.storage.local_root = Some(root.clone());
        }
        if let Some(ref token) = args.token {
            self.auth.token = Some(token.clone());
        }
        if let Some(interval) = args.poll_interval {
            self.polling.interval_seconds = interval;
        }
        if let Some(max_polls) = args.max_polls {
            self.polling.max_attempts = Some(max_polls);
        }
        if let Some(max_wait) = args.max_wait {
            self.polling.max_wait_seconds = Some(max_wait);
        }
        if let Some(ref quantiles) = args.quantiles {
            self.analysis.quantiles = quantiles.clone();
        }
    }

    /// Generate a default configuration file content.
    pub fn default_toml() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}
