//! Command-line interface argument parsing.
//!
//! This module handles all CLI argument parsing using clap,
//! including validation and default values.

use crate::analysis::StatisticalAnalyzer;
use crate::models::AnalysisRequest;
use clap::Parser;
use std::path::PathBuf;

/// fedstats - federated statistics across Trusted Research Environments
///
/// Submits a data-selection query to every listed TRE, waits for the
/// sufficient statistics to come back and combines them into one result.
///
/// Examples:
///   fedstats --analysis mean --query "SELECT value_as_number FROM measurement" --tres Nottingham,"Nottingham 2"
///   fedstats --analysis variance --query-file query.sql --tres A,B --format json
///   fedstats --analysis variance,mean --query-file query.sql --tres A,B
///   fedstats --analysis mean --query-file query.sql --tres A,B --task-id 179
///   fedstats --analysis PMCC --query-file query.sql --tres A,B --dry-run
///   fedstats --init-config
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    /// Analyses to run, in order (comma-separated)
    ///
    /// Any of: mean, variance, PMCC, contingency_table, percentile_sketch, chi_squared.
    /// Later analyses reuse the statistics of earlier ones when they can.
    #[arg(
        short,
        long,
        value_name = "TYPES",
        value_delimiter = ',',
        required_unless_present = "init_config"
    )]
    pub analysis: Vec<String>,

    /// Data-selection SQL (no aggregation; the TRE container adds it)
    #[arg(short = 'q', long, value_name = "SQL", conflicts_with = "query_file")]
    pub query: Option<String>,

    /// Read the data-selection SQL from a file
    #[arg(long, value_name = "FILE")]
    pub query_file: Option<PathBuf>,

    /// TREs to run on (comma-separated, order fixes subtask ids)
    #[arg(short, long, value_name = "NAMES", value_delimiter = ',')]
    pub tres: Vec<String>,

    /// Task name shown in the submission layer
    #[arg(long, value_name = "NAME")]
    pub task_name: Option<String>,

    /// Collect results of an already submitted task instead of submitting
    #[arg(long, value_name = "ID")]
    pub task_id: Option<u64>,

    /// Path to configuration file
    ///
    /// If not specified, looks for .fedstats.toml in the current directory
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Submission layer base URL
    #[arg(long, value_name = "URL", env = "FEDSTATS_BASE_URL")]
    pub base_url: Option<String>,

    /// Bearer token for the submission layer and object storage
    #[arg(long, env = "FEDSTATS_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Container image to run in each TRE
    #[arg(long, value_name = "IMAGE")]
    pub image: Option<String>,

    /// Bucket the TRE results are egressed to
    #[arg(long, value_name = "BUCKET")]
    pub bucket: Option<String>,

    /// Read results from a local mirror of the bucket
    #[arg(long, value_name = "DIR")]
    pub results_dir: Option<PathBuf>,

    /// Seconds between status polls
    #[arg(long, value_name = "SECS")]
    pub poll_interval: Option<u64>,

    /// Give up after this many status polls
    #[arg(long, value_name = "COUNT")]
    pub max_polls: Option<u32>,

    /// Give up after waiting this many seconds
    #[arg(long, value_name = "SECS")]
    pub max_wait: Option<u64>,

    /// Quantiles reported for percentile sketches (comma-separated)
    #[arg(long, value_name = "Q", value_delimiter = ',')]
    pub quantiles: Option<Vec<f64>>,

    /// Output format (markdown, json)
    #[arg(long, default_value = "markdown", value_name = "FORMAT")]
    pub format: OutputFormat,

    /// Write the report to a file instead of stdout
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Print the submission message and exit without submitting
    #[arg(long)]
    pub dry_run: bool,

    /// Exit with code 2 when not every TRE returned a result
    #[arg(long)]
    pub fail_on_partial: bool,

    /// Enable verbose logging output
    #[arg(short, long)]
    pub verbose: bool,

    /// Run in quiet mode (minimal output)
    #[arg(long)]
    pub quiet: bool,

    /// Generate a default .fedstats.toml configuration file
    #[arg(long)]
    pub init_config: bool,
}

/// Output format for the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Markdown format (default)
    #[default]
    Markdown,
    /// JSON format
    Json,
}

impl Args {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the parsed arguments.
    pub fn validate(&self) -> Result<(), String> {
        if self.init_config {
            return Ok(());
        }

        if self.analysis.iter().all(|a| a.trim().is_empty()) {
            return Err("At least one analysis is required (--analysis)".to_string());
        }

        for analysis in self.analysis.iter().filter(|a| !a.trim().is_empty()) {
            StatisticalAnalyzer::parse_type(analysis).map_err(|e| {
                let supported: Vec<String> = StatisticalAnalyzer::supported_types()
                    .iter()
                    .map(ToString::to_string)
                    .collect();
                format!("{} (supported: {})", e, supported.join(", "))
            })?;
        }

        if self.query.is_none() && self.query_file.is_none() {
            return Err("One of --query or --query-file is required".to_string());
        }

        if self.tres.iter().all(|t| t.trim().is_empty()) {
            return Err("At least one TRE is required (--tres)".to_string());
        }

        if let Some(ref base_url) = self.base_url {
            if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
                return Err("Base URL must start with 'http://' or 'https://'".to_string());
            }
        }

        if self.poll_interval == Some(0) {
            return Err("Poll interval must be at least 1 second".to_string());
        }

        if self.max_polls == Some(0) {
            return Err("Max polls must be at least 1".to_string());
        }

        if let Some(ref quantiles) = self.quantiles {
            if quantiles.iter().any(|q| !(0.0..=1.0).contains(q)) {
                return Err("Quantiles must be between 0.0 and 1.0".to_string());
            }
        }

        if self.verbose && self.quiet {
            return Err("Cannot use both --verbose and --quiet".to_string());
        }

        if let Some(ref path) = self.query_file {
            if !path.is_file() {
                return Err(format!("Query file does not exist: {}", path.display()));
            }
        }

        Ok(())
    }

    /// Build one request per analysis, reading the query file if one was given.
    pub fn to_requests(&self) -> anyhow::Result<Vec<AnalysisRequest>> {
        let analysis_types = self
            .analysis
            .iter()
            .filter(|a| !a.trim().is_empty())
            .map(|a| StatisticalAnalyzer::parse_type(a))
            .collect::<Result<Vec<_>, _>>()?;

        let query = match (&self.query, &self.query_file) {
            (Some(query), _) => query.clone(),
            (None, Some(path)) => std::fs::read_to_string(path).map_err(|e| {
                anyhow::anyhow!("Failed to read query file {}: {}", path.display(), e)
            })?,
            (None, None) => anyhow::bail!("No query given"),
        };

        let tres: Vec<String> = self
            .tres
            .iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();

        Ok(analysis_types
            .into_iter()
            .map(|analysis_type| {
                let request = AnalysisRequest::new(analysis_type, query.clone(), tres.clone());
                match self.task_name {
                    Some(ref name) => request.with_task_name(name),
                    None => request,
                }
            })
            .collect())
    }

    /// Returns the log level based on verbosity settings.
    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else if self.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }
}
