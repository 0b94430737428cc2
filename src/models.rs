//! Data models for federated analyses.
//!
//! This module contains the request, task and statistics types shared by
//! the lifecycle manager, poller, aggregator, cache and analyzer.

use crate::analysis::table::ContingencyTable;
use crate::analysis::tdigest::TDigest;
use crate::error::{FederationError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// The closed set of analyses the coordinator can finalize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AnalysisType {
    #[serde(rename = "mean")]
    Mean,
    #[serde(rename = "variance")]
    Variance,
    #[serde(rename = "PMCC")]
    Pmcc,
    #[serde(rename = "contingency_table")]
    ContingencyTable,
    #[serde(rename = "percentile_sketch")]
    PercentileSketch,
    #[serde(rename = "chi_squared")]
    ChiSquared,
}

impl AnalysisType {
    pub const ALL: [AnalysisType; 6] = [
        AnalysisType::Mean,
        AnalysisType::Variance,
        AnalysisType::Pmcc,
        AnalysisType::ContingencyTable,
        AnalysisType::PercentileSketch,
        AnalysisType::ChiSquared,
    ];

    /// Identifier understood by the per-TRE processing container.
    pub fn identifier(&self) -> &'static str {
        match self {
            AnalysisType::Mean => "mean",
            AnalysisType::Variance => "variance",
            AnalysisType::Pmcc => "PMCC",
            AnalysisType::ContingencyTable => "contingency_table",
            AnalysisType::PercentileSketch => "percentile_sketch",
            // the TREs only ever build the table; the test runs here
            AnalysisType::ChiSquared => "contingency_table",
        }
    }
}

impl fmt::Display for AnalysisType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnalysisType::Mean => write!(f, "mean"),
            AnalysisType::Variance => write!(f, "variance"),
            AnalysisType::Pmcc => write!(f, "PMCC"),
            AnalysisType::ContingencyTable => write!(f, "contingency_table"),
            AnalysisType::PercentileSketch => write!(f, "percentile_sketch"),
            AnalysisType::ChiSquared => write!(f, "chi_squared"),
        }
    }
}

impl FromStr for AnalysisType {
    type Err = FederationError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "mean" => Ok(AnalysisType::Mean),
            "variance" => Ok(AnalysisType::Variance),
            "pmcc" | "correlation" => Ok(AnalysisType::Pmcc),
            "contingency_table" | "contingency" => Ok(AnalysisType::ContingencyTable),
            "percentile_sketch" | "percentiles" => Ok(AnalysisType::PercentileSketch),
            "chi_squared" | "chi_squared_manual" => Ok(AnalysisType::ChiSquared),
            _ => Err(FederationError::UnsupportedAnalysisType(s.to_string())),
        }
    }
}

/// A request to run one analysis over one query on a set of TREs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub analysis_type: AnalysisType,
    /// Data-selection SQL supplied by the user (no aggregation in it).
    pub user_query: String,
    pub task_name: String,
    /// Ordered list of TRE names; order fixes the subtask ids.
    pub tre_list: Vec<String>,
}

impl AnalysisRequest {
    pub fn new(
        analysis_type: AnalysisType,
        user_query: impl Into<String>,
        tre_list: Vec<String>,
    ) -> Self {
        Self {
            analysis_type,
            user_query: user_query.into(),
            task_name: format!("analysis {}", analysis_type),
            tre_list,
        }
    }

    pub fn with_task_name(mut self, name: impl Into<String>) -> Self {
        self.task_name = name.into();
        self
    }

    /// Check the TRE list is non-empty with unique, non-blank names.
    pub fn validate(&self) -> Result<()> {
        if self.tre_list.is_empty() {
            return Err(FederationError::InvalidRequest(
                "TRE list is empty".to_string(),
            ));
        }
        let mut seen = BTreeSet::new();
        for tre in &self.tre_list {
            if tre.trim().is_empty() {
                return Err(FederationError::InvalidRequest(
                    "TRE names must not be blank".to_string(),
                ));
            }
            if !seen.insert(tre.as_str()) {
                return Err(FederationError::InvalidRequest(format!(
                    "TRE '{}' is listed more than once",
                    tre
                )));
            }
        }
        if self.user_query.trim().is_empty() {
            return Err(FederationError::InvalidRequest(
                "user query is empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// One per-TRE unit of remote execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subtask {
    pub subtask_id: u64,
    pub tre_name: String,
}

/// A submitted task and its derived subtasks, in TRE order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: u64,
    pub subtasks: Vec<Subtask>,
}

impl Task {
    /// Storage path of a subtask's result: `{task_id}/{subtask_id}/{object}`.
    pub fn result_path(&self, subtask: &Subtask, object: &str) -> String {
        format!("{}/{}/{}", self.task_id, subtask.subtask_id, object)
    }
}

/// Status codes reported by the execution service for a parent task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    Waiting,
    Complete,
    Cancelled,
    Failed,
    Partial,
}

impl TaskStatus {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(TaskStatus::Waiting),
            11 => Some(TaskStatus::Complete),
            16 => Some(TaskStatus::Cancelled),
            27 => Some(TaskStatus::Failed),
            49 => Some(TaskStatus::Partial),
            _ => None,
        }
    }

    pub fn code(&self) -> i64 {
        match self {
            TaskStatus::Waiting => 0,
            TaskStatus::Complete => 11,
            TaskStatus::Cancelled => 16,
            TaskStatus::Failed => 27,
            TaskStatus::Partial => 49,
        }
    }

    /// Display text used by the execution service for this code.
    pub fn description(&self) -> &'static str {
        match self {
            TaskStatus::Waiting => "Waiting for Child Submissions To Complete",
            TaskStatus::Complete => "Completed",
            TaskStatus::Cancelled => "Cancelled",
            TaskStatus::Failed => "Failed",
            TaskStatus::Partial => "Complete but not all TREs returned a result",
        }
    }

    pub fn terminal(&self) -> Option<TerminalStatus> {
        match self {
            TaskStatus::Waiting => None,
            TaskStatus::Complete => Some(TerminalStatus::Complete),
            TaskStatus::Cancelled => Some(TerminalStatus::Cancelled),
            TaskStatus::Failed => Some(TerminalStatus::Failed),
            TaskStatus::Partial => Some(TerminalStatus::Partial),
        }
    }
}

/// The state a poll loop ends in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TerminalStatus {
    Complete,
    Cancelled,
    Failed,
    Partial,
}

impl TerminalStatus {
    /// Whether results should be collected for this outcome.
    pub fn has_results(&self) -> bool {
        matches!(self, TerminalStatus::Complete | TerminalStatus::Partial)
    }
}

impl fmt::Display for TerminalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminalStatus::Complete => write!(f, "COMPLETE"),
            TerminalStatus::Cancelled => write!(f, "CANCELLED"),
            TerminalStatus::Failed => write!(f, "FAILED"),
            TerminalStatus::Partial => write!(f, "PARTIAL"),
        }
    }
}

/// One named sufficient-statistic value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    Scalar(f64),
    Table(ContingencyTable),
    Digest(TDigest),
}

impl Component {
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            Component::Scalar(v) => Some(*v),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Component::Scalar(_) => "scalar",
            Component::Table(_) => "table",
            Component::Digest(_) => "digest",
        }
    }
}

/// Sufficient statistics reported by one subtask. Never mutated once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SufficientStatistics {
    pub subtask_id: u64,
    pub tre_name: String,
    pub analysis_type: AnalysisType,
    pub components: BTreeMap<String, Component>,
}

/// Whether every TRE of the task contributed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Completeness {
    Complete,
    Partial,
}

/// A TRE whose statistics went into an aggregate.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Contributor {
    pub subtask_id: u64,
    pub tre_name: String,
}

/// Merged statistics for one request. Read-only after aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedResult {
    /// Analysis whose remote computation produced these components.
    pub analysis_type: AnalysisType,
    pub components: BTreeMap<String, Component>,
    /// Contributing subtasks, ordered by subtask id.
    pub contributors: Vec<Contributor>,
    /// TREs of the task that did not report.
    #[serde(default)]
    pub missing_tres: Vec<String>,
    pub completeness: Completeness,
}

impl AggregatedResult {
    pub fn is_partial(&self) -> bool {
        self.completeness == Completeness::Partial
    }

    #[cfg(test)]
    pub fn scalar(&self, name: &str) -> Option<f64> {
        self.components.get(name).and_then(Component::as_scalar)
    }
}

/// A finalized statistic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StatisticValue {
    Scalar {
        value: f64,
    },
    Table {
        table: ContingencyTable,
    },
    Percentiles {
        quantiles: Vec<(f64, f64)>,
        count: f64,
        digest: TDigest,
    },
    ChiSquared {
        statistic: f64,
        degrees_of_freedom: u64,
        expected: Vec<Vec<f64>>,
        row_labels: Vec<String>,
        col_labels: Vec<String>,
    },
}

impl StatisticValue {
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            StatisticValue::Scalar { value } => Some(*value),
            StatisticValue::ChiSquared { statistic, .. } => Some(*statistic),
            _ => None,
        }
    }
}

/// Where the aggregate behind an outcome came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum OutcomeSource {
    /// Freshly submitted and aggregated.
    Computed { task_id: u64 },
    /// Served from the cache; `derived` when a different analysis produced it.
    Cached {
        computed_for: AnalysisType,
        derived: bool,
    },
}

impl fmt::Display for OutcomeSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutcomeSource::Computed { task_id } => write!(f, "task {}", task_id),
            OutcomeSource::Cached {
                computed_for,
                derived: true,
            } => write!(f, "cache, derived from {} aggregate", computed_for),
            OutcomeSource::Cached { computed_for, .. } => {
                write!(f, "cache, {} aggregate", computed_for)
            }
        }
    }
}

/// What a caller gets back for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisOutcome {
    pub analysis_type: AnalysisType,
    pub value: StatisticValue,
    pub source: OutcomeSource,
    pub tres_used: Vec<String>,
    pub missing_tres: Vec<String>,
    pub completeness: Completeness,
    pub user_query: String,
    pub completed_at: DateTime<Utc>,
}

impl AnalysisOutcome {
    /// Human-readable warning for a partial result, if any.
    pub fn partial_warning(&self) -> Option<String> {
        if self.completeness != Completeness::Partial {
            return None;
        }
        Some(format!(
            "partial result: {} of {} TREs reported; missing: {}",
            self.tres_used.len(),
            self.tres_used.len() + self.missing_tres.len(),
            if self.missing_tres.is_empty() {
                "unknown".to_string()
            } else {
                self.missing_tres.join(", ")
            }
        ))
    }
}
