//! Error taxonomy for the coordination core.
//!
//! Every failure a caller can observe from submission through finalization
//! is one variant of [`FederationError`]. Partial results are not errors;
//! they travel on the outcome with an explicit completeness flag.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias used across the core modules.
pub type Result<T> = std::result::Result<T, FederationError>;

/// Typed failures surfaced to the caller. Nothing here is retried internally.
#[derive(Debug, Error)]
pub enum FederationError {
    /// The request itself is unusable (empty TRE list, duplicate TRE, empty query).
    #[error("invalid analysis request: {0}")]
    InvalidRequest(String),

    /// The execution service rejected the submission or returned no task id.
    #[error("task submission failed: {0}")]
    Submission(String),

    /// The execution service answered with a status code outside the defined set.
    #[error("unknown task status {code} for task {task_id}")]
    UnknownStatus { task_id: u64, code: i64 },

    /// The status endpoint could not be queried.
    #[error("failed to query status of task {task_id}: {message}")]
    StatusQuery { task_id: u64, message: String },

    /// No terminal state was reached within the polling budget.
    #[error("task {task_id} did not reach a terminal state after {attempts} polls ({waited:?} waited)")]
    PollingTimeout {
        task_id: u64,
        attempts: u32,
        waited: Duration,
    },

    /// The task ended cancelled or failed; nothing was aggregated.
    #[error("task {task_id} ended with status {status}")]
    TaskTerminated { task_id: u64, status: String },

    /// A per-TRE result could not be read from storage.
    #[error("failed to fetch result {path}: {message}")]
    ResultFetch { path: String, message: String },

    /// A per-TRE result was present but not a valid payload for the analysis.
    #[error("invalid result payload from {tre}: {message}")]
    InvalidPayload { tre: String, message: String },

    /// Nothing usable to merge, or the inputs cannot be merged together.
    #[error("aggregation failed: {0}")]
    Aggregation(String),

    /// The analysis identifier is not one of the known variants.
    #[error("unsupported analysis type: {0}")]
    UnsupportedAnalysisType(String),

    /// The aggregated data lacks a component the analysis needs.
    #[error("{analysis} requires component(s) {missing:?} which were never computed for this data")]
    MissingComponent {
        analysis: String,
        missing: Vec<String>,
    },

    /// The components are present but the statistic is undefined for them.
    #[error("{analysis} is undefined for the aggregated data: {reason}")]
    DegenerateStatistic { analysis: String, reason: String },
}

impl FederationError {
    /// True for failures that leave the remote task in an unknown state, where
    /// resubmitting might duplicate work.
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            FederationError::Submission(_)
                | FederationError::StatusQuery { .. }
                | FederationError::UnknownStatus { .. }
                | FederationError::PollingTimeout { .. }
                | FederationError::ResultFetch { .. }
        )
    }
}
