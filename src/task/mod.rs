//! Task submission and subtask bookkeeping.
//!
//! A request becomes one TES task fanned out by the submission layer to one
//! subtask per TRE. The layer assigns subtask ids `task_id + 1 + i` in TRE
//! order; results live under `{task_id}/{subtask_id}/` in the output bucket.

pub mod client;

pub use client::HttpExecutionService;

use crate::config::Config;
use crate::error::{FederationError, Result};
use crate::models::{AnalysisRequest, Subtask, Task};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// The remote service that accepts tasks and reports their status.
#[async_trait]
pub trait ExecutionService: Send + Sync {
    /// Submit a task; the response carries the assigned `id`.
    async fn submit(&self, message: &SubmissionMessage) -> anyhow::Result<Value>;

    /// Raw status code of a task.
    async fn status(&self, task_id: u64) -> anyhow::Result<i64>;
}

/// TES task message with the 5-Safes tags the submission layer expects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionMessage {
    pub id: Option<String>,
    pub name: String,
    pub description: String,
    pub inputs: Option<Vec<Value>>,
    pub outputs: Vec<TaskOutput>,
    pub resources: Option<Value>,
    pub executors: Vec<Executor>,
    pub volumes: Option<Vec<String>>,
    /// `Project` and the `|`-joined `tres` list.
    pub tags: BTreeMap<String, String>,
    pub logs: Option<Value>,
    pub creation_time: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub name: String,
    pub description: String,
    pub url: String,
    pub path: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Executor {
    pub image: String,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub workdir: String,
}

impl SubmissionMessage {
    /// TRE names in submission order, as carried in the `tres` tag.
    pub fn tres(&self) -> Vec<String> {
        self.tags
            .get("tres")
            .map(|t| t.split('|').map(str::to_string).collect())
            .unwrap_or_default()
    }
}

/// Creates tasks on the execution service and derives their subtasks.
pub struct TaskLifecycleManager {
    service: Arc<dyn ExecutionService>,
    config: Arc<Config>,
}

impl TaskLifecycleManager {
    pub fn new(service: Arc<dyn ExecutionService>, config: Arc<Config>) -> Self {
        Self { service, config }
    }

    /// Build the submission message for `request` without sending it.
    pub fn build_message(&self, request: &AnalysisRequest) -> SubmissionMessage {
        let service = &self.config.service;
        let db = &self.config.database;
        let output_path = service.output_path.trim_end_matches('/');

        let command = vec![
            format!("--user-query={}", request.user_query.trim()),
            format!("--analysis={}", request.analysis_type.identifier()),
            format!("--db-connection={}", db.connection_string()),
            format!("--output-filename={}/output", output_path),
            format!("--output-format={}", service.output_format),
        ];

        let env = BTreeMap::from([
            ("DATASOURCE_DB_DATABASE".to_string(), db.name.clone()),
            ("DATASOURCE_DB_HOST".to_string(), db.host.clone()),
            ("DATASOURCE_DB_PASSWORD".to_string(), db.password.clone()),
            ("DATASOURCE_DB_USERNAME".to_string(), db.username.clone()),
        ]);

        let tags = BTreeMap::from([
            ("Project".to_string(), service.project.clone()),
            ("tres".to_string(), request.tre_list.join("|")),
        ]);

        SubmissionMessage {
            id: None,
            name: request.task_name.clone(),
            description: format!(
                "{} over {} TRE(s)",
                request.analysis_type,
                request.tre_list.len()
            ),
            inputs: None,
            outputs: vec![TaskOutput {
                name: "workdir".to_string(),
                description: "analysis output".to_string(),
                url: format!("s3://{}", self.config.storage.bucket),
                path: output_path.to_string(),
                kind: "DIRECTORY".to_string(),
            }],
            resources: None,
            executors: vec![Executor {
                image: service.docker_image.clone(),
                command,
                env,
                workdir: "/app".to_string(),
            }],
            volumes: None,
            tags,
            logs: None,
            creation_time: None,
        }
    }

    /// Submit `request` and return the task with its derived subtasks.
    pub async fn submit(&self, request: &AnalysisRequest) -> Result<Task> {
        request.validate()?;
        let message = self.build_message(request);
        debug!(
            "Submitting '{}' for TREs [{}]",
            message.name,
            request.tre_list.join(", ")
        );

        let response = self
            .service
            .submit(&message)
            .await
            .map_err(|e| FederationError::Submission(format!("{:#}", e)))?;

        let task_id = parse_task_id(&response).ok_or_else(|| {
            FederationError::Submission(format!("response carries no usable task id: {}", response))
        })?;

        let task = Self::attach(task_id, &request.tre_list)?;
        info!(
            "Submitted task {} with {} subtask(s)",
            task.task_id,
            task.subtasks.len()
        );
        Ok(task)
    }

    /// Rebuild the task for an id that was already submitted.
    pub fn attach(task_id: u64, tre_list: &[String]) -> Result<Task> {
        Ok(Task {
            task_id,
            subtasks: Self::derive_subtasks(task_id, tre_list)?,
        })
    }

    /// Subtask `i` gets id `task_id + 1 + i`.
    pub fn derive_subtasks(task_id: u64, tre_list: &[String]) -> Result<Vec<Subtask>> {
        tre_list
            .iter()
            .enumerate()
            .map(|(i, tre)| {
                let subtask_id = (i as u64)
                    .checked_add(1)
                    .and_then(|offset| task_id.checked_add(offset))
                    .ok_or_else(|| {
                        FederationError::Submission(format!(
                            "task id {} leaves no room for {} subtasks",
                            task_id,
                            tre_list.len()
                        ))
                    })?;
                Ok(Subtask {
                    subtask_id,
                    tre_name: tre.clone(),
                })
            })
            .collect()
    }
}

/// The service answers with `{"id": 179}` or `{"id": "179"}`.
fn parse_task_id(response: &Value) -> Option<u64> {
    match response.get("id")? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
