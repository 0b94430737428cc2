//! Status polling until a task reaches a terminal state.

use crate::config::PollingConfig;
use crate::error::{FederationError, Result};
use crate::models::{Task, TaskStatus, TerminalStatus};
use crate::task::ExecutionService;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Suspends the caller between polls. Swapped out in tests so no real time passes.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Sleeps on the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// How often to poll and when to give up.
#[derive(Debug, Clone, PartialEq)]
pub struct PollPolicy {
    pub interval: Duration,
    /// Interval multiplier after each waiting poll; 1.0 keeps it fixed.
    pub backoff_factor: f64,
    pub max_interval: Duration,
    pub max_attempts: Option<u32>,
    pub max_wait: Option<Duration>,
}

impl From<&PollingConfig> for PollPolicy {
    fn from(config: &PollingConfig) -> Self {
        Self {
            interval: Duration::from_secs(config.interval_seconds),
            backoff_factor: config.backoff_factor.max(1.0),
            max_interval: Duration::from_secs(config.max_interval_seconds.max(config.interval_seconds)),
            max_attempts: config.max_attempts,
            max_wait: config.max_wait_seconds.map(Duration::from_secs),
        }
    }
}

impl PollPolicy {
    fn next_interval(&self, current: Duration) -> Duration {
        current.mul_f64(self.backoff_factor).min(self.max_interval)
    }
}

/// Polls the execution service for a task's status.
pub struct StatusPoller {
    service: Arc<dyn ExecutionService>,
    sleeper: Arc<dyn Sleeper>,
    policy: PollPolicy,
}

impl StatusPoller {
    pub fn new(
        service: Arc<dyn ExecutionService>,
        sleeper: Arc<dyn Sleeper>,
        policy: PollPolicy,
    ) -> Self {
        Self {
            service,
            sleeper,
            policy,
        }
    }

    /// Query the current status once.
    pub async fn status(&self, task_id: u64) -> Result<TaskStatus> {
        let code = self
            .service
            .status(task_id)
            .await
            .map_err(|e| FederationError::StatusQuery {
                task_id,
                message: format!("{:#}", e),
            })?;
        TaskStatus::from_code(code).ok_or(FederationError::UnknownStatus { task_id, code })
    }

    /// Poll until the task reports COMPLETE, PARTIAL, CANCELLED or FAILED.
    ///
    /// Returns on the first terminal code. Waiting time is the sum of the
    /// intervals slept, so the budget holds under a fake sleeper too.
    pub async fn wait_for_terminal(&self, task: &Task) -> Result<TerminalStatus> {
        let mut attempts: u32 = 0;
        let mut waited = Duration::ZERO;
        let mut interval = self.policy.interval;

        loop {
            let status = self.status(task.task_id).await?;
            attempts += 1;
            debug!(
                "Task {} poll {}: {} ({})",
                task.task_id,
                attempts,
                status.code(),
                status.description()
            );

            if let Some(terminal) = status.terminal() {
                info!(
                    "Task {} reached {} after {} poll(s)",
                    task.task_id, terminal, attempts
                );
                return Ok(terminal);
            }

            let out_of_attempts = self.policy.max_attempts.is_some_and(|max| attempts >= max);
            let out_of_time = self
                .policy
                .max_wait
                .is_some_and(|max| waited + interval > max);
            if out_of_attempts || out_of_time {
                return Err(FederationError::PollingTimeout {
                    task_id: task.task_id,
                    attempts,
                    waited,
                });
            }

            self.sleeper.sleep(interval).await;
            waited += interval;
            interval = self.policy.next_interval(interval);
        }
    }
}
