//! End-to-end execution of one analysis request.
//!
//! Cache lookup, submission, polling, result collection, aggregation and
//! finalization run here under the per-signature guard, so concurrent
//! requests over the same data trigger at most one remote computation.

use crate::analysis::{parse_payload, ResultAggregator, StatisticalAnalyzer};
use crate::cache::{RequestSignature, SufficientStatisticsCache};
use crate::config::Config;
use crate::error::{FederationError, Result};
use crate::models::{
    AggregatedResult, AnalysisOutcome, AnalysisRequest, AnalysisType, OutcomeSource,
    StatisticValue, SufficientStatistics, Task,
};
use crate::polling::{PollPolicy, Sleeper, StatusPoller, TokioSleeper};
use crate::storage::{FsResultStore, HttpResultStore, ResultStore};
use crate::task::{ExecutionService, HttpExecutionService, TaskLifecycleManager};
use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{info, warn};

pub struct AnalysisOrchestrator {
    config: Arc<Config>,
    lifecycle: TaskLifecycleManager,
    poller: StatusPoller,
    store: Arc<dyn ResultStore>,
    cache: Arc<SufficientStatisticsCache>,
    aggregator: ResultAggregator,
    analyzer: StatisticalAnalyzer,
}

impl AnalysisOrchestrator {
    pub fn new(
        config: Arc<Config>,
        service: Arc<dyn ExecutionService>,
        store: Arc<dyn ResultStore>,
        sleeper: Arc<dyn Sleeper>,
        cache: Arc<SufficientStatisticsCache>,
    ) -> Self {
        let poller = StatusPoller::new(
            Arc::clone(&service),
            sleeper,
            PollPolicy::from(&config.polling),
        );
        Self {
            lifecycle: TaskLifecycleManager::new(service, Arc::clone(&config)),
            poller,
            store,
            cache,
            aggregator: ResultAggregator::new(),
            analyzer: StatisticalAnalyzer::new(config.analysis.quantiles.clone()),
            config,
        }
    }

    /// Wire up the HTTP collaborators described by `config`.
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        let token = config.auth.token.clone();
        let service = Arc::new(HttpExecutionService::new(
            &config.service.base_url,
            token.clone(),
        )?);
        let store: Arc<dyn ResultStore> = match &config.storage.local_root {
            Some(root) => Arc::new(FsResultStore::new(root)),
            None => Arc::new(HttpResultStore::new(&config.storage.endpoint, token)?),
        };

        Ok(Self::new(
            Arc::new(config),
            service,
            store,
            Arc::new(TokioSleeper),
            Arc::new(SufficientStatisticsCache::new()),
        ))
    }

    pub fn lifecycle(&self) -> &TaskLifecycleManager {
        &self.lifecycle
    }

    pub fn cache(&self) -> &Arc<SufficientStatisticsCache> {
        &self.cache
    }

    /// Answer `request` from the cache, or by submitting a new task.
    pub async fn run(&self, request: &AnalysisRequest) -> Result<AnalysisOutcome> {
        self.execute(request, None).await
    }

    /// Collect and analyse the results of an already submitted task.
    pub async fn collect(&self, request: &AnalysisRequest, task_id: u64) -> Result<AnalysisOutcome> {
        self.execute(request, Some(task_id)).await
    }

    /// Run several analyses over the same data in order, sharing this
    /// orchestrator's cache. With `existing_task`, the first request collects
    /// that task and later ones are answered from its aggregate when they can.
    pub async fn run_batch(
        &self,
        requests: &[AnalysisRequest],
        existing_task: Option<u64>,
    ) -> Result<Vec<AnalysisOutcome>> {
        let mut outcomes = Vec::with_capacity(requests.len());
        for (i, request) in requests.iter().enumerate() {
            let outcome = match existing_task {
                Some(task_id) if i == 0 => self.collect(request, task_id).await?,
                _ => self.run(request).await?,
            };
            info!(
                "{} of {}: {} ({})",
                i + 1,
                requests.len(),
                request.analysis_type,
                outcome.source
            );
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    async fn execute(
        &self,
        request: &AnalysisRequest,
        existing_task: Option<u64>,
    ) -> Result<AnalysisOutcome> {
        request.validate()?;
        let analysis_type = request.analysis_type;
        let signature = RequestSignature::for_request(request);

        let _guard = self.cache.lock(&signature).await;

        if existing_task.is_none() {
            if let Some(hit) = self.cache.lookup(analysis_type, &signature) {
                let value = self.analyzer.finalize(analysis_type, &hit.result)?;
                return Ok(self.outcome(
                    request,
                    &hit.result,
                    value,
                    OutcomeSource::Cached {
                        computed_for: hit.computed_for,
                        derived: hit.derived,
                    },
                ));
            }
        }

        let task = match existing_task {
            Some(task_id) => {
                info!("Attaching to existing task {}", task_id);
                TaskLifecycleManager::attach(task_id, &request.tre_list)?
            }
            None => self.lifecycle.submit(request).await?,
        };

        let status = self.poller.wait_for_terminal(&task).await?;
        if !status.has_results() {
            warn!("Task {} ended {}; nothing to aggregate", task.task_id, status);
            return Err(FederationError::TaskTerminated {
                task_id: task.task_id,
                status: status.to_string(),
            });
        }

        let stats = self.fetch_statistics(&task, analysis_type).await?;
        let aggregated = Arc::new(
            self.aggregator
                .aggregate_for_task(&task, status, analysis_type, stats)?,
        );
        self.cache.store(signature, Arc::clone(&aggregated));

        let value = self.analyzer.finalize(analysis_type, &aggregated)?;
        Ok(self.outcome(
            request,
            &aggregated,
            value,
            OutcomeSource::Computed {
                task_id: task.task_id,
            },
        ))
    }

    /// Fetch and parse every subtask's result concurrently. Subtasks with no
    /// stored object are skipped and show up as missing TREs.
    async fn fetch_statistics(
        &self,
        task: &Task,
        analysis_type: AnalysisType,
    ) -> Result<Vec<SufficientStatistics>> {
        let bucket = self.config.storage.bucket.as_str();
        let object = self.config.storage.result_object.as_str();

        let fetches = task.subtasks.iter().map(|subtask| async move {
            let path = task.result_path(subtask, object);
            let raw = self
                .store
                .fetch(bucket, &path)
                .await
                .map_err(|e| FederationError::ResultFetch {
                    path: path.clone(),
                    message: format!("{:#}", e),
                })?;

            match raw {
                Some(raw) => parse_payload(subtask, analysis_type, &raw).map(Some),
                None => {
                    warn!(
                        "No result from {} (subtask {}) at {}/{}",
                        subtask.tre_name, subtask.subtask_id, bucket, path
                    );
                    Ok(None)
                }
            }
        });

        join_all(fetches)
            .await
            .into_iter()
            .filter_map(Result::transpose)
            .collect()
    }

    fn outcome(
        &self,
        request: &AnalysisRequest,
        result: &AggregatedResult,
        value: StatisticValue,
        source: OutcomeSource,
    ) -> AnalysisOutcome {
        AnalysisOutcome {
            analysis_type: request.analysis_type,
            value,
            source,
            tres_used: result
                .contributors
                .iter()
                .map(|c| c.tre_name.clone())
                .collect(),
            missing_tres: result.missing_tres.clone(),
            completeness: result.completeness,
            user_query: request.user_query.clone(),
            completed_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Completeness;
    use crate::task::SubmissionMessage;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Hands out task ids from 179 upwards and reports one fixed status code.
    struct FakeService {
        next_id: AtomicU64,
        submissions: AtomicUsize,
        status_code: i64,
    }

    impl FakeService {
        fn new(status_code: i64) -> Arc<Self> {
            Arc::new(Self {
                next_id: AtomicU64::new(179),
                submissions: AtomicUsize::new(0),
                status_code,
            })
        }

        fn submissions(&self) -> usize {
            self.submissions.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ExecutionService for FakeService {
        async fn submit(&self, _message: &SubmissionMessage) -> anyhow::Result<Value> {
            self.submissions.fetch_add(1, Ordering::SeqCst);
            let id = self.next_id.fetch_add(10, Ordering::SeqCst);
            Ok(serde_json::json!({ "id": id }))
        }

        async fn status(&self, _task_id: u64) -> anyhow::Result<i64> {
            Ok(self.status_code)
        }
    }

    #[derive(Default)]
    struct MemoryStore {
        objects: Mutex<HashMap<String, String>>,
    }

    impl MemoryStore {
        fn put(&self, path: &str, body: &str) {
            self.objects
                .lock()
                .unwrap()
                .insert(path.to_string(), body.to_string());
        }
    }

    #[async_trait]
    impl ResultStore for MemoryStore {
        async fn fetch(&self, _bucket: &str, path: &str) -> anyhow::Result<Option<String>> {
            Ok(self.objects.lock().unwrap().get(path).cloned())
        }
    }

    struct NoSleep;

    #[async_trait]
    impl Sleeper for NoSleep {
        async fn sleep(&self, _duration: Duration) {}
    }

    fn tres() -> Vec<String> {
        vec!["Nottingham".to_string(), "Nottingham 2".to_string()]
    }

    const QUERY: &str = "SELECT value_as_number FROM measurement WHERE measurement_concept_id = 3037532";

    fn orchestrator(
        service: Arc<FakeService>,
        store: Arc<MemoryStore>,
        config: Config,
    ) -> AnalysisOrchestrator {
        AnalysisOrchestrator::new(
            Arc::new(config),
            service,
            store,
            Arc::new(NoSleep),
            Arc::new(SufficientStatisticsCache::new()),
        )
    }

    #[tokio::test]
    async fn test_mean_end_to_end() {
        let service = FakeService::new(11);
        let store = Arc::new(MemoryStore::default());
        store.put("179/180/output.json", r#"{"n": 50, "total": 750}"#);
        store.put("179/181/output.json", r#"{"n": 50, "total": 750}"#);
        let orch = orchestrator(service.clone(), store, Config::default());

        let request = AnalysisRequest::new(AnalysisType::Mean, QUERY, tres());
        let outcome = orch.run(&request).await.unwrap();

        assert_eq!(outcome.value.as_scalar(), Some(15.0));
        assert_eq!(outcome.source, OutcomeSource::Computed { task_id: 179 });
        assert_eq!(outcome.completeness, Completeness::Complete);
        assert_eq!(outcome.tres_used, tres());
        assert!(outcome.partial_warning().is_none());
        assert_eq!(service.submissions(), 1);
        assert_eq!(orch.cache().len(), 1);
    }

    #[tokio::test]
    async fn test_mean_served_from_cached_variance() {
        let service = FakeService::new(11);
        let store = Arc::new(MemoryStore::default());
        store.put("179/180/output.json", r#"{"n": 2, "total": 4, "sum_x2": 10}"#);
        store.put("179/181/output.json", r#"{"n": 2, "total": 6, "sum_x2": 20}"#);
        let orch = orchestrator(service.clone(), store, Config::default());

        let variance = orch
            .run(&AnalysisRequest::new(AnalysisType::Variance, QUERY, tres()))
            .await
            .unwrap();
        assert!((variance.value.as_scalar().unwrap() - 1.25).abs() < 1e-12);

        let mut reordered = tres();
        reordered.reverse();
        let mean = orch
            .run(&AnalysisRequest::new(AnalysisType::Mean, format!("{};", QUERY), reordered))
            .await
            .unwrap();

        assert_eq!(mean.value.as_scalar(), Some(2.5));
        assert_eq!(
            mean.source,
            OutcomeSource::Cached {
                computed_for: AnalysisType::Variance,
                derived: true
            }
        );
        assert_eq!(service.submissions(), 1);
    }

    #[tokio::test]
    async fn test_partial_result() {
        let service = FakeService::new(49);
        let store = Arc::new(MemoryStore::default());
        store.put("179/180/output.json", r#"{"n": 50, "total": 750}"#);
        let orch = orchestrator(service, store, Config::default());

        let outcome = orch
            .run(&AnalysisRequest::new(AnalysisType::Mean, QUERY, tres()))
            .await
            .unwrap();

        assert_eq!(outcome.completeness, Completeness::Partial);
        assert_eq!(outcome.value.as_scalar(), Some(15.0));
        assert_eq!(outcome.tres_used, vec!["Nottingham".to_string()]);
        assert_eq!(outcome.missing_tres, vec!["Nottingham 2".to_string()]);
        assert!(outcome.partial_warning().unwrap().contains("Nottingham 2"));
    }

    #[tokio::test]
    async fn test_cancelled_task_is_not_cached() {
        let service = FakeService::new(16);
        let orch = orchestrator(service, Arc::new(MemoryStore::default()), Config::default());

        let err = orch
            .run(&AnalysisRequest::new(AnalysisType::Mean, QUERY, tres()))
            .await
            .unwrap_err();
        assert!(matches!(err, FederationError::TaskTerminated { task_id: 179, .. }));
        assert!(orch.cache().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_is_not_cached() {
        let service = FakeService::new(0);
        let mut config = Config::default();
        config.polling.max_attempts = Some(3);
        let orch = orchestrator(service, Arc::new(MemoryStore::default()), config);

        let err = orch
            .run(&AnalysisRequest::new(AnalysisType::Mean, QUERY, tres()))
            .await
            .unwrap_err();
        assert!(matches!(err, FederationError::PollingTimeout { attempts: 3, .. }));
        assert!(err.is_remote());
        assert!(orch.cache().is_empty());
    }

    #[tokio::test]
    async fn test_no_results_at_all_fails() {
        let service = FakeService::new(11);
        let orch = orchestrator(service, Arc::new(MemoryStore::default()), Config::default());

        let err = orch
            .run(&AnalysisRequest::new(AnalysisType::Mean, QUERY, tres()))
            .await
            .unwrap_err();
        assert!(matches!(err, FederationError::Aggregation(_)));
    }

    #[tokio::test]
    async fn test_invalid_payload_fails() {
        let service = FakeService::new(11);
        let store = Arc::new(MemoryStore::default());
        store.put("179/180/output.json", r#"{"n": 50, "total": 750}"#);
        store.put("179/181/output.json", "<html>Access Denied</html>");
        let orch = orchestrator(service, store, Config::default());

        let err = orch
            .run(&AnalysisRequest::new(AnalysisType::Mean, QUERY, tres()))
            .await
            .unwrap_err();
        assert!(matches!(err, FederationError::InvalidPayload { ref tre, .. } if tre == "Nottingham 2"));
    }

    #[tokio::test]
    async fn test_collect_existing_task() {
        let service = FakeService::new(11);
        let store = Arc::new(MemoryStore::default());
        store.put("42/43/output.json", r#"[{"gender": "F", "n": 3}, {"gender": "M", "n": 0}]"#);
        store.put("42/44/output.json", r#"[{"gender": "F", "n": 1}]"#);
        let orch = orchestrator(service.clone(), store, Config::default());

        let request = AnalysisRequest::new(AnalysisType::ContingencyTable, "SELECT gender FROM person", tres());
        let outcome = orch.collect(&request, 42).await.unwrap();

        assert_eq!(service.submissions(), 0);
        assert_eq!(outcome.source, OutcomeSource::Computed { task_id: 42 });
        match outcome.value {
            StatisticValue::Table { table } => {
                assert_eq!(table.total(), 4);
                assert_eq!(table.counts.len(), 2);
            }
            other => panic!("unexpected value {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_batch_reuses_first_aggregate() {
        let service = FakeService::new(11);
        let store = Arc::new(MemoryStore::default());
        store.put("179/180/output.json", r#"{"n": 2, "total": 4, "sum_x2": 10}"#);
        store.put("179/181/output.json", r#"{"n": 2, "total": 6, "sum_x2": 20}"#);
        let orch = orchestrator(service.clone(), store, Config::default());

        let requests: Vec<AnalysisRequest> = [AnalysisType::Variance, AnalysisType::Mean, AnalysisType::Variance]
            .into_iter()
            .map(|t| AnalysisRequest::new(t, QUERY, tres()))
            .collect();
        let outcomes = orch.run_batch(&requests, None).await.unwrap();

        assert_eq!(service.submissions(), 1);
        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes[0].source, OutcomeSource::Computed { task_id: 179 });
        assert_eq!(outcomes[1].value.as_scalar(), Some(2.5));
        assert_eq!(
            outcomes[1].source,
            OutcomeSource::Cached {
                computed_for: AnalysisType::Variance,
                derived: true
            }
        );
        assert_eq!(
            outcomes[2].source,
            OutcomeSource::Cached {
                computed_for: AnalysisType::Variance,
                derived: false
            }
        );
        assert_eq!(
            orch.cache().runnable_analyses(&RequestSignature::for_request(&requests[0])),
            vec![AnalysisType::Mean, AnalysisType::Variance]
        );
    }

    #[tokio::test]
    async fn test_batch_on_existing_task() {
        let service = FakeService::new(11);
        let store = Arc::new(MemoryStore::default());
        store.put("42/43/output.json", r#"{"n": 2, "total": 4, "sum_x2": 10}"#);
        store.put("42/44/output.json", r#"{"n": 2, "total": 6, "sum_x2": 20}"#);
        let orch = orchestrator(service.clone(), store, Config::default());

        let requests = vec![
            AnalysisRequest::new(AnalysisType::Variance, QUERY, tres()),
            AnalysisRequest::new(AnalysisType::Mean, QUERY, tres()),
        ];
        let outcomes = orch.run_batch(&requests, Some(42)).await.unwrap();

        assert_eq!(service.submissions(), 0);
        assert_eq!(outcomes[0].source, OutcomeSource::Computed { task_id: 42 });
        assert!(matches!(outcomes[1].source, OutcomeSource::Cached { derived: true, .. }));
    }

    #[tokio::test]
    async fn test_batch_stops_at_first_failure() {
        let service = FakeService::new(16);
        let orch = orchestrator(service.clone(), Arc::new(MemoryStore::default()), Config::default());

        let requests = vec![
            AnalysisRequest::new(AnalysisType::Variance, QUERY, tres()),
            AnalysisRequest::new(AnalysisType::Mean, QUERY, tres()),
        ];
        let err = orch.run_batch(&requests, None).await.unwrap_err();
        assert!(matches!(err, FederationError::TaskTerminated { .. }));
        assert_eq!(service.submissions(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_requests_submit_once() {
        let service = FakeService::new(11);
        let store = Arc::new(MemoryStore::default());
        store.put("179/180/output.json", r#"{"n": 1, "total": 2, "sum_x2": 4}"#);
        store.put("179/181/output.json", r#"{"n": 1, "total": 4, "sum_x2": 16}"#);
        let orch = orchestrator(service.clone(), store, Config::default());

        let variance = AnalysisRequest::new(AnalysisType::Variance, QUERY, tres());
        let mean = AnalysisRequest::new(AnalysisType::Mean, QUERY, tres());
        let (a, b) = tokio::join!(orch.run(&variance), orch.run(&mean));

        assert!(a.is_ok());
        assert_eq!(b.unwrap().value.as_scalar(), Some(3.0));
        assert_eq!(service.submissions(), 1);
    }
}
