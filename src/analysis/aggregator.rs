//! Merging of per-TRE sufficient statistics.
//!
//! This module combines the statistics reported by each subtask into one
//! [`AggregatedResult`]. Every merge law is commutative and associative;
//! inputs are additionally put in subtask-id order first, so floating-point
//! sums come out bit-identical whatever order the TREs reported in.

use crate::analysis::table::ContingencyTable;
use crate::analysis::tdigest::TDigest;
use crate::error::{FederationError, Result};
use crate::models::{
    AggregatedResult, AnalysisType, Completeness, Component, Contributor, SufficientStatistics,
    Task, TerminalStatus,
};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// Stateless merger of sufficient statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResultAggregator;

impl ResultAggregator {
    pub fn new() -> Self {
        Self
    }

    /// Merge statistics from every responding subtask. The result is marked
    /// complete; use [`ResultAggregator::aggregate_for_task`] to account for
    /// TREs that did not report.
    pub fn aggregate(
        &self,
        analysis_type: AnalysisType,
        mut stats: Vec<SufficientStatistics>,
    ) -> Result<AggregatedResult> {
        if stats.is_empty() {
            return Err(FederationError::Aggregation(format!(
                "no TRE returned sufficient statistics for {}",
                analysis_type
            )));
        }

        stats.sort_by_key(|s| s.subtask_id);

        let mut seen = BTreeSet::new();
        for s in &stats {
            if !seen.insert(s.subtask_id) {
                return Err(FederationError::Aggregation(format!(
                    "subtask {} reported more than once",
                    s.subtask_id
                )));
            }
            if s.analysis_type.identifier() != analysis_type.identifier() {
                return Err(FederationError::Aggregation(format!(
                    "subtask {} ({}) reported {} statistics, expected {}",
                    s.subtask_id, s.tre_name, s.analysis_type, analysis_type
                )));
            }
        }

        let names: BTreeSet<&String> = stats.iter().flat_map(|s| s.components.keys()).collect();
        let mut components = BTreeMap::new();

        for name in names {
            let mut values = Vec::with_capacity(stats.len());
            for s in &stats {
                let value = s.components.get(name).ok_or_else(|| {
                    FederationError::Aggregation(format!(
                        "component '{}' missing from {} (subtask {})",
                        name, s.tre_name, s.subtask_id
                    ))
                })?;
                values.push(value);
            }
            components.insert(name.clone(), merge_component(name, &values)?);
        }

        let contributors = stats
            .iter()
            .map(|s| Contributor {
                subtask_id: s.subtask_id,
                tre_name: s.tre_name.clone(),
            })
            .collect::<Vec<_>>();

        debug!(
            "Aggregated {} components from {} TREs for {}",
            components.len(),
            contributors.len(),
            analysis_type
        );

        Ok(AggregatedResult {
            analysis_type,
            components,
            contributors,
            missing_tres: Vec::new(),
            completeness: Completeness::Complete,
        })
    }

    /// Merge the statistics collected for `task` after it reached `status`.
    ///
    /// The result is partial when the task reported PARTIAL or when any of its
    /// TREs has no statistics, so a reduced set never presents as complete.
    pub fn aggregate_for_task(
        &self,
        task: &Task,
        status: TerminalStatus,
        analysis_type: AnalysisType,
        stats: Vec<SufficientStatistics>,
    ) -> Result<AggregatedResult> {
        let known: BTreeSet<u64> = task.subtasks.iter().map(|s| s.subtask_id).collect();
        if let Some(stray) = stats.iter().find(|s| !known.contains(&s.subtask_id)) {
            return Err(FederationError::Aggregation(format!(
                "subtask {} does not belong to task {}",
                stray.subtask_id, task.task_id
            )));
        }

        let mut result = self.aggregate(analysis_type, stats)?;

        let reported: BTreeSet<u64> = result.contributors.iter().map(|c| c.subtask_id).collect();
        result.missing_tres = task
            .subtasks
            .iter()
            .filter(|s| !reported.contains(&s.subtask_id))
            .map(|s| s.tre_name.clone())
            .collect();

        if status == TerminalStatus::Partial || !result.missing_tres.is_empty() {
            result.completeness = Completeness::Partial;
            warn!(
                "Task {} is partial: {}/{} TREs reported, missing [{}]",
                task.task_id,
                result.contributors.len(),
                task.subtasks.len(),
                result.missing_tres.join(", ")
            );
        }

        Ok(result)
    }
}

fn merge_component(name: &str, values: &[&Component]) -> Result<Component> {
    let mismatch = || {
        FederationError::Aggregation(format!(
            "component '{}' has different kinds across TREs",
            name
        ))
    };

    match values.first() {
        Some(Component::Scalar(_)) => {
            let mut sum = 0.0;
            for v in values {
                sum += v.as_scalar().ok_or_else(mismatch)?;
            }
            Ok(Component::Scalar(sum))
        }
        Some(Component::Table(_)) => {
            let tables = values
                .iter()
                .map(|v| match v {
                    Component::Table(t) => Ok(t),
                    _ => Err(mismatch()),
                })
                .collect::<Result<Vec<&ContingencyTable>>>()?;
            ContingencyTable::merge(tables)
                .map(Component::Table)
                .map_err(FederationError::Aggregation)
        }
        Some(Component::Digest(_)) => {
            let digests = values
                .iter()
                .map(|v| match v {
                    Component::Digest(d) => Ok(d),
                    _ => Err(mismatch()),
                })
                .collect::<Result<Vec<&TDigest>>>()?;
            Ok(Component::Digest(TDigest::merge_all(digests)))
        }
        None => Err(FederationError::Aggregation(format!(
            "component '{}' has no values",
            name
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::payload::{DIGEST_COMPONENT, TABLE_COMPONENT};
    use crate::models::Subtask;

    fn scalar_stats(subtask_id: u64, tre: &str, pairs: &[(&str, f64)]) -> SufficientStatistics {
        SufficientStatistics {
            subtask_id,
            tre_name: tre.to_string(),
            analysis_type: AnalysisType::Variance,
            components: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), Component::Scalar(*v)))
                .collect(),
        }
    }

    fn table_stats(subtask_id: u64, rows: &[(&str, u64)]) -> SufficientStatistics {
        let table = ContingencyTable {
            columns: vec!["smoker".to_string()],
            counts: rows
                .iter()
                .map(|(label, n)| (vec![label.to_string()], *n))
                .collect(),
        };
        SufficientStatistics {
            subtask_id,
            tre_name: format!("TRE {}", subtask_id),
            analysis_type: AnalysisType::ContingencyTable,
            components: BTreeMap::from([(TABLE_COMPONENT.to_string(), Component::Table(table))]),
        }
    }

    fn two_tre_task() -> Task {
        Task {
            task_id: 179,
            subtasks: vec![
                Subtask {
                    subtask_id: 180,
                    tre_name: "Nottingham".to_string(),
                },
                Subtask {
                    subtask_id: 181,
                    tre_name: "Nottingham 2".to_string(),
                },
            ],
        }
    }

    #[test]
    fn test_mean_scenario() {
        let stats = vec![
            SufficientStatistics {
                analysis_type: AnalysisType::Mean,
                ..scalar_stats(180, "Nottingham", &[("n", 50.0), ("total", 750.0)])
            },
            SufficientStatistics {
                analysis_type: AnalysisType::Mean,
                ..scalar_stats(181, "Nottingham 2", &[("n", 50.0), ("total", 750.0)])
            },
        ];
        let result = ResultAggregator::new()
            .aggregate(AnalysisType::Mean, stats)
            .unwrap();

        assert_eq!(result.scalar("n"), Some(100.0));
        assert_eq!(result.scalar("total"), Some(1500.0));
        assert!(!result.is_partial());
    }

    #[test]
    fn test_permutations_give_identical_results() {
        let inputs = vec![
            scalar_stats(11, "A", &[("n", 3.0), ("total", 0.1), ("sum_x2", 1e16)]),
            scalar_stats(12, "B", &[("n", 5.0), ("total", 0.2), ("sum_x2", 1.0)]),
            scalar_stats(13, "C", &[("n", 7.0), ("total", 0.3), ("sum_x2", -1e16)]),
        ];
        let orders: [[usize; 3]; 6] = [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];

        let aggregator = ResultAggregator::new();
        let reference = aggregator
            .aggregate(AnalysisType::Variance, inputs.clone())
            .unwrap();

        for order in orders {
            let permuted = order.iter().map(|&i| inputs[i].clone()).collect();
            let result = aggregator
                .aggregate(AnalysisType::Variance, permuted)
                .unwrap();
            assert_eq!(result, reference, "order {:?}", order);
        }
    }

    #[test]
    fn test_empty_input_fails() {
        let err = ResultAggregator::new()
            .aggregate(AnalysisType::Mean, vec![])
            .unwrap_err();
        assert!(matches!(err, FederationError::Aggregation(_)));
    }

    #[test]
    fn test_duplicate_subtask_fails() {
        let stats = vec![
            scalar_stats(5, "A", &[("n", 1.0)]),
            scalar_stats(5, "A", &[("n", 1.0)]),
        ];
        assert!(ResultAggregator::new()
            .aggregate(AnalysisType::Variance, stats)
            .is_err());
    }

    #[test]
    fn test_missing_component_in_one_tre_fails() {
        let stats = vec![
            scalar_stats(1, "A", &[("n", 1.0), ("total", 2.0)]),
            scalar_stats(2, "B", &[("n", 1.0)]),
        ];
        assert!(ResultAggregator::new()
            .aggregate(AnalysisType::Variance, stats)
            .is_err());
    }

    #[test]
    fn test_contingency_merge_preserves_zero_counts() {
        let stats = vec![
            table_stats(1, &[("yes", 4), ("no", 0)]),
            table_stats(2, &[("yes", 1), ("unknown", 0)]),
        ];
        let result = ResultAggregator::new()
            .aggregate(AnalysisType::ContingencyTable, stats)
            .unwrap();

        match result.components.get(TABLE_COMPONENT) {
            Some(Component::Table(table)) => {
                assert_eq!(table.counts.len(), 3);
                assert_eq!(table.counts.get(&vec!["yes".to_string()]), Some(&5));
                assert_eq!(table.counts.get(&vec!["no".to_string()]), Some(&0));
                assert_eq!(table.counts.get(&vec!["unknown".to_string()]), Some(&0));
            }
            other => panic!("unexpected component {:?}", other),
        }
    }

    #[test]
    fn test_digest_merge() {
        let digest = |values: &[f64]| TDigest::from_values(values, 0.01);
        let stats = |id: u64, d: TDigest| SufficientStatistics {
            subtask_id: id,
            tre_name: format!("TRE {}", id),
            analysis_type: AnalysisType::PercentileSketch,
            components: BTreeMap::from([(DIGEST_COMPONENT.to_string(), Component::Digest(d))]),
        };
        let forward = ResultAggregator::new()
            .aggregate(
                AnalysisType::PercentileSketch,
                vec![stats(1, digest(&[1.0, 2.0])), stats(2, digest(&[3.0, 4.0]))],
            )
            .unwrap();
        let backward = ResultAggregator::new()
            .aggregate(
                AnalysisType::PercentileSketch,
                vec![stats(2, digest(&[3.0, 4.0])), stats(1, digest(&[1.0, 2.0]))],
            )
            .unwrap();

        assert_eq!(forward, backward);
        match forward.components.get(DIGEST_COMPONENT) {
            Some(Component::Digest(d)) => assert_eq!(d.n, 4.0),
            other => panic!("unexpected component {:?}", other),
        }
    }

    #[test]
    fn test_partial_status_marks_missing_tre() {
        let stats = vec![SufficientStatistics {
            analysis_type: AnalysisType::Mean,
            ..scalar_stats(180, "Nottingham", &[("n", 50.0), ("total", 750.0)])
        }];
        let result = ResultAggregator::new()
            .aggregate_for_task(
                &two_tre_task(),
                TerminalStatus::Partial,
                AnalysisType::Mean,
                stats,
            )
            .unwrap();

        assert!(result.is_partial());
        assert_eq!(result.missing_tres, vec!["Nottingham 2".to_string()]);
        assert_eq!(result.scalar("n"), Some(50.0));
    }

    #[test]
    fn test_complete_status_with_missing_result_is_partial() {
        let stats = vec![SufficientStatistics {
            analysis_type: AnalysisType::Mean,
            ..scalar_stats(181, "Nottingham 2", &[("n", 1.0), ("total", 1.0)])
        }];
        let result = ResultAggregator::new()
            .aggregate_for_task(
                &two_tre_task(),
                TerminalStatus::Complete,
                AnalysisType::Mean,
                stats,
            )
            .unwrap();
        assert!(result.is_partial());
        assert_eq!(result.missing_tres, vec!["Nottingham".to_string()]);
    }

    #[test]
    fn test_stray_subtask_rejected() {
        let stats = vec![SufficientStatistics {
            analysis_type: AnalysisType::Mean,
            ..scalar_stats(999, "Elsewhere", &[("n", 1.0), ("total", 1.0)])
        }];
        assert!(ResultAggregator::new()
            .aggregate_for_task(
                &two_tre_task(),
                TerminalStatus::Complete,
                AnalysisType::Mean,
                stats,
            )
            .is_err());
    }
}
