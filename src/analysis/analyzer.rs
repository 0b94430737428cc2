//! Finalization of aggregated sufficient statistics.
//!
//! Each [`AnalysisType`] declares the components it needs and a pure
//! function from an [`AggregatedResult`] to its final value. Component
//! lookups go through [`resolve_component`], so PMCC aggregates can serve the
//! single-column analyses of their first column.

use crate::analysis::payload::{DIGEST_COMPONENT, TABLE_COMPONENT};
use crate::analysis::table::ContingencyTable;
use crate::analysis::tdigest::TDigest;
use crate::error::{FederationError, Result};
use crate::models::{AggregatedResult, AnalysisType, Component, StatisticValue};
use tracing::debug;

/// Components that may stand in for another under the same data filter.
/// `total` is the column sum; a PMCC run reports it as `sum_x`.
const ALIASES: &[(&str, &str)] = &[("total", "sum_x")];

impl AnalysisType {
    /// Statistic keys this analysis reads from an aggregate.
    pub fn required_components(&self) -> &'static [&'static str] {
        match self {
            AnalysisType::Mean => &["n", "total"],
            AnalysisType::Variance => &["n", "total", "sum_x2"],
            AnalysisType::Pmcc => &["n", "sum_x", "sum_y", "sum_xy", "sum_x2", "sum_y2"],
            AnalysisType::ContingencyTable | AnalysisType::ChiSquared => &[TABLE_COMPONENT],
            AnalysisType::PercentileSketch => &[DIGEST_COMPONENT],
        }
    }
}

/// Find `name` in `result`, following aliases.
pub fn resolve_component<'a>(result: &'a AggregatedResult, name: &str) -> Option<&'a Component> {
    result.components.get(name).or_else(|| {
        ALIASES
            .iter()
            .filter(|(wanted, _)| *wanted == name)
            .find_map(|(_, alias)| result.components.get(*alias))
    })
}

/// Required components absent from `result`, after aliasing.
pub fn missing_components(analysis_type: AnalysisType, result: &AggregatedResult) -> Vec<String> {
    analysis_type
        .required_components()
        .iter()
        .filter(|name| resolve_component(result, name).is_none())
        .map(|name| name.to_string())
        .collect()
}

/// Computes final statistics from aggregates.
#[derive(Debug, Clone)]
pub struct StatisticalAnalyzer {
    quantiles: Vec<f64>,
}

impl Default for StatisticalAnalyzer {
    fn default() -> Self {
        Self::new(vec![0.25, 0.5, 0.75])
    }
}

impl StatisticalAnalyzer {
    /// `quantiles` are the points reported for percentile sketches; values
    /// outside `[0, 1]` are dropped.
    pub fn new(mut quantiles: Vec<f64>) -> Self {
        quantiles.retain(|q| (0.0..=1.0).contains(q));
        quantiles.sort_by(f64::total_cmp);
        quantiles.dedup();
        Self { quantiles }
    }

    /// Look up an analysis by identifier.
    pub fn parse_type(identifier: &str) -> Result<AnalysisType> {
        identifier.parse()
    }

    pub fn supported_types() -> Vec<AnalysisType> {
        AnalysisType::ALL.to_vec()
    }

    /// Whether `result` carries everything `analysis_type` needs.
    pub fn can_finalize(analysis_type: AnalysisType, result: &AggregatedResult) -> bool {
        missing_components(analysis_type, result).is_empty()
    }

    pub fn finalize(
        &self,
        analysis_type: AnalysisType,
        result: &AggregatedResult,
    ) -> Result<StatisticValue> {
        let missing = missing_components(analysis_type, result);
        if !missing.is_empty() {
            return Err(FederationError::MissingComponent {
                analysis: analysis_type.to_string(),
                missing,
            });
        }

        debug!(
            "Finalizing {} from {} aggregate ({} TREs)",
            analysis_type,
            result.analysis_type,
            result.contributors.len()
        );

        match analysis_type {
            AnalysisType::Mean => {
                let s = Scalars::new(analysis_type, result);
                let n = s.positive_n()?;
                Ok(StatisticValue::Scalar {
                    value: s.get("total")? / n,
                })
            }
            AnalysisType::Variance => {
                let s = Scalars::new(analysis_type, result);
                let n = s.positive_n()?;
                let mean = s.get("total")? / n;
                Ok(StatisticValue::Scalar {
                    value: s.get("sum_x2")? / n - mean * mean,
                })
            }
            AnalysisType::Pmcc => {
                let s = Scalars::new(analysis_type, result);
                let n = s.positive_n()?;
                let (sx, sy) = (s.get("sum_x")?, s.get("sum_y")?);
                let numerator = n * s.get("sum_xy")? - sx * sy;
                let var_x = n * s.get("sum_x2")? - sx * sx;
                let var_y = n * s.get("sum_y2")? - sy * sy;
                let denominator = (var_x * var_y).sqrt();
                if !(denominator > 0.0) {
                    return Err(s.degenerate("a column has zero variance"));
                }
                Ok(StatisticValue::Scalar {
                    value: numerator / denominator,
                })
            }
            AnalysisType::ContingencyTable => Ok(StatisticValue::Table {
                table: table_of(analysis_type, result)?.clone(),
            }),
            AnalysisType::ChiSquared => chi_squared(table_of(analysis_type, result)?),
            AnalysisType::PercentileSketch => {
                let digest = digest_of(analysis_type, result)?;
                let quantiles = self
                    .quantiles
                    .iter()
                    .filter_map(|&q| digest.quantile(q).map(|v| (q, v)))
                    .collect();
                Ok(StatisticValue::Percentiles {
                    quantiles,
                    count: digest.n,
                    digest: digest.clone(),
                })
            }
        }
    }
}

/// Scalar accessor that reports errors against the analysis being finalized.
struct Scalars<'a> {
    analysis_type: AnalysisType,
    result: &'a AggregatedResult,
}

impl<'a> Scalars<'a> {
    fn new(analysis_type: AnalysisType, result: &'a AggregatedResult) -> Self {
        Self {
            analysis_type,
            result,
        }
    }

    fn get(&self, name: &str) -> Result<f64> {
        match resolve_component(self.result, name) {
            Some(Component::Scalar(v)) => Ok(*v),
            Some(other) => Err(self.degenerate(&format!(
                "component '{}' is a {}, expected a scalar",
                name,
                other.kind()
            ))),
            None => Err(FederationError::MissingComponent {
                analysis: self.analysis_type.to_string(),
                missing: vec![name.to_string()],
            }),
        }
    }

    fn positive_n(&self) -> Result<f64> {
        let n = self.get("n")?;
        if n > 0.0 {
            Ok(n)
        } else {
            Err(self.degenerate("no rows were counted (n = 0)"))
        }
    }

    fn degenerate(&self, reason: &str) -> FederationError {
        FederationError::DegenerateStatistic {
            analysis: self.analysis_type.to_string(),
            reason: reason.to_string(),
        }
    }
}

fn table_of(analysis_type: AnalysisType, result: &AggregatedResult) -> Result<&ContingencyTable> {
    match resolve_component(result, TABLE_COMPONENT) {
        Some(Component::Table(table)) => Ok(table),
        _ => Err(FederationError::MissingComponent {
            analysis: analysis_type.to_string(),
            missing: vec![TABLE_COMPONENT.to_string()],
        }),
    }
}

fn digest_of(analysis_type: AnalysisType, result: &AggregatedResult) -> Result<&TDigest> {
    match resolve_component(result, DIGEST_COMPONENT) {
        Some(Component::Digest(digest)) => Ok(digest),
        _ => Err(FederationError::MissingComponent {
            analysis: analysis_type.to_string(),
            missing: vec![DIGEST_COMPONENT.to_string()],
        }),
    }
}

/// Pearson chi-squared test of independence on a two-column table.
fn chi_squared(table: &ContingencyTable) -> Result<StatisticValue> {
    let degenerate = |reason: String| FederationError::DegenerateStatistic {
        analysis: AnalysisType::ChiSquared.to_string(),
        reason,
    };

    if table.columns.len() != 2 {
        return Err(degenerate(format!(
            "needs exactly two categorical columns, table has {}",
            table.columns.len()
        )));
    }

    let row_labels = table.levels(0);
    let col_labels = table.levels(1);
    let total = table.total() as f64;
    if total == 0.0 {
        return Err(degenerate("table is empty".to_string()));
    }

    let mut observed = vec![vec![0.0; col_labels.len()]; row_labels.len()];
    for (labels, &n) in &table.counts {
        let r = row_labels.iter().position(|l| *l == labels[0]);
        let c = col_labels.iter().position(|l| *l == labels[1]);
        if let (Some(r), Some(c)) = (r, c) {
            observed[r][c] = n as f64;
        }
    }

    let row_totals: Vec<f64> = observed.iter().map(|row| row.iter().sum()).collect();
    let col_totals: Vec<f64> = (0..col_labels.len())
        .map(|c| observed.iter().map(|row| row[c]).sum())
        .collect();

    let mut expected = vec![vec![0.0; col_labels.len()]; row_labels.len()];
    let mut statistic = 0.0;
    for r in 0..row_labels.len() {
        for c in 0..col_labels.len() {
            let e = row_totals[r] * col_totals[c] / total;
            expected[r][c] = e;
            // an all-zero row or column contributes nothing
            if e > 0.0 {
                statistic += (observed[r][c] - e).powi(2) / e;
            }
        }
    }

    let degrees_of_freedom =
        (row_labels.len().saturating_sub(1) * col_labels.len().saturating_sub(1)) as u64;

    Ok(StatisticValue::ChiSquared {
        statistic,
        degrees_of_freedom,
        expected,
        row_labels,
        col_labels,
    })
}
