//! Markdown and JSON rendering of analysis outcomes.

use crate::analysis::table::ContingencyTable;
use crate::models::{AnalysisOutcome, Completeness, OutcomeSource, StatisticValue};
use anyhow::Result;

/// Generate a complete Markdown report, one section per outcome in run order.
pub fn generate_markdown_report(outcomes: &[AnalysisOutcome]) -> String {
    let mut output = String::new();

    for outcome in outcomes {
        output.push_str(&format!("# fedstats: {}\n\n", outcome.analysis_type));

        if let Some(warning) = outcome.partial_warning() {
            output.push_str(&format!("> ⚠️ **Warning:** {}\n\n", warning));
        }

        output.push_str(&generate_metadata_section(outcome));
        output.push_str(&generate_result_section(&outcome.value));
        output.push_str(&generate_query_section(&outcome.user_query));
    }
    output.push_str(&generate_footer());

    output
}

/// Generate the metadata section.
fn generate_metadata_section(outcome: &AnalysisOutcome) -> String {
    let mut section = String::new();

    section.push_str("## Metadata\n\n");
    section.push_str(&format!("- **Analysis:** `{}`\n", outcome.analysis_type));
    match &outcome.source {
        OutcomeSource::Computed { task_id } => {
            section.push_str(&format!("- **Task:** {}\n", task_id));
        }
        OutcomeSource::Cached {
            computed_for,
            derived,
        } => {
            let how = if *derived { "derived from" } else { "reused" };
            section.push_str(&format!(
                "- **Source:** cache ({} `{}` aggregate)\n",
                how, computed_for
            ));
        }
    }
    section.push_str(&format!(
        "- **Completed:** {}\n",
        outcome.completed_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    section.push_str(&format!(
        "- **TREs Reporting:** {}\n",
        outcome.tres_used.join(", ")
    ));
    if !outcome.missing_tres.is_empty() {
        section.push_str(&format!(
            "- **TREs Missing:** {}\n",
            outcome.missing_tres.join(", ")
        ));
    }
    let completeness = match outcome.completeness {
        Completeness::Complete => "complete",
        Completeness::Partial => "partial",
    };
    section.push_str(&format!("- **Completeness:** {}\n\n", completeness));

    section
}

/// Generate the result section for any statistic kind.
fn generate_result_section(value: &StatisticValue) -> String {
    let mut section = String::new();
    section.push_str("## Result\n\n");

    match value {
        StatisticValue::Scalar { value } => {
            section.push_str(&format!("**Value:** `{}`\n\n", value));
        }
        StatisticValue::Table { table } => {
            section.push_str(&generate_table(table));
        }
        StatisticValue::Percentiles {
            quantiles,
            count,
            digest,
        } => {
            section.push_str(&format!("*Observations: {}*", count));
            if let (Some(min), Some(max)) = (digest.min(), digest.max()) {
                section.push_str(&format!(" *(range {} to {})*", min, max));
            }
            section.push_str("\n\n");
            section.push_str("| Quantile | Value |\n");
            section.push_str("|:---:|---:|\n");
            for (q, v) in quantiles {
                section.push_str(&format!("| {} | {} |\n", q, v));
            }
            section.push('\n');
        }
        StatisticValue::ChiSquared {
            statistic,
            degrees_of_freedom,
            ..
        } => {
            section.push_str(&format!("**Chi-squared:** `{}`\n\n", statistic));
            section.push_str(&format!(
                "**Degrees of freedom:** {}\n\n",
                degrees_of_freedom
            ));
        }
    }

    section
}

fn generate_table(table: &ContingencyTable) -> String {
    let mut out = String::new();

    out.push_str(&format!("| {} | n |\n", table.columns.join(" | ")));
    out.push_str(&format!("|{}---:|\n", ":---|".repeat(table.columns.len())));
    for (labels, count) in &table.counts {
        out.push_str(&format!("| {} | {} |\n", labels.join(" | "), count));
    }
    out.push_str(&format!("\n*Total: {}*\n\n", table.total()));

    out
}

fn generate_query_section(query: &str) -> String {
    format!("## Query\n\n```sql\n{}\n```\n\n", query.trim())
}

/// Generate the report footer.
fn generate_footer() -> String {
    "---\n\n*Report generated by fedstats*\n".to_string()
}

/// Generate a JSON report: a single object for one outcome, an array otherwise.
pub fn generate_json_report(outcomes: &[AnalysisOutcome]) -> Result<String> {
    let json = match outcomes {
        [outcome] => serde_json::to_string_pretty(outcome)?,
        _ => serde_json::to_string_pretty(outcomes)?,
    };
    Ok(json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AnalysisType;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn create_test_outcome() -> AnalysisOutcome {
        AnalysisOutcome {
            analysis_type: AnalysisType::Mean,
            value: StatisticValue::Scalar { value: 15.0 },
            source: OutcomeSource::Computed { task_id: 179 },
            tres_used: vec!["Nottingham".to_string(), "Nottingham 2".to_string()],
            missing_tres: Vec::new(),
            completeness: Completeness::Complete,
            user_query: "SELECT value_as_number FROM measurement".to_string(),
            completed_at: Utc::now(),
        }
    }

    #[test]
    fn test_generate_markdown_report() {
        let outcome = create_test_outcome();
        let markdown = generate_markdown_report(&[outcome]);

        assert!(markdown.contains("# fedstats: mean"));
        assert!(markdown.contains("## Metadata"));
        assert!(markdown.contains("- **Task:** 179"));
        assert!(markdown.contains("`15`"));
        assert!(markdown.contains("Nottingham, Nottingham 2"));
        assert!(!markdown.contains("Warning"));
    }

    #[test]
    fn test_partial_report_warns() {
        let mut outcome = create_test_outcome();
        outcome.tres_used.truncate(1);
        outcome.missing_tres = vec!["Nottingham 2".to_string()];
        outcome.completeness = Completeness::Partial;

        let markdown = generate_markdown_report(&[outcome]);
        assert!(markdown.contains("**Warning:**"));
        assert!(markdown.contains("- **TREs Missing:** Nottingham 2"));
        assert!(markdown.contains("- **Completeness:** partial"));
    }

    #[test]
    fn test_cached_source() {
        let mut outcome = create_test_outcome();
        outcome.source = OutcomeSource::Cached {
            computed_for: AnalysisType::Variance,
            derived: true,
        };

        let section = generate_metadata_section(&outcome);
        assert!(section.contains("derived from `variance` aggregate"));
    }

    #[test]
    fn test_table_section() {
        let table = ContingencyTable {
            columns: vec!["gender".to_string()],
            counts: BTreeMap::from([
                (vec!["F".to_string()], 4),
                (vec!["M".to_string()], 0),
            ]),
        };

        let section = generate_result_section(&StatisticValue::Table { table });
        assert!(section.contains("| gender | n |"));
        assert!(section.contains("| M | 0 |"));
        assert!(section.contains("*Total: 4*"));
    }

    #[test]
    fn test_generate_json_report() {
        let outcome = create_test_outcome();
        let json = generate_json_report(&[outcome]).unwrap();

        assert!(json.contains("\"analysis_type\": \"mean\""));
        assert!(json.contains("\"source\": \"computed\""));
        assert!(json.contains("\"task_id\": 179"));
        assert!(json.contains("\"completeness\": \"complete\""));
    }

    #[test]
    fn test_several_outcomes() {
        let first = create_test_outcome();
        let mut second = create_test_outcome();
        second.analysis_type = AnalysisType::Variance;
        second.value = StatisticValue::Scalar { value: 1.25 };
        second.source = OutcomeSource::Cached {
            computed_for: AnalysisType::Variance,
            derived: false,
        };
        let outcomes = vec![first, second];

        let markdown = generate_markdown_report(&outcomes);
        let mean_at = markdown.find("# fedstats: mean").unwrap();
        let variance_at = markdown.find("# fedstats: variance").unwrap();
        assert!(mean_at < variance_at);
        assert!(markdown.contains("reused `variance` aggregate"));
        assert_eq!(markdown.matches("Report generated by fedstats").count(), 1);

        let json: serde_json::Value = serde_json::from_str(&generate_json_report(&outcomes).unwrap()).unwrap();
        assert_eq!(json.as_array().map(Vec::len), Some(2));
        assert_eq!(json[1]["source"]["source"], "cached");
    }
}
