//! Parsing of per-TRE result objects into [`SufficientStatistics`].
//!
//! The processing container writes JSON by default: a flat object for the
//! scalar analyses, an array of labelled rows for contingency tables and a
//! digest object for percentile sketches. Older containers wrote CSV with a
//! header line; both are accepted.

use crate::analysis::table::ContingencyTable;
use crate::analysis::tdigest::TDigest;
use crate::error::{FederationError, Result};
use crate::models::{AnalysisType, Component, Subtask, SufficientStatistics};
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;
use tracing::debug;

pub const TABLE_COMPONENT: &str = "contingency_table";
pub const DIGEST_COMPONENT: &str = "tdigest";

/// Parse one subtask's raw result for the given analysis.
pub fn parse_payload(
    subtask: &Subtask,
    analysis_type: AnalysisType,
    raw: &str,
) -> Result<SufficientStatistics> {
    let invalid = |message: String| FederationError::InvalidPayload {
        tre: subtask.tre_name.clone(),
        message,
    };

    let trimmed = raw.trim_start();
    let value: Value = if trimmed.starts_with('{') || trimmed.starts_with('[') {
        serde_json::from_str(trimmed).map_err(|e| invalid(format!("malformed JSON: {}", e)))?
    } else {
        Value::Array(csv_rows(trimmed).map_err(&invalid)?)
    };

    let components = match analysis_type {
        AnalysisType::Mean | AnalysisType::Variance | AnalysisType::Pmcc => {
            scalar_components(analysis_type, &value).map_err(&invalid)?
        }
        AnalysisType::ContingencyTable | AnalysisType::ChiSquared => {
            let rows = match &value {
                Value::Array(rows) => rows.clone(),
                // some containers wrap the rows under the component name
                Value::Object(obj) => obj
                    .get(TABLE_COMPONENT)
                    .and_then(Value::as_array)
                    .cloned()
                    .ok_or_else(|| invalid("expected an array of rows".to_string()))?,
                _ => return Err(invalid("expected an array of rows".to_string())),
            };
            let table = ContingencyTable::from_rows(&rows).map_err(&invalid)?;
            BTreeMap::from([(TABLE_COMPONENT.to_string(), Component::Table(table))])
        }
        AnalysisType::PercentileSketch => {
            let digest: TDigest = serde_json::from_value(value)
                .map_err(|e| invalid(format!("not a t-digest: {}", e)))?;
            let digest = digest.normalized().map_err(&invalid)?;
            BTreeMap::from([(DIGEST_COMPONENT.to_string(), Component::Digest(digest))])
        }
    };

    Ok(SufficientStatistics {
        subtask_id: subtask.subtask_id,
        tre_name: subtask.tre_name.clone(),
        analysis_type,
        components,
    })
}

fn scalar_components(
    analysis_type: AnalysisType,
    value: &Value,
) -> std::result::Result<BTreeMap<String, Component>, String> {
    let obj = match value {
        Value::Object(obj) => obj,
        Value::Array(rows) if rows.len() == 1 => rows[0]
            .as_object()
            .ok_or_else(|| "expected a single object row".to_string())?,
        _ => return Err("expected a single object of sufficient statistics".to_string()),
    };

    let mut components = BTreeMap::new();
    for name in analysis_type.required_components() {
        let field = obj
            .get(*name)
            .ok_or_else(|| format!("missing field '{}'", name))?;
        let number = match field {
            // SUM over zero rows is NULL in SQL
            Value::Null => 0.0,
            other => other
                .as_f64()
                .ok_or_else(|| format!("field '{}' is not numeric: {}", name, other))?,
        };
        if !number.is_finite() {
            return Err(format!("field '{}' is not finite", name));
        }
        components.insert(name.to_string(), Component::Scalar(number));
    }

    if components.get("n").and_then(Component::as_scalar).unwrap_or(0.0) < 0.0 {
        return Err("field 'n' is negative".to_string());
    }

    for extra in obj.keys().filter(|k| !components.contains_key(*k)) {
        debug!("Ignoring extra field '{}' in {} payload", extra, analysis_type);
    }

    Ok(components)
}

/// Turn `header\nrow\nrow` CSV into JSON objects, numbers where they parse.
fn csv_rows(raw: &str) -> std::result::Result<Vec<Value>, String> {
    let mut lines = raw.lines().map(str::trim).filter(|l| !l.is_empty());
    let header: Vec<&str> = lines
        .next()
        .ok_or_else(|| "empty result".to_string())?
        .split(',')
        .map(str::trim)
        .collect();

    let mut rows = Vec::new();
    for line in lines {
        let cells: Vec<&str> = line.split(',').map(str::trim).collect();
        if cells.len() != header.len() {
            return Err(format!(
                "row '{}' has {} cells, header has {}",
                line,
                cells.len(),
                header.len()
            ));
        }
        let mut obj = Map::new();
        for (name, cell) in header.iter().zip(cells) {
            let value = if let Ok(int) = cell.parse::<u64>() {
                Value::Number(Number::from(int))
            } else if let Some(n) = cell.parse::<f64>().ok().and_then(Number::from_f64) {
                Value::Number(n)
            } else if cell.is_empty() {
                Value::Null
            } else {
                Value::String(cell.to_string())
            };
            obj.insert(name.to_string(), value);
        }
        rows.push(Value::Object(obj));
    }
    Ok(rows)
}
