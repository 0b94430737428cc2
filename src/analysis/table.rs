//! Contingency tables keyed by label tuples.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Counts per combination of categorical labels.
///
/// `columns` names the label fields in the order the TRE selected them; each
/// key in `counts` holds one label per column in that order. Zero counts are
/// kept: a combination reported by any TRE stays in the table.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(into = "TableRepr", try_from = "TableRepr")]
pub struct ContingencyTable {
    pub columns: Vec<String>,
    pub counts: BTreeMap<Vec<String>, u64>,
}

/// Wire shape: JSON objects cannot use tuples as keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TableRepr {
    columns: Vec<String>,
    rows: Vec<TableRow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TableRow {
    labels: Vec<String>,
    n: u64,
}

impl From<ContingencyTable> for TableRepr {
    fn from(table: ContingencyTable) -> Self {
        Self {
            columns: table.columns,
            rows: table
                .counts
                .into_iter()
                .map(|(labels, n)| TableRow { labels, n })
                .collect(),
        }
    }
}

impl TryFrom<TableRepr> for ContingencyTable {
    type Error = String;

    fn try_from(repr: TableRepr) -> Result<Self, Self::Error> {
        let mut table = ContingencyTable {
            columns: repr.columns,
            counts: BTreeMap::new(),
        };
        for row in repr.rows {
            table.add(row.labels, row.n)?;
        }
        Ok(table)
    }
}

/// Label text for a JSON cell. Strings are used verbatim.
fn label_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn count_of(value: &Value) -> Option<u64> {
    if let Some(n) = value.as_u64() {
        return Some(n);
    }
    // numpy-backed containers emit integral floats
    value
        .as_f64()
        .filter(|f| *f >= 0.0 && f.fract() == 0.0 && *f <= u64::MAX as f64)
        .map(|f| f as u64)
}

impl ContingencyTable {
    /// Parse the container output: an array of `{label fields..., "n": count}`.
    pub fn from_rows(rows: &[Value]) -> Result<Self, String> {
        let mut table = ContingencyTable::default();

        for (i, row) in rows.iter().enumerate() {
            let obj = row
                .as_object()
                .ok_or_else(|| format!("row {} is not an object", i))?;

            let n = obj
                .get("n")
                .and_then(count_of)
                .ok_or_else(|| format!("row {} has no non-negative integer 'n'", i))?;

            let columns: Vec<String> = obj.keys().filter(|k| *k != "n").cloned().collect();
            if columns.is_empty() {
                return Err(format!("row {} has no label columns", i));
            }

            if table.columns.is_empty() {
                table.columns = columns;
            } else if !same_columns(&table.columns, &columns) {
                return Err(format!(
                    "row {} has columns {:?}, expected {:?}",
                    i, columns, table.columns
                ));
            }

            let labels = table
                .columns
                .iter()
                .map(|c| obj.get(c).map(label_of).unwrap_or_default())
                .collect();
            table.add(labels, n)?;
        }

        Ok(table)
    }

    fn add(&mut self, labels: Vec<String>, n: u64) -> Result<(), String> {
        if labels.len() != self.columns.len() {
            return Err(format!(
                "label tuple {:?} does not match columns {:?}",
                labels, self.columns
            ));
        }
        let slot = self.counts.entry(labels).or_insert(0);
        *slot = slot
            .checked_add(n)
            .ok_or_else(|| "count overflow".to_string())?;
        Ok(())
    }

    /// Union of label tuples with per-tuple summed counts.
    ///
    /// A table with no rows carries no column information and merges with
    /// anything; otherwise the column sets must match.
    pub fn merge<'a, I>(tables: I) -> Result<Self, String>
    where
        I: IntoIterator<Item = &'a ContingencyTable>,
    {
        let mut merged = ContingencyTable::default();

        for table in tables {
            if table.columns.is_empty() {
                continue;
            }
            if merged.columns.is_empty() {
                merged.columns = table.columns.clone();
            } else if !same_columns(&merged.columns, &table.columns) {
                return Err(format!(
                    "cannot merge tables with columns {:?} and {:?}",
                    merged.columns, table.columns
                ));
            }

            let order = reorder(&table.columns, &merged.columns);
            for (labels, n) in &table.counts {
                let aligned = order.iter().map(|&i| labels[i].clone()).collect();
                merged.add(aligned, *n)?;
            }
        }

        Ok(merged)
    }

    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    /// Distinct labels seen in column `index`, sorted.
    pub fn levels(&self, index: usize) -> Vec<String> {
        self.counts
            .keys()
            .filter_map(|k| k.get(index).cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

fn same_columns(a: &[String], b: &[String]) -> bool {
    a.len() == b.len() && a.iter().all(|c| b.contains(c))
}

/// Index into `from` for each column of `to`.
fn reorder(from: &[String], to: &[String]) -> Vec<usize> {
    to.iter()
        .map(|c| from.iter().position(|f| f == c).unwrap_or(0))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_from_rows() {
        let rows = json!([
            {"gender": "F", "smoker": "yes", "n": 10},
            {"gender": "F", "smoker": "no", "n": 0},
            {"gender": "M", "smoker": "yes", "n": 7.0}
        ]);
        let table = ContingencyTable::from_rows(rows.as_array().unwrap()).unwrap();

        assert_eq!(table.counts.len(), 3);
        assert_eq!(table.counts.get(&key(&["F", "no"])), Some(&0));
        assert_eq!(table.counts.get(&key(&["M", "yes"])), Some(&7));
        assert_eq!(table.total(), 17);
    }

    #[test]
    fn test_columns_keep_selected_order() {
        let rows = json!([{"smoker": "yes", "gender": "F", "n": 1}]);
        let table = ContingencyTable::from_rows(rows.as_array().unwrap()).unwrap();

        assert_eq!(table.columns, key(&["smoker", "gender"]));
        assert_eq!(table.counts.get(&key(&["yes", "F"])), Some(&1));
        assert_eq!(table.levels(0), key(&["yes"]));
    }

    #[test]
    fn test_rejects_missing_count() {
        let rows = json!([{"gender": "F"}]);
        assert!(ContingencyTable::from_rows(rows.as_array().unwrap()).is_err());
    }

    #[test]
    fn test_merge_keeps_zero_rows_and_sums() {
        let a = ContingencyTable::from_rows(
            json!([{"g": "F", "s": "yes", "n": 3}, {"g": "M", "s": "no", "n": 0}])
                .as_array()
                .unwrap(),
        )
        .unwrap();
        let b = ContingencyTable::from_rows(
            json!([{"g": "F", "s": "yes", "n": 4}, {"g": "F", "s": "no", "n": 2}])
                .as_array()
                .unwrap(),
        )
        .unwrap();

        let merged = ContingencyTable::merge([&a, &b]).unwrap();
        assert_eq!(merged.counts.get(&key(&["F", "yes"])), Some(&7));
        assert_eq!(merged.counts.get(&key(&["F", "no"])), Some(&2));
        assert_eq!(merged.counts.get(&key(&["M", "no"])), Some(&0));
        assert_eq!(merged.counts.len(), 3);
    }

    #[test]
    fn test_merge_realigns_column_order() {
        let a = ContingencyTable {
            columns: key(&["a", "b"]),
            counts: [(key(&["1", "x"]), 2)].into_iter().collect(),
        };
        let b = ContingencyTable {
            columns: key(&["b", "a"]),
            counts: [(key(&["x", "1"]), 5)].into_iter().collect(),
        };
        let merged = ContingencyTable::merge([&a, &b]).unwrap();
        assert_eq!(merged.counts.get(&key(&["1", "x"])), Some(&7));
    }

    #[test]
    fn test_merge_rejects_different_columns() {
        let a = ContingencyTable {
            columns: key(&["a"]),
            counts: [(key(&["1"]), 1)].into_iter().collect(),
        };
        let b = ContingencyTable {
            columns: key(&["z"]),
            counts: [(key(&["1"]), 1)].into_iter().collect(),
        };
        assert!(ContingencyTable::merge([&a, &b]).is_err());
    }

    #[test]
    fn test_empty_table_merges_with_anything() {
        let a = ContingencyTable::default();
        let b = ContingencyTable {
            columns: key(&["a"]),
            counts: [(key(&["1"]), 1)].into_iter().collect(),
        };
        let merged = ContingencyTable::merge([&a, &b]).unwrap();
        assert_eq!(merged, b);
    }

    #[test]
    fn test_serde_shape() {
        let table = ContingencyTable {
            columns: key(&["a"]),
            counts: [(key(&["1"]), 4)].into_iter().collect(),
        };
        let json = serde_json::to_value(&table).unwrap();
        assert_eq!(json["rows"][0]["n"], 4);
        let back: ContingencyTable = serde_json::from_value(json).unwrap();
        assert_eq!(back, table);
    }
}
