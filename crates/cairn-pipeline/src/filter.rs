//! Reversible post-hoc data filter.
//!
//! A filter is replayed against the pre-filter backup of a node's artifact
//! instead of re-invoking the analysis function. Only filter-derived fields
//! change: numeric matrices get their excluded cells masked with `null`, and
//! `filtered_stats` is recomputed over the kept region. Everything else is
//! copied from the backup untouched.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Key under which per-row statistics of the filtered matrices are stored.
pub const FILTERED_STATS_KEY: &str = "filtered_stats";

/// Half-open index range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRange {
    pub start: usize,
    pub end: usize,
}

impl IndexRange {
    pub fn contains(&self, i: usize) -> bool {
        i >= self.start && i < self.end
    }
}

/// Which indices to keep along each axis. An empty list keeps the whole axis.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataFilter {
    #[serde(default)]
    pub dim1: Vec<IndexRange>,
    #[serde(default)]
    pub dim2: Vec<IndexRange>,
    #[serde(default)]
    pub dim3: Vec<IndexRange>,
    #[serde(default)]
    pub roi: Vec<IndexRange>,
}

fn keeps(ranges: &[IndexRange], i: usize) -> bool {
    ranges.is_empty() || ranges.iter().any(|r| r.contains(i))
}

fn as_number_row(v: &Value) -> Option<&Vec<Value>> {
    v.as_array()
        .filter(|row| row.iter().all(|c| c.is_number() || c.is_null()))
}

fn is_matrix(v: &Value) -> bool {
    match v.as_array() {
        Some(rows) => !rows.is_empty() && rows.iter().all(|r| as_number_row(r).is_some()),
        None => false,
    }
}

fn is_volume(v: &Value) -> bool {
    match v.as_array() {
        Some(frames) => !frames.is_empty() && frames.iter().all(is_matrix),
        None => false,
    }
}

impl DataFilter {
    /// A filter with no ranges on any axis is the same as no filter.
    pub fn is_enabled(&self) -> bool {
        !(self.dim1.is_empty() && self.dim2.is_empty() && self.dim3.is_empty() && self.roi.is_empty())
    }

    /// Mask a `[roi][frame]` matrix.
    fn mask_matrix(&self, rows: &[Value]) -> Value {
        let masked = rows
            .iter()
            .enumerate()
            .map(|(r, row)| {
                let cells = row.as_array().map(Vec::as_slice).unwrap_or_default();
                let keep_row = keeps(&self.roi, r);
                Value::Array(
                    cells
                        .iter()
                        .enumerate()
                        .map(|(c, cell)| {
                            if keep_row && keeps(&self.dim3, c) {
                                cell.clone()
                            } else {
                                Value::Null
                            }
                        })
                        .collect(),
                )
            })
            .collect();
        Value::Array(masked)
    }

    /// Mask a `[frame][y][x]` volume.
    fn mask_volume(&self, frames: &[Value]) -> Value {
        let masked = frames
            .iter()
            .enumerate()
            .map(|(t, frame)| {
                let rows = frame.as_array().map(Vec::as_slice).unwrap_or_default();
                Value::Array(
                    rows.iter()
                        .enumerate()
                        .map(|(y, row)| {
                            let cells = row.as_array().map(Vec::as_slice).unwrap_or_default();
                            Value::Array(
                                cells
                                    .iter()
                                    .enumerate()
                                    .map(|(x, cell)| {
                                        if keeps(&self.dim3, t)
                                            && keeps(&self.dim2, y)
                                            && keeps(&self.dim1, x)
                                        {
                                            cell.clone()
                                        } else {
                                            Value::Null
                                        }
                                    })
                                    .collect(),
                            )
                        })
                        .collect(),
                )
            })
            .collect();
        Value::Array(masked)
    }

    /// Replay this filter over the values of a backup artifact.
    ///
    /// Returns the filtered value map; keys that are not numeric matrices or
    /// volumes are returned unchanged.
    pub fn apply(&self, values: &BTreeMap<String, Value>) -> BTreeMap<String, Value> {
        let mut out = BTreeMap::new();
        let mut stats = serde_json::Map::new();

        for (key, value) in values {
            if key == FILTERED_STATS_KEY {
                continue;
            }
            let filtered = if is_volume(value) {
                self.mask_volume(value.as_array().map(Vec::as_slice).unwrap_or_default())
            } else if is_matrix(value) {
                let masked =
                    self.mask_matrix(value.as_array().map(Vec::as_slice).unwrap_or_default());
                stats.insert(key.clone(), row_stats(&masked));
                masked
            } else {
                value.clone()
            };
            out.insert(key.clone(), filtered);
        }

        out.insert(FILTERED_STATS_KEY.to_string(), Value::Object(stats));
        out
    }
}

/// Per-row `{mean, std, count}` over non-null cells; `null` for empty rows.
fn row_stats(matrix: &Value) -> Value {
    let rows = matrix.as_array().map(Vec::as_slice).unwrap_or_default();
    Value::Array(
        rows.iter()
            .map(|row| {
                let kept: Vec<f64> = row
                    .as_array()
                    .map(|cells| cells.iter().filter_map(Value::as_f64).collect())
                    .unwrap_or_default();
                if kept.is_empty() {
                    return Value::Null;
                }
                let n = kept.len() as f64;
                let mean = kept.iter().sum::<f64>() / n;
                let var = kept.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
                json!({ "mean": mean, "std": var.sqrt(), "count": kept.len() })
            })
            .collect(),
    )
}
