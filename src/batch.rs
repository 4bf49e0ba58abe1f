//! Row batches and column normalization.
//!
//! A [`RowBatch`] is the self-describing tabular payload shipped to the
//! destination: column names plus rows of JSON values. An empty batch is
//! valid and round-trips cheaply.
//!
//! # Normalization
//!
//! Telemetry sources return per-minute aggregates with their own naming
//! conventions. Before a batch is shipped, [`normalize`]:
//!
//! - renames the source time column (`time`) to the canonical
//!   `TIMESTAMP`,
//! - strips the aggregation-function prefix (`mean_`) from value
//!   columns,
//! - reformats RFC 3339 timestamps (`2024-07-30T20:01:48Z`) to the
//!   destination format `2024-07-30 20:01:48`.
//!
//! Values that are already in destination format are left untouched, so
//! normalization is idempotent.

use crate::error::{RelayError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::trace;

/// Canonical name of the time column at the destination.
pub const TIME_COLUMN: &str = "TIMESTAMP";

/// Source-side name of the time column.
pub const SOURCE_TIME_COLUMN: &str = "time";

/// Aggregation prefix the source attaches to value columns.
pub const AGGREGATE_PREFIX: &str = "mean_";

/// A self-describing tabular batch: column names plus rows.
///
/// Row width must equal the column count; [`RowBatch::validate`] checks
/// this before a batch crosses the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RowBatch {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl RowBatch {
    /// Create a batch with the given columns and no rows.
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// The empty batch: no columns, no rows. Valid on the wire.
    pub fn empty() -> Self {
        Self {
            columns: Vec::new(),
            rows: Vec::new(),
        }
    }

    /// Append a row, enforcing the width invariant.
    pub fn push_row(&mut self, row: Vec<Value>) -> Result<()> {
        if row.len() != self.columns.len() {
            return Err(RelayError::Internal(format!(
                "row width {} does not match {} columns",
                row.len(),
                self.columns.len()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Index of a column by name.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Check the width invariant over every row.
    pub fn validate(&self) -> Result<()> {
        for (i, row) in self.rows.iter().enumerate() {
            if row.len() != self.columns.len() {
                return Err(RelayError::Internal(format!(
                    "row {} has width {}, expected {}",
                    i,
                    row.len(),
                    self.columns.len()
                )));
            }
        }
        Ok(())
    }
}

/// Normalize a source batch in place for the destination.
///
/// See the module docs for the three rewrites. Unrecognized timestamp
/// values are passed through unchanged (the destination will reject them
/// with context if they are truly bad).
pub fn normalize(batch: &mut RowBatch) {
    let mut time_idx = None;
    for (i, col) in batch.columns.iter_mut().enumerate() {
        if col == SOURCE_TIME_COLUMN || col == TIME_COLUMN {
            *col = TIME_COLUMN.to_string();
            time_idx = Some(i);
        } else if let Some(stripped) = col.strip_prefix(AGGREGATE_PREFIX) {
            *col = stripped.to_string();
        }
    }

    let Some(time_idx) = time_idx else {
        return;
    };

    for row in &mut batch.rows {
        let Some(cell) = row.get_mut(time_idx) else {
            continue;
        };
        if let Value::String(s) = cell {
            if let Some(rewritten) = normalize_timestamp(s) {
                *cell = Value::String(rewritten);
            } else {
                trace!(value = %s, "time value left unnormalized");
            }
        }
    }
}

/// Rewrite one timestamp string to destination format.
///
/// Returns `None` when the input is neither RFC 3339 nor already in
/// destination format.
fn normalize_timestamp(s: &str) -> Option<String> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        let utc: DateTime<Utc> = ts.with_timezone(&Utc);
        return Some(crate::envelope::format_wire_timestamp(utc));
    }
    // Already normalized?
    if crate::envelope::parse_wire_timestamp(s).is_ok() {
        return Some(s.to_string());
    }
    None
}
