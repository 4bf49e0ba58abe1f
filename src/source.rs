// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Telemetry source and table mapping traits.
//!
//! Defines the boundary to the systems the scheduler reads from. The
//! host daemon provides implementations (e.g. an InfluxDB-backed source);
//! [`FixedSource`] is an in-memory implementation for tests and
//! standalone runs.
//!
//! # Example
//!
//! ```rust,no_run
//! use telemetry_relay::source::{TelemetrySource, SourceResult, BoxFuture};
//! use telemetry_relay::batch::RowBatch;
//! use chrono::{DateTime, Utc};
//!
//! struct MyLogger { /* ... */ }
//!
//! impl TelemetrySource for MyLogger {
//!     fn source_id(&self) -> &str {
//!         "logger-1"
//!     }
//!
//!     fn list_measurements(&self) -> BoxFuture<'_, Vec<String>> {
//!         Box::pin(async move { Ok(vec!["bms".to_string()]) })
//!     }
//!
//!     fn earliest_timestamp(&self, _m: &str) -> BoxFuture<'_, Option<DateTime<Utc>>> {
//!         Box::pin(async move { Ok(None) })
//!     }
//!
//!     fn latest_timestamp(&self, _m: &str) -> BoxFuture<'_, Option<DateTime<Utc>>> {
//!         Box::pin(async move { Ok(None) })
//!     }
//!
//!     fn query_window(
//!         &self,
//!         _m: &str,
//!         _start: DateTime<Utc>,
//!         _end: DateTime<Utc>,
//!     ) -> BoxFuture<'_, RowBatch> {
//!         Box::pin(async move { Ok(RowBatch::empty()) })
//!     }
//! }
//! ```

use crate::batch::RowBatch;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

/// Result type for source operations.
pub type SourceResult<T> = std::result::Result<T, SourceError>;

/// Boxed future, so [`TelemetrySource`] stays object-safe.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = SourceResult<T>> + Send + 'a>>;

/// Simplified error for telemetry source operations.
#[derive(Debug, Clone)]
pub struct SourceError(pub String);

impl std::fmt::Display for SourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for SourceError {}

/// Trait defining what the scheduler needs from a telemetry source.
///
/// Implementations query per-minute aggregated values; `query_window`
/// returns rows with timestamps in `(start, end]`; the row at `start`
/// is the one the destination already has.
pub trait TelemetrySource: Send + Sync + 'static {
    /// The source's unique ID (for logging and metrics).
    fn source_id(&self) -> &str;

    /// Enumerate the measurements this source currently holds.
    fn list_measurements(&self) -> BoxFuture<'_, Vec<String>>;

    /// Oldest sample timestamp for a measurement, `None` if it has no data.
    ///
    /// Used when the destination has no prior rows: replication starts
    /// from the earliest available sample.
    fn earliest_timestamp(&self, measurement: &str) -> BoxFuture<'_, Option<DateTime<Utc>>>;

    /// Newest sample timestamp for a measurement, `None` if it has no data.
    fn latest_timestamp(&self, measurement: &str) -> BoxFuture<'_, Option<DateTime<Utc>>>;

    /// Aggregated values for `(start, end]` as a raw (unnormalized) batch.
    fn query_window(
        &self,
        measurement: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> BoxFuture<'_, RowBatch>;

    /// Tear down the underlying connection.
    ///
    /// Called after a failed cycle so the next cycle starts from a fresh
    /// connection. Default is a no-op for stateless implementations.
    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}

/// Resolves a source measurement name to its destination table.
pub trait TableMapper: Send + Sync + 'static {
    /// `None` means the measurement has no destination and is skipped.
    fn resolve_table(&self, measurement: &str) -> Option<String>;
}

/// Table mapping from a fixed name → table map (normally built from
/// configuration).
pub struct StaticTableMapper {
    map: HashMap<String, String>,
}

impl StaticTableMapper {
    pub fn new(map: HashMap<String, String>) -> Self {
        Self { map }
    }
}

impl TableMapper for StaticTableMapper {
    fn resolve_table(&self, measurement: &str) -> Option<String> {
        self.map.get(measurement).cloned()
    }
}

/// In-memory telemetry source for tests and standalone mode.
///
/// Holds per-measurement sample series keyed by timestamp. Queries
/// return batches in the raw source shape: a `time` column with
/// RFC 3339 strings and `mean_`-prefixed value columns, the way a real
/// aggregating source would.
pub struct FixedSource {
    source_id: String,
    /// measurement → (timestamp → value)
    samples: Mutex<HashMap<String, BTreeMap<DateTime<Utc>, f64>>>,
    value_column: String,
}

impl FixedSource {
    pub fn new(source_id: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            samples: Mutex::new(HashMap::new()),
            value_column: "mean_value".to_string(),
        }
    }

    /// Add samples to a measurement (creating it if needed).
    pub fn add_samples(&self, measurement: &str, samples: &[(DateTime<Utc>, f64)]) {
        let mut guard = self.samples.lock().expect("samples lock poisoned");
        let series = guard.entry(measurement.to_string()).or_default();
        for (ts, value) in samples {
            series.insert(*ts, *value);
        }
    }

    fn with_series<T>(
        &self,
        measurement: &str,
        f: impl FnOnce(&BTreeMap<DateTime<Utc>, f64>) -> T,
    ) -> Option<T> {
        let guard = self.samples.lock().expect("samples lock poisoned");
        guard.get(measurement).map(|series| f(series))
    }
}

impl TelemetrySource for FixedSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn list_measurements(&self) -> BoxFuture<'_, Vec<String>> {
        Box::pin(async move {
            let guard = self.samples.lock().expect("samples lock poisoned");
            let mut names: Vec<String> = guard.keys().cloned().collect();
            names.sort();
            Ok(names)
        })
    }

    fn earliest_timestamp(&self, measurement: &str) -> BoxFuture<'_, Option<DateTime<Utc>>> {
        let measurement = measurement.to_string();
        Box::pin(async move {
            Ok(self
                .with_series(&measurement, |s| s.keys().next().copied())
                .flatten())
        })
    }

    fn latest_timestamp(&self, measurement: &str) -> BoxFuture<'_, Option<DateTime<Utc>>> {
        let measurement = measurement.to_string();
        Box::pin(async move {
            Ok(self
                .with_series(&measurement, |s| s.keys().next_back().copied())
                .flatten())
        })
    }

    fn query_window(
        &self,
        measurement: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> BoxFuture<'_, RowBatch> {
        let measurement = measurement.to_string();
        Box::pin(async move {
            let rows = self
                .with_series(&measurement, |series| {
                    series
                        .iter()
                        .filter(|(ts, _)| **ts > start && **ts <= end)
                        .map(|(ts, value)| {
                            vec![
                                json!(ts.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)),
                                json!(value),
                            ]
                        })
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();

            Ok(RowBatch {
                columns: vec!["time".to_string(), self.value_column.clone()],
                rows,
            })
        })
    }
}
