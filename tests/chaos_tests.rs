// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Chaos tests: simulate failures and verify graceful degradation.
//!
//! These tests run the full scheduler against an in-memory destination
//! bridge with injectable faults - no broker required. They verify the
//! system handles failures gracefully without panics, deadlocks, or
//! stuck sources.
//!
//! Run with: cargo test --test chaos_tests -- --nocapture

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use telemetry_relay::batch::{RowBatch, TIME_COLUMN};
use telemetry_relay::config::RelayConfig;
use telemetry_relay::envelope::parse_wire_timestamp;
use telemetry_relay::error::RelayError;
use telemetry_relay::rpc::{BoxFuture, DbBridge, InsertAck, RpcReply};
use telemetry_relay::source::{FixedSource, StaticTableMapper, TelemetrySource};
use telemetry_relay::transport::LinkKind;
use telemetry_relay::{EngineState, RelayEngine};

fn t(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 7, 30, 12, 0, 0).unwrap() + ChronoDuration::minutes(minute as i64)
}

/// In-memory destination: behaves like the real service (the stored
/// cursor advances only when an insert lands), with injectable faults.
struct FaultyDestination {
    /// table → last persisted timestamp
    cursors: Mutex<HashMap<String, DateTime<Utc>>>,
    /// table → total rows received
    rows: Mutex<HashMap<String, u64>>,
    /// Tables that always time out.
    dead_tables: Mutex<Vec<String>>,
    /// Fail this many calls (any table) before recovering.
    fail_next: AtomicU32,
}

impl FaultyDestination {
    fn new() -> Self {
        Self {
            cursors: Mutex::new(HashMap::new()),
            rows: Mutex::new(HashMap::new()),
            dead_tables: Mutex::new(Vec::new()),
            fail_next: AtomicU32::new(0),
        }
    }

    fn set_cursor(&self, table: &str, ts: DateTime<Utc>) {
        self.cursors.lock().unwrap().insert(table.to_string(), ts);
    }

    fn kill_table(&self, table: &str) {
        self.dead_tables.lock().unwrap().push(table.to_string());
    }

    fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    fn rows_for(&self, table: &str) -> u64 {
        self.rows.lock().unwrap().get(table).copied().unwrap_or(0)
    }

    fn check_faults(&self, table: &str) -> Result<(), RelayError> {
        if self.dead_tables.lock().unwrap().iter().any(|t| t == table) {
            return Err(RelayError::Timeout {
                operation: "last_timestamp".to_string(),
                elapsed: Duration::from_millis(1),
            });
        }
        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next.store(remaining - 1, Ordering::SeqCst);
            return Err(RelayError::Protocol("injected fault".to_string()));
        }
        Ok(())
    }
}

impl DbBridge for FaultyDestination {
    fn last_timestamp(&self, table: &str) -> BoxFuture<'_, RpcReply<Option<DateTime<Utc>>>> {
        let table = table.to_string();
        Box::pin(async move {
            self.check_faults(&table)?;
            let value = self.cursors.lock().unwrap().get(&table).copied();
            Ok(RpcReply {
                value,
                delivery: LinkKind::Primary,
            })
        })
    }

    fn insert_batch(&self, table: &str, batch: RowBatch) -> BoxFuture<'_, RpcReply<InsertAck>> {
        let table = table.to_string();
        Box::pin(async move {
            self.check_faults(&table)?;
            let rows_written = batch.len() as u64;

            // Advance the cursor the way MAX(TIMESTAMP) would.
            if let Some(idx) = batch.column_index(TIME_COLUMN) {
                let newest = batch
                    .rows
                    .iter()
                    .filter_map(|row| row.get(idx))
                    .filter_map(|v| v.as_str())
                    .filter_map(|s| parse_wire_timestamp(s).ok())
                    .max();
                if let Some(ts) = newest {
                    let mut cursors = self.cursors.lock().unwrap();
                    let entry = cursors.entry(table.clone()).or_insert(ts);
                    if ts > *entry {
                        *entry = ts;
                    }
                }
            }

            *self.rows.lock().unwrap().entry(table).or_insert(0) += rows_written;
            Ok(RpcReply {
                value: InsertAck { rows_written },
                delivery: LinkKind::Primary,
            })
        })
    }
}

/// Opt into log output with RUST_LOG=debug and --nocapture.
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn fast_config() -> RelayConfig {
    let mut config = RelayConfig::for_testing("chaos");
    config.settings.sync.poll_interval = "50ms".to_string();
    config.settings.sync.catch_up_interval = "10ms".to_string();
    config
}

fn engine_with(
    destination: Arc<FaultyDestination>,
    source: FixedSource,
    tables: &[(&str, &str)],
    config: RelayConfig,
) -> RelayEngine<FaultyDestination> {
    init_logging();
    let map: HashMap<String, String> = tables
        .iter()
        .map(|(m, t)| (m.to_string(), t.to_string()))
        .collect();
    let sources: Vec<Arc<dyn TelemetrySource>> = vec![Arc::new(source)];
    RelayEngine::with_bridge(
        config,
        destination,
        sources,
        Arc::new(StaticTableMapper::new(map)),
    )
}

// =============================================================================
// Fault Isolation
// =============================================================================

/// One dead table must not starve the source's other measurements.
#[tokio::test]
async fn dead_table_does_not_starve_others() {
    let destination = Arc::new(FaultyDestination::new());
    destination.set_cursor("BMS_TABLE", t(0));
    destination.set_cursor("GRID_TABLE", t(0));
    destination.kill_table("BMS_TABLE");

    let source = FixedSource::new("logger-1");
    source.add_samples("bms", &[(t(1), 48.0), (t(2), 48.1)]);
    source.add_samples("grid", &[(t(1), 230.0), (t(2), 231.0)]);

    let mut engine = engine_with(
        Arc::clone(&destination),
        source,
        &[("bms", "BMS_TABLE"), ("grid", "GRID_TABLE")],
        fast_config(),
    );
    engine.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    let health = engine.health_check().await;
    engine.shutdown().await;

    // grid replicated despite bms timing out every cycle.
    assert_eq!(destination.rows_for("GRID_TABLE"), 2);
    assert_eq!(destination.rows_for("BMS_TABLE"), 0);
    assert!(health.sources[0].measurements_skipped >= 1);
    assert!(health.sources[0].measurements_synced >= 1);
    assert_eq!(health.state, EngineState::Running);
}

/// Transient destination faults delay replication but never lose it.
#[tokio::test]
async fn transient_faults_recover_without_restart() {
    let destination = Arc::new(FaultyDestination::new());
    destination.set_cursor("BMS_TABLE", t(0));
    destination.fail_next(3);

    let source = FixedSource::new("logger-1");
    source.add_samples("bms", &[(t(1), 48.0), (t(2), 48.1)]);

    let mut engine = engine_with(
        Arc::clone(&destination),
        source,
        &[("bms", "BMS_TABLE")],
        fast_config(),
    );
    engine.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(800)).await;
    engine.shutdown().await;

    // Faults burned a few cycles; the data still arrived.
    assert_eq!(destination.rows_for("BMS_TABLE"), 2);
}

/// An unmapped measurement is skipped forever without blocking the rest.
#[tokio::test]
async fn unmapped_measurement_is_skipped() {
    let destination = Arc::new(FaultyDestination::new());
    destination.set_cursor("BMS_TABLE", t(0));

    let source = FixedSource::new("logger-1");
    source.add_samples("bms", &[(t(1), 48.0)]);
    source.add_samples("mystery", &[(t(1), 1.0)]);

    let mut engine = engine_with(
        Arc::clone(&destination),
        source,
        &[("bms", "BMS_TABLE")],
        fast_config(),
    );
    engine.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    let health = engine.health_check().await;
    engine.shutdown().await;

    assert_eq!(destination.rows_for("BMS_TABLE"), 1);
    assert!(health.sources[0].measurements_skipped >= 1);
}

// =============================================================================
// Catch-Up Behavior
// =============================================================================

/// A backlog beyond one window span drains via catch-up mode: the
/// scheduler re-polls at the minimal interval until caught up.
#[tokio::test]
async fn catch_up_drains_multi_window_backlog() {
    let destination = Arc::new(FaultyDestination::new());
    destination.set_cursor("BMS_TABLE", t(0));

    // Three hours of backlog against a one hour span: at least three
    // windows, only reachable in time through catch-up mode (the normal
    // poll interval is set prohibitively long).
    let source = FixedSource::new("logger-1");
    let samples: Vec<_> = (1..=180u32).map(|m| (t(m), m as f64)).collect();
    source.add_samples("bms", &samples);

    let mut config = fast_config();
    config.settings.sync.poll_interval = "3600s".to_string();
    config.settings.sync.max_window_span = "1h".to_string();

    let mut engine = engine_with(
        Arc::clone(&destination),
        source,
        &[("bms", "BMS_TABLE")],
        config,
    );
    engine.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(800)).await;
    let health = engine.health_check().await;
    engine.shutdown().await;

    assert_eq!(destination.rows_for("BMS_TABLE"), 180);
    assert!(health.sources[0].cycles_completed >= 3);
    // Backlog drained: the task settled back to the normal interval.
    assert!(!health.sources[0].catch_up);
}

/// Catch-up mode ends exactly when the backlog fits one window again.
#[tokio::test]
async fn catch_up_flag_clears_after_drain() {
    let destination = Arc::new(FaultyDestination::new());
    destination.set_cursor("BMS_TABLE", t(0));

    let source = FixedSource::new("logger-1");
    let samples: Vec<_> = (1..=90u32).map(|m| (t(m), m as f64)).collect();
    source.add_samples("bms", &samples);

    let mut engine = engine_with(
        Arc::clone(&destination),
        source,
        &[("bms", "BMS_TABLE")],
        fast_config(),
    );
    engine.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    let health = engine.health_check().await;
    engine.shutdown().await;

    assert_eq!(destination.rows_for("BMS_TABLE"), 90);
    assert!(!health.sources[0].catch_up);
}

// =============================================================================
// Lifecycle
// =============================================================================

/// Shutdown during a long idle wait must not hang until the interval.
#[tokio::test]
async fn shutdown_is_prompt_during_long_idle() {
    let destination = Arc::new(FaultyDestination::new());
    let source = FixedSource::new("logger-1");
    source.add_samples("bms", &[(t(1), 48.0)]);
    destination.set_cursor("BMS_TABLE", t(1));

    let mut config = fast_config();
    config.settings.sync.poll_interval = "900s".to_string();

    let mut engine = engine_with(
        Arc::clone(&destination),
        source,
        &[("bms", "BMS_TABLE")],
        config,
    );
    engine.start().await.unwrap();
    // Let the first cycle finish and the task park on the 900s sleep.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let started = std::time::Instant::now();
    engine.shutdown().await;
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(engine.state(), EngineState::Stopped);
}

/// Two sources share one bridge without interfering.
#[tokio::test]
async fn independent_sources_replicate_concurrently() {
    let destination = Arc::new(FaultyDestination::new());
    destination.set_cursor("A_TABLE", t(0));
    destination.set_cursor("B_TABLE", t(0));

    let source_a = FixedSource::new("logger-a");
    source_a.add_samples("alpha", &[(t(1), 1.0), (t(2), 2.0)]);
    let source_b = FixedSource::new("logger-b");
    source_b.add_samples("beta", &[(t(1), 10.0), (t(2), 20.0), (t(3), 30.0)]);

    let map: HashMap<String, String> = [
        ("alpha".to_string(), "A_TABLE".to_string()),
        ("beta".to_string(), "B_TABLE".to_string()),
    ]
    .into_iter()
    .collect();
    let sources: Vec<Arc<dyn TelemetrySource>> =
        vec![Arc::new(source_a), Arc::new(source_b)];

    let mut engine = RelayEngine::with_bridge(
        fast_config(),
        Arc::clone(&destination),
        sources,
        Arc::new(StaticTableMapper::new(map)),
    );
    engine.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    let health = engine.health_check().await;
    engine.shutdown().await;

    assert_eq!(destination.rows_for("A_TABLE"), 2);
    assert_eq!(destination.rows_for("B_TABLE"), 3);
    assert_eq!(health.sources.len(), 2);
}
