// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-source sync loop.
//!
//! Each configured telemetry source gets a dedicated task that:
//! 1. Enumerates the source's measurements
//! 2. Resolves each measurement's destination table (unmapped → skipped)
//! 3. Asks the destination for the last persisted timestamp (via RPC)
//! 4. Asks the source for its latest available timestamp
//! 5. Computes a bounded sync window and fetches it from the source
//! 6. Normalizes the batch and ships it with `insert_batch`
//! 7. Writes the liveness heartbeat after the cycle
//!
//! Steps within one task are strictly sequential; tasks for different
//! sources run concurrently and share only the RPC bridge.
//!
//! # Failure Granularity
//!
//! A bridge error (timeout, protocol, transport) aborts only that
//! measurement's step for the cycle; the remaining measurements still
//! run. A source error additionally closes the source connection so the
//! next cycle starts fresh. Nothing here terminates the process.
//!
//! # Catch-Up Mode
//!
//! When any measurement's window was clamped short of the backlog, the
//! task skips the normal poll interval and re-polls after the minimal
//! catch-up interval until the backlog drains.
//!
//! # Graceful Shutdown
//!
//! The interval sleep races the shutdown signal via `tokio::select!`,
//! so a task waiting out a 900 second interval still stops promptly.

use crate::error::{RelayError, Result};
use crate::heartbeat::Heartbeat;
use crate::metrics;
use crate::rpc::DbBridge;
use crate::source::{TableMapper, TelemetrySource};
use crate::window::SyncWindow;
use chrono::Duration as ChronoDuration;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn, Instrument};

use super::types::{CyclePhase, SourceStatus};

/// Everything a source task needs besides the source itself.
pub struct SourceTaskContext<B: DbBridge> {
    pub bridge: Arc<B>,
    pub mapper: Arc<dyn TableMapper>,
    pub heartbeat: Arc<Heartbeat>,
    pub status: Arc<SourceStatus>,
    pub poll_interval: Duration,
    pub catch_up_interval: Duration,
    pub max_window_span: Duration,
}

/// What one cycle accomplished.
#[derive(Debug, Default)]
struct CycleOutcome {
    synced: usize,
    skipped: usize,
    rows: u64,
    catch_up: bool,
}

/// What one measurement's step accomplished.
struct StepOutcome {
    rows: u64,
    catch_up: bool,
}

/// Run the sync loop for a single source until shutdown is signaled.
pub async fn run_sync_loop<B: DbBridge>(
    source: Arc<dyn TelemetrySource>,
    ctx: SourceTaskContext<B>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let source_id = source.source_id().to_string();
    let span = tracing::info_span!("sync", source_id = %source_id);

    async move {
        info!("Starting sync loop");

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let cycle_started = Instant::now();
            ctx.status.set_phase(CyclePhase::Querying);

            let catch_up = match run_cycle(source.as_ref(), &ctx).await {
                Ok(outcome) => {
                    ctx.status
                        .record_cycle(outcome.synced, outcome.skipped, outcome.rows);
                    metrics::record_cycle(
                        &source_id,
                        outcome.synced,
                        outcome.skipped,
                        cycle_started.elapsed(),
                    );
                    debug!(
                        synced = outcome.synced,
                        skipped = outcome.skipped,
                        rows = outcome.rows,
                        catch_up = outcome.catch_up,
                        "Sync cycle complete"
                    );

                    if let Err(e) = ctx.heartbeat.beat().await {
                        warn!(error = %e, "Heartbeat write failed");
                    }
                    outcome.catch_up
                }
                Err(e) => {
                    warn!(error = %e, error_kind = e.kind(), "Sync cycle failed");
                    // Drop the source connection so the next cycle
                    // reconnects instead of reusing a broken handle.
                    if let Err(close_err) = source.close().await {
                        debug!(error = %close_err, "Source close after failed cycle");
                    }
                    false
                }
            };

            ctx.status.set_catch_up(catch_up);
            metrics::set_catch_up(&source_id, catch_up);

            let wait = if catch_up {
                ctx.status.set_phase(CyclePhase::CatchUp);
                ctx.catch_up_interval
            } else {
                ctx.status.set_phase(CyclePhase::Idle);
                ctx.poll_interval
            };

            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }

        info!("Sync loop stopped");
    }
    .instrument(span)
    .await
}

/// One sync cycle: every measurement the source currently has.
///
/// Returns `Err` only when the source itself is unusable (enumeration
/// failed); per-measurement errors downgrade to skips.
async fn run_cycle<B: DbBridge>(
    source: &dyn TelemetrySource,
    ctx: &SourceTaskContext<B>,
) -> Result<CycleOutcome> {
    let source_id = source.source_id();
    let measurements = source
        .list_measurements()
        .await
        .map_err(|e| RelayError::source(source_id, e))?;

    let mut outcome = CycleOutcome::default();
    let mut source_failed = false;

    for measurement in &measurements {
        match sync_measurement(source, ctx, measurement).await {
            Ok(step) => {
                outcome.synced += 1;
                outcome.rows += step.rows;
                outcome.catch_up |= step.catch_up;
            }
            Err(e) => {
                outcome.skipped += 1;
                warn!(
                    measurement = %measurement,
                    error = %e,
                    error_kind = e.kind(),
                    "Measurement skipped this cycle"
                );
                metrics::record_measurement_skipped(source_id, e.kind());
                if matches!(e, RelayError::Source { .. }) {
                    source_failed = true;
                }
            }
        }
    }

    if source_failed {
        // Reconnect next cycle; the remaining measurements already ran
        // against whatever state the connection was in.
        if let Err(e) = source.close().await {
            debug!(error = %e, "Source close after in-cycle failure");
        }
    }

    Ok(outcome)
}

/// Replicate one measurement's next window.
async fn sync_measurement<B: DbBridge>(
    source: &dyn TelemetrySource,
    ctx: &SourceTaskContext<B>,
    measurement: &str,
) -> Result<StepOutcome> {
    let source_id = source.source_id();
    let table = ctx
        .mapper
        .resolve_table(measurement)
        .ok_or_else(|| RelayError::UnmappedMeasurement(measurement.to_string()))?;

    ctx.status.set_phase(CyclePhase::Querying);

    let last_reply = ctx.bridge.last_timestamp(&table).await?;
    if last_reply.is_degraded() {
        warn!(table = %table, "Last-timestamp query answered via secondary link");
    }

    let start = match last_reply.value {
        Some(ts) => ts,
        None => {
            // Destination has no rows yet: replicate from the earliest
            // available sample. Nudge the cursor one second back so the
            // window's exclusive start does not drop the first sample.
            match source
                .earliest_timestamp(measurement)
                .await
                .map_err(|e| RelayError::source(source_id, e))?
            {
                Some(earliest) => earliest - ChronoDuration::seconds(1),
                None => {
                    debug!(measurement, "Source has no samples yet");
                    return Ok(StepOutcome {
                        rows: 0,
                        catch_up: false,
                    });
                }
            }
        }
    };

    let latest = match source
        .latest_timestamp(measurement)
        .await
        .map_err(|e| RelayError::source(source_id, e))?
    {
        Some(ts) => ts,
        None => {
            debug!(measurement, "Source has no samples yet");
            return Ok(StepOutcome {
                rows: 0,
                catch_up: false,
            });
        }
    };

    ctx.status.set_phase(CyclePhase::Windowing);

    let Some((window, catch_up)) = SyncWindow::compute(start, latest, ctx.max_window_span) else {
        debug!(measurement, "Destination already caught up");
        return Ok(StepOutcome {
            rows: 0,
            catch_up: false,
        });
    };

    ctx.status.set_phase(CyclePhase::Transmitting);

    let mut batch = source
        .query_window(measurement, window.start, window.end)
        .await
        .map_err(|e| RelayError::source(source_id, e))?;
    crate::batch::normalize(&mut batch);
    let batch_len = batch.len();

    // An empty window result still round-trips: the ack confirms the
    // destination is reachable and the cursor simply doesn't move.
    let ack = ctx.bridge.insert_batch(&table, batch).await?;
    if ack.is_degraded() {
        warn!(table = %table, "Batch delivered via secondary link");
    }

    debug!(
        measurement,
        table = %table,
        window_start = %window.start,
        window_end = %window.end,
        batch_rows = batch_len,
        rows_written = ack.value.rows_written,
        catch_up,
        "Window replicated"
    );
    metrics::record_rows_replicated(source_id, &table, ack.value.rows_written);

    Ok(StepOutcome {
        rows: ack.value.rows_written,
        catch_up,
    })
}
