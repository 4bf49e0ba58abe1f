//! Sync windows and cursors.
//!
//! A [`SyncWindow`] is the `[start, end]` slice of source time a single
//! cycle replicates. Windows are clamped to a maximum span so one insert
//! never carries more than a bounded payload; when the clamp truncates
//! the backlog, the pair enters catch-up mode and the scheduler re-polls
//! at the minimal interval instead of the normal one.
//!
//! The per-(source, measurement) [`SyncCursor`] lives only in scheduler
//! memory. The destination is the source of truth for "last persisted":
//! the cursor is re-derived from it every cycle, so a partially failed
//! insert can never cause silent drift.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;

/// A bounded slice of source time to replicate.
///
/// Invariants: `start <= end` and `end - start <= max_span`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl SyncWindow {
    /// Compute the next window for a pair.
    ///
    /// Returns `None` when the source has nothing newer than
    /// `last_persisted`. Otherwise returns the window and whether the
    /// clamp left a backlog (`end < latest_available`, i.e. catch-up
    /// mode must continue).
    pub fn compute(
        last_persisted: DateTime<Utc>,
        latest_available: DateTime<Utc>,
        max_span: Duration,
    ) -> Option<(SyncWindow, bool)> {
        if latest_available <= last_persisted {
            return None;
        }

        let span = ChronoDuration::from_std(max_span).unwrap_or_else(|_| ChronoDuration::hours(1));
        let capped = last_persisted + span;
        let end = std::cmp::min(latest_available, capped);
        let catch_up = end < latest_available;

        Some((
            SyncWindow {
                start: last_persisted,
                end,
            },
            catch_up,
        ))
    }

    /// Span of this window.
    pub fn span(&self) -> ChronoDuration {
        self.end - self.start
    }
}

/// Per-(source, measurement) replication progress, re-derived each cycle.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncCursor {
    /// Authoritative answer from the destination, fetched via RPC.
    pub last_persisted: Option<DateTime<Utc>>,
    /// Newest sample the source holds.
    pub latest_available: Option<DateTime<Utc>>,
    /// Whether the last window was clamped short of the backlog.
    pub catch_up: bool,
}
