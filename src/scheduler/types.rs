//! Engine and per-source state types.
//!
//! Defines the state machine for the relay engine lifecycle and the
//! per-source cycle phases.
//!
//! # Engine State Transitions
//!
//! ```text
//!                  start()
//! Created ───────────────────→ Connecting
//!    │                              │
//!    │ (already stopped)            │ (links connected)
//!    ↓                              ↓
//! Stopped                       Running
//!    ↑                              │
//!    │                    shutdown()│
//!    └────────────────── ShuttingDown
//!                              │
//!                    (no link could connect)
//!                              ↓
//!                           Failed
//! ```
//!
//! # Per-Source Cycle Phases
//!
//! ```text
//! Idle → Querying → Windowing → Transmitting → (Idle | CatchUp)
//!  ↑                                                  │
//!  └───────────── normal interval ←───────────────────┘
//!         CatchUp loops back to Querying after the minimal interval
//! ```

use crate::transport::LinkKind;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

/// State of the relay engine; transitions are diagrammed in the module
/// docs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Constructed; `start()` not yet called.
    Created,
    /// Connecting broker links.
    Connecting,
    /// Running: source tasks are cycling, reply listeners are up.
    Running,
    /// Shutting down gracefully; tasks are draining.
    ShuttingDown,
    /// Stopped cleanly. Safe to drop.
    Stopped,
    /// Failed to start (no broker link could be established).
    Failed,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Created => write!(f, "Created"),
            EngineState::Connecting => write!(f, "Connecting"),
            EngineState::Running => write!(f, "Running"),
            EngineState::ShuttingDown => write!(f, "ShuttingDown"),
            EngineState::Stopped => write!(f, "Stopped"),
            EngineState::Failed => write!(f, "Failed"),
        }
    }
}

/// Where a source task currently is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    /// Waiting out the normal poll interval.
    Idle,
    /// Asking the destination and the source for timestamps.
    Querying,
    /// Computing the sync window.
    Windowing,
    /// Fetching and shipping a batch.
    Transmitting,
    /// Backlog remains; waiting out the minimal interval only.
    CatchUp,
}

impl std::fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CyclePhase::Idle => write!(f, "Idle"),
            CyclePhase::Querying => write!(f, "Querying"),
            CyclePhase::Windowing => write!(f, "Windowing"),
            CyclePhase::Transmitting => write!(f, "Transmitting"),
            CyclePhase::CatchUp => write!(f, "CatchUp"),
        }
    }
}

/// Shared, cheaply-snapshotted counters for one source task.
///
/// The task writes, health checks read; no network I/O on either side.
pub struct SourceStatus {
    source_id: String,
    phase: Mutex<CyclePhase>,
    cycles_completed: AtomicU64,
    measurements_synced: AtomicU64,
    measurements_skipped: AtomicU64,
    rows_replicated: AtomicU64,
    catch_up: AtomicBool,
}

impl SourceStatus {
    pub fn new(source_id: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            phase: Mutex::new(CyclePhase::Idle),
            cycles_completed: AtomicU64::new(0),
            measurements_synced: AtomicU64::new(0),
            measurements_skipped: AtomicU64::new(0),
            rows_replicated: AtomicU64::new(0),
            catch_up: AtomicBool::new(false),
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn set_phase(&self, phase: CyclePhase) {
        *self.phase.lock().expect("phase lock poisoned") = phase;
    }

    pub fn phase(&self) -> CyclePhase {
        *self.phase.lock().expect("phase lock poisoned")
    }

    pub fn record_cycle(&self, synced: usize, skipped: usize, rows: u64) {
        self.cycles_completed.fetch_add(1, Ordering::Relaxed);
        self.measurements_synced
            .fetch_add(synced as u64, Ordering::Relaxed);
        self.measurements_skipped
            .fetch_add(skipped as u64, Ordering::Relaxed);
        self.rows_replicated.fetch_add(rows, Ordering::Relaxed);
    }

    pub fn set_catch_up(&self, catch_up: bool) {
        self.catch_up.store(catch_up, Ordering::Relaxed);
    }

    pub fn is_catch_up(&self) -> bool {
        self.catch_up.load(Ordering::Relaxed)
    }

    pub fn cycles_completed(&self) -> u64 {
        self.cycles_completed.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> SourceHealth {
        SourceHealth {
            source_id: self.source_id.clone(),
            phase: self.phase(),
            cycles_completed: self.cycles_completed.load(Ordering::Relaxed),
            measurements_synced: self.measurements_synced.load(Ordering::Relaxed),
            measurements_skipped: self.measurements_skipped.load(Ordering::Relaxed),
            rows_replicated: self.rows_replicated.load(Ordering::Relaxed),
            catch_up: self.is_catch_up(),
        }
    }
}

/// Point-in-time view of one source task.
#[derive(Debug, Clone)]
pub struct SourceHealth {
    pub source_id: String,
    pub phase: CyclePhase,
    pub cycles_completed: u64,
    pub measurements_synced: u64,
    pub measurements_skipped: u64,
    pub rows_replicated: u64,
    pub catch_up: bool,
}

/// Point-in-time view of one broker link.
#[derive(Debug, Clone)]
pub struct LinkHealth {
    pub kind: LinkKind,
    pub connected: bool,
    pub circuit_open: bool,
    pub failure_count: u64,
    pub millis_since_success: u64,
}

/// Comprehensive health status for monitoring endpoints.
///
/// Collected entirely from cached internal state; no network I/O.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub state: EngineState,
    /// Engine is running with at least one usable broker link.
    pub ready: bool,
    pub healthy: bool,
    /// Requests currently awaiting a correlated reply.
    pub pending_requests: usize,
    pub links: Vec<LinkHealth>,
    pub sources: Vec<SourceHealth>,
}
