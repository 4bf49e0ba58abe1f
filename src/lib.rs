//! # Telemetry Relay
//!
//! Replicates time-series telemetry from remote sources into a central
//! store, with a publish/subscribe broker as the only channel between
//! collector and storage backend.
//!
//! ## Architecture
//!
//! The relay bridges synchronous-looking database operations over a
//! fire-and-forget broker, and schedules incremental time-windowed
//! replication on top:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                            telemetry-relay                              │
//! │                                                                         │
//! │  ┌──────────────┐    ┌─────────────┐    ┌─────────────────────────────┐ │
//! │  │ Sync tasks   │───►│ DbRpcBridge │───►│ TransportAdapter            │ │
//! │  │ (per source) │    │ (correlated │    │ (primary + secondary link,  │ │
//! │  └──────────────┘    │  round-trip)│    │  failover, reply listeners) │ │
//! │         │            └─────────────┘    └─────────────────────────────┘ │
//! │         ▼                    ▲                        │                 │
//! │  ┌──────────────┐    ┌───────┴─────────────┐          ▼                 │
//! │  │ Heartbeat    │    │ CorrelationRegistry │     [ broker ]             │
//! │  │ (liveness)   │    │ (one slot per id)   │                            │
//! │  └──────────────┘    └─────────────────────┘                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Requests flow scheduler → bridge → adapter → broker → remote database
//! service; replies come back through a per-link listener that resolves
//! the correlation registry, waking exactly the task that asked. No
//! ordering is assumed anywhere: concurrent requests from different
//! sources are matched by correlation identifier alone.
//!
//! ## Sync Scheduling
//!
//! Each source task repeatedly derives what the destination is missing
//! (the destination's own answer is the cursor; nothing is cached
//! locally), fetches a bounded window, and ships it. Backlogs larger
//! than one window flip the task into catch-up mode with minimal-delay
//! re-polling.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use telemetry_relay::{RelayEngine, RelayConfig};
//! use telemetry_relay::source::{FixedSource, TelemetrySource};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = RelayConfig::for_testing("carport");
//!     let source: Arc<dyn TelemetrySource> = Arc::new(FixedSource::new("logger-1"));
//!
//!     let mut engine = RelayEngine::new(config, vec![source]);
//!     engine.start().await.expect("Failed to start");
//!
//!     // Engine runs until shutdown signal
//!     engine.shutdown().await;
//! }
//! ```

pub mod batch;
pub mod config;
pub mod correlation;
pub mod envelope;
pub mod error;
pub mod heartbeat;
pub mod metrics;
pub mod resilience;
pub mod rpc;
pub mod scheduler;
pub mod source;
pub mod transport;
pub mod window;

// Re-exports for convenience
pub use batch::RowBatch;
pub use config::{BrokerLinkConfig, RelayConfig, RelaySettings, SourceConfig};
pub use correlation::{CorrelationId, CorrelationRegistry};
pub use envelope::OpKind;
pub use error::{RelayError, Result};
pub use rpc::{DbBridge, DbRpcBridge, InsertAck, RpcReply};
pub use scheduler::{EngineState, HealthCheck, RelayEngine};
pub use source::{FixedSource, StaticTableMapper, TableMapper, TelemetrySource};
pub use transport::{BrokerLink, LinkKind, TransportAdapter};
pub use window::{SyncCursor, SyncWindow};
