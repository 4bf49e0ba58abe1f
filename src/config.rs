//! Configuration for the telemetry relay.
//!
//! All configuration is supplied at startup; there is no runtime
//! reconfiguration. Config can be constructed programmatically or
//! deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use telemetry_relay::config::{RelayConfig, BrokerLinkConfig, SourceConfig};
//!
//! let config = RelayConfig {
//!     scope_id: "carport".into(),
//!     sources: vec![SourceConfig::for_testing("logger-1", "http://logger1:8086")],
//!     ..RelayConfig::for_testing("carport")
//! };
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! RelayConfig
//! ├── scope_id: String              # This process's reply-topic namespace
//! ├── links: LinkSettings
//! │   ├── primary: BrokerLinkConfig
//! │   └── secondary: Option<BrokerLinkConfig>
//! ├── sources: Vec<SourceConfig>    # Telemetry sources to replicate from
//! ├── tables: { measurement: table }# Destination table mapping
//! └── settings: RelaySettings
//!     ├── rpc: RpcSettings          # Request timeout, in-flight cap
//!     ├── sync: SyncSettings        # Poll intervals, window span
//!     ├── link_health: LinkHealthConfig
//!     └── heartbeat: HeartbeatConfig
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! scope_id: "carport"
//!
//! links:
//!   primary:
//!     url: "redis://broker-a:6379"
//!   secondary:
//!     url: "redis://broker-b:6379"
//!
//! sources:
//!   - source_id: "logger-1"
//!     url: "http://logger1:8086"
//!     database: "telemetry"
//!
//! tables:
//!   bms: "CARPORT_BMS_EVPV"
//!   grid: "CARPORT_GRID_EVPV"
//!
//! settings:
//!   rpc:
//!     request_timeout: "5s"
//!   sync:
//!     poll_interval: "900s"
//!     catch_up_interval: "1s"
//!     max_window_span: "1h"
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config: passed from the host daemon to RelayEngine::new()
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `RelayEngine::new()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Reply-topic namespace for this process. Both ends derive topics
    /// from it, so it must match the destination service's configuration.
    pub scope_id: String,

    /// Broker links (primary required, secondary optional failover).
    pub links: LinkSettings,

    /// Telemetry sources to replicate from.
    #[serde(default)]
    pub sources: Vec<SourceConfig>,

    /// Measurement name to destination table mapping.
    /// Unmapped measurements are skipped (logged), never fatal.
    #[serde(default)]
    pub tables: HashMap<String, String>,

    /// Tunable parameters (timeouts, intervals, window span).
    #[serde(default)]
    pub settings: RelaySettings,
}

impl RelayConfig {
    /// Create a minimal config for testing: local primary broker, no
    /// secondary, no sources, heartbeat disabled.
    pub fn for_testing(scope_id: &str) -> Self {
        Self {
            scope_id: scope_id.to_string(),
            links: LinkSettings {
                primary: BrokerLinkConfig::for_testing("redis://127.0.0.1:6379"),
                secondary: None,
            },
            sources: Vec::new(),
            tables: HashMap::new(),
            settings: RelaySettings {
                heartbeat: HeartbeatConfig {
                    enabled: false,
                    ..HeartbeatConfig::default()
                },
                ..RelaySettings::default()
            },
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// LinkSettings / BrokerLinkConfig: one entry per broker link
// ═══════════════════════════════════════════════════════════════════════════════

/// Broker link configuration: a required primary and an optional
/// secondary failover path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkSettings {
    /// Primary broker link. Every publish is attempted here first.
    pub primary: BrokerLinkConfig,

    /// Secondary broker link. A publish that fails on the primary is
    /// retried here once; replies via this path are reported degraded.
    #[serde(default)]
    pub secondary: Option<BrokerLinkConfig>,
}

/// Configuration for a single broker link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerLinkConfig {
    /// Broker URL, e.g. `"redis://broker-a.example.com:6379"`.
    pub url: String,

    /// Consecutive publish failures before the link's circuit opens.
    #[serde(default = "default_circuit_failure_threshold")]
    pub circuit_failure_threshold: u32,

    /// How long to wait before trying again after the circuit opens.
    #[serde(default = "default_circuit_reset_timeout_sec")]
    pub circuit_reset_timeout_sec: u64,
}

fn default_circuit_failure_threshold() -> u32 {
    5
}

fn default_circuit_reset_timeout_sec() -> u64 {
    30
}

impl BrokerLinkConfig {
    /// Create a link config for testing.
    pub fn for_testing(url: &str) -> Self {
        Self {
            url: url.to_string(),
            circuit_failure_threshold: 5,
            circuit_reset_timeout_sec: 30,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SourceConfig: one entry per telemetry source
// ═══════════════════════════════════════════════════════════════════════════════

/// Connection parameters for a single telemetry source.
///
/// The core treats these as opaque: they are handed to whatever
/// [`TelemetrySource`](crate::source::TelemetrySource) implementation the
/// host daemon constructs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Source's unique ID (for logging and metrics).
    pub source_id: String,

    /// Source endpoint URL.
    pub url: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Database/bucket name within the source, if applicable.
    #[serde(default)]
    pub database: Option<String>,
}

impl SourceConfig {
    /// Create a source config for testing.
    pub fn for_testing(source_id: &str, url: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            url: url.to_string(),
            username: None,
            password: None,
            database: None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RelaySettings: rpc + sync tunables
// ═══════════════════════════════════════════════════════════════════════════════

/// General settings for the relay logic.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RelaySettings {
    #[serde(default)]
    pub rpc: RpcSettings,
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub link_health: LinkHealthConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
}

/// RPC bridge settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcSettings {
    /// How long to wait for a correlated reply, as a duration string
    /// (e.g. "5s"). Parsed to Duration internally.
    #[serde(default = "default_request_timeout")]
    pub request_timeout: String,

    /// Maximum concurrent in-flight requests across all sources.
    /// Excess callers wait for a slot; they are not rejected.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

fn default_request_timeout() -> String {
    "5s".to_string()
}

fn default_max_in_flight() -> usize {
    32
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            request_timeout: "5s".to_string(),
            max_in_flight: 32,
        }
    }
}

impl RpcSettings {
    /// Parse the request_timeout string to a Duration.
    pub fn request_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.request_timeout).unwrap_or(Duration::from_secs(5))
    }
}

/// Sync scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Normal wait between sync cycles for a source.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,

    /// Shortened wait while a source has unreplicated backlog beyond
    /// one window span.
    #[serde(default = "default_catch_up_interval")]
    pub catch_up_interval: String,

    /// Maximum span of a single sync window (bounds payload size).
    #[serde(default = "default_max_window_span")]
    pub max_window_span: String,
}

fn default_poll_interval() -> String {
    "900s".to_string()
}

fn default_catch_up_interval() -> String {
    "1s".to_string()
}

fn default_max_window_span() -> String {
    "1h".to_string()
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            poll_interval: "900s".to_string(),
            catch_up_interval: "1s".to_string(),
            max_window_span: "1h".to_string(),
        }
    }
}

impl SyncSettings {
    /// Parse the poll_interval string to a Duration.
    pub fn poll_interval_duration(&self) -> Duration {
        humantime::parse_duration(&self.poll_interval).unwrap_or(Duration::from_secs(900))
    }

    /// Parse the catch_up_interval string to a Duration.
    pub fn catch_up_interval_duration(&self) -> Duration {
        humantime::parse_duration(&self.catch_up_interval).unwrap_or(Duration::from_secs(1))
    }

    /// Parse the max_window_span string to a Duration.
    pub fn max_window_span_duration(&self) -> Duration {
        humantime::parse_duration(&self.max_window_span).unwrap_or(Duration::from_secs(3600))
    }
}

/// Broker link health check configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkHealthConfig {
    /// Whether to enable idle link ping checks.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// How often to check for idle links.
    #[serde(default = "default_ping_interval")]
    pub ping_interval: String,

    /// Consider a link idle if no successful operation for this long.
    #[serde(default = "default_idle_threshold")]
    pub idle_threshold: String,
}

fn default_true() -> bool {
    true
}

fn default_ping_interval() -> String {
    "30s".to_string()
}

fn default_idle_threshold() -> String {
    "60s".to_string()
}

impl Default for LinkHealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ping_interval: "30s".to_string(),
            idle_threshold: "60s".to_string(),
        }
    }
}

impl LinkHealthConfig {
    /// Parse the ping_interval string to a Duration.
    pub fn ping_interval_duration(&self) -> Duration {
        humantime::parse_duration(&self.ping_interval).unwrap_or(Duration::from_secs(30))
    }

    /// Parse the idle_threshold string to a Duration.
    pub fn idle_threshold_duration(&self) -> Duration {
        humantime::parse_duration(&self.idle_threshold).unwrap_or(Duration::from_secs(60))
    }
}

/// Liveness heartbeat configuration.
///
/// On each completed sync cycle the scheduler writes the current time to
/// a well-known file; external monitoring treats a stale file as a stuck
/// process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Whether the heartbeat file is written.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Path of the heartbeat file.
    #[serde(default = "default_heartbeat_path")]
    pub path: String,
}

fn default_heartbeat_path() -> String {
    "/tmp/heartbeat.txt".to_string()
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: "/tmp/heartbeat.txt".to_string(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
