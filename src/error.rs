// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error taxonomy for the telemetry relay.
//!
//! Each variant names where in the request path the failure happened
//! and carries enough context to diagnose it from a log line.
//!
//! | Variant | Retryable | Meaning |
//! |---------|-----------|---------|
//! | `Transport` | Yes | Publish failed: link unreachable or circuit open |
//! | `Timeout` | Yes | No correlated reply before the deadline |
//! | `Source` | Yes | A telemetry source query failed |
//! | `Protocol` | No | Reply arrived but is malformed or mismatched |
//! | `UnmappedMeasurement` | No | Measurement has no destination table |
//! | `Config` | No | Startup configuration rejected |
//! | `InvalidState` | No | Engine lifecycle misuse |
//! | `Shutdown` | No | Engine is stopping |
//! | `Internal` | No | Relay-side invariant violated |
//!
//! A destination that reports "no rows yet" is **not** an error: the RPC
//! bridge models it as `Option::None`.
//!
//! [`RelayError::is_retryable()`] is what the scheduler consults when
//! deciding whether a skipped step is worth another attempt next cycle:
//! transient availability problems are, a remote end speaking the wrong
//! dialect is not.

use crate::transport::LinkKind;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Errors that can occur while relaying telemetry.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Broker link failure (connect, subscribe, or publish).
    ///
    /// When the adapter has exhausted both links for a publish, the
    /// recorded link is the last one tried.
    #[error("transport error on {link} link ({operation}): {message}")]
    Transport {
        link: LinkKind,
        operation: String,
        message: String,
        #[source]
        source: Option<redis::RedisError>,
    },

    /// No correlated reply arrived within the deadline.
    ///
    /// The pending entry has been purged; a late reply is discarded.
    #[error("timed out after {elapsed:?} waiting for {operation} reply")]
    Timeout { operation: String, elapsed: Duration },

    /// Reply received but unparsable or semantically invalid.
    ///
    /// Not retryable: the remote end is speaking a different dialect.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// No destination table is mapped for a source measurement.
    ///
    /// The measurement is skipped for the cycle, never fatal.
    #[error("no destination table mapped for measurement '{0}'")]
    UnmappedMeasurement(String),

    /// Telemetry source query failure.
    ///
    /// Retryable: the source connection is closed and re-established on
    /// the next cycle.
    #[error("source error ({source_id}): {message}")]
    Source { source_id: String, message: String },

    /// Configuration rejected at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// An operation was attempted in the wrong engine state (say,
    /// `start()` on an engine that is already running).
    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// The engine is shutting down; the operation was abandoned.
    #[error("shutdown in progress")]
    Shutdown,

    /// A bug: an invariant the relay maintains itself was violated.
    #[error("internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Create a transport error from a `redis::RedisError`.
    pub fn transport(
        link: LinkKind,
        operation: impl Into<String>,
        source: redis::RedisError,
    ) -> Self {
        Self::Transport {
            link,
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a transport error without an underlying cause.
    pub fn transport_msg(
        link: LinkKind,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Transport {
            link,
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a source error.
    pub fn source(source_id: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Source {
            source_id: source_id.into(),
            message: message.to_string(),
        }
    }

    /// Check if this error is retryable on a later cycle.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::Timeout { .. } => true,
            Self::Source { .. } => true,
            Self::Protocol(_) => false,
            Self::UnmappedMeasurement(_) => false,
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// Short stable label for metrics and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transport { .. } => "transport",
            Self::Timeout { .. } => "timeout",
            Self::Protocol(_) => "protocol",
            Self::UnmappedMeasurement(_) => "unmapped",
            Self::Source { .. } => "source",
            Self::Config(_) => "config",
            Self::InvalidState { .. } => "invalid_state",
            Self::Shutdown => "shutdown",
            Self::Internal(_) => "internal",
        }
    }
}
