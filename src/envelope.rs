// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Wire envelope for requests and replies over the broker.
//!
//! Every message carries a correlation identifier, the operation kind,
//! the scope (tenant namespace), the destination table, and a
//! kind-specific structured body. Payloads are JSON and parsed
//! defensively: a malformed reply is a protocol error, never evaluated
//! or partially trusted.
//!
//! # Topics
//!
//! Topic names are a deterministic function of (operation, scope, table)
//! so both ends can route without external coordination:
//!
//! ```text
//! requests:  db/<op>/<scope>/<table>      e.g. db/insert/carport/CARPORT_BMS_EVPV
//! replies:   reply/<scope>/<correlation>  e.g. reply/carport/5e97…
//! listener:  reply/<scope>/*              (pattern subscription)
//! ```
//!
//! The reply listener extracts the correlation identifier from the topic
//! alone, so routing a reply never requires decoding its payload on the
//! broker delivery loop.
//!
//! # Timestamps
//!
//! Timestamps cross the wire as `YYYY-MM-DD HH:MM:SS` (UTC, second
//! precision), the destination's canonical format.

use crate::batch::RowBatch;
use crate::correlation::CorrelationId;
use crate::error::{RelayError, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Wire timestamp format, shared with the destination service.
pub const WIRE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Logical operation kind of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    /// Ask the destination for the last stored timestamp of a table.
    LastTimestamp,
    /// Ship a row batch to the destination and await an acknowledgment.
    InsertBatch,
}

impl OpKind {
    /// Topic path segment for this operation.
    pub fn topic_segment(&self) -> &'static str {
        match self {
            OpKind::LastTimestamp => "last-ts",
            OpKind::InsertBatch => "insert",
        }
    }
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpKind::LastTimestamp => write!(f, "last_timestamp"),
            OpKind::InsertBatch => write!(f, "insert_batch"),
        }
    }
}

/// An outbound request envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestEnvelope {
    pub correlation_id: CorrelationId,
    pub op: OpKind,
    /// Tenant namespace; the destination publishes the reply under it.
    pub scope: String,
    pub table: String,
    pub body: RequestBody,
}

/// Kind-specific request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RequestBody {
    LastTimestamp,
    InsertBatch { batch: RowBatch },
}

/// An inbound reply envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReplyEnvelope {
    pub correlation_id: CorrelationId,
    pub op: OpKind,
    pub table: String,
    pub body: ReplyBody,
}

/// Kind-specific reply body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReplyBody {
    /// Answer to `LastTimestamp`. `None` means the table has no rows yet,
    /// which is a valid answer and not an error.
    LastTimestamp { timestamp: Option<String> },
    /// Acknowledgment of an `InsertBatch`.
    Ack { rows_written: u64 },
    /// Destination-reported failure for either operation.
    Error { code: String, message: String },
}

/// Build the request topic for (operation, scope, table).
pub fn request_topic(op: OpKind, scope: &str, table: &str) -> String {
    format!("db/{}/{}/{}", op.topic_segment(), scope, table)
}

/// Build the reply topic for one correlation identifier.
pub fn reply_topic(scope: &str, id: &CorrelationId) -> String {
    format!("reply/{}/{}", scope, id)
}

/// Pattern covering every reply addressed to this scope.
pub fn reply_pattern(scope: &str) -> String {
    format!("reply/{}/*", scope)
}

/// Extract the correlation identifier from a reply topic.
///
/// Returns `None` for topics outside this scope's reply space or with an
/// unparsable identifier segment.
pub fn correlation_from_reply_topic(scope: &str, topic: &str) -> Option<CorrelationId> {
    let rest = topic.strip_prefix("reply/")?;
    let rest = rest.strip_prefix(scope)?;
    let id = rest.strip_prefix('/')?;
    id.parse().ok()
}

/// Serialize a request envelope for publishing.
pub fn encode_request(envelope: &RequestEnvelope) -> Result<Vec<u8>> {
    serde_json::to_vec(envelope)
        .map_err(|e| RelayError::Internal(format!("request encode failed: {}", e)))
}

/// Parse a reply payload.
///
/// Anything that does not match the reply schema exactly is rejected as
/// a protocol error.
pub fn decode_reply(payload: &[u8]) -> Result<ReplyEnvelope> {
    serde_json::from_slice(payload)
        .map_err(|e| RelayError::Protocol(format!("malformed reply payload: {}", e)))
}

/// Parse a wire timestamp (`YYYY-MM-DD HH:MM:SS`, UTC).
pub fn parse_wire_timestamp(s: &str) -> Result<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s, WIRE_TIME_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|e| RelayError::Protocol(format!("bad timestamp '{}': {}", s, e)))
}

/// Format a timestamp for the wire.
pub fn format_wire_timestamp(ts: DateTime<Utc>) -> String {
    ts.format(WIRE_TIME_FORMAT).to_string()
}
