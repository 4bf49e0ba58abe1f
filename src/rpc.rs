// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! RPC bridge: synchronous-looking database operations over pub/sub.
//!
//! The scheduler needs correlated, timeout-bounded answers from the
//! destination service ("what is the last stored timestamp for table X?",
//! "insert this batch, confirm success"), but the only channel is a
//! fire-and-forget broker. The bridge hides the mechanics:
//!
//! 1. Register a fresh correlation identifier with the registry
//! 2. Publish the request envelope (with failover to the secondary link)
//! 3. Suspend the calling task until the correlated reply arrives or the
//!    deadline elapses
//! 4. Decode and validate the reply defensively
//!
//! Any number of round-trips from different source tasks can be in
//! flight at once; replies are matched by correlation identifier alone.
//! A [`Bulkhead`] bounds the total in-flight count so a slow destination
//! cannot pile up unbounded pending requests.
//!
//! # Error Taxonomy
//!
//! - `Timeout`: no correlated reply within the deadline. The registry
//!   entry is purged; a late reply is discarded harmlessly.
//! - `Protocol`: a reply arrived but is unparsable, mismatched, or the
//!   destination reported an application error.
//! - `Transport`: the publish failed on every configured link.
//!
//! A destination that reports "no rows yet" is `Ok(None)`, not an error.

use crate::batch::RowBatch;
use crate::config::RpcSettings;
use crate::correlation::CorrelationRegistry;
use crate::envelope::{
    self, OpKind, ReplyBody, ReplyEnvelope, RequestBody, RequestEnvelope,
};
use crate::error::{RelayError, Result};
use crate::metrics;
use crate::resilience::Bulkhead;
use crate::transport::{LinkKind, TransportAdapter};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Boxed future, so [`DbBridge`] stays object-safe.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Acknowledgment returned by the destination for an insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertAck {
    /// Rows the destination reports having written.
    pub rows_written: u64,
}

/// A successful RPC outcome, tagged with the link that carried it.
#[derive(Debug, Clone)]
pub struct RpcReply<T> {
    pub value: T,
    /// Which link the request was published on. `Secondary` means the
    /// primary failed to send and service is degraded.
    pub delivery: LinkKind,
}

impl<T> RpcReply<T> {
    /// Whether this result was achieved only via the secondary link.
    pub fn is_degraded(&self) -> bool {
        self.delivery == LinkKind::Secondary
    }
}

/// The destination-database seam the scheduler drives.
///
/// The production implementation is [`DbRpcBridge`]; tests substitute an
/// in-memory mock to exercise the scheduler without a broker.
pub trait DbBridge: Send + Sync + 'static {
    /// Last stored timestamp for a table. `None` means the table has no
    /// rows yet, which is a valid answer and not an error.
    fn last_timestamp(&self, table: &str) -> BoxFuture<'_, RpcReply<Option<DateTime<Utc>>>>;

    /// Ship a row batch and await the destination's acknowledgment.
    /// An empty batch is a valid, cheap round-trip.
    fn insert_batch(&self, table: &str, batch: RowBatch) -> BoxFuture<'_, RpcReply<InsertAck>>;
}

/// Production bridge over the transport adapter.
pub struct DbRpcBridge {
    adapter: Arc<TransportAdapter>,
    registry: Arc<CorrelationRegistry>,
    bulkhead: Bulkhead,
    request_timeout: Duration,
}

impl DbRpcBridge {
    pub fn new(
        adapter: Arc<TransportAdapter>,
        registry: Arc<CorrelationRegistry>,
        settings: &RpcSettings,
    ) -> Self {
        Self {
            adapter,
            registry,
            bulkhead: Bulkhead::new(settings.max_in_flight),
            request_timeout: settings.request_timeout_duration(),
        }
    }

    /// One full request/reply round-trip.
    ///
    /// Holding the waiter across the publish means a reply racing the
    /// publish call can never be lost; dropping it on any error path
    /// purges the registry entry.
    async fn round_trip(
        &self,
        op: OpKind,
        table: &str,
        body: RequestBody,
    ) -> Result<(ReplyEnvelope, LinkKind)> {
        let _permit = self
            .bulkhead
            .acquire()
            .await
            .map_err(|_| RelayError::Shutdown)?;

        let started = Instant::now();
        let scope = self.adapter.scope_id().to_string();
        let (correlation_id, waiter) = self.registry.register(op);

        let request = RequestEnvelope {
            correlation_id,
            op,
            scope: scope.clone(),
            table: table.to_string(),
            body,
        };
        let payload = envelope::encode_request(&request)?;
        let topic = envelope::request_topic(op, &scope, table);

        let delivery = match self.adapter.publish_request(&topic, &payload).await {
            Ok(delivery) => delivery,
            Err(e) => {
                metrics::record_rpc_error(op, e.kind());
                return Err(e);
            }
        };

        debug!(
            correlation_id = %correlation_id,
            op = %op,
            table,
            link = %delivery,
            "Request published, awaiting reply"
        );

        let reply = match waiter.wait(self.request_timeout).await {
            Ok(reply) => reply,
            Err(e) => {
                metrics::record_rpc_error(op, e.kind());
                return Err(e);
            }
        };

        let decoded = match envelope::decode_reply(&reply.payload) {
            Ok(decoded) => decoded,
            Err(e) => {
                metrics::record_rpc_error(op, e.kind());
                return Err(e);
            }
        };

        // The topic routed us here by correlation id; the envelope must
        // agree with itself or something is forging replies.
        if decoded.correlation_id != correlation_id {
            metrics::record_rpc_error(op, "protocol");
            return Err(RelayError::Protocol(format!(
                "reply correlation id {} does not match request {}",
                decoded.correlation_id, correlation_id
            )));
        }
        if decoded.op != op {
            metrics::record_rpc_error(op, "protocol");
            return Err(RelayError::Protocol(format!(
                "reply op '{}' does not match request op '{}'",
                decoded.op, op
            )));
        }

        if delivery == LinkKind::Secondary {
            warn!(op = %op, table, "Operation succeeded via secondary link (degraded)");
            metrics::record_degraded_delivery(op);
        }
        metrics::record_rpc_latency(op, started.elapsed());

        Ok((decoded, delivery))
    }

    async fn last_timestamp_inner(
        &self,
        table: &str,
    ) -> Result<RpcReply<Option<DateTime<Utc>>>> {
        let (reply, delivery) = self
            .round_trip(OpKind::LastTimestamp, table, RequestBody::LastTimestamp)
            .await?;

        let value = match reply.body {
            ReplyBody::LastTimestamp { timestamp: None } => None,
            ReplyBody::LastTimestamp { timestamp: Some(s) } => {
                Some(envelope::parse_wire_timestamp(&s)?)
            }
            ReplyBody::Error { code, message } => {
                return Err(RelayError::Protocol(format!(
                    "destination error ({}): {}",
                    code, message
                )));
            }
            ReplyBody::Ack { .. } => {
                return Err(RelayError::Protocol(
                    "ack body in reply to last_timestamp request".to_string(),
                ));
            }
        };

        Ok(RpcReply { value, delivery })
    }

    async fn insert_batch_inner(&self, table: &str, batch: RowBatch) -> Result<RpcReply<InsertAck>> {
        batch.validate()?;

        let (reply, delivery) = self
            .round_trip(OpKind::InsertBatch, table, RequestBody::InsertBatch { batch })
            .await?;

        let value = match reply.body {
            ReplyBody::Ack { rows_written } => InsertAck { rows_written },
            ReplyBody::Error { code, message } => {
                return Err(RelayError::Protocol(format!(
                    "destination error ({}): {}",
                    code, message
                )));
            }
            ReplyBody::LastTimestamp { .. } => {
                return Err(RelayError::Protocol(
                    "timestamp body in reply to insert_batch request".to_string(),
                ));
            }
        };

        Ok(RpcReply { value, delivery })
    }

    /// Requests currently waiting on a bulkhead slot or a reply.
    pub fn in_flight(&self) -> usize {
        self.bulkhead.max_concurrent() - self.bulkhead.available()
    }
}

impl DbBridge for DbRpcBridge {
    fn last_timestamp(&self, table: &str) -> BoxFuture<'_, RpcReply<Option<DateTime<Utc>>>> {
        let table = table.to_string();
        Box::pin(async move { self.last_timestamp_inner(&table).await })
    }

    fn insert_batch(&self, table: &str, batch: RowBatch) -> BoxFuture<'_, RpcReply<InsertAck>> {
        let table = table.to_string();
        Box::pin(async move { self.insert_batch_inner(&table, batch).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerLinkConfig;
    use tokio::sync::watch;

    fn bridge_without_broker() -> (DbRpcBridge, Arc<CorrelationRegistry>) {
        // Primary link with a forced-open circuit: every publish fails
        // fast without touching the network.
        let registry = Arc::new(CorrelationRegistry::new());
        let (_tx, rx) = watch::channel(false);
        let adapter = Arc::new(TransportAdapter::new(
            "test-scope".to_string(),
            BrokerLinkConfig {
                url: "redis://localhost:6379".to_string(),
                circuit_failure_threshold: 1,
                circuit_reset_timeout_sec: 3600,
            },
            None,
            Arc::clone(&registry),
            rx,
        ));
        let settings = RpcSettings {
            request_timeout: "100ms".to_string(),
            max_in_flight: 4,
        };
        (
            DbRpcBridge::new(adapter, Arc::clone(&registry), &settings),
            registry,
        )
    }

    async fn force_circuit_open(bridge: &DbRpcBridge) {
        for link in bridge.adapter.links() {
            link.record_failure().await;
        }
    }

    #[test]
    fn test_rpc_reply_degraded_flag() {
        let primary = RpcReply {
            value: 1,
            delivery: LinkKind::Primary,
        };
        let secondary = RpcReply {
            value: 1,
            delivery: LinkKind::Secondary,
        };
        assert!(!primary.is_degraded());
        assert!(secondary.is_degraded());
    }

    #[tokio::test]
    async fn test_transport_failure_purges_registry() {
        let (bridge, registry) = bridge_without_broker();
        force_circuit_open(&bridge).await;

        let err = bridge.last_timestamp("T").await.unwrap_err();
        assert!(matches!(err, RelayError::Transport { .. }));
        // Failed publish must not leak a pending entry.
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_transport_failure_releases_bulkhead() {
        let (bridge, _registry) = bridge_without_broker();
        force_circuit_open(&bridge).await;

        for _ in 0..10 {
            let _ = bridge.insert_batch("T", RowBatch::empty()).await;
        }
        assert_eq!(bridge.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_insert_rejects_ragged_batch_before_publish() {
        let (bridge, registry) = bridge_without_broker();

        let batch = RowBatch {
            columns: vec!["a".to_string()],
            rows: vec![vec![serde_json::json!(1), serde_json::json!(2)]],
        };
        let err = bridge.insert_batch("T", batch).await.unwrap_err();
        assert!(matches!(err, RelayError::Internal(_)));
        // Validation failed before any registration happened.
        assert!(registry.is_empty());
    }
}
