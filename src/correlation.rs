// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Correlation registry for in-flight requests.
//!
//! Every request published to the broker gets a fresh correlation
//! identifier and a single-fulfillment waiter slot. Inbound replies are
//! routed to their waiter by identifier alone, never by arrival order, so
//! any number of requests from different source tasks can be pending at
//! once without interfering.
//!
//! # Lifecycle
//!
//! ```text
//! register() ──► pending ──resolve()──► delivered to waiter
//!                   │
//!                   ├─ wait() deadline elapses ──► purged, Timeout
//!                   └─ waiter dropped ───────────► purged
//! ```
//!
//! A reply for an identifier that is no longer pending (late delivery
//! after a timeout, or a duplicate from the transport's at-least-once
//! delivery) is discarded and logged; it can never reach a different
//! caller's slot.
//!
//! # Concurrency
//!
//! `register` / `resolve` / waiter cleanup may run concurrently from the
//! source tasks and the broker delivery loops. The map entry is removed
//! *before* the reply is sent into the oneshot channel, so exactly one
//! resolution can win; the loser observes a missing entry and backs off.

use crate::envelope::OpKind;
use crate::error::{RelayError, Result};
use crate::metrics;
use crate::transport::LinkKind;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// A value uniquely tagging one outstanding request.
///
/// Random 128-bit identifiers: collision-free in practice, and never
/// reused while pending (registration re-rolls on the astronomically
/// unlikely collision).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(uuid::Uuid);

impl CorrelationId {
    /// Allocate a fresh random identifier.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for CorrelationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(uuid::Uuid::parse_str(s)?))
    }
}

/// A reply delivered by a broker link, not yet decoded.
///
/// The registry is payload-agnostic: decoding happens on the waiting
/// task, never on the broker delivery loop.
#[derive(Debug)]
pub struct InboundReply {
    /// Which link's listener delivered the reply.
    pub link: LinkKind,
    /// Raw reply payload.
    pub payload: Vec<u8>,
}

/// One in-flight request awaiting its reply.
struct PendingEntry {
    op: OpKind,
    created_at: Instant,
    tx: oneshot::Sender<InboundReply>,
}

/// Registry of in-flight requests keyed by correlation identifier.
pub struct CorrelationRegistry {
    pending: DashMap<CorrelationId, PendingEntry>,
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
        }
    }

    /// Register a new in-flight request.
    ///
    /// Returns the fresh identifier and a waiter that yields the reply.
    /// The entry stays in the registry until resolved, timed out, or the
    /// waiter is dropped.
    pub fn register(self: &Arc<Self>, op: OpKind) -> (CorrelationId, ResponseWaiter) {
        let (id, rx) = loop {
            let id = CorrelationId::new();
            let (tx, rx) = oneshot::channel();
            // Vacant in all but the absurd collision case; re-roll rather
            // than clobber a pending entry.
            match self.pending.entry(id) {
                dashmap::mapref::entry::Entry::Vacant(slot) => {
                    slot.insert(PendingEntry {
                        op,
                        created_at: Instant::now(),
                        tx,
                    });
                    break (id, rx);
                }
                dashmap::mapref::entry::Entry::Occupied(_) => continue,
            }
        };
        metrics::set_pending_requests(self.pending.len());
        let waiter = ResponseWaiter {
            id,
            op,
            rx: Some(rx),
            registry: Arc::clone(self),
        };
        (id, waiter)
    }

    /// Deliver a reply to the matching waiter, if one is still pending.
    ///
    /// Returns `true` if a waiter was resolved. Late or duplicate replies
    /// return `false` and are discarded; the transport delivers
    /// at-least-once, so this is expected occasionally and logged rather
    /// than treated as an error.
    pub fn resolve(&self, id: &CorrelationId, reply: InboundReply) -> bool {
        match self.pending.remove(id) {
            Some((_, entry)) => {
                metrics::set_pending_requests(self.pending.len());
                let waited = entry.created_at.elapsed();
                if entry.tx.send(reply).is_err() {
                    // Waiter gave up between our remove and this send.
                    debug!(
                        correlation_id = %id,
                        op = %entry.op,
                        waited_ms = waited.as_millis() as u64,
                        "reply arrived but waiter already gone, discarding"
                    );
                    return false;
                }
                true
            }
            None => {
                warn!(
                    correlation_id = %id,
                    link = %reply.link,
                    "unmatched reply discarded (late, duplicate, or unknown)"
                );
                metrics::record_unmatched_reply(reply.link);
                false
            }
        }
    }

    /// Number of requests currently pending.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn purge(&self, id: &CorrelationId) {
        if self.pending.remove(id).is_some() {
            metrics::set_pending_requests(self.pending.len());
        }
    }
}

impl Default for CorrelationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Waitable handle for one registered request.
///
/// Dropping the waiter (abandoned request) purges the registry entry.
pub struct ResponseWaiter {
    id: CorrelationId,
    op: OpKind,
    rx: Option<oneshot::Receiver<InboundReply>>,
    registry: Arc<CorrelationRegistry>,
}

impl ResponseWaiter {
    /// The identifier this waiter is registered under.
    pub fn correlation_id(&self) -> CorrelationId {
        self.id
    }

    /// Suspend the calling task until the reply arrives or the deadline
    /// elapses. The registry entry is removed on either outcome.
    pub async fn wait(mut self, timeout: Duration) -> Result<InboundReply> {
        let rx = self.rx.take().expect("waiter polled twice");
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_closed)) => {
                // Sender dropped without a send; only possible if the
                // entry was purged out from under us.
                Err(RelayError::Internal(format!(
                    "reply slot for {} closed without resolution",
                    self.id
                )))
            }
            Err(_elapsed) => {
                metrics::record_rpc_timeout(self.op);
                Err(RelayError::Timeout {
                    operation: self.op.to_string(),
                    elapsed: timeout,
                })
            }
        }
        // Drop impl purges the entry if it is still present (timeout or
        // closed path); after a successful resolve the purge is a no-op.
    }
}

impl Drop for ResponseWaiter {
    fn drop(&mut self) {
        self.registry.purge(&self.id);
    }
}
