// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Mock destination database service.
//!
//! Plays the remote end of the RPC-over-pub/sub protocol: subscribes to
//! `db/*/<scope>/*` on a broker, answers last-timestamp queries from an
//! in-memory table store, records inserted batches, and publishes
//! replies on `reply/<scope>/<correlation_id>`.
//!
//! Behavior is switchable per test to simulate a slow or broken
//! destination (never answering, or answering with an error body).

use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use telemetry_relay::batch::{RowBatch, TIME_COLUMN};
use telemetry_relay::envelope::{
    OpKind, ReplyBody, ReplyEnvelope, RequestBody, RequestEnvelope,
};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// How the mock answers requests.
#[derive(Debug, Clone)]
pub enum ServiceBehavior {
    /// Answer normally from the in-memory store.
    Normal,
    /// Receive requests but never reply (forces timeouts).
    Mute,
    /// Reply to everything with an error body.
    ErrorReply { code: String, message: String },
}

#[derive(Default)]
struct ServiceState {
    /// table → last stored timestamp (wire format)
    last_timestamps: HashMap<String, String>,
    /// every batch received, in arrival order
    inserts: Vec<(String, RowBatch)>,
}

/// Handle to a running mock service.
pub struct MockDbService {
    state: Arc<Mutex<ServiceState>>,
    behavior: Arc<Mutex<ServiceBehavior>>,
    handle: JoinHandle<()>,
}

impl MockDbService {
    /// Spawn the service against a broker. Returns once the request
    /// subscription is live, so tests can publish immediately.
    pub async fn spawn(broker_url: &str, scope: &str) -> Self {
        let state = Arc::new(Mutex::new(ServiceState::default()));
        let behavior = Arc::new(Mutex::new(ServiceBehavior::Normal));
        let (ready_tx, ready_rx) = oneshot::channel();

        let url = broker_url.to_string();
        let scope = scope.to_string();
        let task_state = Arc::clone(&state);
        let task_behavior = Arc::clone(&behavior);

        let handle = tokio::spawn(async move {
            run_service(url, scope, task_state, task_behavior, ready_tx).await;
        });

        ready_rx.await.expect("mock service failed to subscribe");

        Self {
            state,
            behavior,
            handle,
        }
    }

    /// Pretend the destination already has rows up to `timestamp`
    /// (wire format, `YYYY-MM-DD HH:MM:SS`).
    pub fn set_last_timestamp(&self, table: &str, timestamp: &str) {
        self.state
            .lock()
            .unwrap()
            .last_timestamps
            .insert(table.to_string(), timestamp.to_string());
    }

    /// Every batch received so far.
    pub fn inserts(&self) -> Vec<(String, RowBatch)> {
        self.state.lock().unwrap().inserts.clone()
    }

    /// Total rows received for one table.
    pub fn rows_for(&self, table: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .inserts
            .iter()
            .filter(|(t, _)| t == table)
            .map(|(_, b)| b.len())
            .sum()
    }

    pub fn set_behavior(&self, behavior: ServiceBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn stop(self) {
        self.handle.abort();
    }
}

async fn run_service(
    url: String,
    scope: String,
    state: Arc<Mutex<ServiceState>>,
    behavior: Arc<Mutex<ServiceBehavior>>,
    ready_tx: oneshot::Sender<()>,
) {
    let client = redis::Client::open(url.as_str()).expect("bad broker url");
    let mut pubsub = client
        .get_async_pubsub()
        .await
        .expect("mock service subscribe connection");
    pubsub
        .psubscribe(format!("db/*/{}/*", scope))
        .await
        .expect("mock service psubscribe");

    let mut publish_conn = client
        .get_connection_manager()
        .await
        .expect("mock service publish connection");

    let _ = ready_tx.send(());

    let mut stream = pubsub.on_message();
    while let Some(msg) = stream.next().await {
        let request: RequestEnvelope = match serde_json::from_slice(msg.get_payload_bytes()) {
            Ok(req) => req,
            Err(_) => continue, // not ours to judge; the relay never sends garbage
        };

        let current = behavior.lock().unwrap().clone();
        let body = match current {
            ServiceBehavior::Mute => continue,
            ServiceBehavior::ErrorReply { code, message } => ReplyBody::Error { code, message },
            ServiceBehavior::Normal => answer(&state, &request),
        };

        let reply = ReplyEnvelope {
            correlation_id: request.correlation_id,
            op: request.op,
            table: request.table.clone(),
            body,
        };
        let topic = format!("reply/{}/{}", scope, request.correlation_id);
        let payload = serde_json::to_vec(&reply).expect("reply encode");

        let _: Result<i64, _> = redis::cmd("PUBLISH")
            .arg(&topic)
            .arg(payload)
            .query_async(&mut publish_conn)
            .await;
    }
}

fn answer(state: &Mutex<ServiceState>, request: &RequestEnvelope) -> ReplyBody {
    let mut state = state.lock().unwrap();
    match (&request.op, &request.body) {
        (OpKind::LastTimestamp, RequestBody::LastTimestamp) => ReplyBody::LastTimestamp {
            timestamp: state.last_timestamps.get(&request.table).cloned(),
        },
        (OpKind::InsertBatch, RequestBody::InsertBatch { batch }) => {
            let rows_written = batch.len() as u64;

            // Advance the stored cursor from the batch's TIMESTAMP column,
            // the way a real destination's MAX(TIMESTAMP) would.
            if let Some(idx) = batch.column_index(TIME_COLUMN) {
                let newest = batch
                    .rows
                    .iter()
                    .filter_map(|row| row.get(idx))
                    .filter_map(|v| v.as_str())
                    .max()
                    .map(|s| s.to_string());
                if let Some(ts) = newest {
                    let entry = state
                        .last_timestamps
                        .entry(request.table.clone())
                        .or_default();
                    if ts > *entry {
                        *entry = ts;
                    }
                }
            }

            state.inserts.push((request.table.clone(), batch.clone()));
            ReplyBody::Ack { rows_written }
        }
        _ => ReplyBody::Error {
            code: "bad_request".to_string(),
            message: "request body does not match operation".to_string(),
        },
    }
}
