// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Broker link management and the transport adapter.
//!
//! Manages two independent Redis pub/sub connections (primary and
//! secondary), publishes outbound request messages, and routes inbound
//! replies to the [`CorrelationRegistry`](crate::correlation::CorrelationRegistry).
//!
//! # Connection Lifecycle
//!
//! ```text
//! Disconnected → Connecting → Connected
//!      ↑             ↓             ↓
//!      └─── Backoff ←┴─────────────┘
//! ```
//!
//! Publish connections are **lazy**: they're only established when first
//! needed (via [`BrokerLink::ensure_connected()`]). If a connection fails,
//! the link enters [`LinkState::Backoff`] with exponential backoff.
//!
//! Each link also runs a dedicated reply-listener task with its own
//! subscriber connection (a multiplexed connection cannot enter subscribe
//! mode). The listener PSUBSCRIBEs the process's reply scope, extracts the
//! correlation identifier from the message topic, and resolves the
//! registry, nothing else. It re-subscribes on reconnect and is
//! supervised independently of the publish side: losing one link never
//! affects the other.
//!
//! # Publish Circuit
//!
//! Each link counts consecutive failures; at the configured threshold
//! its publishes start failing fast (which is what lets failover kick
//! in immediately instead of each caller re-discovering the dead link).
//! After the reset timeout one publish is let through as a probe.
//!
//! # Failover
//!
//! A publish is attempted on the primary link first. If the *send* fails
//! (connection error, open circuit, or zero subscribers on the topic),
//! the same message is retried once on the secondary link. A success via
//! the secondary is reported to the caller so the eventual response can
//! be tagged as degraded service; it is not a failure.

use crate::config::BrokerLinkConfig;
use crate::correlation::{CorrelationRegistry, InboundReply};
use crate::envelope;
use crate::error::{RelayError, Result};
use crate::metrics;
use crate::resilience::RetryConfig;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::Client;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, RwLock};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Which broker link carried a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkKind {
    Primary,
    Secondary,
}

impl std::fmt::Display for LinkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkKind::Primary => write!(f, "primary"),
            LinkKind::Secondary => write!(f, "secondary"),
        }
    }
}

/// Where a link's publish connection currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No connection yet, or the last one was torn down.
    Disconnected,
    /// A connect attempt is underway.
    Connecting,
    /// Usable for publishing.
    Connected,
    /// The last connect gave up; waiting for the next lazy attempt.
    Backoff,
}

/// Circuit breaker state for a broker link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkCircuitState {
    /// Normal operation, publishes pass through.
    Closed,
    /// Too many failures, publishes rejected immediately.
    Open,
}

/// A managed connection to one broker.
///
/// Uses `redis::aio::ConnectionManager` for the publish side, which
/// provides automatic reconnection and a multiplexed connection (cloning
/// is cheap, shares the underlying socket). The subscribe side lives in
/// the reply-listener task with its own connection.
pub struct BrokerLink {
    pub config: BrokerLinkConfig,
    kind: LinkKind,
    /// Publish connection; `None` until the first lazy connect.
    conn: RwLock<Option<ConnectionManager>>,
    state: RwLock<LinkState>,
    /// Epoch millis of the last successful operation.
    last_success: AtomicU64,
    /// Failures since the last success; drives the circuit.
    failure_count: AtomicU64,
    shutdown: AtomicBool,
    /// Set when the circuit opens, cleared on success.
    circuit_opened_at: RwLock<Option<Instant>>,
}

impl BrokerLink {
    /// Create a new broker link (not yet connected).
    pub fn new(kind: LinkKind, config: BrokerLinkConfig) -> Self {
        Self {
            config,
            kind,
            conn: RwLock::new(None),
            state: RwLock::new(LinkState::Disconnected),
            last_success: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            circuit_opened_at: RwLock::new(None),
        }
    }

    /// Which role this link plays.
    pub fn kind(&self) -> LinkKind {
        self.kind
    }

    /// The broker URL this link connects to.
    pub fn url(&self) -> &str {
        &self.config.url
    }

    pub async fn state(&self) -> LinkState {
        *self.state.read().await
    }

    pub async fn is_connected(&self) -> bool {
        self.state().await == LinkState::Connected
    }

    // =========================================================================
    // Publish circuit
    // =========================================================================

    /// Current circuit state, accounting for the reset timeout.
    pub async fn circuit_state(&self) -> LinkCircuitState {
        let failures = self.failure_count.load(Ordering::Relaxed);
        let threshold = self.config.circuit_failure_threshold as u64;

        if failures >= threshold {
            // Past the reset timeout the next publish is allowed through
            // as the probe.
            if let Some(opened_at) = *self.circuit_opened_at.read().await {
                let reset_timeout = Duration::from_secs(self.config.circuit_reset_timeout_sec);
                if opened_at.elapsed() >= reset_timeout {
                    return LinkCircuitState::Closed;
                }
            }
            LinkCircuitState::Open
        } else {
            LinkCircuitState::Closed
        }
    }

    /// Whether publishes are currently rejected outright.
    pub async fn is_circuit_open(&self) -> bool {
        self.circuit_state().await == LinkCircuitState::Open
    }

    /// Note a successful operation: failure streak over, circuit closed.
    pub async fn record_success(&self) {
        self.failure_count.store(0, Ordering::Relaxed);
        self.last_success.store(epoch_millis(), Ordering::Relaxed);
        *self.circuit_opened_at.write().await = None;
    }

    /// Note a failed operation; crossing the threshold opens the circuit.
    pub async fn record_failure(&self) {
        let failures = self.failure_count.fetch_add(1, Ordering::Relaxed) + 1;
        let threshold = self.config.circuit_failure_threshold as u64;

        if failures >= threshold {
            let mut opened_at = self.circuit_opened_at.write().await;
            if opened_at.is_none() {
                *opened_at = Some(Instant::now());
                warn!(
                    link = %self.kind,
                    failures,
                    threshold,
                    reset_timeout_sec = self.config.circuit_reset_timeout_sec,
                    "Circuit breaker opened for broker link"
                );
                metrics::record_link_circuit_state(self.kind, "open");
            }
        }
    }

    /// Connect the publish side with retry logic.
    pub async fn connect(&self, retry_config: &RetryConfig) -> Result<()> {
        *self.state.write().await = LinkState::Connecting;
        info!(link = %self.kind, url = %self.config.url, "Connecting to broker");

        let client = Client::open(self.config.url.as_str()).map_err(|e| {
            RelayError::transport_msg(self.kind, "connect", format!("Invalid broker URL: {}", e))
        })?;

        let mut attempt = 0;
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return Err(RelayError::Shutdown);
            }

            attempt += 1;

            // Bound each attempt; an unreachable host must fail, not hang.
            let outcome = timeout(
                retry_config.connection_timeout,
                client.get_connection_manager(),
            )
            .await;

            let failure = match outcome {
                Ok(Ok(conn)) => {
                    *self.conn.write().await = Some(conn);
                    *self.state.write().await = LinkState::Connected;
                    self.failure_count.store(0, Ordering::Release);
                    self.last_success.store(epoch_millis(), Ordering::Release);

                    metrics::record_link_connection(self.kind, true);
                    metrics::record_link_state(self.kind, "connected");

                    info!(link = %self.kind, attempt, "Broker link connected");
                    return Ok(());
                }
                Ok(Err(e)) => RelayError::transport(self.kind, "connect", e),
                Err(_) => RelayError::transport_msg(
                    self.kind,
                    "connect",
                    format!(
                        "attempt timed out after {}ms",
                        retry_config.connection_timeout.as_millis()
                    ),
                ),
            };

            self.failure_count.fetch_add(1, Ordering::AcqRel);

            if attempt >= retry_config.max_attempts {
                *self.state.write().await = LinkState::Backoff;
                metrics::record_link_connection(self.kind, false);
                metrics::record_link_state(self.kind, "backoff");
                error!(link = %self.kind, attempt, error = %failure, "Giving up on broker link");
                return Err(failure);
            }

            let delay = retry_config.delay_for_attempt(attempt);
            warn!(
                link = %self.kind,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "Broker link attempt failed, backing off"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Get the publish connection, if any.
    pub async fn connection(&self) -> Option<ConnectionManager> {
        self.conn.read().await.clone()
    }

    /// Ensure the publish side is connected, connecting lazily if needed.
    ///
    /// Uses the fail-fast publish-path retry profile: a publish must fail
    /// quickly so the adapter can fail over instead of stalling the caller.
    pub async fn ensure_connected(&self) -> Result<ConnectionManager> {
        if let Some(conn) = self.connection().await {
            return Ok(conn);
        }

        self.connect(&RetryConfig::publish_path()).await?;

        self.connection().await.ok_or_else(|| {
            RelayError::transport_msg(
                self.kind,
                "connect",
                "Connection lost immediately after connect",
            )
        })
    }

    /// Publish a payload on a topic.
    ///
    /// A send-level failure is a connection error, an open circuit, or a
    /// `PUBLISH` that reached zero subscribers (nobody is listening on
    /// the remote end, so the message went nowhere). Success means the
    /// broker accepted the message; it says nothing about whether the
    /// remote service processed it. That's what the correlated reply
    /// is for.
    pub async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        if self.is_circuit_open().await {
            metrics::record_publish(self.kind, false);
            return Err(RelayError::transport_msg(self.kind, "PUBLISH", "circuit open"));
        }

        let mut conn = self.ensure_connected().await?;

        let result: std::result::Result<i64, redis::RedisError> = redis::cmd("PUBLISH")
            .arg(topic)
            .arg(payload)
            .query_async(&mut conn)
            .await;

        match result {
            Ok(0) => {
                self.record_failure().await;
                metrics::record_publish(self.kind, false);
                Err(RelayError::transport_msg(
                    self.kind,
                    "PUBLISH",
                    format!("no subscribers for topic '{}'", topic),
                ))
            }
            Ok(receivers) => {
                debug!(link = %self.kind, topic, receivers, "Published request");
                self.record_success().await;
                metrics::record_publish(self.kind, true);
                Ok(())
            }
            Err(e) => {
                self.record_failure().await;
                self.mark_disconnected().await;
                metrics::record_publish(self.kind, false);
                Err(RelayError::transport(self.kind, "PUBLISH", e))
            }
        }
    }

    /// Ping the broker to check publish connection health.
    ///
    /// Returns the round-trip latency on success and updates
    /// `last_success`.
    pub async fn ping(&self) -> Result<Duration> {
        let mut conn = self.connection().await.ok_or_else(|| {
            RelayError::transport_msg(self.kind, "PING", "Not connected")
        })?;

        let start = Instant::now();
        let result: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| RelayError::transport(self.kind, "PING", e))?;

        let latency = start.elapsed();

        if result == "PONG" {
            self.record_success().await;
            metrics::record_link_ping(self.kind, true);
            metrics::record_link_ping_latency(self.kind, latency);
            Ok(latency)
        } else {
            self.record_failure().await;
            metrics::record_link_ping(self.kind, false);
            Err(RelayError::transport_msg(
                self.kind,
                "PING",
                format!("Unexpected PING response: {}", result),
            ))
        }
    }

    /// Failures since the last success.
    pub fn failure_count(&self) -> u64 {
        self.failure_count.load(Ordering::Acquire)
    }

    /// Milliseconds since the last success, `u64::MAX` if there was none.
    pub fn millis_since_success(&self) -> u64 {
        let last = self.last_success.load(Ordering::Acquire);
        if last == 0 {
            return u64::MAX;
        }
        epoch_millis().saturating_sub(last)
    }

    /// Mark the publish connection as failed (triggers lazy reconnect).
    pub async fn mark_disconnected(&self) {
        *self.conn.write().await = None;
        *self.state.write().await = LinkState::Disconnected;
        metrics::record_link_state(self.kind, "disconnected");
        warn!(link = %self.kind, "Connection marked as disconnected");
    }

    /// Ask any in-progress connect loop to stop.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }
}

/// Owns both broker links and fans inbound replies into the registry.
pub struct TransportAdapter {
    /// Reply-topic namespace for this process.
    scope_id: String,
    primary: Arc<BrokerLink>,
    secondary: Option<Arc<BrokerLink>>,
    registry: Arc<CorrelationRegistry>,
    shutdown_rx: watch::Receiver<bool>,
}

impl TransportAdapter {
    /// Create the adapter. Links are not connected yet; call
    /// [`connect_links()`](Self::connect_links) at startup.
    pub fn new(
        scope_id: String,
        primary: BrokerLinkConfig,
        secondary: Option<BrokerLinkConfig>,
        registry: Arc<CorrelationRegistry>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            scope_id,
            primary: Arc::new(BrokerLink::new(LinkKind::Primary, primary)),
            secondary: secondary.map(|cfg| Arc::new(BrokerLink::new(LinkKind::Secondary, cfg))),
            registry,
            shutdown_rx,
        }
    }

    /// The reply-topic namespace this adapter listens under.
    pub fn scope_id(&self) -> &str {
        &self.scope_id
    }

    /// All configured links (primary first).
    pub fn links(&self) -> Vec<Arc<BrokerLink>> {
        let mut links = vec![Arc::clone(&self.primary)];
        if let Some(secondary) = &self.secondary {
            links.push(Arc::clone(secondary));
        }
        links
    }

    /// Connect every configured link's publish side.
    ///
    /// Returns the number of links that connected. A secondary failure is
    /// logged but tolerated; the caller decides whether zero connected
    /// links is fatal.
    pub async fn connect_links(&self, retry_config: &RetryConfig) -> usize {
        let mut connected = 0;
        for link in self.links() {
            match link.connect(retry_config).await {
                Ok(()) => connected += 1,
                Err(e) => {
                    warn!(link = %link.kind(), error = %e, "Broker link failed to connect");
                }
            }
        }
        metrics::set_connected_links(connected);
        connected
    }

    /// Publish a request with failover.
    ///
    /// Attempts the primary link; a send-level failure triggers exactly
    /// one retry on the secondary. Returns which link carried the message
    /// so the caller can tag the eventual response as degraded when it
    /// was the secondary.
    pub async fn publish_request(&self, topic: &str, payload: &[u8]) -> Result<LinkKind> {
        match self.primary.publish(topic, payload).await {
            Ok(()) => Ok(LinkKind::Primary),
            Err(primary_err) => {
                let Some(secondary) = &self.secondary else {
                    return Err(primary_err);
                };

                warn!(
                    topic,
                    error = %primary_err,
                    "Primary publish failed, failing over to secondary"
                );
                metrics::record_publish_failover();

                match secondary.publish(topic, payload).await {
                    Ok(()) => Ok(LinkKind::Secondary),
                    Err(secondary_err) => {
                        error!(
                            topic,
                            primary_error = %primary_err,
                            secondary_error = %secondary_err,
                            "Publish failed on both links"
                        );
                        Err(secondary_err)
                    }
                }
            }
        }
    }

    /// Spawn one reply-listener task per link.
    ///
    /// Each listener holds its own subscriber connection, PSUBSCRIBEs
    /// `reply/<scope>/*`, and resolves the registry for every message.
    /// Listeners reconnect and re-subscribe on failure until shutdown.
    ///
    /// Returns once every listener has confirmed its first subscription
    /// (bounded wait), so a request published right after startup cannot
    /// race its own reply listener. A link whose listener is still down
    /// keeps retrying in the background; startup proceeds.
    pub async fn spawn_reply_listeners(&self) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();
        let mut pending_ready = Vec::new();

        for link in self.links() {
            let kind = link.kind();
            let scope = self.scope_id.clone();
            let registry = Arc::clone(&self.registry);
            let shutdown_rx = self.shutdown_rx.clone();
            let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();

            handles.push(tokio::spawn(async move {
                run_reply_listener(link, scope, registry, shutdown_rx, ready_tx).await;
            }));
            pending_ready.push((kind, ready_rx));
        }

        for (kind, ready_rx) in pending_ready {
            match timeout(Duration::from_secs(2), ready_rx).await {
                Ok(Ok(())) => {}
                _ => {
                    warn!(
                        link = %kind,
                        "Reply listener not yet subscribed, continuing startup"
                    );
                }
            }
        }

        handles
    }

    /// Signal shutdown on every link.
    pub fn shutdown_links(&self) {
        for link in self.links() {
            link.shutdown();
        }
        metrics::set_connected_links(0);
    }
}

/// Reply listener loop for one link.
///
/// Runs until shutdown. Only registry resolution happens on this task;
/// reply decoding is the waiting caller's job.
async fn run_reply_listener(
    link: Arc<BrokerLink>,
    scope: String,
    registry: Arc<CorrelationRegistry>,
    mut shutdown_rx: watch::Receiver<bool>,
    ready_tx: tokio::sync::oneshot::Sender<()>,
) {
    let pattern = envelope::reply_pattern(&scope);
    let retry = RetryConfig::daemon();
    let mut attempt: usize = 0;
    let mut ready_tx = Some(ready_tx);

    info!(link = %link.kind(), pattern = %pattern, "Starting reply listener");

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let client = match Client::open(link.url()) {
            Ok(c) => c,
            Err(e) => {
                // URL is static config; a parse failure won't fix itself.
                error!(link = %link.kind(), error = %e, "Invalid broker URL, reply listener exiting");
                return;
            }
        };

        let pubsub = timeout(retry.connection_timeout, client.get_async_pubsub()).await;
        let mut pubsub = match pubsub {
            Ok(Ok(ps)) => ps,
            Ok(Err(e)) => {
                attempt += 1;
                warn!(
                    link = %link.kind(),
                    attempt,
                    error = %e,
                    "Reply listener failed to connect, retrying"
                );
                if sleep_or_shutdown(retry.delay_for_attempt(attempt), &mut shutdown_rx).await {
                    break;
                }
                continue;
            }
            Err(_) => {
                attempt += 1;
                warn!(
                    link = %link.kind(),
                    attempt,
                    timeout_ms = retry.connection_timeout.as_millis(),
                    "Reply listener connect timed out, retrying"
                );
                if sleep_or_shutdown(retry.delay_for_attempt(attempt), &mut shutdown_rx).await {
                    break;
                }
                continue;
            }
        };

        if let Err(e) = pubsub.psubscribe(&pattern).await {
            attempt += 1;
            warn!(link = %link.kind(), error = %e, "PSUBSCRIBE failed, retrying");
            if sleep_or_shutdown(retry.delay_for_attempt(attempt), &mut shutdown_rx).await {
                break;
            }
            continue;
        }

        attempt = 0;
        info!(link = %link.kind(), pattern = %pattern, "Reply listener subscribed");
        if let Some(tx) = ready_tx.take() {
            let _ = tx.send(());
        }

        let mut stream = pubsub.on_message();
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!(link = %link.kind(), "Reply listener stopping");
                        return;
                    }
                }
                msg = stream.next() => match msg {
                    Some(msg) => {
                        dispatch_reply(&link, &scope, &registry, &msg);
                    }
                    None => {
                        warn!(link = %link.kind(), "Reply subscription lost, reconnecting");
                        break;
                    }
                }
            }
        }
    }

    info!(link = %link.kind(), "Reply listener stopped");
}

/// Route one inbound message to its waiter.
///
/// The correlation identifier comes from the topic alone, so no payload
/// decoding happens on the delivery loop.
fn dispatch_reply(
    link: &BrokerLink,
    scope: &str,
    registry: &CorrelationRegistry,
    msg: &redis::Msg,
) {
    let topic = msg.get_channel_name();
    match envelope::correlation_from_reply_topic(scope, topic) {
        Some(id) => {
            registry.resolve(
                &id,
                InboundReply {
                    link: link.kind(),
                    payload: msg.get_payload_bytes().to_vec(),
                },
            );
        }
        None => {
            warn!(link = %link.kind(), topic, "Reply on unrecognized topic, discarding");
        }
    }
}

/// Sleep for `delay`, returning `true` if shutdown was signaled meanwhile.
async fn sleep_or_shutdown(delay: Duration, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = shutdown_rx.changed() => *shutdown_rx.borrow(),
        _ = tokio::time::sleep(delay) => false,
    }
}

fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_link(kind: LinkKind) -> BrokerLink {
        BrokerLink::new(kind, BrokerLinkConfig::for_testing("redis://localhost:6379"))
    }

    fn adapter(secondary: bool) -> TransportAdapter {
        let (_tx, rx) = watch::channel(false);
        TransportAdapter::new(
            "carport".to_string(),
            BrokerLinkConfig::for_testing("redis://localhost:6379"),
            secondary.then(|| BrokerLinkConfig::for_testing("redis://localhost:6380")),
            Arc::new(CorrelationRegistry::new()),
            rx,
        )
    }

    #[test]
    fn test_link_kind_display() {
        assert_eq!(LinkKind::Primary.to_string(), "primary");
        assert_eq!(LinkKind::Secondary.to_string(), "secondary");
    }

    #[test]
    fn test_link_kind_serde() {
        assert_eq!(
            serde_json::to_string(&LinkKind::Primary).unwrap(),
            r#""primary""#
        );
        let back: LinkKind = serde_json::from_str(r#""secondary""#).unwrap();
        assert_eq!(back, LinkKind::Secondary);
    }

    #[tokio::test]
    async fn test_link_initial_state() {
        let link = test_link(LinkKind::Primary);
        assert_eq!(link.state().await, LinkState::Disconnected);
        assert!(!link.is_connected().await);
        assert_eq!(link.failure_count(), 0);
        assert!(link.connection().await.is_none());
        assert_eq!(link.millis_since_success(), u64::MAX);
    }

    #[tokio::test]
    async fn test_link_circuit_breaker() {
        let config = BrokerLinkConfig {
            url: "redis://localhost:6379".to_string(),
            circuit_failure_threshold: 3,
            circuit_reset_timeout_sec: 1,
        };
        let link = BrokerLink::new(LinkKind::Primary, config);

        assert_eq!(link.circuit_state().await, LinkCircuitState::Closed);

        link.record_failure().await;
        link.record_failure().await;
        assert_eq!(link.circuit_state().await, LinkCircuitState::Closed);
        link.record_failure().await;
        assert_eq!(link.circuit_state().await, LinkCircuitState::Open);
        assert!(link.is_circuit_open().await);

        // After the reset timeout the circuit allows a retry (half-open)
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(link.circuit_state().await, LinkCircuitState::Closed);

        link.record_success().await;
        assert_eq!(link.failure_count(), 0);
        assert!(!link.is_circuit_open().await);
    }

    #[tokio::test]
    async fn test_link_publish_rejected_when_circuit_open() {
        let config = BrokerLinkConfig {
            url: "redis://localhost:6379".to_string(),
            circuit_failure_threshold: 1,
            circuit_reset_timeout_sec: 3600,
        };
        let link = BrokerLink::new(LinkKind::Secondary, config);
        link.record_failure().await;
        assert!(link.is_circuit_open().await);

        let err = link.publish("db/insert/x/T", b"{}").await.unwrap_err();
        assert!(matches!(err, RelayError::Transport { .. }));
        assert!(err.to_string().contains("circuit open"));
    }

    #[tokio::test]
    async fn test_link_ping_not_connected() {
        let link = test_link(LinkKind::Primary);
        let err = link.ping().await.unwrap_err();
        assert!(err.to_string().contains("Not connected"));
    }

    #[tokio::test]
    async fn test_link_mark_disconnected() {
        let link = test_link(LinkKind::Primary);
        link.mark_disconnected().await;
        assert_eq!(link.state().await, LinkState::Disconnected);
        assert!(link.connection().await.is_none());
    }

    #[tokio::test]
    async fn test_link_record_success_updates_last_success() {
        let link = test_link(LinkKind::Primary);
        link.record_failure().await;
        link.record_failure().await;
        assert_eq!(link.failure_count(), 2);

        link.record_success().await;
        assert_eq!(link.failure_count(), 0);
        assert!(link.millis_since_success() < 1000);
    }

    #[test]
    fn test_adapter_links_primary_only() {
        let adapter = adapter(false);
        let links = adapter.links();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].kind(), LinkKind::Primary);
    }

    #[test]
    fn test_adapter_links_with_secondary() {
        let adapter = adapter(true);
        let links = adapter.links();
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].kind(), LinkKind::Primary);
        assert_eq!(links[1].kind(), LinkKind::Secondary);
    }

    #[test]
    fn test_adapter_scope_id() {
        let adapter = adapter(false);
        assert_eq!(adapter.scope_id(), "carport");
    }

    #[tokio::test]
    async fn test_publish_request_no_secondary_propagates_primary_error() {
        // Primary circuit forced open and no secondary configured: the
        // primary's error surfaces directly.
        let (_tx, rx) = watch::channel(false);
        let adapter = TransportAdapter::new(
            "carport".to_string(),
            BrokerLinkConfig {
                url: "redis://localhost:6379".to_string(),
                circuit_failure_threshold: 1,
                circuit_reset_timeout_sec: 3600,
            },
            None,
            Arc::new(CorrelationRegistry::new()),
            rx,
        );
        adapter.links()[0].record_failure().await;

        let err = adapter.publish_request("db/insert/carport/T", b"{}").await.unwrap_err();
        match err {
            RelayError::Transport { link, .. } => assert_eq!(link, LinkKind::Primary),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_publish_request_both_circuits_open_reports_secondary() {
        // Both circuits open: failover is attempted and the last link
        // tried (secondary) is the one in the error.
        let (_tx, rx) = watch::channel(false);
        let open_circuit = |url: &str| BrokerLinkConfig {
            url: url.to_string(),
            circuit_failure_threshold: 1,
            circuit_reset_timeout_sec: 3600,
        };
        let adapter = TransportAdapter::new(
            "carport".to_string(),
            open_circuit("redis://localhost:6379"),
            Some(open_circuit("redis://localhost:6380")),
            Arc::new(CorrelationRegistry::new()),
            rx,
        );
        for link in adapter.links() {
            link.record_failure().await;
        }

        let err = adapter.publish_request("db/insert/carport/T", b"{}").await.unwrap_err();
        match err {
            RelayError::Transport { link, .. } => assert_eq!(link, LinkKind::Secondary),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_shutdown_links_sets_flag() {
        let adapter = adapter(true);
        adapter.shutdown_links();
        for link in adapter.links() {
            assert!(link.shutdown.load(Ordering::Acquire));
        }
    }

    #[test]
    fn test_epoch_millis() {
        let millis = epoch_millis();
        assert!(millis > 1577836800000); // Jan 1, 2020
        assert!(millis < 4102444800000); // Jan 1, 2100
    }
}
