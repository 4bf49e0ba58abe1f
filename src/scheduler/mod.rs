// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Relay engine orchestration.
//!
//! [`RelayEngine`] owns everything with a lifecycle: the broker links
//! ([`crate::transport::TransportAdapter`]), the in-flight registry
//! ([`crate::correlation::CorrelationRegistry`]), the RPC bridge, and
//! one sync loop per telemetry source (see [`source_task`]).
//!
//! `start()` connects the links (fatal only if neither comes up), then
//! spawns a reply listener per link and a sync task per source.
//! `shutdown()` broadcasts the stop signal and drains every spawned
//! task with a bounded wait.

mod source_task;
mod types;

pub use source_task::{run_sync_loop, SourceTaskContext};
pub use types::{CyclePhase, EngineState, HealthCheck, LinkHealth, SourceHealth, SourceStatus};

use crate::config::RelayConfig;
use crate::correlation::CorrelationRegistry;
use crate::error::{RelayError, Result};
use crate::heartbeat::Heartbeat;
use crate::metrics;
use crate::resilience::RetryConfig;
use crate::rpc::{DbBridge, DbRpcBridge};
use crate::source::{StaticTableMapper, TableMapper, TelemetrySource};
use crate::transport::TransportAdapter;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};

/// The main relay engine.
///
/// Owns the broker transport and drives one sync loop per telemetry
/// source. The host daemon constructs it with [`RelayConfig`] and the
/// source implementations, then calls [`start()`](Self::start).
///
/// # Bridge Seam
///
/// The engine is generic over [`DbBridge`] so the scheduler can be
/// exercised without a broker; production uses the default
/// [`DbRpcBridge`] built from the config's links.
pub struct RelayEngine<B: DbBridge = DbRpcBridge> {
    config: RelayConfig,

    /// Lifecycle state, broadcast to watchers.
    state_tx: watch::Sender<EngineState>,
    state_rx: watch::Receiver<EngineState>,

    /// Stop signal shared by every spawned task.
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    registry: Arc<CorrelationRegistry>,

    /// Broker transport. `None` when a custom bridge was injected and
    /// no broker is involved (scheduler-only tests).
    adapter: Option<Arc<TransportAdapter>>,

    bridge: Arc<B>,
    sources: Vec<Arc<dyn TelemetrySource>>,
    mapper: Arc<dyn TableMapper>,
    heartbeat: Arc<Heartbeat>,

    /// Per-source status, index-aligned with `sources`.
    statuses: Vec<Arc<SourceStatus>>,

    /// Spawned task handles (listeners + source loops)
    task_handles: RwLock<Vec<tokio::task::JoinHandle<()>>>,
}

impl RelayEngine<DbRpcBridge> {
    /// Create an engine with the production RPC bridge.
    ///
    /// The table mapping comes from `config.tables`; broker links come
    /// from `config.links`. Nothing connects until `start()`.
    pub fn new(config: RelayConfig, sources: Vec<Arc<dyn TelemetrySource>>) -> Self {
        let registry = Arc::new(CorrelationRegistry::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let adapter = Arc::new(TransportAdapter::new(
            config.scope_id.clone(),
            config.links.primary.clone(),
            config.links.secondary.clone(),
            Arc::clone(&registry),
            shutdown_rx.clone(),
        ));
        let bridge = Arc::new(DbRpcBridge::new(
            Arc::clone(&adapter),
            Arc::clone(&registry),
            &config.settings.rpc,
        ));
        let mapper: Arc<dyn TableMapper> =
            Arc::new(StaticTableMapper::new(config.tables.clone()));

        Self::assemble(
            config,
            registry,
            Some(adapter),
            bridge,
            sources,
            mapper,
            shutdown_tx,
            shutdown_rx,
        )
    }
}

impl<B: DbBridge> RelayEngine<B> {
    /// Create an engine with an injected bridge and mapper.
    ///
    /// No broker transport is constructed; `start()` skips link setup.
    pub fn with_bridge(
        config: RelayConfig,
        bridge: Arc<B>,
        sources: Vec<Arc<dyn TelemetrySource>>,
        mapper: Arc<dyn TableMapper>,
    ) -> Self {
        let registry = Arc::new(CorrelationRegistry::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self::assemble(
            config,
            registry,
            None,
            bridge,
            sources,
            mapper,
            shutdown_tx,
            shutdown_rx,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        config: RelayConfig,
        registry: Arc<CorrelationRegistry>,
        adapter: Option<Arc<TransportAdapter>>,
        bridge: Arc<B>,
        sources: Vec<Arc<dyn TelemetrySource>>,
        mapper: Arc<dyn TableMapper>,
        shutdown_tx: watch::Sender<bool>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let heartbeat = Arc::new(Heartbeat::new(&config.settings.heartbeat));
        let statuses = sources
            .iter()
            .map(|s| Arc::new(SourceStatus::new(s.source_id())))
            .collect();

        Self {
            config,
            state_tx,
            state_rx,
            shutdown_tx,
            shutdown_rx,
            registry,
            adapter,
            bridge,
            sources,
            mapper,
            heartbeat,
            statuses,
            task_handles: RwLock::new(Vec::new()),
        }
    }

    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// A receiver the host daemon can watch for lifecycle transitions.
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), EngineState::Running)
    }

    /// The reply-topic namespace this engine operates under.
    pub fn scope_id(&self) -> &str {
        &self.config.scope_id
    }

    /// Get a reference to the bridge (for diagnostics).
    pub fn bridge(&self) -> &Arc<B> {
        &self.bridge
    }

    /// Start the relay engine.
    ///
    /// 1. Connects both broker links (fatal only if neither connects)
    /// 2. Spawns reply listeners
    /// 3. Spawns one sync task per source
    /// 4. Spawns the link health task (if enabled)
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != EngineState::Created {
            return Err(RelayError::InvalidState {
                expected: "Created".to_string(),
                actual: format!("{:?}", self.state()),
            });
        }

        info!(
            scope_id = %self.config.scope_id,
            source_count = self.sources.len(),
            "Starting relay engine"
        );

        let _ = self.state_tx.send(EngineState::Connecting);
        metrics::set_engine_state("Connecting");

        if let Some(adapter) = self.adapter.clone() {
            let connected = adapter.connect_links(&RetryConfig::startup()).await;
            if connected == 0 {
                error!("No broker link could be established");
                let _ = self.state_tx.send(EngineState::Failed);
                metrics::set_engine_state("Failed");
                return Err(RelayError::Config(
                    "failed to establish any broker link".to_string(),
                ));
            }
            if connected < adapter.links().len() {
                warn!(connected, total = adapter.links().len(), "Some broker links failed to connect");
            }

            let listener_handles = adapter.spawn_reply_listeners().await;
            self.task_handles.write().await.extend(listener_handles);

            if self.config.settings.link_health.enabled {
                self.spawn_link_health_task(Arc::clone(&adapter)).await;
            }
        }

        self.spawn_source_tasks().await;

        let _ = self.state_tx.send(EngineState::Running);
        metrics::set_engine_state("Running");
        info!(
            sources = self.sources.len(),
            "Relay engine running"
        );

        Ok(())
    }

    /// Spawn one sync loop per configured source.
    async fn spawn_source_tasks(&self) {
        let sync = &self.config.settings.sync;
        let mut handles = self.task_handles.write().await;

        for (source, status) in self.sources.iter().zip(&self.statuses) {
            let source = Arc::clone(source);
            let ctx = SourceTaskContext {
                bridge: Arc::clone(&self.bridge),
                mapper: Arc::clone(&self.mapper),
                heartbeat: Arc::clone(&self.heartbeat),
                status: Arc::clone(status),
                poll_interval: sync.poll_interval_duration(),
                catch_up_interval: sync.catch_up_interval_duration(),
                max_window_span: sync.max_window_span_duration(),
            };
            let shutdown_rx = self.shutdown_rx.clone();

            let source_id = source.source_id().to_string();
            handles.push(tokio::spawn(async move {
                run_sync_loop(source, ctx, shutdown_rx).await;
            }));
            info!(source_id = %source_id, "Spawned sync task");
        }
    }

    /// Spawn the link health check task.
    ///
    /// Periodically pings idle links to detect stale publish connections
    /// before a request pays for the discovery.
    async fn spawn_link_health_task(&self, adapter: Arc<TransportAdapter>) {
        let config = self.config.settings.link_health.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            let ping_interval = config.ping_interval_duration();
            let idle_threshold_ms = config.idle_threshold_duration().as_millis() as u64;
            let mut timer = tokio::time::interval(ping_interval);

            info!(
                ping_interval = ?ping_interval,
                idle_threshold_ms,
                "Starting link health check task"
            );

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        for link in adapter.links() {
                            if !link.is_connected().await {
                                continue;
                            }

                            let idle_ms = link.millis_since_success();
                            if idle_ms < idle_threshold_ms {
                                continue;
                            }

                            debug!(link = %link.kind(), idle_ms, "Pinging idle link");
                            match link.ping().await {
                                Ok(latency) => {
                                    debug!(
                                        link = %link.kind(),
                                        latency_ms = latency.as_millis() as u64,
                                        "Link ping successful"
                                    );
                                }
                                Err(e) => {
                                    warn!(link = %link.kind(), error = %e, "Link ping failed");
                                    link.mark_disconnected().await;
                                }
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            debug!("Link health task stopping");
                            break;
                        }
                    }
                }
            }
        });

        info!("Spawned link health check task");
        self.task_handles.write().await.push(handle);
    }

    /// Stop the engine: signal every task, wait (bounded) for each to
    /// finish its current step, then tear down the broker links.
    pub async fn shutdown(&mut self) {
        info!("Shutting down relay engine");
        let _ = self.state_tx.send(EngineState::ShuttingDown);
        metrics::set_engine_state("ShuttingDown");

        let _ = self.shutdown_tx.send(true);

        let handles: Vec<_> = {
            let mut guard = self.task_handles.write().await;
            std::mem::take(&mut *guard)
        };

        let task_count = handles.len();
        if task_count > 0 {
            info!(task_count, "Waiting for tasks to drain and complete");
        }

        let drain_timeout = std::time::Duration::from_secs(10);
        for (i, handle) in handles.into_iter().enumerate() {
            match tokio::time::timeout(drain_timeout, handle).await {
                Ok(Ok(())) => {
                    debug!(task = i + 1, "Task drained");
                }
                Ok(Err(e)) => {
                    warn!(task = i + 1, error = %e, "Task panicked while draining");
                }
                Err(_) => {
                    warn!(task = i + 1, "Task still running at drain deadline, detaching");
                }
            }
        }

        if let Some(adapter) = &self.adapter {
            adapter.shutdown_links();
        }

        let _ = self.state_tx.send(EngineState::Stopped);
        metrics::set_engine_state("Stopped");
        info!("Relay engine stopped");
    }

    /// Snapshot the engine for a monitoring endpoint.
    ///
    /// Reads only cached internal state (atomics, watch channels), so
    /// it is safe to call from a request handler at any frequency.
    pub async fn health_check(&self) -> HealthCheck {
        let state = self.state();

        let mut links = Vec::new();
        let mut links_connected = 0;
        if let Some(adapter) = &self.adapter {
            for link in adapter.links() {
                let connected = link.is_connected().await;
                if connected {
                    links_connected += 1;
                }
                links.push(LinkHealth {
                    kind: link.kind(),
                    connected,
                    circuit_open: link.is_circuit_open().await,
                    failure_count: link.failure_count(),
                    millis_since_success: link.millis_since_success(),
                });
            }
        }

        let sources = self.statuses.iter().map(|s| s.snapshot()).collect();

        // With no adapter (injected bridge) there are no links to be down.
        let ready =
            state == EngineState::Running && (self.adapter.is_none() || links_connected > 0);

        HealthCheck {
            state,
            ready,
            healthy: ready,
            pending_requests: self.registry.len(),
            links,
            sources,
        }
    }
}
