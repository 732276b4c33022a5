// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync orchestrator.
//!
//! The component that ties together:
//! - Replica stores via [`crate::store::ReplicaStore`]
//! - Change extraction via [`crate::extractor`]
//! - Remote deltas via [`crate::applier`] and [`crate::serializer`]
//! - Upload reconciliation via [`crate::reconcile`]
//!
//! # Architecture
//!
//! The orchestrator drives the full detached-editing lifecycle:
//! 1. Creates missing replica containers (stub fill + snapshot download)
//! 2. Pulls and applies remote deltas, detecting conflicts first
//! 3. Uploads pending local edits and folds acknowledgements back in
//! 4. Refreshes auxiliary metadata at most once per configured interval
//!
//! # Scheduling
//!
//! One job per process: `tick()` scans all replicas and is a no-op while any
//! of them is `Synchronizing`. Otherwise it starts at most one job,
//! servicing uninitialized replicas before initialized ones. This bounds
//! outbound load to a single in-flight job, trading per-replica freshness
//! for server-load predictability.

mod job;
mod types;

pub use types::{ReplicaState, ReplicaStatus, VersioningState};

use crate::config::{ReplicaConfig, SyncConfig};
use crate::executor::{TaskExecutor, TokioExecutor};
use crate::metrics;
use crate::store::ReplicaStore;
use crate::transport::{NoOpTransport, Transport};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info, warn};

/// Everything one replica carries between jobs.
pub(crate) struct ReplicaSlot {
    pub(super) config: ReplicaConfig,
    /// Container file path, `cache_root` + container name.
    pub(super) path: PathBuf,
    pub(super) status: RwLock<ReplicaStatus>,
    /// Opened lazily by the first job; cached for the process lifetime.
    pub(super) store: RwLock<Option<Arc<ReplicaStore>>>,
    pub(super) last_aux_refresh: Mutex<Option<Instant>>,
}

impl ReplicaSlot {
    fn new(config: ReplicaConfig, cache_root: &std::path::Path) -> Self {
        let path = cache_root.join(&config.container_name);
        let status = ReplicaStatus::new(&config.container_name, config.resource_id);
        Self {
            config,
            path,
            status: RwLock::new(status),
            store: RwLock::new(None),
            last_aux_refresh: Mutex::new(None),
        }
    }
}

/// The detached-editing sync engine.
///
/// Owns one [`ReplicaSlot`] per configured dataset and schedules sync jobs
/// across them. Construction is cheap and does no I/O; containers are
/// created or opened by the first job that touches them.
pub struct SyncOrchestrator<T: Transport = NoOpTransport> {
    config: SyncConfig,
    transport: Arc<T>,
    executor: Arc<dyn TaskExecutor>,
    slots: Vec<Arc<ReplicaSlot>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl SyncOrchestrator<NoOpTransport> {
    /// Create an orchestrator with the no-op transport (standalone mode).
    pub fn new(config: SyncConfig) -> Self {
        Self::with_transport(config, Arc::new(NoOpTransport))
    }
}

impl<T: Transport> SyncOrchestrator<T> {
    /// Create an orchestrator with a real transport. Jobs run on the
    /// ambient tokio runtime.
    pub fn with_transport(config: SyncConfig, transport: Arc<T>) -> Self {
        Self::with_executor(config, transport, Arc::new(TokioExecutor))
    }

    /// Full constructor: explicit transport and task executor.
    pub fn with_executor(
        config: SyncConfig,
        transport: Arc<T>,
        executor: Arc<dyn TaskExecutor>,
    ) -> Self {
        let slots = config
            .replicas
            .iter()
            .map(|r| Arc::new(ReplicaSlot::new(r.clone(), &config.cache_root)))
            .collect::<Vec<_>>();
        metrics::set_tracked_replicas(slots.len());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            config,
            transport,
            executor,
            slots,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Current status of every tracked replica.
    pub async fn status(&self) -> Vec<ReplicaStatus> {
        let mut out = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            out.push(slot.status.read().await.clone());
        }
        out
    }

    /// Status of one replica by container name.
    pub async fn replica_status(&self, container_name: &str) -> Option<ReplicaStatus> {
        for slot in &self.slots {
            if slot.config.container_name == container_name {
                return Some(slot.status.read().await.clone());
            }
        }
        None
    }

    /// The opened store for a replica, if a job has initialized it. This is
    /// how the host application edits rows between syncs.
    pub async fn store(&self, container_name: &str) -> Option<Arc<ReplicaStore>> {
        for slot in &self.slots {
            if slot.config.container_name == container_name {
                return slot.store.read().await.clone();
            }
        }
        None
    }

    /// Whether any replica has a job in flight.
    pub async fn is_synchronizing(&self) -> bool {
        for slot in &self.slots {
            if slot.status.read().await.state == ReplicaState::Synchronizing {
                return true;
            }
        }
        false
    }

    /// One scheduler scan. Starts at most one sync job; a no-op while any
    /// job is already in flight. Returns whether a job was started.
    pub async fn tick(&self) -> bool {
        if *self.shutdown_rx.borrow() {
            return false;
        }
        if self.is_synchronizing().await {
            debug!("Tick skipped: a sync job is in flight");
            return false;
        }

        // Uninitialized replicas first, then least recently checked.
        let mut candidates = Vec::new();
        for slot in &self.slots {
            if !slot.config.auto_sync {
                continue;
            }
            let status = slot.status.read().await;
            let uninitialized = status.state == ReplicaState::NotInitialized;
            candidates.push((slot.clone(), uninitialized, status.last_checked_at));
        }
        candidates.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));

        let Some((slot, _, _)) = candidates.into_iter().next() else {
            return false;
        };

        {
            let mut status = slot.status.write().await;
            status.state = ReplicaState::Synchronizing;
            metrics::set_replica_state(&status.container_name, &status.state.to_string());
        }
        info!(container = %slot.config.container_name, "Starting sync job");
        self.executor.submit(Box::pin(job::run(
            slot,
            self.transport.clone(),
            self.config.timing.clone(),
            self.config.connection_id.clone(),
        )));
        true
    }

    /// Background scheduler loop: tick every `sync_period` until shutdown.
    pub async fn run(&self) {
        let mut timer = tokio::time::interval(self.config.timing.sync_period());
        let mut shutdown_rx = self.shutdown_rx.clone();
        info!(
            replicas = self.slots.len(),
            period_sec = self.config.timing.sync_period_sec,
            "Scheduler running"
        );
        loop {
            tokio::select! {
                _ = timer.tick() => {
                    self.tick().await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        debug!("Scheduler stopping");
                        break;
                    }
                }
            }
        }
    }

    /// Graceful shutdown: stop scheduling new jobs, then wait up to the
    /// drain timeout for the in-flight job to reach a terminal state.
    pub async fn shutdown(&self) {
        info!("Shutting down sync orchestrator");
        let _ = self.shutdown_tx.send(true);

        let deadline = Instant::now() + self.config.timing.drain_timeout();
        while self.is_synchronizing().await {
            if Instant::now() >= deadline {
                warn!("In-flight sync job did not drain before the timeout");
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        info!("Sync orchestrator stopped");
    }
}
