//! Replica state types.
//!
//! Defines the per-replica state machine the orchestrator drives.
//!
//! # State Transitions
//!
//! ```text
//!                    job accepted
//! NotInitialized ───────────────────→ Synchronizing
//!       ↑                                  │
//!       │ (stub fill failed,               │
//!       │  container missing)              │
//!       │                 ┌────────────────┼────────────────┐
//!       │                 ↓                ↓                ↓
//!       └──────────── Error        Synchronized    NotSynchronized
//!                    (retried          (clean)      (conflicts parked)
//!                   next tick)
//! ```
//!
//! Versioned replicas additionally walk a sub-state chain while
//! `Synchronizing`:
//!
//! ```text
//! NotInitialized → FetchingChanges → ConflictDetection → ChangesApplying
//!                                          │                   │
//!                                          ↓                   ↓
//!                                   ConflictSolving      UploadingChanges
//!                                    (job parks)               │
//!                                                              ↓
//!                                                         Synchronized
//! ```
//!
//! Non-versioned replicas stay in `NotVersionedLayer` and skip the chain.

use crate::conflict::Conflict;
use crate::error::ErrorKind;
use chrono::{DateTime, Utc};

/// Top-level state of one replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaState {
    /// No local container yet; the next job runs a stub fill.
    NotInitialized,

    /// A sync job is running. Rows are read-only until it finishes.
    Synchronizing,

    /// Last job completed and local state matches the server.
    Synchronized,

    /// Last job finished but left work behind, typically parked conflicts.
    NotSynchronized,

    /// Last job failed. The classification is on the replica status;
    /// the scheduler retries on a later tick.
    Error,
}

impl std::fmt::Display for ReplicaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicaState::NotInitialized => write!(f, "not_initialized"),
            ReplicaState::Synchronizing => write!(f, "synchronizing"),
            ReplicaState::Synchronized => write!(f, "synchronized"),
            ReplicaState::NotSynchronized => write!(f, "not_synchronized"),
            ReplicaState::Error => write!(f, "error"),
        }
    }
}

/// Sub-state chain for versioned replicas, visible while a job runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersioningState {
    /// The replica carries no epoch/version pair; the chain does not apply.
    NotVersionedLayer,
    NotInitialized,
    FetchingChanges,
    ConflictDetection,
    /// Conflicts were found; the job parked and a resolver must act.
    ConflictSolving,
    ChangesApplying,
    UploadingChanges,
    Synchronized,
}

impl std::fmt::Display for VersioningState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VersioningState::NotVersionedLayer => "not_versioned_layer",
            VersioningState::NotInitialized => "not_initialized",
            VersioningState::FetchingChanges => "fetching_changes",
            VersioningState::ConflictDetection => "conflict_detection",
            VersioningState::ConflictSolving => "conflict_solving",
            VersioningState::ChangesApplying => "changes_applying",
            VersioningState::UploadingChanges => "uploading_changes",
            VersioningState::Synchronized => "synchronized",
        };
        write!(f, "{}", s)
    }
}

/// User-visible status of one replica.
#[derive(Debug, Clone)]
pub struct ReplicaStatus {
    pub container_name: String,
    pub resource_id: i64,
    pub state: ReplicaState,
    pub versioning: VersioningState,
    /// Classification of the last failure, cleared on success.
    pub error_kind: Option<ErrorKind>,
    /// Conflicts parked by the last job, for a resolver to inspect.
    /// The engine never auto-resolves.
    pub conflicts: Vec<Conflict>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl ReplicaStatus {
    pub fn new(container_name: &str, resource_id: i64) -> Self {
        Self {
            container_name: container_name.to_string(),
            resource_id,
            state: ReplicaState::NotInitialized,
            versioning: VersioningState::NotInitialized,
            error_kind: None,
            conflicts: Vec::new(),
            last_checked_at: None,
            last_synced_at: None,
        }
    }
}
