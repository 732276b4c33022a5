//! # Detached Sync
//!
//! A detached-editing engine: each remote vector dataset gets a local
//! SQLite replica that stays editable offline, with changes synchronized
//! back to the server on a schedule.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                           detached-sync                              │
//! │                                                                      │
//! │  ┌──────────────┐   ┌───────────┐   ┌──────────────────────────────┐ │
//! │  │ Orchestrator │──►│ Extractor │──►│ Serializer (versioned/plain) │ │
//! │  │ (scheduler)  │   │ Applier   │   │ at the wire boundary         │ │
//! │  └──────────────┘   │ Reconcile │   └──────────────────────────────┘ │
//! │         │           │ Conflicts │                  │                 │
//! │         ▼           └───────────┘                  ▼                 │
//! │  ┌──────────────┐         │           ┌─────────────────────────┐    │
//! │  │ ReplicaStore │◄────────┘           │ Transport (host-owned)  │    │
//! │  │ (SQLite)     │                     │ JSON over the network   │    │
//! │  └──────────────┘                     └─────────────────────────┘    │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Lifecycle
//!
//! 1. **Stub fill**: first contact creates the container and downloads the
//!    full snapshot.
//! 2. **Pull**: versioned replicas fetch delta pages, detect conflicts
//!    against local pending edits, then apply.
//! 3. **Push**: pending local edits are extracted, encoded, transmitted,
//!    and the server's acknowledgements folded back in.
//!
//! Edits made between syncs are captured row-by-row in the replica's
//! change log with immediate collapse rules, so a row created and deleted
//! offline never crosses the wire.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use detached_sync::{SyncConfig, ReplicaConfig, SyncOrchestrator};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = SyncConfig {
//!         connection_id: "prod".into(),
//!         endpoint: "https://gis.example.com".into(),
//!         replicas: vec![ReplicaConfig::for_testing(108, "roads.gpkg")],
//!         ..Default::default()
//!     };
//!
//!     let orchestrator = SyncOrchestrator::new(config);
//!     // Runs until shutdown signal
//!     orchestrator.run().await;
//! }
//! ```

pub mod action;
pub mod applier;
pub mod config;
pub mod conflict;
pub mod error;
pub mod executor;
pub mod extractor;
pub mod geometry;
pub mod metrics;
pub mod orchestrator;
pub mod reconcile;
pub mod serializer;
pub mod store;
pub mod transport;
pub mod value;
pub mod writer;

// Re-exports for convenience
pub use action::{Action, ActionKind, FieldUpdate};
pub use config::{ReplicaConfig, SyncConfig, TimingConfig};
pub use conflict::{detect, Conflict, ConflictReason};
pub use error::{ErrorKind, Result, SyncError, TransportError};
pub use geometry::Geometry;
pub use orchestrator::{ReplicaState, ReplicaStatus, SyncOrchestrator, VersioningState};
pub use reconcile::Acknowledgement;
pub use store::{FieldDef, FieldSchema, ReplicaMeta, ReplicaStore};
pub use transport::{NoOpTransport, ResourcePermissions, Transport};
pub use value::FieldValue;
pub use writer::{DatasetWriter, SqliteDatasetWriter};
