//! Configuration for the synchronization engine.
//!
//! Configuration is passed to
//! [`SyncOrchestrator::new()`](crate::orchestrator::SyncOrchestrator::new)
//! explicitly; there is no ambient singleton state. It can be constructed
//! programmatically or deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use detached_sync::config::{SyncConfig, ReplicaConfig};
//!
//! let config = SyncConfig {
//!     connection_id: "prod".into(),
//!     endpoint: "https://gis.example.com".into(),
//!     replicas: vec![
//!         ReplicaConfig::for_testing(108, "roads.gpkg"),
//!     ],
//!     ..Default::default()
//! };
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! SyncConfig
//! ├── connection_id: String       # Identifies the remote connection
//! ├── endpoint: String            # Server base URL (transport resolves it)
//! ├── cache_root: PathBuf         # Directory holding replica store files
//! ├── replicas: Vec<ReplicaConfig># Datasets to keep synchronized
//! └── timing: TimingConfig        # Tick period, call timeouts, aux refresh
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// The top-level config object passed to `SyncOrchestrator::new()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Identifier of the remote connection (credentials live with the
    /// transport, not here).
    pub connection_id: String,

    /// Server base URL. Opaque to the engine; the transport resolves paths
    /// against it.
    pub endpoint: String,

    /// Directory under which replica store files live.
    #[serde(default = "default_cache_root")]
    pub cache_root: PathBuf,

    /// The datasets to keep synchronized.
    pub replicas: Vec<ReplicaConfig>,

    /// Scheduler and transport timing knobs.
    #[serde(default)]
    pub timing: TimingConfig,
}

fn default_cache_root() -> PathBuf {
    PathBuf::from("detached_layers")
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            connection_id: "default".to_string(),
            endpoint: String::new(),
            cache_root: default_cache_root(),
            replicas: Vec::new(),
            timing: TimingConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Create a minimal config for testing.
    pub fn for_testing(cache_root: impl Into<PathBuf>) -> Self {
        Self {
            connection_id: "test-connection".to_string(),
            endpoint: "https://test.invalid".to_string(),
            cache_root: cache_root.into(),
            replicas: Vec::new(),
            timing: TimingConfig::for_testing(),
        }
    }
}

/// One replica: a local store file mirroring one remote vector resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaConfig {
    /// Remote resource id on the server.
    pub resource_id: i64,

    /// File name of the replica store, relative to `cache_root`.
    pub container_name: String,

    /// Whether the scheduler should sync this replica automatically.
    #[serde(default = "default_true")]
    pub auto_sync: bool,
}

fn default_true() -> bool {
    true
}

impl ReplicaConfig {
    /// Create a replica config for testing.
    pub fn for_testing(resource_id: i64, container_name: &str) -> Self {
        Self {
            resource_id,
            container_name: container_name.to_string(),
            auto_sync: true,
        }
    }
}

/// Scheduler and transport timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// How often the scheduler scans replicas (seconds).
    #[serde(default = "default_sync_period_sec")]
    pub sync_period_sec: u64,

    /// Per-transport-call timeout (seconds). Expiry fails the job; the
    /// scheduler retries on a later tick, never inline.
    #[serde(default = "default_call_timeout_sec")]
    pub call_timeout_sec: u64,

    /// Minimum interval between auxiliary-metadata refreshes (seconds).
    /// Field aliases, lookup tables and edit permission are refetched at
    /// most this often after the first successful sync.
    #[serde(default = "default_aux_refresh_sec")]
    pub aux_refresh_sec: u64,

    /// How long shutdown waits for the in-flight job to drain (seconds).
    #[serde(default = "default_drain_timeout_sec")]
    pub drain_timeout_sec: u64,
}

fn default_sync_period_sec() -> u64 {
    60
}

fn default_call_timeout_sec() -> u64 {
    30
}

fn default_aux_refresh_sec() -> u64 {
    3600 // at most once per hour
}

fn default_drain_timeout_sec() -> u64 {
    10
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            sync_period_sec: 60,
            call_timeout_sec: 30,
            aux_refresh_sec: 3600,
            drain_timeout_sec: 10,
        }
    }
}

impl TimingConfig {
    /// Fast timing for tests.
    pub fn for_testing() -> Self {
        Self {
            sync_period_sec: 1,
            call_timeout_sec: 2,
            aux_refresh_sec: 3600,
            drain_timeout_sec: 2,
        }
    }

    pub fn sync_period(&self) -> Duration {
        Duration::from_secs(self.sync_period_sec)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_sec)
    }

    pub fn aux_refresh(&self) -> Duration {
        Duration::from_secs(self.aux_refresh_sec)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_sec)
    }
}
