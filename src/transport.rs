// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Server transport abstraction.
//!
//! The orchestrator never talks HTTP directly; it goes through [`Transport`],
//! which the host application implements over its own connection stack
//! (authentication, retries, proxies). Transport calls are the only
//! suspension points in a sync job and each one is wrapped in a per-call
//! timeout by the orchestrator.
//!
//! [`NoOpTransport`] serves standalone mode: a replica that is edited offline
//! with no server configured.

use crate::error::TransportError;
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// What the server lets the current credentials do with a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourcePermissions {
    pub read: bool,
    pub write: bool,
}

/// JSON-level access to the remote server.
///
/// Paths are relative to the configured endpoint. Implementations own
/// connection reuse and authentication; they must not retry internally,
/// the orchestrator schedules retries across ticks.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn get(&self, path: &str) -> TransportResult<Value>;

    async fn post(&self, path: &str, body: Value) -> TransportResult<Value>;

    async fn patch(&self, path: &str, body: Value) -> TransportResult<Value>;

    async fn delete(&self, path: &str, body: Value) -> TransportResult<Value>;

    /// Current read/write grants for a resource.
    async fn permissions(&self, resource_id: i64) -> TransportResult<ResourcePermissions>;
}

/// A transport for standalone mode: every read returns an empty result and
/// every write is logged and discarded. Edits accumulate locally until a
/// real transport is wired in.
#[derive(Clone)]
pub struct NoOpTransport;

#[async_trait]
impl Transport for NoOpTransport {
    async fn get(&self, path: &str) -> TransportResult<Value> {
        debug!(path, "NoOp transport: empty response");
        Ok(json!([]))
    }

    async fn post(&self, path: &str, _body: Value) -> TransportResult<Value> {
        debug!(path, "NoOp transport: discarding POST");
        Ok(json!([]))
    }

    async fn patch(&self, path: &str, _body: Value) -> TransportResult<Value> {
        debug!(path, "NoOp transport: discarding PATCH");
        Ok(json!([]))
    }

    async fn delete(&self, path: &str, _body: Value) -> TransportResult<Value> {
        debug!(path, "NoOp transport: discarding DELETE");
        Ok(json!([]))
    }

    async fn permissions(&self, _resource_id: i64) -> TransportResult<ResourcePermissions> {
        // Full grants so standalone replicas stay editable.
        Ok(ResourcePermissions {
            read: true,
            write: true,
        })
    }
}
