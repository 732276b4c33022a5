//! Shared test utilities for integration tests.
//!
//! This module provides:
//! - A scripted [`MockTransport`] recording every call
//! - Canned server payloads (resource metadata, snapshots, delta pages)
//! - A polling helper for waiting on replica state transitions

use async_trait::async_trait;
use detached_sync::transport::{ResourcePermissions, Transport, TransportResult};
use detached_sync::{ReplicaState, SyncOrchestrator, TransportError};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Once;
use std::time::Duration;
use tokio::sync::RwLock;

static TRACING: Once = Once::new();

/// Install the test tracing subscriber once per binary. Controlled by
/// `RUST_LOG`, quiet by default.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A recorded transport call.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub method: &'static str,
    pub path: String,
    pub body: Option<Value>,
}

/// Mock transport with scripted responses.
///
/// GET responses are queued per path prefix; the first queued response whose
/// prefix matches the requested path is consumed. Unmatched GETs return an
/// empty array, so snapshot and extension fetches succeed by default.
///
/// # Example
/// ```rust,ignore
/// let transport = MockTransport::new();
/// transport.stub_get("/resource/108/delta", json!([...])).await;
/// transport.stub_post(json!([{"action": "create", "id": 42}])).await;
/// ```
pub struct MockTransport {
    get_responses: RwLock<Vec<(String, VecDeque<TransportResult<Value>>)>>,
    post_responses: RwLock<VecDeque<TransportResult<Value>>>,
    calls: RwLock<Vec<RecordedCall>>,
    permissions: RwLock<ResourcePermissions>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            get_responses: RwLock::new(Vec::new()),
            post_responses: RwLock::new(VecDeque::new()),
            calls: RwLock::new(Vec::new()),
            permissions: RwLock::new(ResourcePermissions {
                read: true,
                write: true,
            }),
        }
    }

    /// Queue a GET response for paths starting with `prefix`.
    pub async fn stub_get(&self, prefix: &str, response: Value) {
        self.stub_get_result(prefix, Ok(response)).await;
    }

    /// Queue a GET failure for paths starting with `prefix`.
    pub async fn stub_get_err(&self, prefix: &str, err: TransportError) {
        self.stub_get_result(prefix, Err(err)).await;
    }

    async fn stub_get_result(&self, prefix: &str, result: TransportResult<Value>) {
        let mut responses = self.get_responses.write().await;
        if let Some((_, queue)) = responses.iter_mut().find(|(p, _)| p == prefix) {
            queue.push_back(result);
        } else {
            responses.push((prefix.to_string(), VecDeque::from([result])));
        }
    }

    /// Queue a POST response (consumed in order, any path).
    pub async fn stub_post(&self, response: Value) {
        self.post_responses.write().await.push_back(Ok(response));
    }

    #[allow(dead_code)] // Useful for permission-denied scenarios
    pub async fn set_permissions(&self, read: bool, write: bool) {
        *self.permissions.write().await = ResourcePermissions { read, write };
    }

    /// Count of GETs whose path starts with `prefix`.
    pub async fn get_count(&self, prefix: &str) -> usize {
        self.calls
            .read()
            .await
            .iter()
            .filter(|c| c.method == "GET" && c.path.starts_with(prefix))
            .count()
    }

    /// Bodies of every recorded POST.
    pub async fn posted_bodies(&self) -> Vec<Value> {
        self.calls
            .read()
            .await
            .iter()
            .filter(|c| c.method == "POST")
            .filter_map(|c| c.body.clone())
            .collect()
    }

    async fn record(&self, method: &'static str, path: &str, body: Option<Value>) {
        self.calls.write().await.push(RecordedCall {
            method,
            path: path.to_string(),
            body,
        });
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn get(&self, path: &str) -> TransportResult<Value> {
        self.record("GET", path, None).await;
        let mut responses = self.get_responses.write().await;
        // Longest matching prefix with responses left wins, so a stub for
        // "/resource/7" never shadows one for "/resource/7/feature/".
        let best = responses
            .iter_mut()
            .filter(|(prefix, queue)| path.starts_with(prefix.as_str()) && !queue.is_empty())
            .max_by_key(|(prefix, _)| prefix.len());
        match best {
            Some((_, queue)) => queue.pop_front().unwrap_or(Ok(json!([]))),
            None => Ok(json!([])),
        }
    }

    async fn post(&self, path: &str, body: Value) -> TransportResult<Value> {
        self.record("POST", path, Some(body)).await;
        self.post_responses
            .write()
            .await
            .pop_front()
            .unwrap_or_else(|| Ok(json!([])))
    }

    async fn patch(&self, path: &str, body: Value) -> TransportResult<Value> {
        self.record("PATCH", path, Some(body)).await;
        Ok(json!([]))
    }

    async fn delete(&self, path: &str, body: Value) -> TransportResult<Value> {
        self.record("DELETE", path, Some(body)).await;
        Ok(json!([]))
    }

    async fn permissions(&self, _resource_id: i64) -> TransportResult<ResourcePermissions> {
        Ok(*self.permissions.read().await)
    }
}

/// Resource metadata payload with two fields: 100 "name" (STRING, label)
/// and 101 "lanes" (INTEGER).
pub fn resource_metadata(versioned: bool, version: i64) -> Value {
    json!({
        "resource": {
            "display_name": "Roads",
            "keyname": "roads",
            "instance": "test-instance"
        },
        "feature_layer": {
            "geometry_type": "POINT",
            "fields": [
                {"id": 100, "keyname": "name", "datatype": "STRING",
                 "display_name": "Name", "label_field": true},
                {"id": 101, "keyname": "lanes", "datatype": "INTEGER"}
            ]
        },
        "versioning": {"enabled": versioned, "epoch": 1, "version": version}
    })
}

/// Poll a replica's status until `pred` holds or the timeout expires.
pub async fn wait_for_state<T: Transport>(
    orch: &SyncOrchestrator<T>,
    container: &str,
    pred: impl Fn(ReplicaState) -> bool,
) -> ReplicaState {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let status = orch
            .replica_status(container)
            .await
            .expect("unknown replica");
        if pred(status.state) {
            return status.state;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!(
                "replica {} stuck in {:?} before reaching expected state",
                container, status.state
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait until the replica settles in any terminal state.
pub async fn wait_terminal<T: Transport>(
    orch: &SyncOrchestrator<T>,
    container: &str,
) -> ReplicaState {
    wait_for_state(orch, container, |s| {
        s != ReplicaState::Synchronizing && s != ReplicaState::NotInitialized
    })
    .await
}
