// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The push-acknowledgement path: folding the server's transaction result
//! back into the replica.
//!
//! Uploading pending edits is a two-step exchange. The extractor builds the
//! action batch, the orchestrator POSTs it, and the server answers with one
//! acknowledgement per action in the same order. This module checks that the
//! answer has the exact shape of the question and, only then, retires the
//! corresponding change-log entries inside one transaction. A shape mismatch
//! commits nothing, so the same batch can be re-sent after the next pull.

use crate::action::{Action, ActionKind};
use crate::error::{Result, SyncError};
use crate::store::{self, changelog, ReplicaStore};
use serde_json::Value;
use tracing::{debug, warn};

/// One per-action server acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acknowledgement {
    pub kind: ActionKind,
    /// Server-assigned feature id. Always present for `Create`.
    pub remote_id: Option<i64>,
    /// Feature version after the server applied the action.
    pub version: Option<i64>,
}

impl Acknowledgement {
    /// Decode a transaction response body into an acknowledgement batch.
    ///
    /// Accepts the same two shapes the delta endpoint uses: bare objects or
    /// `{"seq": n, "action": {...}}` envelopes.
    pub fn parse_batch(body: &Value) -> Result<Vec<Acknowledgement>> {
        let items = body.as_array().ok_or_else(|| {
            SyncError::Synchronization("transaction response is not an array".into())
        })?;

        let mut acks = Vec::with_capacity(items.len());
        for item in items {
            let obj = if item.get("action").map_or(false, Value::is_object) {
                &item["action"]
            } else {
                item
            };
            let kind_str = obj
                .get("action")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    SyncError::Synchronization("acknowledgement missing action kind".into())
                })?;
            let kind = ActionKind::from_wire(kind_str).ok_or_else(|| {
                SyncError::Synchronization(format!("unknown acknowledgement kind {kind_str:?}"))
            })?;
            acks.push(Acknowledgement {
                kind,
                remote_id: obj.get("id").and_then(Value::as_i64),
                version: obj.get("version").and_then(Value::as_i64),
            });
        }
        Ok(acks)
    }
}

/// Retire acknowledged pending changes.
///
/// `actions` is the batch that was uploaded, `acks` the server's answer
/// positionally matched to it. The whole fold is one transaction; a second
/// call with the same inputs is a no-op.
pub async fn reconcile_acknowledged(
    store: &ReplicaStore,
    actions: &[Action],
    acks: &[Acknowledgement],
) -> Result<()> {
    if acks.len() != actions.len() {
        return Err(SyncError::Synchronization(format!(
            "acknowledgement count mismatch: sent {}, got {}",
            actions.len(),
            acks.len()
        )));
    }
    for (i, (action, ack)) in actions.iter().zip(acks).enumerate() {
        if ack.kind != action.kind() {
            return Err(SyncError::Synchronization(format!(
                "acknowledgement {} is {}, expected {}",
                i,
                ack.kind,
                action.kind()
            )));
        }
    }

    let mut tx = store.pool().begin().await?;
    for (action, ack) in actions.iter().zip(acks) {
        match action {
            Action::Create { local_id, .. } => {
                let remote_id = ack.remote_id.ok_or_else(|| {
                    SyncError::Synchronization(
                        "create acknowledged without a feature id".into(),
                    )
                })?;
                store::set_remote_identity(&mut tx, *local_id, remote_id, ack.version)
                    .await?;
                changelog::clear_added(&mut tx, *local_id).await?;
            }

            Action::Delete { remote_id, .. } => {
                // The row itself was removed at edit time; only the mapping
                // and the log entry remain.
                let Some(fid) = store::fid_for_remote_tx(&mut tx, *remote_id).await? else {
                    debug!(remote_id, "Delete already reconciled");
                    continue;
                };
                store::delete_mapping(&mut tx, fid).await?;
                changelog::clear_removed(&mut tx, fid).await?;
            }

            Action::Restore { remote_id, .. } => {
                let Some(fid) = store::fid_for_remote_tx(&mut tx, *remote_id).await? else {
                    debug!(remote_id, "Restore already reconciled");
                    continue;
                };
                store::bump_remote_version(&mut tx, fid, ack.version).await?;
                changelog::clear_restored(&mut tx, fid).await?;
            }

            Action::Update { remote_id, .. } => {
                let Some(fid) = store::fid_for_remote_tx(&mut tx, *remote_id).await? else {
                    debug!(remote_id, "Update already reconciled");
                    continue;
                };
                store::bump_remote_version(&mut tx, fid, ack.version).await?;
                changelog::clear_updates(&mut tx, fid).await?;
            }

            Action::DescribePut { .. }
            | Action::AttachmentCreate { .. }
            | Action::AttachmentUpdate { .. }
            | Action::AttachmentDelete { .. } => {
                // Nothing of these lives in the change log.
            }

            Action::Continue { .. } => {
                warn!("Continue in an uploaded batch; ignoring its acknowledgement");
            }
        }
    }
    tx.commit().await?;
    debug!(count = actions.len(), "Reconciled acknowledged batch");
    Ok(())
}
