// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The pull path: writing remote-originated actions into the replica store.
//!
//! One call applies one decoded delta page as a single transaction. Remote
//! writes never touch the change log; they are the server's state, not
//! pending local edits.
//!
//! A single malformed `Update`/`Delete`/`DescribePut` referencing an unknown
//! local row is logged and skipped rather than aborting the whole batch; the
//! missing row usually means the server already told us about a deletion we
//! applied earlier in the same delta.

use crate::action::Action;
use crate::error::Result;
use crate::store::{self, FeatureMapping, ReplicaStore};
use crate::value::FieldValue;
use tracing::{debug, warn};

/// Counters for one applied batch.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ApplyStats {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub described: usize,
    /// Actions referencing rows this replica does not know.
    pub skipped: usize,
    /// Attachment actions accepted as no-ops.
    pub attachments_ignored: usize,
}

/// Apply a batch of remote actions, one transaction for the whole batch.
///
/// `Continue` must be stripped by the orchestrator before this point; it is
/// a paging signal, not an applicable action.
pub async fn apply_remote(store: &ReplicaStore, actions: &[Action]) -> Result<ApplyStats> {
    let schema = store.field_schema().await?;
    let mut stats = ApplyStats::default();
    let mut tx = store.pool().begin().await?;

    for action in actions {
        match action {
            Action::Create {
                local_id: remote_id,
                version,
                geometry,
                fields,
            } => {
                // Remote-decoded creates carry the server's feature id in the
                // id slot (see the serializer). A re-fetched page can repeat a
                // create we already hold; apply those in place so a replayed
                // delta never trips the unique remote_id constraint.
                if let Some(fid) = store::fid_for_remote_tx(&mut tx, *remote_id).await? {
                    warn!(remote_id, "Create for known feature; updating in place");
                    let mut attr_updates = Vec::with_capacity(fields.len());
                    for f in fields {
                        attr_updates
                            .push((schema.index_for_field_id(f.field_id)?, f.value.clone()));
                    }
                    store::update_feature_row(&mut tx, fid, geometry.as_ref(), &attr_updates)
                        .await?;
                    store::bump_remote_version(&mut tx, fid, *version).await?;
                    stats.updated += 1;
                    continue;
                }
                let mut attrs = vec![FieldValue::Null; schema.len()];
                for f in fields {
                    let idx = schema.index_for_field_id(f.field_id)? as usize;
                    if idx >= attrs.len() {
                        attrs.resize(idx + 1, FieldValue::Null);
                    }
                    attrs[idx] = f.value.clone();
                }
                let fid = store::insert_feature_row(&mut tx, geometry.as_ref(), &attrs).await?;
                store::insert_mapping(
                    &mut tx,
                    &FeatureMapping {
                        fid,
                        remote_id: Some(*remote_id),
                        remote_version: *version,
                        description: None,
                    },
                )
                .await?;
                stats.created += 1;
            }

            Action::Update {
                remote_id,
                version,
                geometry,
                fields,
            } => {
                let Some(fid) = store::fid_for_remote_tx(&mut tx, *remote_id).await? else {
                    warn!(remote_id, "Update for unknown feature; skipping");
                    stats.skipped += 1;
                    continue;
                };
                let mut attr_updates = Vec::with_capacity(fields.len());
                for f in fields {
                    attr_updates
                        .push((schema.index_for_field_id(f.field_id)?, f.value.clone()));
                }
                store::update_feature_row(&mut tx, fid, geometry.as_ref(), &attr_updates)
                    .await?;
                store::bump_remote_version(&mut tx, fid, *version).await?;
                stats.updated += 1;
            }

            Action::Delete { remote_id, .. } => {
                let Some(fid) = store::fid_for_remote_tx(&mut tx, *remote_id).await? else {
                    warn!(remote_id, "Delete for unknown feature; skipping");
                    stats.skipped += 1;
                    continue;
                };
                store::delete_feature_row(&mut tx, fid).await?;
                store::delete_mapping(&mut tx, fid).await?;
                stats.deleted += 1;
            }

            Action::Restore {
                remote_id,
                version,
                geometry,
                fields,
            } => {
                // A remote restore is an update that also carries the full
                // content; the row still exists locally unless we also saw
                // the delete, in which case it was skipped above.
                let Some(fid) = store::fid_for_remote_tx(&mut tx, *remote_id).await? else {
                    warn!(remote_id, "Restore for unknown feature; skipping");
                    stats.skipped += 1;
                    continue;
                };
                let mut attr_updates = Vec::with_capacity(fields.len());
                for f in fields {
                    attr_updates
                        .push((schema.index_for_field_id(f.field_id)?, f.value.clone()));
                }
                store::update_feature_row(&mut tx, fid, geometry.as_ref(), &attr_updates)
                    .await?;
                store::bump_remote_version(&mut tx, fid, Some(*version)).await?;
                stats.updated += 1;
            }

            Action::DescribePut {
                remote_id, text, ..
            } => {
                let Some(fid) = store::fid_for_remote_tx(&mut tx, *remote_id).await? else {
                    warn!(remote_id, "Description for unknown feature; skipping");
                    stats.skipped += 1;
                    continue;
                };
                store::set_mapping_description(&mut tx, fid, text.as_deref()).await?;
                stats.described += 1;
            }

            Action::AttachmentCreate { .. }
            | Action::AttachmentUpdate { .. }
            | Action::AttachmentDelete { .. } => {
                // Accepted, not applied: attachment binary transfer is out of
                // scope.
                stats.attachments_ignored += 1;
            }

            Action::Continue { .. } => {
                debug_assert!(false, "Continue must be stripped before apply");
                warn!("Continue action reached the applier; ignoring");
                stats.skipped += 1;
            }
        }
    }

    tx.commit().await?;
    debug!(?stats, "Applied remote batch");
    Ok(stats)
}
