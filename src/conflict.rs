// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Collision detection between local pending edits and a pulled remote delta.
//!
//! This module only detects. Resolution is the caller's problem: the result
//! is every colliding local/remote pair per feature, so a three-way collision
//! (two local updates against one remote) yields two entries rather than one
//! deduplicated verdict. The resolver sees each pairwise reason.

use crate::action::Action;
use std::collections::BTreeMap;

/// Why a local/remote pair collides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictReason {
    /// One side deleted the feature the other side edited.
    Delete,
    /// Both sides moved the geometry.
    Geometry,
    /// Both sides changed at least one common field; carries the overlap.
    Fields(Vec<i64>),
}

impl std::fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictReason::Delete => write!(f, "concurrent delete"),
            ConflictReason::Geometry => write!(f, "concurrent geometry change"),
            ConflictReason::Fields(ids) => write!(f, "overlapping fields {:?}", ids),
        }
    }
}

/// One colliding local/remote action pair.
#[derive(Debug, Clone, PartialEq)]
pub struct Conflict {
    pub remote_id: i64,
    pub local: Action,
    pub remote: Action,
    pub reason: ConflictReason,
}

/// Compare a local pending batch against a remote delta.
///
/// Both sides are grouped by remote id; `Create` never participates (a row
/// the server has not seen cannot collide with anything remote). For each
/// feature known to both sides, every local action is compared against every
/// remote action:
///
/// - a `Delete` on either side conflicts with any concurrent action;
/// - two `Update`s conflict when both carry geometry or their changed-field
///   sets intersect. Disjoint field edits merge cleanly and do not conflict.
pub fn detect(local: &[Action], remote: &[Action]) -> Vec<Conflict> {
    let local_by_id = group_by_remote_id(local);
    let remote_by_id = group_by_remote_id(remote);

    let mut conflicts = Vec::new();
    for (remote_id, local_actions) in &local_by_id {
        let Some(remote_actions) = remote_by_id.get(remote_id) else {
            continue;
        };
        for l in local_actions {
            for r in remote_actions {
                if let Some(reason) = collision(l, r) {
                    conflicts.push(Conflict {
                        remote_id: *remote_id,
                        local: (*l).clone(),
                        remote: (*r).clone(),
                        reason,
                    });
                }
            }
        }
    }
    conflicts
}

fn group_by_remote_id(actions: &[Action]) -> BTreeMap<i64, Vec<&Action>> {
    let mut groups: BTreeMap<i64, Vec<&Action>> = BTreeMap::new();
    for action in actions {
        if let Some(id) = action.remote_id() {
            groups.entry(id).or_default().push(action);
        }
    }
    groups
}

fn collision(local: &Action, remote: &Action) -> Option<ConflictReason> {
    if matches!(local, Action::Delete { .. }) || matches!(remote, Action::Delete { .. }) {
        return Some(ConflictReason::Delete);
    }
    let (Action::Update { .. }, Action::Update { .. }) = (local, remote) else {
        return None;
    };
    if local.changes_geometry() && remote.changes_geometry() {
        return Some(ConflictReason::Geometry);
    }
    let remote_fields = remote.changed_field_ids();
    let overlap: Vec<i64> = local
        .changed_field_ids()
        .into_iter()
        .filter(|id| remote_fields.contains(id))
        .collect();
    if overlap.is_empty() {
        None
    } else {
        Some(ConflictReason::Fields(overlap))
    }
}
