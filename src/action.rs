// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The action model: one versioned operation on one feature.
//!
//! Actions are the transient, in-memory representation of edits. The
//! extractor builds them from the change log, the serializer moves them
//! across the wire in both directions, and the applier/reconciler/conflict
//! detector consume them. They are never persisted as their own entity.
//!
//! A closed sum type dispatched by `match`; adding a kind is a compile error
//! at every consumer until handled.

use crate::geometry::Geometry;
use crate::value::FieldValue;
use serde_json::Value;

/// One changed attribute: remote field id plus its new value.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldUpdate {
    pub field_id: i64,
    pub value: FieldValue,
}

impl FieldUpdate {
    pub fn new(field_id: i64, value: FieldValue) -> Self {
        Self { field_id, value }
    }
}

/// Kind discriminator, used for acknowledgement shape checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Create,
    Update,
    Delete,
    Restore,
    DescribePut,
    AttachmentCreate,
    AttachmentUpdate,
    AttachmentDelete,
    Continue,
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ActionKind::Create => "create",
            ActionKind::Update => "update",
            ActionKind::Delete => "delete",
            ActionKind::Restore => "restore",
            ActionKind::DescribePut => "describe_put",
            ActionKind::AttachmentCreate => "attachment_create",
            ActionKind::AttachmentUpdate => "attachment_update",
            ActionKind::AttachmentDelete => "attachment_delete",
            ActionKind::Continue => "continue",
        };
        write!(f, "{}", s)
    }
}

impl ActionKind {
    /// The inverse of `Display`, for decoding acknowledgements.
    pub fn from_wire(s: &str) -> Option<Self> {
        Some(match s {
            "create" => ActionKind::Create,
            "update" => ActionKind::Update,
            "delete" => ActionKind::Delete,
            "restore" => ActionKind::Restore,
            "describe_put" => ActionKind::DescribePut,
            "attachment_create" => ActionKind::AttachmentCreate,
            "attachment_update" => ActionKind::AttachmentUpdate,
            "attachment_delete" => ActionKind::AttachmentDelete,
            "continue" => ActionKind::Continue,
            _ => return None,
        })
    }
}

/// One versioned operation on one feature.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// A locally-created row not yet known to the server. `local_id` never
    /// crosses the wire; the server assigns the remote id on acknowledgement.
    Create {
        local_id: i64,
        version: Option<i64>,
        geometry: Option<Geometry>,
        fields: Vec<FieldUpdate>,
    },
    /// Changed attributes and/or geometry on an existing feature. Carries
    /// only what actually changed.
    Update {
        remote_id: i64,
        version: Option<i64>,
        geometry: Option<Geometry>,
        fields: Vec<FieldUpdate>,
    },
    Delete {
        remote_id: i64,
        version: Option<i64>,
    },
    /// An undone deletion; re-asserts the feature's content at `version`.
    Restore {
        remote_id: i64,
        version: i64,
        geometry: Option<Geometry>,
        fields: Vec<FieldUpdate>,
    },
    /// Replaces the feature description text.
    DescribePut {
        remote_id: i64,
        version: Option<i64>,
        text: Option<String>,
    },
    /// Attachment operations carry an opaque payload; binary transfer is out
    /// of scope and the applier treats these as no-ops.
    AttachmentCreate { remote_id: i64, payload: Value },
    AttachmentUpdate { remote_id: i64, payload: Value },
    AttachmentDelete { remote_id: i64, payload: Value },
    /// More remote actions exist past this page. Never applied; the
    /// orchestrator follows the cursor before the batch is complete.
    Continue { cursor_url: String },
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::Create { .. } => ActionKind::Create,
            Action::Update { .. } => ActionKind::Update,
            Action::Delete { .. } => ActionKind::Delete,
            Action::Restore { .. } => ActionKind::Restore,
            Action::DescribePut { .. } => ActionKind::DescribePut,
            Action::AttachmentCreate { .. } => ActionKind::AttachmentCreate,
            Action::AttachmentUpdate { .. } => ActionKind::AttachmentUpdate,
            Action::AttachmentDelete { .. } => ActionKind::AttachmentDelete,
            Action::Continue { .. } => ActionKind::Continue,
        }
    }

    /// The remote feature id this action targets, if it targets one.
    /// `Create` has none (the row is not yet known to the server), and
    /// `Continue` targets no feature at all.
    pub fn remote_id(&self) -> Option<i64> {
        match self {
            Action::Create { .. } | Action::Continue { .. } => None,
            Action::Update { remote_id, .. }
            | Action::Delete { remote_id, .. }
            | Action::Restore { remote_id, .. }
            | Action::DescribePut { remote_id, .. }
            | Action::AttachmentCreate { remote_id, .. }
            | Action::AttachmentUpdate { remote_id, .. }
            | Action::AttachmentDelete { remote_id, .. } => Some(*remote_id),
        }
    }

    /// Whether this action carries field/geometry data. Only data actions
    /// may cross the wire in versioned mode.
    pub fn is_data_action(&self) -> bool {
        matches!(
            self,
            Action::Create { .. }
                | Action::Update { .. }
                | Action::Delete { .. }
                | Action::Restore { .. }
                | Action::DescribePut { .. }
        )
    }

    /// The set of changed field ids, for conflict detection.
    pub fn changed_field_ids(&self) -> Vec<i64> {
        match self {
            Action::Create { fields, .. }
            | Action::Update { fields, .. }
            | Action::Restore { fields, .. } => fields.iter().map(|f| f.field_id).collect(),
            _ => Vec::new(),
        }
    }

    /// Whether this action changes geometry.
    pub fn changes_geometry(&self) -> bool {
        match self {
            Action::Create { geometry, .. }
            | Action::Update { geometry, .. }
            | Action::Restore { geometry, .. } => geometry.is_some(),
            _ => false,
        }
    }
}
