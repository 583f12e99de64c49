//! Operation types for expressing changes.
//!
//! Changes are expressed as operations, not direct mutations. An operation
//! records who made it, which entities it touches, what it carries, and the
//! author's causal position right after making it.

use crate::entity::{EntityKey, EntityType};
use crate::{ClientId, ClockComparison, EntityId, OperationId, SchemaVersion, Timestamp, VectorClock};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Schema version stamped on newly created operations.
pub const CURRENT_SCHEMA_VERSION: SchemaVersion = 1;

/// Kind of mutation an operation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpType {
    Create,
    /// Partial update: the payload holds changed fields only.
    Update,
    /// The payload holds the entity as it was before deletion.
    Delete,
    /// Move entities to the archive.
    Archive,
    /// Full state replacement from another device.
    SyncImport,
    /// Full state replacement from a backup file.
    BackupImport,
    /// Full state replacement produced by state repair.
    Repair,
    /// Whole-entity state chosen by last-write-wins resolution.
    ///
    /// Unlike [`OpType::Update`] this carries the complete entity and may
    /// recreate an entity that no longer exists locally.
    LwwUpdate,
}

impl OpType {
    /// Whether this operation replaces the entire application state.
    pub fn is_full_state(self) -> bool {
        matches!(
            self,
            OpType::SyncImport | OpType::BackupImport | OpType::Repair
        )
    }

    /// Whether this is an explicit user import (clean-slate semantics).
    pub fn is_import(self) -> bool {
        matches!(self, OpType::SyncImport | OpType::BackupImport)
    }
}

/// What happened to one entity inside an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeType {
    Created,
    Updated,
    Deleted,
}

/// One entity's part of a multi-entity user action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityChange {
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    pub change_type: ChangeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_state: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_state: Option<serde_json::Value>,
}

impl EntityChange {
    pub fn created(
        entity_type: EntityType,
        entity_id: impl Into<EntityId>,
        state: serde_json::Value,
    ) -> Self {
        Self {
            entity_type,
            entity_id: entity_id.into(),
            change_type: ChangeType::Created,
            before_state: None,
            after_state: Some(state),
        }
    }

    pub fn updated(
        entity_type: EntityType,
        entity_id: impl Into<EntityId>,
        before: Option<serde_json::Value>,
        after: serde_json::Value,
    ) -> Self {
        Self {
            entity_type,
            entity_id: entity_id.into(),
            change_type: ChangeType::Updated,
            before_state: before,
            after_state: Some(after),
        }
    }

    pub fn deleted(
        entity_type: EntityType,
        entity_id: impl Into<EntityId>,
        before: Option<serde_json::Value>,
    ) -> Self {
        Self {
            entity_type,
            entity_id: entity_id.into(),
            change_type: ChangeType::Deleted,
            before_state: before,
            after_state: None,
        }
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type, self.entity_id.clone())
    }
}

/// A single mutation of application state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    /// Globally unique, time-sortable id
    pub id: OperationId,
    /// Client that created the operation
    pub client_id: ClientId,
    pub op_type: OpType,
    pub entity_type: EntityType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<EntityId>,
    /// Targets of a bulk operation
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entity_ids: Vec<EntityId>,
    pub payload: serde_json::Value,
    /// Author's causal position after this operation
    pub vector_clock: VectorClock,
    /// Wall clock, only ever used for last-write-wins tie breaking
    pub timestamp: Timestamp,
    pub schema_version: SchemaVersion,
    /// Per-entity changes of a multi-entity action, applied atomically
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entity_changes: Vec<EntityChange>,
}

impl Operation {
    /// Create an operation with a fresh id.
    pub fn new(
        client_id: impl Into<ClientId>,
        op_type: OpType,
        entity_type: EntityType,
        entity_id: Option<EntityId>,
        payload: serde_json::Value,
        vector_clock: VectorClock,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            id: new_operation_id(),
            client_id: client_id.into(),
            op_type,
            entity_type,
            entity_id,
            entity_ids: Vec::new(),
            payload,
            vector_clock,
            timestamp,
            schema_version: CURRENT_SCHEMA_VERSION,
            entity_changes: Vec::new(),
        }
    }

    /// Whole-entity state chosen by last-write-wins.
    pub fn lww_update(
        client_id: impl Into<ClientId>,
        entity_type: EntityType,
        entity_id: impl Into<EntityId>,
        state: serde_json::Value,
        vector_clock: VectorClock,
        timestamp: Timestamp,
    ) -> Self {
        Self::new(
            client_id,
            OpType::LwwUpdate,
            entity_type,
            Some(entity_id.into()),
            state,
            vector_clock,
            timestamp,
        )
    }

    pub fn with_id(mut self, id: impl Into<OperationId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_entity_ids(mut self, ids: Vec<EntityId>) -> Self {
        self.entity_ids = ids;
        self
    }

    pub fn with_entity_changes(mut self, changes: Vec<EntityChange>) -> Self {
        self.entity_changes = changes;
        self
    }

    pub fn is_full_state(&self) -> bool {
        self.op_type.is_full_state()
    }

    pub fn is_archive(&self) -> bool {
        self.op_type == OpType::Archive
    }

    /// Ids of the entities this operation targets, without entity changes.
    pub fn target_ids(&self) -> Vec<EntityId> {
        if !self.entity_ids.is_empty() {
            self.entity_ids.clone()
        } else {
            self.entity_id.iter().cloned().collect()
        }
    }

    /// Every entity this operation touches. Full-state operations touch none
    /// individually.
    pub fn entity_keys(&self) -> Vec<EntityKey> {
        if self.is_full_state() {
            return Vec::new();
        }
        let mut keys: Vec<EntityKey> = if !self.entity_changes.is_empty() {
            self.entity_changes.iter().map(EntityChange::key).collect()
        } else {
            self.target_ids()
                .into_iter()
                .map(|id| EntityKey::new(self.entity_type, id))
                .collect()
        };
        if keys.is_empty() && !self.entity_type.is_keyed() {
            keys.push(EntityKey::new(self.entity_type, ""));
        }
        keys.sort();
        keys.dedup();
        keys
    }

    pub fn touches(&self, key: &EntityKey) -> bool {
        self.entity_keys().contains(key)
    }

    /// Deterministic wall-clock order: timestamp, then id.
    pub fn cmp_by_time(&self, other: &Operation) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// Current wall-clock time in milliseconds since the epoch.
pub fn now() -> Timestamp {
    chrono::Utc::now().timestamp_millis()
}

/// Generate a new time-sortable operation id.
pub fn new_operation_id() -> OperationId {
    uuid::Uuid::now_v7().to_string()
}

/// Order a batch for application.
///
/// Causal order wins: an operation is never placed before one whose clock it
/// dominates. Among operations that are free to go next, the earliest by
/// `(timestamp, id)` goes first, so every client produces the same sequence.
pub fn sort_for_apply(mut ops: Vec<Operation>) -> Vec<Operation> {
    ops.sort_by(Operation::cmp_by_time);
    let mut sorted = Vec::with_capacity(ops.len());

    while !ops.is_empty() {
        let next = (0..ops.len())
            .find(|&i| {
                !ops.iter().enumerate().any(|(j, other)| {
                    j != i
                        && other.vector_clock.compare(&ops[i].vector_clock)
                            == ClockComparison::LessThan
                })
            })
            // a cycle is impossible for a strict partial order, but corrupted
            // clocks must not stall the sort
            .unwrap_or(0);
        sorted.push(ops.remove(next));
    }

    sorted
}
