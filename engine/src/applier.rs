//! Operation applier - turns operations into change sets for the state store.
//!
//! Each operation becomes exactly one [`ChangeSet`], so a user action that
//! touched several entities is never half visible. Operations are applied
//! strictly in the order given; the first failure stops the batch.

use crate::entity::{EntityType, StoragePattern};
use crate::error::Result;
use crate::operation::{EntityChange, OpType, Operation};
use crate::state::{merge_fields, ChangeSet, StateStore};
use crate::Error;
use serde_json::{json, Value};
use tracing::{debug, warn};

/// An operation that could not be applied.
#[derive(Debug)]
pub struct FailedApply {
    pub op: Operation,
    pub error: Error,
}

/// Outcome of applying a batch.
#[derive(Debug, Default)]
pub struct ApplyResult {
    /// Operations applied, in order. Always a prefix of the input.
    pub applied_ops: Vec<Operation>,
    pub failed: Option<FailedApply>,
}

impl ApplyResult {
    pub fn is_complete(&self) -> bool {
        self.failed.is_none()
    }
}

/// Applies operations to a [`StateStore`].
pub struct OperationApplier<'a, S: StateStore + ?Sized> {
    store: &'a S,
}

impl<'a, S: StateStore + ?Sized> OperationApplier<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Apply `ops` in order, stopping at the first failure.
    pub async fn apply(&self, ops: &[Operation]) -> ApplyResult {
        let mut result = ApplyResult::default();

        for op in ops {
            match self.apply_one(op).await {
                Ok(()) => result.applied_ops.push(op.clone()),
                Err(error) => {
                    warn!(op_id = %op.id, %error, "failed to apply operation");
                    result.failed = Some(FailedApply {
                        op: op.clone(),
                        error,
                    });
                    break;
                }
            }
        }

        debug!(
            applied = result.applied_ops.len(),
            failed = result.failed.is_some(),
            "applied operation batch"
        );
        result
    }

    async fn apply_one(&self, op: &Operation) -> Result<()> {
        let changes = self.change_set_for(op).await?;
        if changes.is_empty() {
            debug!(op_id = %op.id, "operation has no effect on current state");
            return Ok(());
        }
        self.store.apply_entity_change_set(changes).await
    }

    /// Compute the change set an operation produces against current state.
    pub async fn change_set_for(&self, op: &Operation) -> Result<ChangeSet> {
        if op.is_full_state() {
            return match &op.payload {
                Value::Object(_) => Ok(ChangeSet::ReplaceAll(op.payload.clone())),
                _ => Err(Error::InvalidOperation {
                    op_id: op.id.clone(),
                    reason: "full-state payload must be an object".into(),
                }),
            };
        }

        if !op.entity_changes.is_empty() {
            return Ok(ChangeSet::Entities(op.entity_changes.clone()));
        }

        if op.entity_type == EntityType::All {
            return Err(Error::InvalidOperation {
                op_id: op.id.clone(),
                reason: format!("{:?} cannot target the whole state", op.op_type),
            });
        }

        let mut ids = op.target_ids();
        if ids.is_empty() {
            if op.entity_type.is_keyed() {
                return Err(Error::InvalidOperation {
                    op_id: op.id.clone(),
                    reason: format!("{} operation without entity id", op.entity_type),
                });
            }
            ids.push(String::new());
        }

        let mut changes = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(change) = self.entity_change(op, &id).await? {
                changes.push(change);
            }
        }
        Ok(ChangeSet::Entities(changes))
    }

    async fn entity_change(&self, op: &Operation, id: &str) -> Result<Option<EntityChange>> {
        let entity_type = op.entity_type;
        let current = self.store.read_entity_state(entity_type, id).await?;

        let change = match op.op_type {
            OpType::Create => Some(EntityChange::created(entity_type, id, op.payload.clone())),
            OpType::Update => match (entity_type.storage(), current) {
                (StoragePattern::Collection | StoragePattern::Singleton, Some(current)) => {
                    let merged = merge_fields(&current, &op.payload);
                    Some(EntityChange::updated(entity_type, id, Some(current), merged))
                }
                (StoragePattern::Map | StoragePattern::Array, current) => Some(
                    EntityChange::updated(entity_type, id, current, op.payload.clone()),
                ),
                (StoragePattern::Singleton, None) => {
                    Some(EntityChange::created(entity_type, id, op.payload.clone()))
                }
                (StoragePattern::Collection, None) => {
                    return Err(Error::EntityNotFound {
                        entity_type: entity_type.to_string(),
                        entity_id: id.to_string(),
                    })
                }
                (StoragePattern::Virtual, _) => None,
            },
            // whole entity, recreated if it was deleted here
            OpType::LwwUpdate => Some(match current {
                Some(current) => {
                    EntityChange::updated(entity_type, id, Some(current), op.payload.clone())
                }
                None => EntityChange::created(entity_type, id, op.payload.clone()),
            }),
            OpType::Delete => {
                current.map(|current| EntityChange::deleted(entity_type, id, Some(current)))
            }
            OpType::Archive => current.map(|current| {
                let mut archived = merge_fields(&current, &op.payload);
                if !archived.is_object() {
                    archived = current.clone();
                }
                let archived = merge_fields(&archived, &json!({ "isArchived": true }));
                EntityChange::updated(entity_type, id, Some(current), archived)
            }),
            OpType::SyncImport | OpType::BackupImport | OpType::Repair => None,
        };

        Ok(change)
    }
}
