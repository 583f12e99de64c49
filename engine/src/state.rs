//! The application state store boundary.
//!
//! The engine never owns entity state. It computes what should change and
//! hands a [`ChangeSet`] to a [`StateStore`], which commits it all-or-nothing.

use crate::entity::{EntityType, StoragePattern};
use crate::error::Result;
use crate::operation::{ChangeType, EntityChange};
use crate::Error;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::RwLock;

/// A unit of change committed atomically by the state store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "camelCase")]
pub enum ChangeSet {
    /// Per-entity changes of one user action.
    Entities(Vec<EntityChange>),
    /// Replace the whole application state.
    ReplaceAll(Value),
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        matches!(self, ChangeSet::Entities(changes) if changes.is_empty())
    }
}

/// External holder of current entity state.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Current state of one entity, or `None` if it does not exist.
    ///
    /// Singleton and array kinds ignore `entity_id` and return the whole value.
    async fn read_entity_state(&self, entity_type: EntityType, entity_id: &str)
        -> Result<Option<Value>>;

    /// Commit a change set. Either all of it becomes visible or none of it.
    async fn apply_entity_change_set(&self, changes: ChangeSet) -> Result<()>;

    /// The whole application state, keyed by [`EntityType::state_key`].
    async fn export_state(&self) -> Result<Value>;

    /// Fix up state left inconsistent by conflict resolution.
    ///
    /// Must be idempotent. Returns whether anything was changed.
    async fn repair(&self) -> Result<bool> {
        Ok(false)
    }
}

/// Shallow merge of `changes` into `base`. Non-object values replace.
pub fn merge_fields(base: &Value, changes: &Value) -> Value {
    match (base, changes) {
        (Value::Object(base), Value::Object(changes)) => {
            let mut merged = base.clone();
            for (key, value) in changes {
                merged.insert(key.clone(), value.clone());
            }
            Value::Object(merged)
        }
        (_, changes) => changes.clone(),
    }
}

/// In-memory [`StateStore`].
///
/// State is a JSON object keyed by [`EntityType::state_key`]. Keyed kinds hold
/// an object of id to entity; singleton and array kinds hold their value
/// directly.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    state: RwLock<Map<String, Value>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store from an exported state object.
    pub fn from_state(state: Value) -> Result<Self> {
        Ok(Self {
            state: RwLock::new(into_state_map(state)?),
        })
    }

    /// Number of entities of a keyed kind.
    pub async fn count(&self, entity_type: EntityType) -> usize {
        let state = self.state.read().await;
        match state.get(entity_type.state_key()) {
            Some(Value::Object(entities)) if entity_type.is_keyed() => entities.len(),
            Some(Value::Null) | None => 0,
            Some(_) => 1,
        }
    }
}

fn into_state_map(state: Value) -> Result<Map<String, Value>> {
    match state {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        other => Err(Error::SyncDataCorrupted(format!(
            "state must be an object, got {}",
            type_name(&other)
        ))),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn apply_change(state: &mut Map<String, Value>, change: &EntityChange) -> Result<()> {
    let slot_key = change.entity_type.state_key();

    match change.entity_type.storage() {
        StoragePattern::Collection | StoragePattern::Map => {
            let slot = state
                .entry(slot_key.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if slot.is_null() {
                *slot = Value::Object(Map::new());
            }
            let entities = slot.as_object_mut().ok_or_else(|| {
                Error::SyncDataCorrupted(format!("'{slot_key}' is not an object"))
            })?;
            match (change.change_type, &change.after_state) {
                (ChangeType::Deleted, _) => {
                    entities.remove(&change.entity_id);
                }
                (_, Some(after)) => {
                    entities.insert(change.entity_id.clone(), after.clone());
                }
                (_, None) => {
                    return Err(Error::InvalidChange(format!(
                        "{} without state",
                        change.key()
                    )))
                }
            }
        }
        StoragePattern::Singleton | StoragePattern::Array => match change.change_type {
            ChangeType::Deleted => {
                state.remove(slot_key);
            }
            _ => {
                let after = change.after_state.clone().unwrap_or(Value::Null);
                state.insert(slot_key.to_string(), after);
            }
        },
        StoragePattern::Virtual => {
            return Err(Error::InvalidChange(format!(
                "{} targets the whole state",
                change.key()
            )))
        }
    }

    Ok(())
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn read_entity_state(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Option<Value>> {
        let state = self.state.read().await;
        let slot = state.get(entity_type.state_key());

        let value = match entity_type.storage() {
            StoragePattern::Collection | StoragePattern::Map => {
                slot.and_then(|s| s.get(entity_id)).cloned()
            }
            StoragePattern::Singleton | StoragePattern::Array => slot.cloned(),
            StoragePattern::Virtual => Some(Value::Object(state.clone())),
        };

        Ok(value.filter(|v| !v.is_null()))
    }

    async fn apply_entity_change_set(&self, changes: ChangeSet) -> Result<()> {
        let mut state = self.state.write().await;

        match changes {
            ChangeSet::ReplaceAll(new_state) => {
                *state = into_state_map(new_state)?;
            }
            ChangeSet::Entities(changes) => {
                // stage on a copy so a bad change leaves nothing behind
                let mut staged = state.clone();
                for change in &changes {
                    apply_change(&mut staged, change)?;
                }
                *state = staged;
            }
        }

        Ok(())
    }

    async fn export_state(&self) -> Result<Value> {
        Ok(Value::Object(self.state.read().await.clone()))
    }

    /// Drops null entities and resets keyed slots that are not objects.
    async fn repair(&self) -> Result<bool> {
        let mut state = self.state.write().await;
        let mut repaired = false;

        for entity_type in EntityType::STORED {
            let key = entity_type.state_key();
            let Some(slot) = state.get_mut(key) else {
                continue;
            };
            if entity_type.is_keyed() {
                match slot {
                    Value::Object(entities) => {
                        let before = entities.len();
                        entities.retain(|_, v| !v.is_null());
                        repaired |= entities.len() != before;
                    }
                    _ => {
                        *slot = Value::Object(Map::new());
                        repaired = true;
                    }
                }
            } else if entity_type.storage() == StoragePattern::Array && !slot.is_array() {
                *slot = Value::Array(Vec::new());
                repaired = true;
            }
        }

        if repaired {
            tracing::info!("repaired application state");
        }
        Ok(repaired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn create_read_delete() {
        let store = MemoryStateStore::new();
        store
            .apply_entity_change_set(ChangeSet::Entities(vec![EntityChange::created(
                EntityType::Task,
                "t1",
                json!({"title": "Write"}),
            )]))
            .await
            .unwrap();

        let task = store.read_entity_state(EntityType::Task, "t1").await.unwrap();
        assert_eq!(task, Some(json!({"title": "Write"})));

        store
            .apply_entity_change_set(ChangeSet::Entities(vec![EntityChange::deleted(
                EntityType::Task,
                "t1",
                None,
            )]))
            .await
            .unwrap();
        assert_eq!(
            store.read_entity_state(EntityType::Task, "t1").await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn failed_change_set_leaves_state_untouched() {
        let store = MemoryStateStore::new();
        let result = store
            .apply_entity_change_set(ChangeSet::Entities(vec![
                EntityChange::created(EntityType::Task, "t1", json!({"title": "a"})),
                EntityChange::created(EntityType::All, "x", json!({})),
            ]))
            .await;

        assert!(result.is_err());
        assert_eq!(store.count(EntityType::Task).await, 0);
    }

    #[tokio::test]
    async fn singleton_ignores_id() {
        let store = MemoryStateStore::new();
        store
            .apply_entity_change_set(ChangeSet::Entities(vec![EntityChange::updated(
                EntityType::GlobalConfig,
                "misc",
                None,
                json!({"theme": "dark"}),
            )]))
            .await
            .unwrap();

        let config = store
            .read_entity_state(EntityType::GlobalConfig, "anything")
            .await
            .unwrap();
        assert_eq!(config, Some(json!({"theme": "dark"})));
    }

    #[tokio::test]
    async fn replace_all_and_export() {
        let store = MemoryStateStore::new();
        let state = json!({"task": {"t1": {"title": "a"}}, "reminders": []});
        store
            .apply_entity_change_set(ChangeSet::ReplaceAll(state.clone()))
            .await
            .unwrap();
        assert_eq!(store.export_state().await.unwrap(), state);

        let err = store
            .apply_entity_change_set(ChangeSet::ReplaceAll(json!([1, 2])))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SyncDataCorrupted(_)));
    }

    #[tokio::test]
    async fn repair_is_idempotent() {
        let store =
            MemoryStateStore::from_state(json!({"task": {"t1": null, "t2": {}}, "tag": 5}))
                .unwrap();
        assert!(store.repair().await.unwrap());
        assert!(!store.repair().await.unwrap());
        assert_eq!(store.count(EntityType::Task).await, 1);
        assert_eq!(store.count(EntityType::Tag).await, 0);
    }

    #[test]
    fn merge_fields_is_shallow() {
        let merged = merge_fields(
            &json!({"title": "a", "meta": {"x": 1}}),
            &json!({"meta": {"y": 2}, "done": true}),
        );
        assert_eq!(merged, json!({"title": "a", "meta": {"y": 2}, "done": true}));
        assert_eq!(merge_fields(&json!(1), &json!({"a": 1})), json!({"a": 1}));
    }
}
