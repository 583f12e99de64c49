//! Entity kinds and how each one is stored.
//!
//! The set of entity kinds is closed. Everything that depends on the kind of
//! an entity (how it is keyed, how a partial update merges, where it lives in
//! a full-state snapshot) matches on [`EntityType`] exhaustively, so adding a
//! kind is a compile error until every site handles it.

use crate::EntityId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// How an entity kind is laid out in application state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoragePattern {
    /// Many entities keyed by id; updates merge field by field.
    Collection,
    /// Exactly one value; the entity id is ignored.
    Singleton,
    /// Many values keyed by id; updates replace the value.
    Map,
    /// One ordered list, replaced as a whole.
    Array,
    /// No storage of its own (full-state operations).
    Virtual,
}

/// Kinds of entity an operation can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityType {
    Task,
    Project,
    Tag,
    Note,
    SimpleCounter,
    TaskRepeatCfg,
    Board,
    GlobalConfig,
    TimeTracking,
    PlannerDay,
    Reminder,
    /// The whole application state.
    All,
}

impl EntityType {
    /// Every concrete kind, in snapshot order.
    pub const STORED: [EntityType; 11] = [
        EntityType::Task,
        EntityType::Project,
        EntityType::Tag,
        EntityType::Note,
        EntityType::SimpleCounter,
        EntityType::TaskRepeatCfg,
        EntityType::Board,
        EntityType::GlobalConfig,
        EntityType::TimeTracking,
        EntityType::PlannerDay,
        EntityType::Reminder,
    ];

    pub fn storage(self) -> StoragePattern {
        match self {
            EntityType::Task
            | EntityType::Project
            | EntityType::Tag
            | EntityType::Note
            | EntityType::SimpleCounter
            | EntityType::TaskRepeatCfg
            | EntityType::Board => StoragePattern::Collection,
            EntityType::GlobalConfig => StoragePattern::Singleton,
            EntityType::TimeTracking | EntityType::PlannerDay => StoragePattern::Map,
            EntityType::Reminder => StoragePattern::Array,
            EntityType::All => StoragePattern::Virtual,
        }
    }

    /// Key of this kind in a full-state snapshot.
    pub fn state_key(self) -> &'static str {
        match self {
            EntityType::Task => "task",
            EntityType::Project => "project",
            EntityType::Tag => "tag",
            EntityType::Note => "note",
            EntityType::SimpleCounter => "simpleCounter",
            EntityType::TaskRepeatCfg => "taskRepeatCfg",
            EntityType::Board => "board",
            EntityType::GlobalConfig => "globalConfig",
            EntityType::TimeTracking => "timeTracking",
            EntityType::PlannerDay => "planner",
            EntityType::Reminder => "reminders",
            EntityType::All => "all",
        }
    }

    pub fn from_state_key(key: &str) -> Option<Self> {
        Self::STORED.into_iter().find(|t| t.state_key() == key)
    }

    /// Wire name, e.g. `TASK`.
    pub fn as_str(self) -> &'static str {
        match self {
            EntityType::Task => "TASK",
            EntityType::Project => "PROJECT",
            EntityType::Tag => "TAG",
            EntityType::Note => "NOTE",
            EntityType::SimpleCounter => "SIMPLE_COUNTER",
            EntityType::TaskRepeatCfg => "TASK_REPEAT_CFG",
            EntityType::Board => "BOARD",
            EntityType::GlobalConfig => "GLOBAL_CONFIG",
            EntityType::TimeTracking => "TIME_TRACKING",
            EntityType::PlannerDay => "PLANNER_DAY",
            EntityType::Reminder => "REMINDER",
            EntityType::All => "ALL",
        }
    }

    /// Whether entities of this kind are addressed by id.
    pub fn is_keyed(self) -> bool {
        matches!(
            self.storage(),
            StoragePattern::Collection | StoragePattern::Map
        )
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Id used for kinds that hold a single value.
pub const SINGLETON_ID: &str = "*";

/// Identifies one entity: its kind plus its id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityKey {
    pub entity_type: EntityType,
    pub entity_id: EntityId,
}

impl EntityKey {
    /// Key for an entity. Unkeyed kinds collapse to [`SINGLETON_ID`].
    pub fn new(entity_type: EntityType, entity_id: impl Into<EntityId>) -> Self {
        let entity_id = if entity_type.is_keyed() {
            entity_id.into()
        } else {
            SINGLETON_ID.to_string()
        };
        Self {
            entity_type,
            entity_id,
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.entity_id)
    }
}

/// Every entity present in a full application state.
pub fn keys_in_state(state: &serde_json::Value) -> Vec<EntityKey> {
    let Some(slots) = state.as_object() else {
        return Vec::new();
    };

    let mut keys = Vec::new();
    for (slot_key, slot) in slots {
        let Some(entity_type) = EntityType::from_state_key(slot_key) else {
            continue;
        };
        if slot.is_null() {
            continue;
        }
        if entity_type.is_keyed() {
            if let Some(entities) = slot.as_object() {
                keys.extend(
                    entities
                        .iter()
                        .filter(|(_, v)| !v.is_null())
                        .map(|(id, _)| EntityKey::new(entity_type, id.as_str())),
                );
            }
        } else {
            keys.push(EntityKey::new(entity_type, SINGLETON_ID));
        }
    }
    keys.sort();
    keys
}
