//! Snapshot types for persisting and restoring the operation log.
//!
//! A [`LogSnapshot`] is the persisted layout of the log: every entry with its
//! lifecycle flags plus the clock bookkeeping. It is written as one JSON
//! document, atomically, through [`LogPersistence`].

use crate::entity::EntityKey;
use crate::error::Result;
use crate::log::LogEntry;
use crate::{ClientId, Error, Seq, VectorClock};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Version of the snapshot format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Last-known causal position of one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityFrontier {
    #[serde(flatten)]
    pub key: EntityKey,
    pub clock: VectorClock,
}

/// A point-in-time copy of the operation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogSnapshot {
    /// Snapshot format version
    pub format_version: u32,
    /// Next sequence number to hand out
    pub next_seq: Seq,
    /// Entries in sequence order
    pub entries: Vec<LogEntry>,
    /// This client's causal position
    pub vector_clock: VectorClock,
    /// Client ids that survive clock pruning
    #[serde(default)]
    pub protected_client_ids: Vec<ClientId>,
    #[serde(default)]
    pub frontiers: Vec<EntityFrontier>,
    /// Clock of the last hydrated or imported full state
    #[serde(default)]
    pub snapshot_clock: Option<VectorClock>,
    /// Entities that existed in that full state
    #[serde(default)]
    pub snapshot_entity_keys: Vec<EntityKey>,
    /// Last server sequence seen by the sync provider
    #[serde(default)]
    pub last_server_seq: u64,
}

impl LogSnapshot {
    /// Create an empty snapshot.
    pub fn new() -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            next_seq: 1,
            entries: Vec::new(),
            vector_clock: VectorClock::new(),
            protected_client_ids: Vec::new(),
            frontiers: Vec::new(),
            snapshot_clock: None,
            snapshot_entity_keys: Vec::new(),
            last_server_seq: 0,
        }
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Deserialize from JSON, rejecting formats newer than this build.
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;

        if snapshot.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported snapshot format version: {} (max supported: {})",
                snapshot.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }

        Ok(snapshot)
    }
}

impl Default for LogSnapshot {
    fn default() -> Self {
        Self::new()
    }
}

/// Map an I/O error, turning a full disk into a quota error.
pub(crate) fn storage_error(err: std::io::Error) -> Error {
    match err.kind() {
        ErrorKind::StorageFull => Error::StorageQuotaExceeded(err.to_string()),
        _ => Error::Storage(err),
    }
}

/// File-backed storage for a [`LogSnapshot`].
#[derive(Debug, Clone)]
pub struct LogPersistence {
    path: PathBuf,
}

impl LogPersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the snapshot, or `None` if nothing was saved yet.
    pub async fn load(&self) -> Result<Option<LogSnapshot>> {
        match fs::read_to_string(&self.path).await {
            Ok(json) => LogSnapshot::from_json(&json).map(Some),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(storage_error(e)),
        }
    }

    /// Write the snapshot through a temp file and rename it into place.
    pub async fn save(&self, snapshot: &LogSnapshot) -> Result<()> {
        let json = snapshot.to_json()?;
        let temp_path = self.path.with_extension("tmp");

        let mut file = fs::File::create(&temp_path).await.map_err(storage_error)?;
        file.write_all(json.as_bytes())
            .await
            .map_err(storage_error)?;
        file.sync_all().await.map_err(storage_error)?;

        fs::rename(&temp_path, &self.path)
            .await
            .map_err(storage_error)?;
        Ok(())
    }
}
