//! The file-based sync envelope.
//!
//! File providers only offer whole-blob reads and writes, so everything a
//! client needs lives in one document: a full state snapshot, a bounded
//! window of recent operations and the `syncVersion` counter used for
//! optimistic concurrency.

use crate::error::Result;
use crate::operation::{now, Operation, CURRENT_SCHEMA_VERSION};
use crate::{ClientId, ClockComparison, Error, SchemaVersion, Timestamp, VectorClock};
use serde::{Deserialize, Serialize};

/// Envelope protocol version written by this build.
pub const FILE_SYNC_VERSION: u32 = 2;

/// Opaque transform applied to serialized envelopes (encryption, compression).
pub trait PayloadCodec: Send + Sync {
    fn encode(&self, data: Vec<u8>) -> Result<Vec<u8>>;
    fn decode(&self, data: Vec<u8>) -> Result<Vec<u8>>;
}

/// Codec that stores plain JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainJsonCodec;

impl PayloadCodec for PlainJsonCodec {
    fn encode(&self, data: Vec<u8>) -> Result<Vec<u8>> {
        Ok(data)
    }

    fn decode(&self, data: Vec<u8>) -> Result<Vec<u8>> {
        Ok(data)
    }
}

/// Everything stored in the remote sync file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileBasedSyncData {
    /// Envelope protocol version
    pub version: u32,
    /// Optimistic-lock counter, +1 per write
    pub sync_version: u64,
    /// Payload schema version
    pub schema_version: SchemaVersion,
    /// Causal position of `state`
    pub vector_clock: VectorClock,
    pub last_modified: Timestamp,
    /// Client that wrote this envelope
    pub client_id: ClientId,
    /// Full state snapshot
    pub state: Option<serde_json::Value>,
    /// Window of recent operations, oldest first
    pub recent_ops: Vec<Operation>,
    /// Timestamp of the oldest retained operation once the window was trimmed
    pub oldest_op_timestamp: Option<Timestamp>,
}

#[derive(Deserialize)]
struct VersionHeader {
    version: u32,
}

impl FileBasedSyncData {
    /// An empty envelope, as if nothing was ever synced.
    pub fn empty(client_id: impl Into<ClientId>) -> Self {
        Self {
            version: FILE_SYNC_VERSION,
            sync_version: 0,
            schema_version: CURRENT_SCHEMA_VERSION,
            vector_clock: VectorClock::new(),
            last_modified: now(),
            client_id: client_id.into(),
            state: None,
            recent_ops: Vec::new(),
            oldest_op_timestamp: None,
        }
    }

    /// Serialize and encode.
    pub fn to_bytes(&self, codec: &dyn PayloadCodec) -> Result<Vec<u8>> {
        codec.encode(serde_json::to_vec(self)?)
    }

    /// Decode and parse, rejecting unknown envelope versions before parsing
    /// the rest.
    pub fn from_bytes(data: Vec<u8>, codec: &dyn PayloadCodec) -> Result<Self> {
        let json = codec.decode(data)?;

        let header: VersionHeader = serde_json::from_slice(&json)
            .map_err(|e| Error::SyncDataCorrupted(format!("unreadable sync file: {e}")))?;
        if header.version != FILE_SYNC_VERSION {
            return Err(Error::UnsupportedSyncFormat {
                found: header.version,
                supported: FILE_SYNC_VERSION,
            });
        }

        serde_json::from_slice(&json)
            .map_err(|e| Error::SyncDataCorrupted(format!("malformed sync file: {e}")))
    }

    /// Whether an operation with this id is in the window.
    pub fn contains_op(&self, id: &str) -> bool {
        self.recent_ops.iter().any(|op| op.id == id)
    }

    /// Operations in the window written by other clients.
    pub fn ops_not_from(&self, client_id: &str) -> Vec<Operation> {
        self.recent_ops
            .iter()
            .filter(|op| op.client_id != client_id)
            .cloned()
            .collect()
    }

    /// Append operations not already in the window. Returns how many were added.
    pub fn append_ops<'a>(&mut self, ops: impl IntoIterator<Item = &'a Operation>) -> usize {
        let mut added = 0;
        for op in ops {
            if !self.contains_op(&op.id) {
                self.recent_ops.push(op.clone());
                added += 1;
            }
        }
        added
    }

    /// Drop the oldest operations beyond `max`, recording the new cutoff.
    /// Returns how many were dropped.
    pub fn trim(&mut self, max: usize) -> usize {
        self.trim_before(max, self.recent_ops.len())
    }

    /// Like [`trim`](Self::trim), but never drops the operation at `limit`
    /// or anything after it.
    pub fn trim_before(&mut self, max: usize, limit: usize) -> usize {
        let excess = self.recent_ops.len().saturating_sub(max).min(limit);
        if excess == 0 {
            return 0;
        }
        self.recent_ops.drain(..excess);
        self.oldest_op_timestamp = self.recent_ops.first().map(|op| op.timestamp);
        excess
    }

    /// Replace the state snapshot and empty the window.
    pub fn reset_to_snapshot(&mut self, state: serde_json::Value, vector_clock: VectorClock) {
        self.state = Some(state);
        self.vector_clock = vector_clock;
        self.recent_ops.clear();
        self.oldest_op_timestamp = None;
    }

    /// Clock covering the snapshot and every operation in the window.
    pub fn merged_clock(&self) -> VectorClock {
        let mut clock = self.vector_clock.clone();
        for op in &self.recent_ops {
            clock.merge_in_place(&op.vector_clock);
        }
        clock
    }

    /// How many leading window operations the state snapshot already contains.
    ///
    /// Only these may be trimmed: a reader hydrating from the snapshot would
    /// never see the others.
    pub fn covered_prefix_len(&self) -> usize {
        if self.state.is_none() {
            return 0;
        }
        self.recent_ops
            .iter()
            .take_while(|op| {
                matches!(
                    op.vector_clock.compare(&self.vector_clock),
                    ClockComparison::LessThan | ClockComparison::Equal
                )
            })
            .count()
    }
}
