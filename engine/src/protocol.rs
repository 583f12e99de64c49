//! Sync protocol types and the provider boundary.
//!
//! [`OperationSyncProvider`] is what the orchestrator talks to. The file-based
//! adapter implements it on top of whole-blob storage; a server client
//! implements it on top of the HTTP API whose request and response bodies are
//! defined here so both ends share one wire format.

use crate::error::Result;
use crate::operation::Operation;
use crate::{ClientId, ClockComparison, OperationId, Timestamp, VectorClock};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Operations fetched from the remote side.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DownloadResult {
    /// Operations newer than the requested sequence, in remote order
    pub ops: Vec<Operation>,
    /// Sequence to ask from next time
    pub latest_seq: u64,
    /// The remote no longer holds the requested window; re-download from 0
    pub gap_detected: bool,
    /// The remote finished a migration this download
    pub server_migration_handled: bool,
    /// Full state, present when downloading from scratch
    pub snapshot_state: Option<serde_json::Value>,
    /// Causal position of `snapshot_state`
    pub snapshot_vector_clock: Option<VectorClock>,
}

/// Why the remote refused an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectionReason {
    /// Already stored
    Duplicate,
    /// Concurrent with what the remote holds for the entity
    ConflictConcurrent,
    /// The remote holds a causally newer state for the entity
    ConflictSuperseded,
    /// Malformed operation
    Validation,
    /// Remote storage refused the write
    Storage,
}

impl RejectionReason {
    /// Conflicts are resolved locally after downloading the remote side.
    pub fn is_conflict(self) -> bool {
        matches!(
            self,
            RejectionReason::ConflictConcurrent | RejectionReason::ConflictSuperseded
        )
    }
}

/// An operation the remote refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedOp {
    pub op_id: OperationId,
    pub reason: RejectionReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Outcome of an upload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UploadResult {
    pub uploaded_count: usize,
    pub rejected_count: usize,
    /// Other clients' operations returned with the acknowledgment
    pub piggybacked_ops: Vec<Operation>,
    pub rejected_ops: Vec<RejectedOp>,
    /// Remote sequence after the upload
    pub latest_seq: u64,
}

/// Why a full snapshot is being uploaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SnapshotReason {
    Initial,
    Recovery,
    Migration,
    Import,
}

/// Remote side of synchronization.
#[async_trait]
pub trait OperationSyncProvider: Send + Sync {
    /// Operations the remote holds after `since_seq`.
    async fn download_ops(&self, since_seq: u64) -> Result<DownloadResult>;

    /// Upload pending operations.
    ///
    /// `last_known_seq` is the last remote sequence this client has seen; the
    /// remote piggybacks other clients' operations newer than it.
    async fn upload_ops(
        &self,
        ops: &[Operation],
        client_id: &str,
        last_known_seq: u64,
    ) -> Result<UploadResult>;

    /// Replace the remote state with a full snapshot. Returns the new sequence.
    async fn upload_snapshot(
        &self,
        state: serde_json::Value,
        vector_clock: &VectorClock,
        client_id: &str,
        reason: SnapshotReason,
    ) -> Result<u64>;
}

/// Server-side verdict on an uploaded operation.
///
/// `stored` is the merged clock of everything the server holds for the
/// entities `op` touches. Returns `None` to accept. Full-state operations are
/// always accepted; clients filter around them.
pub fn classify_upload(stored: Option<&VectorClock>, op: &Operation) -> Option<RejectionReason> {
    if op.is_full_state() {
        return None;
    }
    match op.vector_clock.compare(stored?) {
        ClockComparison::GreaterThan => None,
        ClockComparison::Equal => Some(RejectionReason::Duplicate),
        ClockComparison::LessThan => Some(RejectionReason::ConflictSuperseded),
        ClockComparison::Concurrent => Some(RejectionReason::ConflictConcurrent),
    }
}

// Server HTTP bodies

/// An operation as stored by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerOperation {
    pub server_seq: u64,
    pub op: Operation,
    pub received_at: Timestamp,
}

/// Query of `GET /api/sync/ops`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadOpsQuery {
    #[serde(default)]
    pub since_seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude_client: Option<ClientId>,
}

/// Body of `GET /api/sync/ops`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadOpsResponse {
    pub ops: Vec<ServerOperation>,
    pub has_more: bool,
    pub latest_seq: u64,
    #[serde(default)]
    pub gap_detected: bool,
}

impl DownloadOpsResponse {
    /// Convert to the provider result.
    pub fn into_download_result(self) -> DownloadResult {
        DownloadResult {
            latest_seq: self
                .ops
                .last()
                .map(|o| o.server_seq)
                .unwrap_or(self.latest_seq),
            ops: self.ops.into_iter().map(|o| o.op).collect(),
            gap_detected: self.gap_detected,
            ..Default::default()
        }
    }
}

/// Body of `POST /api/sync/ops`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadOpsRequest {
    pub client_id: ClientId,
    pub ops: Vec<Operation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_known_server_seq: Option<u64>,
}

/// Per-operation result of an upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpUploadResult {
    pub op_id: OperationId,
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_seq: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<RejectionReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OpUploadResult {
    pub fn accepted(op_id: impl Into<OperationId>, server_seq: u64) -> Self {
        Self {
            op_id: op_id.into(),
            accepted: true,
            server_seq: Some(server_seq),
            reason: None,
            error: None,
        }
    }

    pub fn rejected(
        op_id: impl Into<OperationId>,
        reason: RejectionReason,
        error: impl Into<String>,
    ) -> Self {
        Self {
            op_id: op_id.into(),
            accepted: false,
            server_seq: None,
            reason: Some(reason),
            error: Some(error.into()),
        }
    }
}

/// Body returned by `POST /api/sync/ops`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadOpsResponse {
    pub results: Vec<OpUploadResult>,
    /// Other clients' operations since `lastKnownServerSeq`
    #[serde(default)]
    pub new_ops: Vec<ServerOperation>,
    pub latest_seq: u64,
}

impl UploadOpsResponse {
    /// Convert to the provider result.
    pub fn into_upload_result(self) -> UploadResult {
        let rejected_ops: Vec<RejectedOp> = self
            .results
            .iter()
            .filter(|r| !r.accepted)
            .map(|r| RejectedOp {
                op_id: r.op_id.clone(),
                reason: r.reason.unwrap_or(RejectionReason::Validation),
                message: r.error.clone(),
            })
            .collect();

        UploadResult {
            uploaded_count: self.results.len() - rejected_ops.len(),
            rejected_count: rejected_ops.len(),
            piggybacked_ops: self.new_ops.into_iter().map(|o| o.op).collect(),
            rejected_ops,
            latest_seq: self.latest_seq,
        }
    }
}

/// Body of `POST /api/sync/snapshot`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotUploadRequest {
    pub client_id: ClientId,
    pub state: serde_json::Value,
    pub vector_clock: VectorClock,
    pub reason: SnapshotReason,
}

/// Body returned by `POST /api/sync/snapshot`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotUploadResponse {
    pub server_seq: u64,
}
