//! Snapshot handler - stores a client's full state as an import.

use crate::db;
use crate::error::{AppError, Result};
use sqlx::PgPool;
use tandem_engine::operation::now;
use tandem_engine::protocol::{SnapshotUploadRequest, SnapshotUploadResponse};
use tandem_engine::{EntityType, OpType, Operation, SnapshotReason};

/// Full-state operation other clients receive for an uploaded snapshot.
pub fn snapshot_operation(request: SnapshotUploadRequest) -> Operation {
    let op_type = match request.reason {
        SnapshotReason::Import => OpType::BackupImport,
        SnapshotReason::Initial | SnapshotReason::Recovery | SnapshotReason::Migration => {
            OpType::SyncImport
        }
    };
    Operation::new(
        request.client_id,
        op_type,
        EntityType::All,
        None,
        request.state,
        request.vector_clock,
        now(),
    )
}

/// Process a snapshot upload.
pub async fn handle_snapshot(
    pool: &PgPool,
    request: SnapshotUploadRequest,
) -> Result<SnapshotUploadResponse> {
    if request.client_id.is_empty() {
        return Err(AppError::BadRequest("clientId is required".to_string()));
    }
    if !request.state.is_object() {
        return Err(AppError::BadRequest("state must be an object".to_string()));
    }

    let reason = request.reason;
    let op = snapshot_operation(request);

    let mut tx = pool.begin().await?;
    db::lock_uploads(&mut tx).await?;
    let server_seq = db::insert_operation(&mut *tx, &op).await?;
    db::clear_frontiers(&mut *tx).await?;
    tx.commit().await?;

    tracing::info!(
        client_id = %op.client_id,
        op_id = %op.id,
        ?reason,
        server_seq,
        "stored snapshot"
    );

    Ok(SnapshotUploadResponse {
        server_seq: server_seq as u64,
    })
}
