//! Upload handler - stores incoming operations and answers per operation.

use crate::db;
use crate::error::{AppError, Result};
use crate::handlers::download::page;
use sqlx::{PgConnection, PgPool};
use tandem_engine::protocol::{
    classify_upload, OpUploadResult, RejectionReason, UploadOpsRequest, UploadOpsResponse,
};
use tandem_engine::Operation;

/// Why an operation is malformed, if it is.
pub fn validate(client_id: &str, op: &Operation) -> Option<&'static str> {
    if op.id.is_empty() {
        return Some("operation has no id");
    }
    if op.client_id != client_id {
        return Some("operation belongs to another client");
    }
    if op.is_full_state() {
        if !op.payload.is_object() {
            return Some("full-state payload must be an object");
        }
    } else if op.entity_keys().is_empty() {
        return Some("operation targets no entity");
    }
    None
}

fn rejection_message(reason: RejectionReason) -> &'static str {
    match reason {
        RejectionReason::Duplicate => "operation already stored",
        RejectionReason::ConflictConcurrent => "concurrent with stored state",
        RejectionReason::ConflictSuperseded => "stored state is newer",
        RejectionReason::Validation => "invalid operation",
        RejectionReason::Storage => "storage refused operation",
    }
}

/// Process an upload request from a client.
pub async fn handle_upload(
    pool: &PgPool,
    request: UploadOpsRequest,
    max_limit: u32,
) -> Result<UploadOpsResponse> {
    if request.client_id.is_empty() {
        return Err(AppError::BadRequest("clientId is required".to_string()));
    }

    let mut tx = pool.begin().await?;
    db::lock_uploads(&mut tx).await?;

    let mut results = Vec::with_capacity(request.ops.len());
    for op in &request.ops {
        results.push(store_operation(&mut tx, &request.client_id, op).await?);
    }
    tx.commit().await?;

    let mut latest_seq = db::latest_seq(pool).await?;

    // other clients' operations the uploader has not seen yet
    let mut new_ops = Vec::new();
    if let Some(since) = request.last_known_server_seq {
        let stored = db::get_operations_since(
            pool,
            since as i64,
            Some(&request.client_id),
            i64::from(max_limit) + 1,
        )
        .await?;
        let (ops, has_more) = page(stored, max_limit)?;
        if has_more {
            // the client must fetch the rest before skipping past it
            if let Some(last) = ops.last() {
                latest_seq = last.server_seq;
            }
        }
        new_ops = ops;
    }

    let rejected = results.iter().filter(|r| !r.accepted).count();
    tracing::info!(
        client_id = %request.client_id,
        accepted = results.len() - rejected,
        rejected,
        piggybacked = new_ops.len(),
        latest_seq,
        "processed upload"
    );

    Ok(UploadOpsResponse {
        results,
        new_ops,
        latest_seq,
    })
}

async fn store_operation(
    conn: &mut PgConnection,
    client_id: &str,
    op: &Operation,
) -> Result<OpUploadResult> {
    if let Some(problem) = validate(client_id, op) {
        tracing::debug!(op_id = %op.id, problem, "rejecting invalid operation");
        return Ok(OpUploadResult::rejected(
            &op.id,
            RejectionReason::Validation,
            problem,
        ));
    }

    if db::operation_exists(&mut *conn, &op.id).await? {
        return Ok(OpUploadResult::rejected(
            &op.id,
            RejectionReason::Duplicate,
            rejection_message(RejectionReason::Duplicate),
        ));
    }

    let keys = op.entity_keys();
    let stored = if op.is_full_state() {
        None
    } else {
        db::entity_frontier(&mut *conn, &keys).await?
    };
    if let Some(reason) = classify_upload(stored.as_ref(), op) {
        tracing::debug!(op_id = %op.id, ?reason, "rejecting operation");
        return Ok(OpUploadResult::rejected(
            &op.id,
            reason,
            rejection_message(reason),
        ));
    }

    let server_seq = db::insert_operation(&mut *conn, op).await?;
    if op.is_full_state() {
        let cleared = db::clear_frontiers(&mut *conn).await?;
        tracing::info!(op_id = %op.id, server_seq, cleared, "stored full-state operation");
    } else {
        db::advance_frontiers(conn, &keys, &op.vector_clock, server_seq).await?;
    }

    Ok(OpUploadResult::accepted(&op.id, server_seq as u64))
}
