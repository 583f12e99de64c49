//! Download handler - serves stored operations after a sequence.

use crate::db::{self, StoredOperation};
use crate::error::Result;
use sqlx::PgPool;
use tandem_engine::protocol::{DownloadOpsQuery, DownloadOpsResponse, ServerOperation};

/// Default limit for downloads that do not ask for one.
pub const DEFAULT_LIMIT: u32 = 500;

/// Clamp a requested page size to `1..=max_limit`.
pub fn effective_limit(requested: Option<u32>, max_limit: u32) -> u32 {
    requested
        .unwrap_or(DEFAULT_LIMIT)
        .clamp(1, max_limit.max(1))
}

/// Process a download request from a client.
pub async fn handle_download(
    pool: &PgPool,
    query: DownloadOpsQuery,
    max_limit: u32,
) -> Result<DownloadOpsResponse> {
    let limit = effective_limit(query.limit, max_limit);
    let latest_seq = db::latest_seq(pool).await?;

    // the client saw sequences we never issued: the database was reset
    if query.since_seq > latest_seq {
        tracing::warn!(
            since_seq = query.since_seq,
            latest_seq,
            "client is ahead of the server"
        );
        return Ok(DownloadOpsResponse {
            ops: Vec::new(),
            has_more: false,
            latest_seq,
            gap_detected: true,
        });
    }

    // one more than requested tells whether there is another page
    let stored = db::get_operations_since(
        pool,
        query.since_seq as i64,
        query.exclude_client.as_deref(),
        i64::from(limit) + 1,
    )
    .await?;
    let (ops, has_more) = page(stored, limit)?;

    tracing::debug!(
        since_seq = query.since_seq,
        count = ops.len(),
        has_more,
        "serving operations"
    );

    Ok(DownloadOpsResponse {
        ops,
        has_more,
        latest_seq,
        gap_detected: false,
    })
}

/// Decode at most `limit` rows. Returns whether rows were left over.
pub(crate) fn page(
    stored: Vec<StoredOperation>,
    limit: u32,
) -> tandem_engine::error::Result<(Vec<ServerOperation>, bool)> {
    let has_more = stored.len() > limit as usize;
    let ops = stored
        .into_iter()
        .take(limit as usize)
        .map(StoredOperation::into_server_operation)
        .collect::<tandem_engine::error::Result<Vec<_>>>()?;
    Ok((ops, has_more))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tandem_engine::{EntityType, OpType, Operation, VectorClock};

    fn row(seq: i64) -> StoredOperation {
        let op = Operation::new(
            "a",
            OpType::Create,
            EntityType::Task,
            Some(format!("t{seq}")),
            json!({}),
            VectorClock::from_entries([("a", seq as u64)]),
            seq,
        )
        .with_id(format!("op-{seq}"));
        StoredOperation {
            server_seq: seq,
            op_id: op.id.clone(),
            op: serde_json::to_value(&op).unwrap(),
            received_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn limit_is_clamped() {
        assert_eq!(effective_limit(None, 1000), DEFAULT_LIMIT);
        assert_eq!(effective_limit(Some(0), 1000), 1);
        assert_eq!(effective_limit(Some(5000), 1000), 1000);
        assert_eq!(effective_limit(None, 100), 100);
    }

    #[test]
    fn page_reports_leftover_rows() {
        let (ops, has_more) = page((1..=4).map(row).collect(), 3).unwrap();
        assert!(has_more);
        assert_eq!(ops.len(), 3);
        assert_eq!(ops[2].server_seq, 3);

        let (ops, has_more) = page((1..=2).map(row).collect(), 3).unwrap();
        assert!(!has_more);
        assert_eq!(ops[0].op.id, "op-1");
    }

    #[test]
    fn undecodable_row_is_corruption() {
        let mut bad = row(1);
        bad.op = json!({"id": "op-1"});
        let err = page(vec![bad], 10).unwrap_err();
        assert!(matches!(err, tandem_engine::Error::SyncDataCorrupted(_)));
    }
}
