//! Database operations for the operation log and entity frontiers.
//!
//! Uploads run inside one transaction that holds an advisory lock, so
//! classifying an operation and storing it never interleave with another
//! upload.

use sqlx::types::Json;
use sqlx::{PgConnection, PgExecutor, Row};
use tandem_engine::protocol::ServerOperation;
use tandem_engine::{EntityKey, Operation, VectorClock};

/// Advisory lock key serializing uploads.
const UPLOAD_LOCK: i64 = 0x7461_6e64_656d;

/// A stored operation row from the database.
#[derive(Debug)]
pub struct StoredOperation {
    pub server_seq: i64,
    pub op_id: String,
    pub op: serde_json::Value,
    pub received_at: chrono::DateTime<chrono::Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for StoredOperation {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(StoredOperation {
            server_seq: row.try_get("server_seq")?,
            op_id: row.try_get("op_id")?,
            op: row.try_get("op")?,
            received_at: row.try_get("received_at")?,
        })
    }
}

impl StoredOperation {
    /// Decode the row into the wire type.
    pub fn into_server_operation(self) -> tandem_engine::error::Result<ServerOperation> {
        let op: Operation = serde_json::from_value(self.op).map_err(|e| {
            tandem_engine::Error::SyncDataCorrupted(format!(
                "stored operation {} (seq {}): {e}",
                self.op_id, self.server_seq
            ))
        })?;

        Ok(ServerOperation {
            server_seq: self.server_seq as u64,
            op,
            received_at: self.received_at.timestamp_millis(),
        })
    }
}

/// Take the upload lock for the rest of the current transaction.
pub async fn lock_uploads(conn: &mut PgConnection) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(UPLOAD_LOCK)
        .execute(conn)
        .await?;
    Ok(())
}

/// Insert an operation. Returns its server sequence.
pub async fn insert_operation<'e>(
    executor: impl PgExecutor<'e>,
    op: &Operation,
) -> Result<i64, sqlx::Error> {
    let result: (i64,) = sqlx::query_as(
        r#"
        INSERT INTO operations (
            op_id, client_id, op_type, entity_type, is_full_state, op, client_timestamp
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING server_seq
        "#,
    )
    .bind(&op.id)
    .bind(&op.client_id)
    .bind(format!("{:?}", op.op_type))
    .bind(op.entity_type.as_str())
    .bind(op.is_full_state())
    .bind(Json(op))
    .bind(op.timestamp)
    .fetch_one(executor)
    .await?;

    Ok(result.0)
}

/// Operations after `since_seq` in server order, optionally without one
/// client's own.
pub async fn get_operations_since<'e>(
    executor: impl PgExecutor<'e>,
    since_seq: i64,
    exclude_client: Option<&str>,
    limit: i64,
) -> Result<Vec<StoredOperation>, sqlx::Error> {
    sqlx::query_as::<_, StoredOperation>(
        r#"
        SELECT server_seq, op_id, op, received_at
        FROM operations
        WHERE server_seq > $1
          AND ($2::TEXT IS NULL OR client_id <> $2)
        ORDER BY server_seq ASC
        LIMIT $3
        "#,
    )
    .bind(since_seq)
    .bind(exclude_client)
    .bind(limit)
    .fetch_all(executor)
    .await
}

/// Check if an operation with the given id already exists.
pub async fn operation_exists<'e>(
    executor: impl PgExecutor<'e>,
    op_id: &str,
) -> Result<bool, sqlx::Error> {
    let result: (bool,) =
        sqlx::query_as(r#"SELECT EXISTS(SELECT 1 FROM operations WHERE op_id = $1)"#)
            .bind(op_id)
            .fetch_one(executor)
            .await?;

    Ok(result.0)
}

/// Highest server sequence handed out so far.
pub async fn latest_seq<'e>(executor: impl PgExecutor<'e>) -> Result<u64, sqlx::Error> {
    let result: (i64,) = sqlx::query_as(r#"SELECT COALESCE(MAX(server_seq), 0) FROM operations"#)
        .fetch_one(executor)
        .await?;

    Ok(result.0 as u64)
}

/// Merged clock of everything stored for `keys`, or `None` if none of them
/// has been written.
pub async fn entity_frontier<'e>(
    executor: impl PgExecutor<'e>,
    keys: &[EntityKey],
) -> Result<Option<VectorClock>, sqlx::Error> {
    let (types, ids) = split_keys(keys);
    let rows = sqlx::query(
        r#"
        SELECT vector_clock
        FROM entity_frontiers
        WHERE (entity_type, entity_id) IN (
            SELECT * FROM UNNEST($1::TEXT[], $2::TEXT[])
        )
        "#,
    )
    .bind(types)
    .bind(ids)
    .fetch_all(executor)
    .await?;

    let mut clocks = Vec::with_capacity(rows.len());
    for row in rows {
        let Json(clock): Json<VectorClock> = row.try_get("vector_clock")?;
        clocks.push(clock);
    }
    if clocks.is_empty() {
        return Ok(None);
    }
    Ok(Some(VectorClock::merge_all(&clocks)))
}

/// Record `clock` as the newest state of every entity in `keys`.
///
/// Only called for accepted operations, whose clock dominates what was
/// stored before, so the clock replaces rather than merges.
pub async fn advance_frontiers(
    conn: &mut PgConnection,
    keys: &[EntityKey],
    clock: &VectorClock,
    server_seq: i64,
) -> Result<(), sqlx::Error> {
    for key in keys {
        sqlx::query(
            r#"
            INSERT INTO entity_frontiers (entity_type, entity_id, vector_clock, server_seq)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (entity_type, entity_id) DO UPDATE SET
                vector_clock = EXCLUDED.vector_clock,
                server_seq = EXCLUDED.server_seq
            "#,
        )
        .bind(key.entity_type.as_str())
        .bind(&key.entity_id)
        .bind(Json(clock))
        .bind(server_seq)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

/// Forget every frontier. A full-state import starts causality over.
pub async fn clear_frontiers<'e>(executor: impl PgExecutor<'e>) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM entity_frontiers")
        .execute(executor)
        .await?;
    Ok(result.rows_affected())
}

fn split_keys(keys: &[EntityKey]) -> (Vec<String>, Vec<String>) {
    keys.iter()
        .map(|k| (k.entity_type.as_str().to_string(), k.entity_id.clone()))
        .unzip()
}
