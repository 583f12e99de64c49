//! Protocol tests for the sync server.
//!
//! These run without a database: they cover the wire format clients and the
//! server exchange and the classification the server applies to uploads.

use serde_json::json;
use tandem_engine::protocol::{
    classify_upload, DownloadOpsQuery, DownloadOpsResponse, OpUploadResult, RejectionReason,
    ServerOperation, SnapshotUploadRequest, UploadOpsRequest, UploadOpsResponse,
};
use tandem_engine::{EntityType, OpType, Operation, SnapshotReason, VectorClock};

/// Test helper to create a task update.
fn create_test_op(op_id: &str, task_id: &str, clock: &[(&str, u64)]) -> Operation {
    let client = clock.first().map(|(c, _)| *c).unwrap_or("device-1");
    Operation::new(
        client,
        OpType::Update,
        EntityType::Task,
        Some(task_id.to_string()),
        json!({"title": "Test task", "isDone": false}),
        VectorClock::from_entries(clock.iter().map(|&(c, n)| (c, n))),
        1706745600000,
    )
    .with_id(op_id)
}

#[cfg(test)]
mod protocol_tests {
    use super::*;

    #[test]
    fn test_upload_request_deserialization() {
        let json = r#"{
            "clientId": "device-123",
            "lastKnownServerSeq": 41,
            "ops": [
                {
                    "id": "op-1",
                    "clientId": "device-123",
                    "opType": "UPDATE",
                    "entityType": "TASK",
                    "entityId": "task-1",
                    "payload": {"title": "Test"},
                    "vectorClock": {"device-123": 3},
                    "timestamp": 1706745600000,
                    "schemaVersion": 1
                }
            ]
        }"#;

        let request: UploadOpsRequest = serde_json::from_str(json).unwrap();

        assert_eq!(request.client_id, "device-123");
        assert_eq!(request.last_known_server_seq, Some(41));
        assert_eq!(request.ops.len(), 1);
        assert_eq!(request.ops[0].id, "op-1");
        assert_eq!(request.ops[0].vector_clock.get("device-123"), 3);
    }

    #[test]
    fn test_download_query_defaults() {
        let query: DownloadOpsQuery = serde_json::from_str("{}").unwrap();
        assert_eq!(query.since_seq, 0);
        assert_eq!(query.limit, None);
        assert_eq!(query.exclude_client, None);
    }

    #[test]
    fn test_download_response_serialization() {
        let response = DownloadOpsResponse {
            ops: vec![ServerOperation {
                server_seq: 7,
                op: create_test_op("op-1", "task-1", &[("device-1", 1)]),
                received_at: 1706745601000,
            }],
            has_more: false,
            latest_seq: 7,
            gap_detected: false,
        };

        let json = serde_json::to_value(&response).unwrap();

        assert_eq!(json["hasMore"], false);
        assert_eq!(json["latestSeq"], 7);
        assert_eq!(json["ops"][0]["serverSeq"], 7);
        assert_eq!(json["ops"][0]["op"]["entityType"], "TASK");

        let result = response.into_download_result();
        assert_eq!(result.latest_seq, 7);
        assert!(!result.gap_detected);
    }

    #[test]
    fn test_upload_response_round_trip_to_provider_result() {
        let response = UploadOpsResponse {
            results: vec![
                OpUploadResult::accepted("op-1", 12),
                OpUploadResult::rejected("op-2", RejectionReason::Duplicate, "operation already stored"),
                OpUploadResult::rejected(
                    "op-3",
                    RejectionReason::ConflictSuperseded,
                    "stored state is newer",
                ),
            ],
            new_ops: vec![],
            latest_seq: 12,
        };

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"reason\":\"CONFLICT_SUPERSEDED\""));

        let parsed: UploadOpsResponse = serde_json::from_str(&json).unwrap();
        let result = parsed.into_upload_result();
        assert_eq!(result.uploaded_count, 1);
        assert_eq!(result.rejected_count, 2);
        assert!(result.rejected_ops.iter().any(|r| r.reason.is_conflict()));
    }

    #[test]
    fn test_snapshot_request_deserialization() {
        let json = r#"{
            "clientId": "device-1",
            "state": {"tasks": {}},
            "vectorClock": {"device-1": 9},
            "reason": "recovery"
        }"#;

        let request: SnapshotUploadRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.reason, SnapshotReason::Recovery);
        assert_eq!(request.vector_clock.get("device-1"), 9);
    }
}

#[cfg(test)]
mod classification_tests {
    use super::*;

    #[test]
    fn test_first_write_to_entity_is_accepted() {
        let op = create_test_op("op-1", "task-1", &[("device-1", 1)]);
        assert_eq!(classify_upload(None, &op), None);
    }

    #[test]
    fn test_sequential_edits_from_two_devices() {
        // device-2 saw device-1's edit before making its own
        let stored = VectorClock::from_entries([("device-1", 1)]);
        let op = create_test_op("op-2", "task-1", &[("device-2", 1), ("device-1", 1)]);
        assert_eq!(classify_upload(Some(&stored), &op), None);
    }

    #[test]
    fn test_concurrent_edit_is_sent_back_for_local_resolution() {
        let stored = VectorClock::from_entries([("device-1", 2)]);
        let op = create_test_op("op-2", "task-1", &[("device-2", 1), ("device-1", 1)]);

        let reason = classify_upload(Some(&stored), &op).unwrap();
        assert_eq!(reason, RejectionReason::ConflictConcurrent);
        assert!(reason.is_conflict());
    }

    #[test]
    fn test_replayed_upload_is_duplicate() {
        let stored = VectorClock::from_entries([("device-1", 2)]);
        let op = create_test_op("op-2", "task-1", &[("device-1", 2)]);
        assert_eq!(classify_upload(Some(&stored), &op), Some(RejectionReason::Duplicate));
    }

    #[test]
    fn test_stale_edit_is_superseded() {
        let stored = VectorClock::from_entries([("device-1", 3), ("device-2", 1)]);
        let op = create_test_op("op-2", "task-1", &[("device-1", 2)]);
        assert_eq!(
            classify_upload(Some(&stored), &op),
            Some(RejectionReason::ConflictSuperseded)
        );
    }

    #[test]
    fn test_full_state_import_always_accepted() {
        let stored = VectorClock::from_entries([("device-1", 30)]);
        let import = Operation::new(
            "device-2",
            OpType::BackupImport,
            EntityType::All,
            None,
            json!({"tasks": {}}),
            VectorClock::from_entries([("device-2", 1)]),
            1706745600000,
        );
        assert_eq!(classify_upload(Some(&stored), &import), None);
    }
}
