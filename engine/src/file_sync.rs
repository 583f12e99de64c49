//! File-based sync adapter.
//!
//! Implements [`OperationSyncProvider`] on top of a [`FileProvider`] that can
//! only read and write whole files. Concurrency is optimistic on two levels:
//! the envelope's `syncVersion` detects that another client wrote since we
//! last looked, and the provider's revision compare-and-swap makes the write
//! itself safe against a writer sneaking in between our read and our write.

use crate::config::{EngineConfig, RetryConfig};
use crate::envelope::{FileBasedSyncData, PayloadCodec, PlainJsonCodec, FILE_SYNC_VERSION};
use crate::error::Result;
use crate::operation::{now, Operation};
use crate::protocol::{DownloadResult, OperationSyncProvider, SnapshotReason, UploadResult};
use crate::state::StateStore;
use crate::{Error, OperationId, VectorClock};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Default name of the sync file.
pub const DEFAULT_SYNC_FILE: &str = "sync-data.json";

/// A file as stored remotely, with the provider's revision tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub data: Vec<u8>,
    pub rev: String,
}

/// Raw remote storage (WebDAV, Dropbox, a local folder, ...).
#[async_trait]
pub trait FileProvider: Send + Sync {
    /// Read a file, or `None` if it does not exist.
    async fn download_file(&self, path: &str) -> Result<Option<RemoteFile>>;

    /// Write a file if its revision still is `expected_rev` (`None`: the file
    /// must not exist). Returns the new revision, or
    /// [`Error::RevisionMismatch`] if someone else wrote first.
    async fn upload_file(&self, path: &str, data: Vec<u8>, expected_rev: Option<&str>)
        -> Result<String>;

    async fn remove_file(&self, path: &str) -> Result<()>;
}

/// In-memory [`FileProvider`]. Cloning shares the underlying files, so
/// several clients can sync through one instance.
#[derive(Debug, Clone, Default)]
pub struct MemoryFileProvider {
    files: Arc<Mutex<HashMap<String, (Vec<u8>, u64)>>>,
}

impl MemoryFileProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FileProvider for MemoryFileProvider {
    async fn download_file(&self, path: &str) -> Result<Option<RemoteFile>> {
        let files = self.files.lock().await;
        Ok(files.get(path).map(|(data, rev)| RemoteFile {
            data: data.clone(),
            rev: rev.to_string(),
        }))
    }

    async fn upload_file(
        &self,
        path: &str,
        data: Vec<u8>,
        expected_rev: Option<&str>,
    ) -> Result<String> {
        let mut files = self.files.lock().await;
        let current = files.get(path).map(|(_, rev)| rev.to_string());
        if current.as_deref() != expected_rev {
            return Err(Error::RevisionMismatch {
                path: path.to_string(),
            });
        }

        let rev = files.get(path).map(|(_, rev)| rev + 1).unwrap_or(1);
        files.insert(path.to_string(), (data, rev));
        Ok(rev.to_string())
    }

    async fn remove_file(&self, path: &str) -> Result<()> {
        self.files.lock().await.remove(path);
        Ok(())
    }
}

/// [`OperationSyncProvider`] over a single envelope file.
///
/// The window of recent operations is collapsed into the envelope's state
/// snapshot once it outgrows `max_recent_ops`. That snapshot is read from
/// `state_source`, the store the client applies every operation to.
pub struct FileBasedSyncAdapter {
    provider: Arc<dyn FileProvider>,
    path: String,
    codec: Arc<dyn PayloadCodec>,
    max_recent_ops: usize,
    retry: RetryConfig,
    state_source: Arc<dyn StateStore>,
    /// Newest operation handed out by the last download.
    last_seen_op: Mutex<Option<OperationId>>,
}

impl FileBasedSyncAdapter {
    pub fn new(
        provider: Arc<dyn FileProvider>,
        state_source: Arc<dyn StateStore>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            provider,
            path: DEFAULT_SYNC_FILE.to_string(),
            codec: Arc::new(PlainJsonCodec),
            max_recent_ops: config.max_recent_ops,
            retry: config.retry.clone(),
            state_source,
            last_seen_op: Mutex::new(None),
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_codec(mut self, codec: Arc<dyn PayloadCodec>) -> Self {
        self.codec = codec;
        self
    }

    async fn read_envelope(&self) -> Result<Option<(FileBasedSyncData, String)>> {
        match self.provider.download_file(&self.path).await? {
            Some(file) => {
                let data = FileBasedSyncData::from_bytes(file.data, self.codec.as_ref())?;
                Ok(Some((data, file.rev)))
            }
            None => Ok(None),
        }
    }

    async fn write_envelope(&self, data: &FileBasedSyncData, rev: Option<&str>) -> Result<String> {
        let bytes = data.to_bytes(self.codec.as_ref())?;
        self.provider.upload_file(&self.path, bytes, rev).await
    }

    async fn remember_seen(&self, ops: &[Operation]) {
        if let Some(last) = ops.last() {
            *self.last_seen_op.lock().await = Some(last.id.clone());
        }
    }

    /// Whether the window lost operations this client has not seen yet.
    async fn window_lost_ops(&self, data: &FileBasedSyncData) -> bool {
        if data.oldest_op_timestamp.is_none() {
            return false;
        }
        match &*self.last_seen_op.lock().await {
            Some(id) => !data.contains_op(id),
            // nothing to check against after a restart
            None => true,
        }
    }

    /// Collapse the window into a fresh snapshot of local state.
    ///
    /// Only valid when local state reflects every operation in the envelope.
    async fn refresh_snapshot(&self, data: &mut FileBasedSyncData) -> Result<()> {
        data.state = Some(self.state_source.export_state().await?);
        data.vector_clock = data.merged_clock();
        Ok(())
    }
}

#[async_trait]
impl OperationSyncProvider for FileBasedSyncAdapter {
    async fn download_ops(&self, since_seq: u64) -> Result<DownloadResult> {
        let Some((data, _rev)) = self.read_envelope().await? else {
            return Ok(DownloadResult {
                gap_detected: since_seq > 0,
                ..Default::default()
            });
        };

        if data.sync_version < since_seq {
            warn!(
                since_seq,
                sync_version = data.sync_version,
                "remote sync version went backwards"
            );
            return Ok(DownloadResult {
                latest_seq: data.sync_version,
                gap_detected: true,
                ..Default::default()
            });
        }

        if since_seq == 0 {
            self.remember_seen(&data.recent_ops).await;
            return Ok(DownloadResult {
                latest_seq: data.sync_version,
                snapshot_vector_clock: data.state.as_ref().map(|_| data.vector_clock.clone()),
                snapshot_state: data.state,
                ops: data.recent_ops,
                ..Default::default()
            });
        }

        if data.sync_version == since_seq {
            return Ok(DownloadResult {
                latest_seq: since_seq,
                ..Default::default()
            });
        }

        if data.recent_ops.is_empty() || self.window_lost_ops(&data).await {
            warn!(
                since_seq,
                sync_version = data.sync_version,
                "operation window no longer covers this client"
            );
            return Ok(DownloadResult {
                latest_seq: data.sync_version,
                gap_detected: true,
                ..Default::default()
            });
        }

        self.remember_seen(&data.recent_ops).await;
        Ok(DownloadResult {
            latest_seq: data.sync_version,
            ops: data.recent_ops,
            ..Default::default()
        })
    }

    async fn upload_ops(
        &self,
        ops: &[Operation],
        client_id: &str,
        last_known_seq: u64,
    ) -> Result<UploadResult> {
        let mut piggybacked: Vec<Operation> = Vec::new();
        let mut last_conflict = (last_known_seq, last_known_seq);

        for attempt in 0..self.retry.max_attempts {
            let delay = self.retry.delay_for_attempt(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let (mut data, rev) = match self.read_envelope().await? {
                Some((data, rev)) => (data, Some(rev)),
                None => (FileBasedSyncData::empty(client_id), None),
            };

            let in_sync = data.sync_version == last_known_seq;
            if !in_sync {
                debug!(
                    expected = last_known_seq,
                    actual = data.sync_version,
                    attempt,
                    "sync version moved, merging remote operations"
                );
                last_conflict = (last_known_seq, data.sync_version);
                for op in data.ops_not_from(client_id) {
                    if !piggybacked.iter().any(|p| p.id == op.id) {
                        piggybacked.push(op);
                    }
                }
            }

            // an import in the batch replaces everything written before it
            let added = match ops.iter().rposition(Operation::is_full_state) {
                Some(pos) => {
                    let import = &ops[pos];
                    debug!(import_id = %import.id, "resetting sync file to uploaded import");
                    data.reset_to_snapshot(import.payload.clone(), import.vector_clock.clone());
                    data.append_ops(&ops[pos..])
                }
                None => data.append_ops(ops),
            };

            let over_cap = data.recent_ops.len() > self.max_recent_ops;
            // only an in-sync client's state reflects the whole file
            if in_sync && (over_cap || data.state.is_none()) {
                self.refresh_snapshot(&mut data).await?;
            }
            if over_cap {
                let covered = data.covered_prefix_len();
                let dropped = data.trim_before(self.max_recent_ops, covered);
                debug!(dropped, kept = data.recent_ops.len(), "trimmed operation window");
            }

            data.sync_version += 1;
            data.version = FILE_SYNC_VERSION;
            data.last_modified = now();
            data.client_id = client_id.to_string();

            match self.write_envelope(&data, rev.as_deref()).await {
                Ok(_) => {
                    info!(
                        uploaded = added,
                        piggybacked = piggybacked.len(),
                        sync_version = data.sync_version,
                        "uploaded operations"
                    );
                    self.remember_seen(&data.recent_ops).await;
                    return Ok(UploadResult {
                        uploaded_count: ops.len(),
                        rejected_count: 0,
                        piggybacked_ops: piggybacked,
                        rejected_ops: Vec::new(),
                        latest_seq: data.sync_version,
                    });
                }
                Err(Error::RevisionMismatch { .. }) => {
                    debug!(attempt, "remote file changed during upload, retrying");
                    last_conflict = (last_known_seq, data.sync_version);
                }
                Err(e) => return Err(e),
            }
        }

        let (expected, actual) = last_conflict;
        Err(Error::SyncVersionConflict { expected, actual })
    }

    async fn upload_snapshot(
        &self,
        state: serde_json::Value,
        vector_clock: &VectorClock,
        client_id: &str,
        reason: SnapshotReason,
    ) -> Result<u64> {
        for attempt in 0..self.retry.max_attempts {
            let delay = self.retry.delay_for_attempt(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let (mut data, rev) = match self.read_envelope().await {
                Ok(Some((data, rev))) => (data, Some(rev)),
                Ok(None) => (FileBasedSyncData::empty(client_id), None),
                // a snapshot replaces whatever is there, readable or not
                Err(Error::UnsupportedSyncFormat { .. } | Error::SyncDataCorrupted(_)) => {
                    let rev = self
                        .provider
                        .download_file(&self.path)
                        .await?
                        .map(|file| file.rev);
                    (FileBasedSyncData::empty(client_id), rev)
                }
                Err(e) => return Err(e),
            };

            data.reset_to_snapshot(state.clone(), vector_clock.clone());
            data.sync_version += 1;
            data.version = FILE_SYNC_VERSION;
            data.last_modified = now();
            data.client_id = client_id.to_string();

            match self.write_envelope(&data, rev.as_deref()).await {
                Ok(_) => {
                    info!(?reason, sync_version = data.sync_version, "uploaded snapshot");
                    *self.last_seen_op.lock().await = None;
                    return Ok(data.sync_version);
                }
                Err(Error::RevisionMismatch { .. }) => {
                    debug!(attempt, "remote file changed during snapshot upload, retrying");
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::RevisionMismatch {
            path: self.path.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityType;
    use crate::operation::OpType;
    use crate::state::MemoryStateStore;
    use serde_json::json;

    fn op(id: &str, client: &str, counter: u64) -> Operation {
        Operation::new(
            client,
            OpType::Create,
            EntityType::Task,
            Some(id.into()),
            json!({"title": id}),
            VectorClock::from_entries([(client, counter)]),
            counter as i64,
        )
        .with_id(id)
    }

    fn adapter_over(
        provider: &MemoryFileProvider,
        store: Arc<MemoryStateStore>,
    ) -> FileBasedSyncAdapter {
        let config = EngineConfig::new("unused")
            .with_max_recent_ops(3)
            .with_retry(RetryConfig::new(3).with_initial_delay(std::time::Duration::ZERO));
        FileBasedSyncAdapter::new(Arc::new(provider.clone()), store, &config)
    }

    fn adapter(provider: &MemoryFileProvider) -> FileBasedSyncAdapter {
        adapter_over(provider, Arc::new(MemoryStateStore::new()))
    }

    async fn envelope(provider: &MemoryFileProvider) -> FileBasedSyncData {
        let file = provider.download_file(DEFAULT_SYNC_FILE).await.unwrap().unwrap();
        FileBasedSyncData::from_bytes(file.data, &PlainJsonCodec).unwrap()
    }

    #[tokio::test]
    async fn memory_provider_compare_and_swap() {
        let provider = MemoryFileProvider::new();
        let rev = provider.upload_file("f", b"1".to_vec(), None).await.unwrap();

        let err = provider.upload_file("f", b"2".to_vec(), None).await.unwrap_err();
        assert!(matches!(err, Error::RevisionMismatch { .. }));

        let rev2 = provider
            .upload_file("f", b"2".to_vec(), Some(&rev))
            .await
            .unwrap();
        assert_ne!(rev, rev2);
        assert_eq!(provider.download_file("f").await.unwrap().unwrap().data, b"2");
    }

    #[tokio::test]
    async fn first_upload_creates_envelope() {
        let provider = MemoryFileProvider::new();
        let sync = adapter(&provider);

        let result = sync.upload_ops(&[op("op-1", "a", 1)], "a", 0).await.unwrap();
        assert_eq!(result.latest_seq, 1);
        assert!(result.piggybacked_ops.is_empty());

        let download = sync.download_ops(0).await.unwrap();
        assert_eq!(download.ops.len(), 1);
        assert_eq!(download.latest_seq, 1);
    }

    #[tokio::test]
    async fn stale_uploader_piggybacks_and_advances() {
        let provider = MemoryFileProvider::new();
        let a = adapter(&provider);
        let b = adapter(&provider);

        a.upload_ops(&[op("a-1", "a", 1)], "a", 0).await.unwrap();
        b.upload_ops(&[op("b-1", "b", 1)], "b", 1).await.unwrap();

        // a still believes version 1 is current
        let result = a.upload_ops(&[op("a-2", "a", 2)], "a", 1).await.unwrap();
        assert_eq!(result.latest_seq, 3);
        assert_eq!(result.piggybacked_ops.len(), 1);
        assert_eq!(result.piggybacked_ops[0].id, "b-1");
    }

    #[tokio::test]
    async fn download_since_current_version_is_empty() {
        let provider = MemoryFileProvider::new();
        let sync = adapter(&provider);
        sync.upload_ops(&[op("op-1", "a", 1)], "a", 0).await.unwrap();

        let download = sync.download_ops(1).await.unwrap();
        assert!(download.ops.is_empty());
        assert!(!download.gap_detected);
    }

    #[tokio::test]
    async fn snapshot_upload_resets_window_and_causes_gap() {
        let provider = MemoryFileProvider::new();
        let sync = adapter(&provider);
        sync.upload_ops(&[op("op-1", "a", 1)], "a", 0).await.unwrap();

        let seq = sync
            .upload_snapshot(
                json!({"task": {}}),
                &VectorClock::from_entries([("a", 1)]),
                "a",
                SnapshotReason::Recovery,
            )
            .await
            .unwrap();
        assert_eq!(seq, 2);

        let download = sync.download_ops(1).await.unwrap();
        assert!(download.gap_detected);

        let full = sync.download_ops(0).await.unwrap();
        assert!(full.ops.is_empty());
        assert_eq!(full.snapshot_state, Some(json!({"task": {}})));
    }

    #[tokio::test]
    async fn version_going_backwards_is_a_gap() {
        let provider = MemoryFileProvider::new();
        let sync = adapter(&provider);
        sync.upload_ops(&[op("op-1", "a", 1)], "a", 0).await.unwrap();

        let download = sync.download_ops(7).await.unwrap();
        assert!(download.gap_detected);
    }

    #[tokio::test]
    async fn window_is_trimmed_and_lagging_reader_sees_gap() {
        let provider = MemoryFileProvider::new();
        let writer = adapter(&provider);
        let reader = adapter(&provider);

        writer.upload_ops(&[op("op-1", "a", 1)], "a", 0).await.unwrap();
        let first = reader.download_ops(0).await.unwrap();
        assert_eq!(first.latest_seq, 1);

        let ops: Vec<Operation> = (2..=6).map(|i| op(&format!("op-{i}"), "a", i)).collect();
        writer.upload_ops(&ops, "a", 1).await.unwrap();

        let data = envelope(&provider).await;
        assert_eq!(data.recent_ops.len(), 3);
        assert_eq!(data.oldest_op_timestamp, Some(4));

        let download = reader.download_ops(1).await.unwrap();
        assert!(download.gap_detected);
    }

    #[tokio::test]
    async fn upload_refreshes_snapshot_from_state_source() {
        let provider = MemoryFileProvider::new();
        let store = Arc::new(
            MemoryStateStore::from_state(json!({"task": {"op-1": {"title": "op-1"}}})).unwrap(),
        );
        let sync = adapter_over(&provider, store);

        sync.upload_ops(&[op("op-1", "a", 1)], "a", 0).await.unwrap();

        let full = sync.download_ops(0).await.unwrap();
        assert_eq!(
            full.snapshot_state,
            Some(json!({"task": {"op-1": {"title": "op-1"}}}))
        );
        assert_eq!(
            full.snapshot_vector_clock,
            Some(VectorClock::from_entries([("a", 1)]))
        );
    }

    #[tokio::test]
    async fn trimmed_window_is_covered_by_snapshot() {
        let provider = MemoryFileProvider::new();
        let store = Arc::new(MemoryStateStore::new());
        let writer = adapter_over(&provider, store.clone());

        let ops: Vec<Operation> = (1..=5).map(|i| op(&format!("t{i}"), "a", i)).collect();
        for op in &ops {
            store
                .apply_entity_change_set(crate::state::ChangeSet::Entities(vec![
                    crate::operation::EntityChange::created(
                        EntityType::Task,
                        op.id.clone(),
                        op.payload.clone(),
                    ),
                ]))
                .await
                .unwrap();
        }
        writer.upload_ops(&ops, "a", 0).await.unwrap();

        let full = adapter(&provider).download_ops(0).await.unwrap();
        assert_eq!(full.ops.len(), 3);
        let state = full.snapshot_state.unwrap();
        assert_eq!(state["task"].as_object().unwrap().len(), 5);
        assert_eq!(
            full.snapshot_vector_clock,
            Some(VectorClock::from_entries([("a", 5)]))
        );
    }

    #[tokio::test]
    async fn racing_upload_trims_only_what_the_snapshot_covers() {
        let provider = MemoryFileProvider::new();
        let w = adapter(&provider);
        let v = adapter(&provider);
        let a = adapter(&provider);

        w.upload_ops(&[op("w-1", "w", 1)], "w", 0).await.unwrap();
        v.upload_ops(&[op("v-1", "v", 1)], "v", 1).await.unwrap();
        let before = envelope(&provider).await;
        assert_eq!(before.vector_clock, VectorClock::from_entries([("w", 1)]));

        // a never saw the file, so it cannot refresh the snapshot
        let ops: Vec<Operation> = (1..=3).map(|i| op(&format!("a-{i}"), "a", i)).collect();
        let result = a.upload_ops(&ops, "a", 0).await.unwrap();
        assert_eq!(result.piggybacked_ops.len(), 2);

        let data = envelope(&provider).await;
        let ids: Vec<&str> = data.recent_ops.iter().map(|op| op.id.as_str()).collect();
        assert_eq!(ids, vec!["v-1", "a-1", "a-2", "a-3"]);
        assert_eq!(data.oldest_op_timestamp, Some(1));
        assert_eq!(data.vector_clock, before.vector_clock);
        assert_eq!(data.state, before.state);
    }

    #[tokio::test]
    async fn uploaded_import_resets_window() {
        let provider = MemoryFileProvider::new();
        let sync = adapter(&provider);
        sync.upload_ops(&[op("op-1", "a", 1), op("op-2", "b", 1)], "a", 0)
            .await
            .unwrap();

        let import = Operation::new(
            "a",
            OpType::SyncImport,
            EntityType::All,
            None,
            json!({"task": {"t1": {"title": "restored"}}}),
            VectorClock::from_entries([("a", 2), ("b", 1)]),
            10,
        )
        .with_id("import");
        sync.upload_ops(&[import], "a", 1).await.unwrap();

        let full = sync.download_ops(0).await.unwrap();
        assert_eq!(full.ops.len(), 1);
        assert_eq!(full.ops[0].id, "import");
        assert_eq!(
            full.snapshot_state,
            Some(json!({"task": {"t1": {"title": "restored"}}}))
        );
    }

    #[tokio::test]
    async fn unknown_version_is_rejected_on_download() {
        let provider = MemoryFileProvider::new();
        provider
            .upload_file(DEFAULT_SYNC_FILE, br#"{"version": 7}"#.to_vec(), None)
            .await
            .unwrap();

        let err = adapter(&provider).download_ops(0).await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedSyncFormat { found: 7, .. }));
    }
}
