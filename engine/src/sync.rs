//! Sync orchestrator.
//!
//! [`SyncEngine`] runs one sync cycle at a time:
//!
//! 1. Download remote operations (again from scratch on a gap) and hydrate
//!    from a snapshot when the remote holds one this client has not seen.
//! 2. Drop operations made obsolete by a full-state import.
//! 3. Detect and resolve conflicts, recording every rejection first.
//! 4. Apply accepted operations, then append local-win operations.
//! 5. Upload pending local operations and process piggybacked ones.
//!
//! Nothing here is wrapped in a cross-call transaction. Crash safety comes
//! from ordering: losers are rejected before anything is applied, and remote
//! operations are stored as pending before they touch state. A restart
//! resumes through [`SyncEngine::recover`].

use crate::applier::OperationApplier;
use crate::clock::MAX_VECTOR_CLOCK_SIZE;
use crate::config::EngineConfig;
use crate::conflict::{detect_conflicts, ConflictResolver};
use crate::entity::{keys_in_state, EntityType};
use crate::error::Result;
use crate::import_filter::{filter_ops_invalidated_by_import, local_ops_lost_to_import};
use crate::log::{OpSource, OperationLog};
use crate::notify::{ImportConflictChoice, SyncNotifier, TracingNotifier};
use crate::operation::{now, sort_for_apply, OpType, Operation};
use crate::protocol::{OperationSyncProvider, RejectionReason, SnapshotReason};
use crate::state::{ChangeSet, StateStore};
use crate::{ClockComparison, Error, OperationId, Seq, VectorClock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Upload attempts per cycle when the remote answers with conflicts.
const UPLOAD_ROUNDS: usize = 2;

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncCycleOutcome {
    pub downloaded: usize,
    pub applied: usize,
    pub conflicts_resolved: usize,
    pub local_win_ops_created: usize,
    pub invalidated_by_import: usize,
    pub uploaded: usize,
    pub rejected: usize,
    pub piggybacked: usize,
    pub gap_detected: bool,
}

/// Clears the in-progress flag when the cycle ends, however it ends.
struct CycleGuard<'a>(&'a AtomicBool);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Drives sync cycles for one client.
pub struct SyncEngine<P, S>
where
    P: OperationSyncProvider + ?Sized,
    S: StateStore + ?Sized,
{
    config: EngineConfig,
    log: Arc<OperationLog>,
    store: Arc<S>,
    provider: Arc<P>,
    notifier: Arc<dyn SyncNotifier>,
    in_progress: AtomicBool,
}

impl<P, S> SyncEngine<P, S>
where
    P: OperationSyncProvider + ?Sized,
    S: StateStore + ?Sized,
{
    pub fn new(
        config: EngineConfig,
        log: Arc<OperationLog>,
        store: Arc<S>,
        provider: Arc<P>,
    ) -> Self {
        Self {
            config,
            log,
            store,
            provider,
            notifier: Arc::new(TracingNotifier::default()),
            in_progress: AtomicBool::new(false),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn SyncNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn log(&self) -> &Arc<OperationLog> {
        &self.log
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn is_syncing(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    fn begin(&self) -> Result<CycleGuard<'_>> {
        self.in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| CycleGuard(&self.in_progress))
            .map_err(|_| Error::SyncInProgress)
    }

    /// Record an operation the application just performed.
    ///
    /// Stamps it with this client's id and next clock and appends it for
    /// upload. The application has already changed its own state.
    pub async fn record_local_op(&self, mut op: Operation) -> Result<Operation> {
        let client_id = self.config.client_id.as_str();
        op.client_id = client_id.to_string();
        op.vector_clock = self.log.increment_vector_clock(client_id).await?;

        self.log.append(op.clone(), OpSource::Local).await?;
        if op.is_full_state() {
            self.adopt_full_state(&op).await?;
        }

        debug!(op_id = %op.id, op_type = ?op.op_type, "recorded local operation");
        Ok(op)
    }

    /// Run one sync cycle. Fails fast if a cycle is already running.
    pub async fn sync(&self) -> Result<SyncCycleOutcome> {
        let _guard = self.begin()?;
        let mut outcome = SyncCycleOutcome::default();

        match self.run_cycle(&mut outcome).await {
            Ok(()) => {
                info!(
                    downloaded = outcome.downloaded,
                    applied = outcome.applied,
                    conflicts = outcome.conflicts_resolved,
                    uploaded = outcome.uploaded,
                    "sync cycle complete"
                );
                Ok(outcome)
            }
            Err(error) => {
                warn!(%error, "sync cycle failed");
                self.notifier.sync_error(&error).await;
                Err(error)
            }
        }
    }

    /// Run [`SyncEngine::sync`], repeating with backoff while the remote is
    /// migrating or another writer won a version race.
    pub async fn sync_with_retry(&self) -> Result<SyncCycleOutcome> {
        let retry = &self.config.retry;
        let mut attempt = 0;
        loop {
            match self.sync().await {
                Err(error) if error.should_retry_cycle() && attempt + 1 < retry.max_attempts => {
                    attempt += 1;
                    let delay = retry.delay_for_attempt(attempt);
                    debug!(attempt, ?delay, %error, "retrying sync cycle");
                    tokio::time::sleep(delay).await;
                }
                result => return result,
            }
        }
    }

    /// Apply remote operations a crash left pending, and retry failed ones
    /// that still have attempts left.
    pub async fn recover(&self) -> Result<SyncCycleOutcome> {
        let _guard = self.begin()?;
        let mut outcome = SyncCycleOutcome::default();

        let mut entries = self.log.get_pending_remote_ops().await;
        entries.extend(self.log.get_failed_remote_ops().await);
        if entries.is_empty() {
            return Ok(outcome);
        }
        entries.sort_by_key(|e| e.seq);
        info!(count = entries.len(), "re-applying unapplied remote operations");

        let entries = entries.into_iter().map(|e| (e.seq, e.op)).collect();
        if let Some(error) = self.apply_logged(entries, &mut outcome).await? {
            return Err(error);
        }
        self.store.repair().await?;
        Ok(outcome)
    }

    /// Replace the remote state with this client's current state.
    ///
    /// Used for recovery and when the payload encoding changes. Pending local
    /// operations are contained in the snapshot and count as synced.
    pub async fn upload_snapshot(&self, reason: SnapshotReason) -> Result<u64> {
        let _guard = self.begin()?;
        let state = self.store.export_state().await?;
        let clock = self.log.get_vector_clock_entry().await;

        let seq = self
            .provider
            .upload_snapshot(state, &clock, &self.config.client_id, reason)
            .await?;

        let pending: Vec<OperationId> = self
            .log
            .get_unsynced()
            .await
            .into_iter()
            .map(|e| e.op.id)
            .collect();
        self.log.mark_synced(&pending).await?;
        self.log.set_last_server_seq(seq).await?;

        info!(?reason, seq, "uploaded state snapshot");
        Ok(seq)
    }

    /// Drop log entries older than the configured retention.
    pub async fn compact(&self) -> Result<usize> {
        self.log
            .compact(now(), self.config.compaction_retention)
            .await
    }

    async fn run_cycle(&self, outcome: &mut SyncCycleOutcome) -> Result<()> {
        self.download(outcome).await?;

        for round in 0..UPLOAD_ROUNDS {
            if !self.upload(outcome).await? {
                break;
            }
            debug!(round, "upload rejected as conflicting, downloading again");
            self.download(outcome).await?;
        }
        Ok(())
    }

    async fn download(&self, outcome: &mut SyncCycleOutcome) -> Result<()> {
        let since = self.log.last_server_seq().await;
        let mut download = self.provider.download_ops(since).await?;
        if download.gap_detected {
            warn!(since, "remote no longer holds our window, downloading everything");
            outcome.gap_detected = true;
            download = self.provider.download_ops(0).await?;
        }
        outcome.downloaded += download.ops.len();

        let mut ops = download.ops;
        // an import in the window carries the state itself
        if let Some(state) = download.snapshot_state {
            if !ops.iter().any(Operation::is_full_state) {
                let clock = download.snapshot_vector_clock.unwrap_or_default();
                if self.hydrate(state, &clock).await? {
                    ops = self.skip_ops_in_snapshot(ops, &clock).await?;
                }
            }
        }

        match self.process_remote_ops(ops, outcome).await {
            Ok(()) => self.log.set_last_server_seq(download.latest_seq).await,
            // everything is stored; failed ops are retried by `recover`
            Err(error @ Error::ApplyFailed { .. }) => {
                self.log.set_last_server_seq(download.latest_seq).await?;
                Err(error)
            }
            Err(error) => Err(error),
        }
    }

    /// Replace local state with a remote snapshot if it knows more than we do.
    async fn hydrate(&self, state: serde_json::Value, clock: &VectorClock) -> Result<bool> {
        let local_clock = self.log.get_vector_clock_entry().await;
        let fresh = local_clock.is_empty() && self.log.is_empty().await;
        if !fresh && !clock.has_changes(Some(&local_clock)) {
            debug!("remote snapshot holds nothing new");
            return Ok(false);
        }

        let unsynced: Vec<Operation> = self
            .log
            .get_unsynced()
            .await
            .into_iter()
            .map(|e| e.op)
            .filter(|op| !op.is_full_state())
            .collect();
        let keys = keys_in_state(&state);
        info!(fresh, entities = keys.len(), "hydrating from remote snapshot");

        self.store
            .apply_entity_change_set(ChangeSet::ReplaceAll(state))
            .await?;
        self.log.set_snapshot(clock.clone(), keys).await?;

        let protected = self.log.get_protected_client_ids().await;
        let merged = local_clock
            .merge(clock)
            .limit_size(&self.config.client_id, &protected);
        self.log.set_vector_clock(merged).await?;

        // local work the snapshot does not contain goes back on top
        let applier = OperationApplier::new(self.store.as_ref());
        let mut lost = Vec::new();
        for op in &unsynced {
            let result = applier.apply(std::slice::from_ref(op)).await;
            if let Some(failed) = result.failed {
                warn!(op_id = %op.id, error = %failed.error, "local operation lost over snapshot");
                self.notifier.apply_failed(op, &failed.error).await;
                lost.push(op.id.clone());
            }
        }
        if !lost.is_empty() {
            // never uploaded: the state they changed no longer exists here
            self.log.mark_rejected(&lost).await?;
        }
        Ok(true)
    }

    /// Store operations the hydrated snapshot already contains.
    async fn skip_ops_in_snapshot(
        &self,
        ops: Vec<Operation>,
        clock: &VectorClock,
    ) -> Result<Vec<Operation>> {
        let ops = self.log.filter_new_ops(ops).await;
        let (covered, rest): (Vec<_>, Vec<_>) = ops.into_iter().partition(|op| {
            matches!(
                op.vector_clock.compare(clock),
                ClockComparison::LessThan | ClockComparison::Equal
            )
        });

        if !covered.is_empty() {
            debug!(count = covered.len(), "operations already contained in snapshot");
            self.log
                .append_batch_skip_duplicates(covered, OpSource::Remote, false)
                .await?;
        }
        Ok(rest)
    }

    async fn process_remote_ops(
        &self,
        ops: Vec<Operation>,
        outcome: &mut SyncCycleOutcome,
    ) -> Result<()> {
        let ops = self.log.filter_new_ops(ops).await;
        if ops.is_empty() {
            return Ok(());
        }
        let client_id = self.config.client_id.as_str();

        let filtered = filter_ops_invalidated_by_import(&self.log, ops).await;
        let ops = filtered.valid_ops;
        if let Some(import) = &filtered.import {
            if !filtered.invalidated_ops.is_empty() {
                outcome.invalidated_by_import += filtered.invalidated_ops.len();
                self.notifier
                    .ops_invalidated_by_import(import, &filtered.invalidated_ops)
                    .await;
                self.store_rejected_remote(filtered.invalidated_ops).await?;
            }
            if filtered.import_in_batch && !self.accept_remote_import(import, outcome).await? {
                self.store_rejected_remote(ops).await?;
                return Ok(());
            }
        }

        let pending = self.log.get_unsynced_by_entity().await;
        let detection = detect_conflicts(&self.log, ops, &pending).await;
        if !detection.duplicates.is_empty() {
            self.log
                .append_batch_skip_duplicates(detection.duplicates, OpSource::Remote, false)
                .await?;
        }
        self.store_rejected_remote(detection.superseded).await?;

        let resolver = ConflictResolver::new(client_id, &self.log, self.store.as_ref());
        let plan = resolver.resolve(detection.conflicts, &pending).await?;
        if !plan.resolutions.is_empty() {
            outcome.conflicts_resolved += plan.resolutions.len();
            self.notifier.conflicts_resolved(&plan.resolutions).await;
        }

        // losers are recorded before anything is applied
        let rejected_local: Vec<OperationId> = plan.rejected_local.into_iter().collect();
        self.log.mark_rejected(&rejected_local).await?;
        self.store_rejected_remote(plan.rejected_remote).await?;

        let mut to_apply = detection.non_conflicting;
        to_apply.extend(plan.remote_to_apply);
        let apply_failure = self.apply_remote(to_apply, outcome).await?;

        if !plan.local_win_ops.is_empty() {
            outcome.local_win_ops_created += plan.local_win_ops.len();
            self.log
                .append_batch(plan.local_win_ops, OpSource::Local, false)
                .await?;
        }
        if self.store.repair().await? {
            debug!("repaired state after applying remote operations");
        }

        match apply_failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Ask before a remote import discards local work. Returns whether the
    /// import should be applied.
    async fn accept_remote_import(
        &self,
        import: &Operation,
        outcome: &mut SyncCycleOutcome,
    ) -> Result<bool> {
        let local: Vec<Operation> = self
            .log
            .get_unsynced()
            .await
            .into_iter()
            .map(|e| e.op)
            .collect();
        let lost = local_ops_lost_to_import(import, &local);
        if lost.is_empty() {
            return Ok(true);
        }

        match self.notifier.choose_import_resolution(import, &lost).await {
            ImportConflictChoice::AcceptRemote => {
                info!(import_id = %import.id, dropped = lost.len(), "accepting remote import");
                let ids: Vec<OperationId> = lost.iter().map(|op| op.id.clone()).collect();
                self.log.mark_rejected(&ids).await?;
                outcome.invalidated_by_import += lost.len();
                Ok(true)
            }
            ImportConflictChoice::KeepLocal => {
                info!(import_id = %import.id, "keeping local state over remote import");
                self.publish_local_import(import).await?;
                Ok(false)
            }
        }
    }

    /// Re-publish current state as an import that dominates `rejected`.
    async fn publish_local_import(&self, rejected: &Operation) -> Result<()> {
        self.log
            .merge_remote_op_clocks(std::slice::from_ref(rejected), &self.config.client_id)
            .await?;
        let state = self.store.export_state().await?;
        let op = Operation::new(
            self.config.client_id.as_str(),
            OpType::SyncImport,
            EntityType::All,
            None,
            state,
            VectorClock::new(),
            now(),
        );
        self.record_local_op(op).await?;
        Ok(())
    }

    async fn store_rejected_remote(&self, ops: Vec<Operation>) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let ids: Vec<OperationId> = ops.iter().map(|op| op.id.clone()).collect();
        self.log
            .append_batch_skip_duplicates(ops, OpSource::Remote, false)
            .await?;
        self.log.mark_rejected(&ids).await
    }

    async fn apply_remote(
        &self,
        ops: Vec<Operation>,
        outcome: &mut SyncCycleOutcome,
    ) -> Result<Option<Error>> {
        if ops.is_empty() {
            return Ok(None);
        }
        // stored as pending first, so a crash never loses an applied op
        let appended = self
            .log
            .append_batch_skip_duplicates(ops, OpSource::Remote, true)
            .await?;
        let entries = appended
            .seqs
            .into_iter()
            .zip(appended.written_ops)
            .collect();
        self.apply_logged(entries, outcome).await
    }

    /// Apply operations already in the log and record the outcome.
    ///
    /// Returns the apply failure, if any, after its bookkeeping is done.
    async fn apply_logged(
        &self,
        entries: Vec<(Seq, Operation)>,
        outcome: &mut SyncCycleOutcome,
    ) -> Result<Option<Error>> {
        let seq_by_id: HashMap<OperationId, Seq> = entries
            .iter()
            .map(|(seq, op)| (op.id.clone(), *seq))
            .collect();
        let ops = sort_for_apply(entries.into_iter().map(|(_, op)| op).collect());

        let result = OperationApplier::new(self.store.as_ref()).apply(&ops).await;

        let latest_import = result
            .applied_ops
            .iter()
            .filter(|op| op.is_full_state())
            .max_by(|a, b| a.cmp_by_time(b));
        if let Some(import) = latest_import {
            self.adopt_full_state(import).await?;
        }

        let applied_seqs: Vec<Seq> = result
            .applied_ops
            .iter()
            .filter_map(|op| seq_by_id.get(&op.id).copied())
            .collect();
        self.log.mark_applied(&applied_seqs).await?;
        self.log
            .merge_remote_op_clocks(&result.applied_ops, &self.config.client_id)
            .await?;
        outcome.applied += result.applied_ops.len();

        let Some(failed) = result.failed else {
            return Ok(None);
        };

        let remainder: Vec<OperationId> = ops
            .iter()
            .skip(result.applied_ops.len())
            .map(|op| op.id.clone())
            .collect();
        warn!(
            op_id = %failed.op.id,
            error = %failed.error,
            remaining = remainder.len(),
            "remote batch applied partially"
        );
        self.log
            .mark_failed(&remainder, self.config.max_apply_attempts)
            .await?;
        self.notifier.apply_failed(&failed.op, &failed.error).await;

        Ok(Some(Error::ApplyFailed {
            op_id: failed.op.id.clone(),
            reason: failed.error.to_string(),
        }))
    }

    /// Make a full-state operation the new causal baseline.
    async fn adopt_full_state(&self, import: &Operation) -> Result<()> {
        let protected = import
            .vector_clock
            .select_protected_ids(MAX_VECTOR_CLOCK_SIZE - 1);
        self.log.set_protected_client_ids(protected).await?;
        self.log
            .set_snapshot(import.vector_clock.clone(), keys_in_state(&import.payload))
            .await
    }

    /// Upload pending local operations. Returns whether the remote rejected
    /// some as conflicting, which calls for another download.
    async fn upload(&self, outcome: &mut SyncCycleOutcome) -> Result<bool> {
        let mut ops: Vec<Operation> = self
            .log
            .get_unsynced()
            .await
            .into_iter()
            .map(|e| e.op)
            .collect();
        if ops.is_empty() {
            return Ok(false);
        }
        let client_id = self.config.client_id.as_str();

        // a local full-state operation covers everything recorded before it
        if let Some(pos) = ops.iter().rposition(Operation::is_full_state) {
            let covered: Vec<OperationId> = ops.drain(..pos).map(|op| op.id).collect();
            if !covered.is_empty() {
                debug!(count = covered.len(), "pending operations covered by local import");
                self.log.mark_synced(&covered).await?;
            }
        }

        let last_known = self.log.last_server_seq().await;
        let result = self.provider.upload_ops(&ops, client_id, last_known).await?;
        outcome.uploaded += result.uploaded_count;
        outcome.rejected += result.rejected_count;

        // piggybacked ops meet our uploads while those still count as pending
        if !result.piggybacked_ops.is_empty() {
            outcome.piggybacked += result.piggybacked_ops.len();
            self.process_remote_ops(result.piggybacked_ops, outcome)
                .await?;
        }

        let reasons: HashMap<&str, RejectionReason> = result
            .rejected_ops
            .iter()
            .map(|r| (r.op_id.as_str(), r.reason))
            .collect();
        let mut synced = Vec::new();
        let mut refused = Vec::new();
        let mut conflicting = false;
        for op in &ops {
            match reasons.get(op.id.as_str()) {
                None | Some(RejectionReason::Duplicate) => synced.push(op.id.clone()),
                Some(reason) if reason.is_conflict() => conflicting = true,
                Some(_) => refused.push(op.clone()),
            }
        }

        self.log.mark_synced(&synced).await?;
        if !refused.is_empty() {
            warn!(count = refused.len(), "remote refused operations");
            let ids: Vec<OperationId> = refused.iter().map(|op| op.id.clone()).collect();
            self.log.mark_rejected(&ids).await?;
            self.notifier.ops_rejected_by_remote(&refused).await;
        }
        self.log.set_last_server_seq(result.latest_seq).await?;

        Ok(conflicting)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::file_sync::{FileBasedSyncAdapter, MemoryFileProvider};
    use crate::log::ApplicationStatus;
    use crate::notify::NoopNotifier;
    use crate::protocol::{DownloadResult, RejectedOp, UploadResult};
    use crate::state::MemoryStateStore;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;
    use tokio::sync::Mutex;

    type FileEngine = SyncEngine<FileBasedSyncAdapter, MemoryStateStore>;

    fn fast_retry() -> RetryConfig {
        RetryConfig::new(3).with_initial_delay(Duration::ZERO)
    }

    fn client(id: &str, files: &MemoryFileProvider) -> FileEngine {
        let config = EngineConfig::new(id).with_retry(fast_retry());
        let store = Arc::new(MemoryStateStore::new());
        let provider = FileBasedSyncAdapter::new(Arc::new(files.clone()), store.clone(), &config);
        SyncEngine::new(config, Arc::new(OperationLog::new()), store, Arc::new(provider))
        .with_notifier(Arc::new(NoopNotifier))
    }

    fn task(op_type: OpType, id: &str, payload: serde_json::Value, ts: i64) -> Operation {
        Operation::new("", op_type, EntityType::Task, Some(id.into()), payload, VectorClock::new(), ts)
    }

    /// Change local state the way the application would, then record.
    async fn act<P: OperationSyncProvider + ?Sized>(
        engine: &SyncEngine<P, MemoryStateStore>,
        op: Operation,
    ) -> Operation {
        let op = engine.record_local_op(op).await.unwrap();
        let result = OperationApplier::new(engine.store().as_ref())
            .apply(std::slice::from_ref(&op))
            .await;
        assert!(result.is_complete());
        op
    }

    async fn title<P: OperationSyncProvider + ?Sized>(
        engine: &SyncEngine<P, MemoryStateStore>,
        id: &str,
    ) -> Option<String> {
        engine
            .store()
            .read_entity_state(EntityType::Task, id)
            .await
            .unwrap()
            .and_then(|s| s["title"].as_str().map(str::to_string))
    }

    #[tokio::test]
    async fn record_local_op_stamps_client_and_clock() {
        let files = MemoryFileProvider::new();
        let a = client("a", &files);

        let first = a
            .record_local_op(task(OpType::Create, "t1", json!({"title": "x"}), 1))
            .await
            .unwrap();
        let second = a
            .record_local_op(task(OpType::Update, "t1", json!({"title": "y"}), 2))
            .await
            .unwrap();

        assert_eq!(first.client_id, "a");
        assert_eq!(first.vector_clock.get("a"), 1);
        assert_eq!(second.vector_clock.get("a"), 2);
        assert_eq!(a.log().get_unsynced().await.len(), 2);
    }

    #[tokio::test]
    async fn concurrent_cycle_fails_fast() {
        let files = MemoryFileProvider::new();
        let a = client("a", &files);

        let guard = a.begin().unwrap();
        assert!(a.is_syncing());
        assert!(matches!(a.sync().await, Err(Error::SyncInProgress)));
        assert!(matches!(a.recover().await, Err(Error::SyncInProgress)));
        drop(guard);

        assert!(!a.is_syncing());
        a.sync().await.unwrap();
    }

    #[tokio::test]
    async fn changes_flow_between_clients() {
        let files = MemoryFileProvider::new();
        let a = client("a", &files);
        let b = client("b", &files);

        act(&a, task(OpType::Create, "t1", json!({"title": "hello"}), 1)).await;
        let outcome = a.sync().await.unwrap();
        assert_eq!(outcome.uploaded, 1);
        assert!(a.log().get_unsynced().await.is_empty());

        let outcome = b.sync().await.unwrap();
        assert_eq!(outcome.applied, 1);
        assert_eq!(title(&b, "t1").await.as_deref(), Some("hello"));
        assert_eq!(b.log().get_vector_clock_entry().await.get("a"), 1);

        // nothing new the second time
        let outcome = b.sync().await.unwrap();
        assert_eq!(outcome.applied, 0);
    }

    #[tokio::test]
    async fn later_local_edit_wins_and_converges() {
        let files = MemoryFileProvider::new();
        let a = client("a", &files);
        let b = client("b", &files);

        act(&a, task(OpType::Create, "t1", json!({"title": "orig"}), 1)).await;
        a.sync().await.unwrap();
        b.sync().await.unwrap();

        act(&a, task(OpType::Update, "t1", json!({"title": "from a"}), 100)).await;
        act(&b, task(OpType::Update, "t1", json!({"title": "from b"}), 200)).await;

        a.sync().await.unwrap();
        let outcome = b.sync().await.unwrap();
        assert_eq!(outcome.conflicts_resolved, 1);
        assert_eq!(outcome.local_win_ops_created, 1);
        assert_eq!(title(&b, "t1").await.as_deref(), Some("from b"));

        a.sync().await.unwrap();
        assert_eq!(title(&a, "t1").await.as_deref(), Some("from b"));
    }

    #[tokio::test]
    async fn recover_applies_pending_remote_ops() {
        let files = MemoryFileProvider::new();
        let a = client("a", &files);

        let op = Operation::new(
            "b",
            OpType::Create,
            EntityType::Task,
            Some("t9".into()),
            json!({"title": "stored before crash"}),
            VectorClock::from_entries([("b", 1)]),
            5,
        );
        a.log()
            .append_batch(vec![op], OpSource::Remote, true)
            .await
            .unwrap();
        assert_eq!(a.log().get_pending_remote_ops().await.len(), 1);

        let outcome = a.recover().await.unwrap();
        assert_eq!(outcome.applied, 1);
        assert!(a.log().get_pending_remote_ops().await.is_empty());
        assert_eq!(
            title(&a, "t9").await.as_deref(),
            Some("stored before crash")
        );
        assert_eq!(a.log().get_vector_clock_entry().await.get("b"), 1);
    }

    /// Provider with canned answers.
    #[derive(Default)]
    struct StubProvider {
        migrating_for: AtomicU32,
        /// Served once, then downloads are empty
        download: Mutex<Option<DownloadResult>>,
        rejections: Vec<RejectedOp>,
        uploaded: Mutex<Vec<Operation>>,
    }

    #[async_trait::async_trait]
    impl OperationSyncProvider for StubProvider {
        async fn download_ops(&self, _since_seq: u64) -> Result<DownloadResult> {
            let remaining = self.migrating_for.load(Ordering::SeqCst);
            if remaining > 0 {
                self.migrating_for.store(remaining - 1, Ordering::SeqCst);
                return Err(Error::MigrationInProgress);
            }
            Ok(self.download.lock().await.take().unwrap_or_default())
        }

        async fn upload_ops(
            &self,
            ops: &[Operation],
            _client_id: &str,
            last_known_seq: u64,
        ) -> Result<UploadResult> {
            self.uploaded.lock().await.extend_from_slice(ops);
            Ok(UploadResult {
                uploaded_count: ops.len() - self.rejections.len(),
                rejected_count: self.rejections.len(),
                rejected_ops: self.rejections.clone(),
                latest_seq: last_known_seq + 1,
                ..Default::default()
            })
        }

        async fn upload_snapshot(
            &self,
            _state: serde_json::Value,
            _vector_clock: &VectorClock,
            _client_id: &str,
            _reason: SnapshotReason,
        ) -> Result<u64> {
            Ok(1)
        }
    }

    fn stub_engine(provider: StubProvider) -> SyncEngine<StubProvider, MemoryStateStore> {
        SyncEngine::new(
            EngineConfig::new("a").with_retry(fast_retry()),
            Arc::new(OperationLog::new()),
            Arc::new(MemoryStateStore::new()),
            Arc::new(provider),
        )
        .with_notifier(Arc::new(NoopNotifier))
    }

    #[tokio::test]
    async fn retries_while_remote_migrates() {
        let engine = stub_engine(StubProvider {
            migrating_for: AtomicU32::new(2),
            ..Default::default()
        });
        assert!(engine.sync_with_retry().await.is_ok());

        let engine = stub_engine(StubProvider {
            migrating_for: AtomicU32::new(5),
            ..Default::default()
        });
        assert!(matches!(
            engine.sync_with_retry().await,
            Err(Error::MigrationInProgress)
        ));
    }

    #[tokio::test]
    async fn upload_rejections_are_classified() {
        let engine = stub_engine(StubProvider {
            rejections: vec![
                RejectedOp {
                    op_id: "dup".into(),
                    reason: RejectionReason::Duplicate,
                    message: None,
                },
                RejectedOp {
                    op_id: "bad".into(),
                    reason: RejectionReason::Validation,
                    message: Some("payload too large".into()),
                },
            ],
            ..Default::default()
        });

        for id in ["ok", "dup", "bad"] {
            engine
                .record_local_op(task(OpType::Create, id, json!({"title": id}), 1).with_id(id))
                .await
                .unwrap();
        }
        let outcome = engine.sync().await.unwrap();
        assert_eq!(outcome.uploaded, 1);
        assert_eq!(outcome.rejected, 2);

        let log = engine.log();
        assert!(log.get_unsynced().await.is_empty());
        assert!(log.get_op_by_id("ok").await.unwrap().synced_at.is_some());
        assert!(log.get_op_by_id("dup").await.unwrap().synced_at.is_some());
        assert!(log.get_op_by_id("bad").await.unwrap().is_rejected());
        assert_eq!(log.last_server_seq().await, 1);
    }

    #[tokio::test]
    async fn local_import_covers_earlier_pending_ops() {
        let engine = stub_engine(StubProvider::default());

        act(&engine, task(OpType::Create, "t1", json!({"title": "x"}), 1)).await;
        let state = engine.store().export_state().await.unwrap();
        engine
            .record_local_op(Operation::new(
                "",
                OpType::BackupImport,
                EntityType::All,
                None,
                state,
                VectorClock::new(),
                2,
            ))
            .await
            .unwrap();

        let outcome = engine.sync().await.unwrap();
        assert_eq!(outcome.uploaded, 1);
        assert!(engine.log().get_unsynced().await.is_empty());

        // the create travels inside the import
        let uploaded = engine.provider.uploaded.lock().await;
        assert_eq!(uploaded.len(), 1);
        assert_eq!(uploaded[0].op_type, OpType::BackupImport);
        assert_eq!(
            engine.log().snapshot_clock().await,
            Some(VectorClock::from_entries([("a", 2)]))
        );
    }

    #[tokio::test]
    async fn explicit_snapshot_marks_pending_synced() {
        let files = MemoryFileProvider::new();
        let a = client("a", &files);
        act(&a, task(OpType::Create, "t1", json!({"title": "x"}), 1)).await;

        let seq = a.upload_snapshot(SnapshotReason::Recovery).await.unwrap();
        assert_eq!(seq, 1);
        assert!(a.log().get_unsynced().await.is_empty());
        assert_eq!(a.log().last_server_seq().await, 1);

        let b = client("b", &files);
        let outcome = b.sync().await.unwrap();
        assert_eq!(outcome.applied, 0);
        assert_eq!(title(&b, "t1").await.as_deref(), Some("x"));
        assert_eq!(b.log().snapshot_clock().await, Some(VectorClock::from_entries([("a", 1)])));
    }

    /// Remembers which operations failed to apply.
    #[derive(Default)]
    struct RecordingNotifier {
        failed: Mutex<Vec<OperationId>>,
    }

    #[async_trait::async_trait]
    impl SyncNotifier for RecordingNotifier {
        async fn apply_failed(&self, op: &Operation, _error: &Error) {
            self.failed.lock().await.push(op.id.clone());
        }
    }

    fn from_b(id: &str, op_type: OpType, entity: &str, payload: serde_json::Value, n: u64) -> Operation {
        Operation::new(
            "b",
            op_type,
            EntityType::Task,
            Some(entity.into()),
            payload,
            VectorClock::from_entries([("b", n)]),
            n as i64,
        )
        .with_id(id)
    }

    fn batch_with_broken_middle() -> DownloadResult {
        DownloadResult {
            ops: vec![
                from_b("b-1", OpType::Create, "t1", json!({"title": "one"}), 1),
                from_b("b-2", OpType::Update, "t2", json!({"title": "renamed"}), 2),
                from_b("b-3", OpType::Create, "t3", json!({"title": "three"}), 3),
            ],
            latest_seq: 3,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn partial_apply_keeps_prefix_and_retries_the_rest() {
        let notifier = Arc::new(RecordingNotifier::default());
        let engine = stub_engine(StubProvider {
            download: Mutex::new(Some(batch_with_broken_middle())),
            ..Default::default()
        })
        .with_notifier(notifier.clone());

        let err = engine.sync().await.unwrap_err();
        assert!(matches!(err, Error::ApplyFailed { ref op_id, .. } if op_id == "b-2"));
        assert_eq!(*notifier.failed.lock().await, vec!["b-2".to_string()]);

        let first = engine.log().get_op_by_id("b-1").await.unwrap();
        assert_eq!(first.application_status, ApplicationStatus::Applied);
        assert_eq!(title(&engine, "t1").await.as_deref(), Some("one"));
        assert!(title(&engine, "t3").await.is_none());

        let mut failed: Vec<String> = engine
            .log()
            .get_failed_remote_ops()
            .await
            .into_iter()
            .map(|e| e.op.id)
            .collect();
        failed.sort();
        assert_eq!(failed, ["b-2", "b-3"]);
        // the whole batch is stored, so the next download starts after it
        assert_eq!(engine.log().last_server_seq().await, 3);

        // still missing: second attempt fails too
        assert!(matches!(engine.recover().await, Err(Error::ApplyFailed { .. })));

        act(&engine, task(OpType::Create, "t2", json!({"title": "two"}), 10)).await;
        let outcome = engine.recover().await.unwrap();
        assert_eq!(outcome.applied, 2);
        assert_eq!(title(&engine, "t2").await.as_deref(), Some("renamed"));
        assert_eq!(title(&engine, "t3").await.as_deref(), Some("three"));
        assert!(engine.log().get_failed_remote_ops().await.is_empty());
    }

    #[tokio::test]
    async fn failed_remote_ops_are_dropped_once_attempts_run_out() {
        let engine = SyncEngine::new(
            EngineConfig::new("a")
                .with_retry(fast_retry())
                .with_max_apply_attempts(2),
            Arc::new(OperationLog::new()),
            Arc::new(MemoryStateStore::new()),
            Arc::new(StubProvider {
                download: Mutex::new(Some(batch_with_broken_middle())),
                ..Default::default()
            }),
        )
        .with_notifier(Arc::new(NoopNotifier));

        assert!(engine.sync().await.is_err());
        assert!(engine.recover().await.is_err());

        assert!(engine.log().get_failed_remote_ops().await.is_empty());
        assert!(engine.log().get_op_by_id("b-3").await.unwrap().is_rejected());
        let outcome = engine.recover().await.unwrap();
        assert_eq!(outcome.applied, 0);
    }

    #[tokio::test]
    async fn local_op_lost_over_snapshot_is_reported_and_not_uploaded() {
        let notifier = Arc::new(RecordingNotifier::default());

        // the remote deleted t1; its snapshot only holds t2
        let remote = MemoryStateStore::new();
        let seeded = OperationApplier::new(&remote)
            .apply(&[from_b("b-1", OpType::Create, "t2", json!({"title": "two"}), 1)])
            .await;
        assert!(seeded.is_complete());

        let engine = stub_engine(StubProvider {
            download: Mutex::new(Some(DownloadResult {
                snapshot_state: Some(remote.export_state().await.unwrap()),
                snapshot_vector_clock: Some(VectorClock::from_entries([("b", 5)])),
                latest_seq: 5,
                ..Default::default()
            })),
            ..Default::default()
        })
        .with_notifier(notifier.clone());

        let existing = OperationApplier::new(engine.store().as_ref())
            .apply(&[from_b("b-0", OpType::Create, "t1", json!({"title": "one"}), 1)])
            .await;
        assert!(existing.is_complete());
        let edit = act(&engine, task(OpType::Update, "t1", json!({"title": "mine"}), 2)).await;

        engine.sync().await.unwrap();

        assert_eq!(*notifier.failed.lock().await, vec![edit.id.clone()]);
        assert!(engine.log().get_op_by_id(&edit.id).await.unwrap().is_rejected());
        assert!(engine.log().get_unsynced().await.is_empty());
        assert!(engine.provider.uploaded.lock().await.is_empty());
        assert!(title(&engine, "t1").await.is_none());
        assert_eq!(title(&engine, "t2").await.as_deref(), Some("two"));
    }
}
