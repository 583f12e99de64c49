//! Operation log - the append-only, sequence-numbered record of every
//! operation this client knows about.
//!
//! The log exclusively owns per-operation lifecycle flags (applied, rejected,
//! failed, synced) and the client's clock bookkeeping. When persistence is
//! configured every mutating call writes the new state before it returns.
//! Appends are all or nothing: a failed write removes the appended entries
//! again. Status and clock updates stay in memory when their write fails;
//! the error is returned and the next successful write persists them.

use crate::clock::MAX_VECTOR_CLOCK_SIZE;
use crate::entity::EntityKey;
use crate::error::Result;
use crate::operation::{now, Operation};
use crate::snapshot::{EntityFrontier, LogPersistence, LogSnapshot};
use crate::{ClientId, Error, OperationId, Seq, Timestamp, VectorClock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Where an operation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OpSource {
    Local,
    Remote,
}

/// Whether an operation's effect has reached the state store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ApplicationStatus {
    /// Durably stored, not yet applied.
    Pending,
    Applied,
    /// Application failed; retried until the budget runs out.
    Failed,
}

/// One operation in the log, with its lifecycle flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub seq: Seq,
    pub op: Operation,
    pub source: OpSource,
    pub application_status: ApplicationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejected_at: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced_at: Option<Timestamp>,
    #[serde(default)]
    pub retry_count: u32,
    pub appended_at: Timestamp,
}

impl LogEntry {
    pub fn is_rejected(&self) -> bool {
        self.rejected_at.is_some()
    }

    /// Local, not rejected and not yet uploaded.
    pub fn is_unsynced(&self) -> bool {
        self.source == OpSource::Local && self.rejected_at.is_none() && self.synced_at.is_none()
    }
}

/// Result of [`OperationLog::append_batch_skip_duplicates`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppendOutcome {
    pub written_ops: Vec<Operation>,
    pub skipped_count: usize,
    pub seqs: Vec<Seq>,
}

/// Log limits.
#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    /// Maximum number of entries. `None` means unbounded.
    pub capacity: Option<usize>,
}

#[derive(Debug, Default)]
struct LogState {
    entries: BTreeMap<Seq, LogEntry>,
    by_id: HashMap<OperationId, Seq>,
    next_seq: Seq,
    vector_clock: VectorClock,
    protected_client_ids: Vec<ClientId>,
    frontiers: BTreeMap<EntityKey, VectorClock>,
    snapshot_clock: Option<VectorClock>,
    snapshot_entity_keys: BTreeSet<EntityKey>,
    last_server_seq: u64,
}

impl LogState {
    fn from_snapshot(snapshot: LogSnapshot) -> Self {
        let mut state = LogState {
            next_seq: snapshot.next_seq.max(1),
            vector_clock: snapshot.vector_clock,
            protected_client_ids: snapshot.protected_client_ids,
            frontiers: snapshot
                .frontiers
                .into_iter()
                .map(|f| (f.key, f.clock))
                .collect(),
            snapshot_clock: snapshot.snapshot_clock,
            snapshot_entity_keys: snapshot.snapshot_entity_keys.into_iter().collect(),
            last_server_seq: snapshot.last_server_seq,
            ..Default::default()
        };
        for entry in snapshot.entries {
            state.by_id.insert(entry.op.id.clone(), entry.seq);
            state.next_seq = state.next_seq.max(entry.seq + 1);
            state.entries.insert(entry.seq, entry);
        }
        state
    }

    fn to_snapshot(&self) -> LogSnapshot {
        LogSnapshot {
            next_seq: self.next_seq,
            entries: self.entries.values().cloned().collect(),
            vector_clock: self.vector_clock.clone(),
            protected_client_ids: self.protected_client_ids.clone(),
            frontiers: self
                .frontiers
                .iter()
                .map(|(key, clock)| EntityFrontier {
                    key: key.clone(),
                    clock: clock.clone(),
                })
                .collect(),
            snapshot_clock: self.snapshot_clock.clone(),
            snapshot_entity_keys: self.snapshot_entity_keys.iter().cloned().collect(),
            last_server_seq: self.last_server_seq,
            ..LogSnapshot::new()
        }
    }

    fn entry_by_id(&self, id: &str) -> Option<&LogEntry> {
        self.by_id.get(id).and_then(|seq| self.entries.get(seq))
    }

    fn entry_by_id_mut(&mut self, id: &str) -> Option<&mut LogEntry> {
        let seq = *self.by_id.get(id)?;
        self.entries.get_mut(&seq)
    }

    fn insert(&mut self, op: Operation, source: OpSource, pending_apply: bool, at: Timestamp) -> Seq {
        let seq = self.next_seq;
        self.next_seq += 1;

        if source == OpSource::Local {
            self.advance_frontiers(&op);
        }

        self.by_id.insert(op.id.clone(), seq);
        self.entries.insert(
            seq,
            LogEntry {
                seq,
                op,
                source,
                application_status: if pending_apply {
                    ApplicationStatus::Pending
                } else {
                    ApplicationStatus::Applied
                },
                rejected_at: None,
                synced_at: (source == OpSource::Remote).then_some(at),
                retry_count: 0,
                appended_at: at,
            },
        );
        seq
    }

    fn remove(&mut self, seq: Seq) {
        if let Some(entry) = self.entries.remove(&seq) {
            self.by_id.remove(&entry.op.id);
        }
    }

    fn advance_frontiers(&mut self, op: &Operation) {
        if op.is_full_state() {
            // a full state resets every entity to the import's position
            self.frontiers.clear();
            self.snapshot_clock = Some(op.vector_clock.clone());
            return;
        }
        for key in op.entity_keys() {
            self.frontiers
                .entry(key)
                .or_default()
                .merge_in_place(&op.vector_clock);
        }
    }
}

/// The operation log store.
#[derive(Debug)]
pub struct OperationLog {
    state: Mutex<LogState>,
    persistence: Option<LogPersistence>,
    config: LogConfig,
}

impl Default for OperationLog {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationLog {
    /// Create an in-memory log.
    pub fn new() -> Self {
        Self::with_config(LogConfig::default())
    }

    pub fn with_config(config: LogConfig) -> Self {
        Self {
            state: Mutex::new(LogState {
                next_seq: 1,
                ..Default::default()
            }),
            persistence: None,
            config,
        }
    }

    /// Open a persisted log, loading what was saved before.
    pub async fn open(persistence: LogPersistence, config: LogConfig) -> Result<Self> {
        let state = match persistence.load().await? {
            Some(snapshot) => {
                debug!(
                    path = %persistence.path().display(),
                    entries = snapshot.entries.len(),
                    "loaded operation log"
                );
                LogState::from_snapshot(snapshot)
            }
            None => LogState {
                next_seq: 1,
                ..Default::default()
            },
        };

        Ok(Self {
            state: Mutex::new(state),
            persistence: Some(persistence),
            config,
        })
    }

    async fn flush(&self, state: &LogState) -> Result<()> {
        match &self.persistence {
            Some(persistence) => persistence.save(&state.to_snapshot()).await,
            None => Ok(()),
        }
    }

    fn check_capacity(&self, state: &LogState, additional: usize) -> Result<()> {
        match self.config.capacity {
            Some(capacity) if state.entries.len() + additional > capacity => {
                warn!(capacity, entries = state.entries.len(), "operation log is full");
                Err(Error::StorageQuotaExceeded(format!(
                    "operation log holds {} of {} entries, cannot add {}",
                    state.entries.len(),
                    capacity,
                    additional
                )))
            }
            _ => Ok(()),
        }
    }

    /// Snapshot the log as it is right now.
    pub async fn snapshot(&self) -> LogSnapshot {
        self.state.lock().await.to_snapshot()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.entries.is_empty()
    }

    /// Append one operation.
    pub async fn append(&self, op: Operation, source: OpSource) -> Result<Seq> {
        let id = op.id.clone();
        let seqs = self.append_batch(vec![op], source, false).await?;
        seqs.first()
            .copied()
            .ok_or_else(|| Error::InvalidOperation {
                op_id: id,
                reason: "append produced no sequence number".into(),
            })
    }

    /// Append a batch, all or nothing.
    ///
    /// With `pending_apply` the entries are stored as awaiting application;
    /// they become applied only through [`OperationLog::mark_applied`].
    pub async fn append_batch(
        &self,
        ops: Vec<Operation>,
        source: OpSource,
        pending_apply: bool,
    ) -> Result<Vec<Seq>> {
        let mut state = self.state.lock().await;

        let mut batch_ids = BTreeSet::new();
        for op in &ops {
            if state.by_id.contains_key(&op.id) || !batch_ids.insert(op.id.as_str()) {
                return Err(Error::DuplicateOperation(op.id.clone()));
            }
        }
        self.check_capacity(&state, ops.len())?;

        let next_seq = state.next_seq;
        let frontiers = state.frontiers.clone();
        let snapshot_clock = state.snapshot_clock.clone();
        let at = now();
        let seqs: Vec<Seq> = ops
            .into_iter()
            .map(|op| state.insert(op, source, pending_apply, at))
            .collect();

        if let Err(e) = self.flush(&state).await {
            for seq in &seqs {
                state.remove(*seq);
            }
            state.next_seq = next_seq;
            state.frontiers = frontiers;
            state.snapshot_clock = snapshot_clock;
            return Err(e);
        }

        debug!(count = seqs.len(), ?source, "appended operations");
        Ok(seqs)
    }

    /// Append a batch, skipping operations whose id is already present.
    pub async fn append_batch_skip_duplicates(
        &self,
        ops: Vec<Operation>,
        source: OpSource,
        pending_apply: bool,
    ) -> Result<AppendOutcome> {
        let total = ops.len();
        let new_ops = self.filter_new_ops(ops).await;
        let skipped_count = total - new_ops.len();

        let seqs = match self
            .append_batch(new_ops.clone(), source, pending_apply)
            .await
        {
            Ok(seqs) => seqs,
            Err(Error::DuplicateOperation(id)) => {
                // raced with a concurrent insert; filter once more and retry
                debug!(op_id = %id, "duplicate during batch append, retrying");
                let retry_ops = self.filter_new_ops(new_ops).await;
                let skipped = total - retry_ops.len();
                let seqs = self
                    .append_batch(retry_ops.clone(), source, pending_apply)
                    .await?;
                return Ok(AppendOutcome {
                    written_ops: retry_ops,
                    skipped_count: skipped,
                    seqs,
                });
            }
            Err(e) => return Err(e),
        };

        Ok(AppendOutcome {
            written_ops: new_ops,
            skipped_count,
            seqs,
        })
    }

    /// Drop operations that are already in the log, and repeats in `ops`.
    pub async fn filter_new_ops(&self, ops: Vec<Operation>) -> Vec<Operation> {
        let state = self.state.lock().await;
        let mut seen = BTreeSet::new();
        ops.into_iter()
            .filter(|op| !state.by_id.contains_key(&op.id) && seen.insert(op.id.clone()))
            .collect()
    }

    /// Mark entries as applied and fold remote ones into entity frontiers.
    pub async fn mark_applied(&self, seqs: &[Seq]) -> Result<()> {
        let mut state = self.state.lock().await;
        for seq in seqs {
            let Some(entry) = state.entries.get_mut(seq) else {
                continue;
            };
            entry.application_status = ApplicationStatus::Applied;
            let remote_op = (entry.source == OpSource::Remote).then(|| entry.op.clone());
            if let Some(op) = remote_op {
                state.advance_frontiers(&op);
            }
        }
        self.flush(&state).await
    }

    /// Mark operations as rejected. Unknown ids are ignored.
    pub async fn mark_rejected(&self, ids: &[OperationId]) -> Result<()> {
        let mut state = self.state.lock().await;
        let at = now();
        for id in ids {
            if let Some(entry) = state.entry_by_id_mut(id) {
                entry.rejected_at.get_or_insert(at);
            }
        }
        debug!(count = ids.len(), "marked operations rejected");
        self.flush(&state).await
    }

    /// Record a failed application attempt.
    ///
    /// Entries reaching `max_attempts` are rejected for good.
    pub async fn mark_failed(&self, ids: &[OperationId], max_attempts: u32) -> Result<()> {
        let mut state = self.state.lock().await;
        let at = now();
        for id in ids {
            if let Some(entry) = state.entry_by_id_mut(id) {
                entry.application_status = ApplicationStatus::Failed;
                entry.retry_count += 1;
                if entry.retry_count >= max_attempts {
                    warn!(op_id = %id, attempts = entry.retry_count, "giving up on operation");
                    entry.rejected_at.get_or_insert(at);
                }
            }
        }
        self.flush(&state).await
    }

    /// Mark local operations as uploaded.
    pub async fn mark_synced(&self, ids: &[OperationId]) -> Result<()> {
        let mut state = self.state.lock().await;
        let at = now();
        for id in ids {
            if let Some(entry) = state.entry_by_id_mut(id) {
                entry.synced_at.get_or_insert(at);
            }
        }
        self.flush(&state).await
    }

    /// Local operations waiting for upload, in sequence order.
    pub async fn get_unsynced(&self) -> Vec<LogEntry> {
        let state = self.state.lock().await;
        state
            .entries
            .values()
            .filter(|e| e.is_unsynced())
            .cloned()
            .collect()
    }

    /// Pending local operations grouped by the entities they touch.
    pub async fn get_unsynced_by_entity(&self) -> BTreeMap<EntityKey, Vec<Operation>> {
        let state = self.state.lock().await;
        let mut grouped: BTreeMap<EntityKey, Vec<Operation>> = BTreeMap::new();
        for entry in state.entries.values().filter(|e| e.is_unsynced()) {
            for key in entry.op.entity_keys() {
                grouped.entry(key).or_default().push(entry.op.clone());
            }
        }
        grouped
    }

    /// Remote operations stored but never applied (e.g. after a crash).
    pub async fn get_pending_remote_ops(&self) -> Vec<LogEntry> {
        let state = self.state.lock().await;
        state
            .entries
            .values()
            .filter(|e| {
                e.source == OpSource::Remote
                    && !e.is_rejected()
                    && e.application_status == ApplicationStatus::Pending
            })
            .cloned()
            .collect()
    }

    /// Remote operations that failed to apply and still have retries left.
    pub async fn get_failed_remote_ops(&self) -> Vec<LogEntry> {
        let state = self.state.lock().await;
        state
            .entries
            .values()
            .filter(|e| {
                e.source == OpSource::Remote
                    && !e.is_rejected()
                    && e.application_status == ApplicationStatus::Failed
            })
            .cloned()
            .collect()
    }

    pub async fn has_op(&self, id: &str) -> bool {
        self.state.lock().await.by_id.contains_key(id)
    }

    pub async fn get_op_by_id(&self, id: &str) -> Option<LogEntry> {
        self.state.lock().await.entry_by_id(id).cloned()
    }

    /// Most recent full-state operation that was not rejected.
    pub async fn get_latest_full_state_op(&self) -> Option<Operation> {
        let state = self.state.lock().await;
        state
            .entries
            .values()
            .rev()
            .find(|e| e.op.is_full_state() && !e.is_rejected())
            .map(|e| e.op.clone())
    }

    pub async fn get_vector_clock_entry(&self) -> VectorClock {
        self.state.lock().await.vector_clock.clone()
    }

    pub async fn set_vector_clock(&self, clock: VectorClock) -> Result<()> {
        let mut state = self.state.lock().await;
        state.vector_clock = clock;
        self.flush(&state).await
    }

    pub async fn get_protected_client_ids(&self) -> Vec<ClientId> {
        self.state.lock().await.protected_client_ids.clone()
    }

    /// Store the ids that must survive pruning, capped below the clock size.
    pub async fn set_protected_client_ids(&self, mut ids: Vec<ClientId>) -> Result<()> {
        ids.truncate(MAX_VECTOR_CLOCK_SIZE - 1);
        let mut state = self.state.lock().await;
        state.protected_client_ids = ids;
        self.flush(&state).await
    }

    /// Advance this client's clock past every applied remote operation.
    pub async fn merge_remote_op_clocks(
        &self,
        ops: &[Operation],
        client_id: &str,
    ) -> Result<VectorClock> {
        let mut state = self.state.lock().await;
        let mut merged = state.vector_clock.clone();
        for op in ops {
            merged.merge_in_place(&op.vector_clock);
        }
        state.vector_clock = merged.limit_size(client_id, &state.protected_client_ids);
        self.flush(&state).await?;
        Ok(state.vector_clock.clone())
    }

    /// Increment this client's counter and return the pruned clock.
    pub async fn increment_vector_clock(&self, client_id: &str) -> Result<VectorClock> {
        let mut state = self.state.lock().await;
        let next = state
            .vector_clock
            .increment(client_id)
            .limit_size(client_id, &state.protected_client_ids);
        state.vector_clock = next.clone();
        self.flush(&state).await?;
        Ok(next)
    }

    /// Causal position of an entity as far as applied operations go.
    ///
    /// Falls back to the full-state clock when the entity existed in the last
    /// hydrated or imported state, and to an empty clock otherwise.
    pub async fn entity_frontier(&self, key: &EntityKey) -> VectorClock {
        let state = self.state.lock().await;
        if let Some(clock) = state.frontiers.get(key) {
            return clock.clone();
        }
        match &state.snapshot_clock {
            Some(clock) if state.snapshot_entity_keys.contains(key) => clock.clone(),
            _ => VectorClock::new(),
        }
    }

    /// Record the clock and entity set of a hydrated or imported full state.
    pub async fn set_snapshot(
        &self,
        clock: VectorClock,
        keys: impl IntoIterator<Item = EntityKey>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        state.frontiers.clear();
        state.snapshot_clock = Some(clock);
        state.snapshot_entity_keys = keys.into_iter().collect();
        self.flush(&state).await
    }

    /// Clock of the last hydrated or imported full state.
    pub async fn snapshot_clock(&self) -> Option<VectorClock> {
        self.state.lock().await.snapshot_clock.clone()
    }

    pub async fn last_server_seq(&self) -> u64 {
        self.state.lock().await.last_server_seq
    }

    pub async fn set_last_server_seq(&self, seq: u64) -> Result<()> {
        let mut state = self.state.lock().await;
        state.last_server_seq = seq;
        self.flush(&state).await
    }

    /// Remove old entries that no longer matter for sync.
    ///
    /// An entry goes once it is older than `retention` and either rejected or
    /// both applied and synced. The latest full-state operation always stays.
    /// Returns how many entries were removed.
    pub async fn compact(&self, now: Timestamp, retention: Duration) -> Result<usize> {
        let cutoff = now.saturating_sub(i64::try_from(retention.as_millis()).unwrap_or(i64::MAX));
        let mut state = self.state.lock().await;

        let keep_full_state = state
            .entries
            .values()
            .rev()
            .find(|e| e.op.is_full_state() && !e.is_rejected())
            .map(|e| e.seq);

        let removable: Vec<Seq> = state
            .entries
            .values()
            .filter(|e| e.appended_at < cutoff && Some(e.seq) != keep_full_state)
            .filter(|e| {
                e.is_rejected()
                    || (e.application_status == ApplicationStatus::Applied
                        && e.synced_at.is_some())
            })
            .map(|e| e.seq)
            .collect();

        if removable.is_empty() {
            return Ok(0);
        }
        for seq in &removable {
            state.remove(*seq);
        }
        self.flush(&state).await?;

        debug!(removed = removable.len(), "compacted operation log");
        Ok(removable.len())
    }
}
