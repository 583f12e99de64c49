//! Conflict detection and last-write-wins resolution.
//!
//! # Algorithm
//!
//! 1. For every entity a remote operation touches, build the local frontier:
//!    the entity's last applied clock merged with all pending local clocks.
//! 2. Compare the frontier with the remote clock to accept, discard or flag
//!    the operation as conflicting.
//! 3. Resolve each conflict. Archiving beats field edits; otherwise the side
//!    with the later timestamp wins and ties go to the remote side.
//! 4. Hand back a [`ResolutionPlan`] saying what to reject, what to apply and
//!    which new operations re-assert winning local state.
//!
//! Conflicts that share a remote operation are resolved together, so a
//! multi-entity remote operation is either applied as a whole or rejected as
//! a whole.

use crate::entity::EntityKey;
use crate::error::Result;
use crate::log::OperationLog;
use crate::operation::{new_operation_id, OpType, Operation};
use crate::state::{merge_fields, StateStore};
use crate::{ClockComparison, OperationId, Timestamp, VectorClock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// What to do with a remote operation for one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RemoteDisposition {
    /// Already known.
    Duplicate,
    /// Local state is causally ahead.
    Superseded,
    /// Apply directly.
    Accept,
    /// Concurrent with pending local work.
    Conflict,
}

/// Classify a remote operation against an entity's local frontier.
pub fn classify_remote(
    frontier: &VectorClock,
    remote: &VectorClock,
    has_pending_local: bool,
) -> RemoteDisposition {
    match (frontier.compare(remote), has_pending_local) {
        (ClockComparison::Equal, _) => RemoteDisposition::Duplicate,
        (ClockComparison::GreaterThan, false) => RemoteDisposition::Superseded,
        // with nothing pending locally there is no local side to conflict with
        (ClockComparison::LessThan | ClockComparison::Concurrent, false) => {
            RemoteDisposition::Accept
        }
        (_, true) => RemoteDisposition::Conflict,
    }
}

/// Pending local and new remote operations touching one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityConflict {
    #[serde(flatten)]
    pub key: EntityKey,
    pub local_ops: Vec<Operation>,
    pub remote_ops: Vec<Operation>,
}

/// Remote operations sorted by what should happen to them.
#[derive(Debug, Clone, Default)]
pub struct Detection {
    pub non_conflicting: Vec<Operation>,
    pub conflicts: Vec<EntityConflict>,
    pub duplicates: Vec<Operation>,
    pub superseded: Vec<Operation>,
}

/// Sort remote operations into accepted, discarded and conflicting.
///
/// `pending` holds the pending local operations by entity, as returned by
/// [`OperationLog::get_unsynced_by_entity`]. Full-state operations are never
/// conflicts here; the import filter deals with them.
pub async fn detect_conflicts(
    log: &OperationLog,
    remote_ops: Vec<Operation>,
    pending: &BTreeMap<EntityKey, Vec<Operation>>,
) -> Detection {
    let mut detection = Detection::default();
    let mut conflicts: BTreeMap<EntityKey, EntityConflict> = BTreeMap::new();

    for op in remote_ops {
        if op.is_full_state() {
            detection.non_conflicting.push(op);
            continue;
        }

        let mut overall = RemoteDisposition::Duplicate;
        let mut conflicting_keys = Vec::new();
        for key in op.entity_keys() {
            let local_ops = pending.get(&key);
            let mut frontier = log.entity_frontier(&key).await;
            for local in local_ops.into_iter().flatten() {
                frontier.merge_in_place(&local.vector_clock);
            }

            let disposition =
                classify_remote(&frontier, &op.vector_clock, local_ops.is_some());
            if disposition == RemoteDisposition::Conflict {
                conflicting_keys.push(key);
            }
            overall = overall.max(disposition);
        }

        match overall {
            RemoteDisposition::Conflict => {
                for key in conflicting_keys {
                    conflicts
                        .entry(key.clone())
                        .or_insert_with(|| EntityConflict {
                            local_ops: pending.get(&key).cloned().unwrap_or_default(),
                            key,
                            remote_ops: Vec::new(),
                        })
                        .remote_ops
                        .push(op.clone());
                }
            }
            RemoteDisposition::Accept => detection.non_conflicting.push(op),
            RemoteDisposition::Superseded => {
                debug!(op_id = %op.id, "remote operation superseded by local state");
                detection.superseded.push(op);
            }
            RemoteDisposition::Duplicate => {
                debug!(op_id = %op.id, "remote operation already known");
                detection.duplicates.push(op);
            }
        }
    }

    detection.conflicts = conflicts.into_values().collect();
    detection
}

/// Which side of a conflict won.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Winner {
    Local,
    Remote,
}

/// Why a side won.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResolutionReason {
    /// Both sides archived; the outcome is the same either way.
    BothArchived,
    LocalArchived,
    RemoteArchived,
    LastWriteWins,
}

fn max_timestamp(ops: &[Operation]) -> Timestamp {
    ops.iter().map(|op| op.timestamp).max().unwrap_or(Timestamp::MIN)
}

/// Decide the winner of a conflict.
///
/// Archiving is stronger intent than editing fields. Otherwise the later
/// timestamp wins; a tie goes to the remote side on every client.
pub fn decide(local_ops: &[Operation], remote_ops: &[Operation]) -> (Winner, ResolutionReason) {
    let local_archives = local_ops.iter().any(Operation::is_archive);
    let remote_archives = remote_ops.iter().any(Operation::is_archive);

    match (local_archives, remote_archives) {
        (true, true) => (Winner::Remote, ResolutionReason::BothArchived),
        (true, false) => (Winner::Local, ResolutionReason::LocalArchived),
        (false, true) => (Winner::Remote, ResolutionReason::RemoteArchived),
        (false, false) => {
            if max_timestamp(local_ops) > max_timestamp(remote_ops) {
                (Winner::Local, ResolutionReason::LastWriteWins)
            } else {
                (Winner::Remote, ResolutionReason::LastWriteWins)
            }
        }
    }
}

/// How one entity's conflict was settled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    #[serde(flatten)]
    pub key: EntityKey,
    pub winner: Winner,
    pub reason: ResolutionReason,
}

/// Everything the orchestrator must do to carry out a set of resolutions.
#[derive(Debug, Clone, Default)]
pub struct ResolutionPlan {
    /// Pending local operations to reject before anything is applied
    pub rejected_local: BTreeSet<OperationId>,
    /// Remote operations that lost; stored as rejected
    pub rejected_remote: Vec<Operation>,
    /// Remote operations that won, possibly re-tagged
    pub remote_to_apply: Vec<Operation>,
    /// New operations re-asserting winning local state
    pub local_win_ops: Vec<Operation>,
    pub resolutions: Vec<Resolution>,
}

/// Conflicts sharing a remote operation, resolved as one.
#[derive(Debug, Default)]
struct ConflictGroup {
    keys: Vec<EntityKey>,
    local_ops: Vec<Operation>,
    remote_ops: Vec<Operation>,
}

impl ConflictGroup {
    fn remote_ids(&self) -> BTreeSet<&str> {
        self.remote_ops.iter().map(|op| op.id.as_str()).collect()
    }

    fn absorb(&mut self, conflict: EntityConflict) {
        self.keys.push(conflict.key);
        self.absorb_ops(conflict.local_ops, conflict.remote_ops);
    }

    fn merge(&mut self, other: ConflictGroup) {
        self.keys.extend(other.keys);
        self.absorb_ops(other.local_ops, other.remote_ops);
    }

    fn absorb_ops(&mut self, local_ops: Vec<Operation>, remote_ops: Vec<Operation>) {
        for op in local_ops {
            if !self.local_ops.iter().any(|o| o.id == op.id) {
                self.local_ops.push(op);
            }
        }
        for op in remote_ops {
            if !self.remote_ops.iter().any(|o| o.id == op.id) {
                self.remote_ops.push(op);
            }
        }
    }
}

fn group_conflicts(conflicts: Vec<EntityConflict>) -> Vec<ConflictGroup> {
    let mut groups: Vec<ConflictGroup> = Vec::new();

    for conflict in conflicts {
        let ids: BTreeSet<&str> = conflict.remote_ops.iter().map(|op| op.id.as_str()).collect();
        let (overlapping, rest): (Vec<_>, Vec<_>) = groups
            .into_iter()
            .partition(|g| !g.remote_ids().is_disjoint(&ids));

        let mut merged = ConflictGroup::default();
        for group in overlapping {
            merged.merge(group);
        }
        merged.absorb(conflict);

        groups = rest;
        groups.push(merged);
    }

    groups
}

/// Turns conflicts into a [`ResolutionPlan`].
pub struct ConflictResolver<'a, S: StateStore + ?Sized> {
    client_id: &'a str,
    log: &'a OperationLog,
    store: &'a S,
}

impl<'a, S: StateStore + ?Sized> ConflictResolver<'a, S> {
    pub fn new(client_id: &'a str, log: &'a OperationLog, store: &'a S) -> Self {
        Self {
            client_id,
            log,
            store,
        }
    }

    /// Resolve every conflict.
    ///
    /// Reads current entity state for local wins and advances the client's
    /// clock for each synthesized operation. Does not touch lifecycle flags.
    pub async fn resolve(
        &self,
        conflicts: Vec<EntityConflict>,
        pending: &BTreeMap<EntityKey, Vec<Operation>>,
    ) -> Result<ResolutionPlan> {
        let mut plan = ResolutionPlan::default();

        for group in group_conflicts(conflicts) {
            let (winner, reason) = decide(&group.local_ops, &group.remote_ops);
            for key in &group.keys {
                info!(entity = %key, ?winner, ?reason, "resolved conflict");
                plan.resolutions.push(Resolution {
                    key: key.clone(),
                    winner,
                    reason,
                });
            }

            match (winner, reason) {
                (Winner::Remote, _) => self.remote_wins(group, pending, &mut plan),
                (Winner::Local, ResolutionReason::LocalArchived) => {
                    self.restamp_local(group, &mut plan).await?
                }
                (Winner::Local, _) => self.local_wins(group, &mut plan).await?,
            }
        }

        Ok(plan)
    }

    fn remote_wins(
        &self,
        group: ConflictGroup,
        pending: &BTreeMap<EntityKey, Vec<Operation>>,
        plan: &mut ResolutionPlan,
    ) {
        plan.rejected_local
            .extend(group.local_ops.iter().map(|op| op.id.clone()));

        for op in group.remote_ops {
            // every pending op on an entity the winner touches is now stale
            for key in op.entity_keys() {
                for stale in pending.get(&key).into_iter().flatten() {
                    plan.rejected_local.insert(stale.id.clone());
                }
            }
            plan.remote_to_apply
                .push(retag_over_local_delete(op, &group.local_ops));
        }
    }

    /// Re-issue the pending local operations with clocks that dominate the
    /// remote side.
    ///
    /// Local state already shows the winning archive, so nothing is read or
    /// applied. The old clocks are concurrent with what the remote stores and
    /// a server would keep refusing them.
    async fn restamp_local(&self, group: ConflictGroup, plan: &mut ResolutionPlan) -> Result<()> {
        let seen: Vec<Operation> = group
            .local_ops
            .iter()
            .chain(group.remote_ops.iter())
            .cloned()
            .collect();
        self.log.merge_remote_op_clocks(&seen, self.client_id).await?;

        let mut local_ops = group.local_ops;
        local_ops.sort_by_key(|op| op.vector_clock.get(&op.client_id));
        for local in local_ops {
            // re-issued already for another group
            if !plan.rejected_local.insert(local.id.clone()) {
                continue;
            }
            let old_id = local.id.clone();
            let mut op = local.with_id(new_operation_id());
            op.vector_clock = self.log.increment_vector_clock(self.client_id).await?;
            debug!(op_id = %op.id, replaces = %old_id, "re-issued winning local operation");
            plan.local_win_ops.push(op);
        }

        plan.rejected_remote.extend(group.remote_ops);
        Ok(())
    }

    async fn local_wins(&self, group: ConflictGroup, plan: &mut ResolutionPlan) -> Result<()> {
        plan.rejected_local
            .extend(group.local_ops.iter().map(|op| op.id.clone()));

        let timestamp = max_timestamp(&group.local_ops);
        let seen: Vec<Operation> = group
            .local_ops
            .iter()
            .chain(group.remote_ops.iter())
            .cloned()
            .collect();
        self.log.merge_remote_op_clocks(&seen, self.client_id).await?;

        for key in &group.keys {
            let state = self
                .store
                .read_entity_state(key.entity_type, &key.entity_id)
                .await?;

            let op_type_and_payload = match state {
                Some(state) => Some((OpType::LwwUpdate, state)),
                None => match find_delete(&group.local_ops, key) {
                    Some(local_delete) => Some((OpType::Delete, local_delete.payload.clone())),
                    None => find_delete(&group.remote_ops, key)
                        .filter(|op| op.payload.is_object())
                        .map(|op| (OpType::LwwUpdate, op.payload.clone())),
                },
            };

            let Some((op_type, payload)) = op_type_and_payload else {
                warn!(entity = %key, "no state to re-assert for winning local side");
                continue;
            };

            let clock = self.log.increment_vector_clock(self.client_id).await?;
            let op = Operation::new(
                self.client_id,
                op_type,
                key.entity_type,
                Some(key.entity_id.clone()),
                payload,
                clock,
                timestamp,
            );
            debug!(op_id = %op.id, entity = %key, "created local-win operation");
            plan.local_win_ops.push(op);
        }

        plan.rejected_remote.extend(group.remote_ops);
        Ok(())
    }
}

fn find_delete<'o>(ops: &'o [Operation], key: &EntityKey) -> Option<&'o Operation> {
    ops.iter()
        .rev()
        .find(|op| op.op_type == OpType::Delete && op.touches(key))
}

/// A remote update beating a local delete must be able to recreate the entity.
fn retag_over_local_delete(mut op: Operation, local_ops: &[Operation]) -> Operation {
    if op.op_type != OpType::Update || !op.entity_changes.is_empty() {
        return op;
    }
    let Some(key) = op.entity_keys().into_iter().next() else {
        return op;
    };
    if let Some(local_delete) = find_delete(local_ops, &key) {
        debug!(op_id = %op.id, entity = %key, "remote update recreates locally deleted entity");
        op.payload = merge_fields(&local_delete.payload, &op.payload);
        op.op_type = OpType::LwwUpdate;
    }
    op
}
