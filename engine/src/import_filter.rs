//! Clean-slate import filtering.
//!
//! A `SyncImport` or `BackupImport` restores the entire state to a point in
//! time. Every client must end up with exactly that state plus whatever was
//! done with knowledge of it, so operations created without knowledge of the
//! import are dropped. The decision is causal (vector clocks), never by wall
//! clock, because device clocks drift.

use crate::log::OperationLog;
use crate::operation::Operation;
use crate::{ClockComparison, VectorClock};
use tracing::{debug, info};

/// Outcome of filtering a batch against the latest import.
#[derive(Debug, Clone, Default)]
pub struct ImportFilterResult {
    /// Operations to keep, in input order
    pub valid_ops: Vec<Operation>,
    /// Operations made obsolete by the import
    pub invalidated_ops: Vec<Operation>,
    /// The import used for filtering, if any
    pub import: Option<Operation>,
    /// Whether that import arrived in this batch
    pub import_in_batch: bool,
}

/// Keep an operation iff it is causally aware of, or equal to, the import.
pub fn is_aware_of_import(op_clock: &VectorClock, import_clock: &VectorClock) -> bool {
    matches!(
        op_clock.compare(import_clock),
        ClockComparison::GreaterThan | ClockComparison::Equal
    )
}

/// Filter `ops` against the newest full-state operation known.
///
/// The newest full-state operation is taken from the batch or, failing that,
/// `known_import` (usually the log's latest). When both exist the later one
/// by `(timestamp, id)` is used.
pub fn filter_with_import(
    ops: Vec<Operation>,
    known_import: Option<Operation>,
) -> ImportFilterResult {
    let batch_import = ops
        .iter()
        .filter(|op| op.is_full_state())
        .max_by(|a, b| a.cmp_by_time(b))
        .cloned();

    let (import, import_in_batch) = match (batch_import, known_import) {
        (Some(batch), Some(known)) if known.cmp_by_time(&batch).is_gt() => (Some(known), false),
        (Some(batch), _) => (Some(batch), true),
        (None, known) => (known, false),
    };

    let Some(import) = import else {
        return ImportFilterResult {
            valid_ops: ops,
            ..Default::default()
        };
    };

    let mut result = ImportFilterResult {
        import: Some(import.clone()),
        import_in_batch,
        ..Default::default()
    };

    for op in ops {
        if op.id == import.id || is_aware_of_import(&op.vector_clock, &import.vector_clock) {
            result.valid_ops.push(op);
        } else {
            debug!(op_id = %op.id, import_id = %import.id, "operation predates import");
            result.invalidated_ops.push(op);
        }
    }

    if !result.invalidated_ops.is_empty() {
        info!(
            import_id = %import.id,
            dropped = result.invalidated_ops.len(),
            "dropped operations made obsolete by import"
        );
    }
    result
}

/// Filter `ops` against the newest import in the batch or the log.
pub async fn filter_ops_invalidated_by_import(
    log: &OperationLog,
    ops: Vec<Operation>,
) -> ImportFilterResult {
    let known = log.get_latest_full_state_op().await;
    filter_with_import(ops, known)
}

/// Pending local operations an incoming import would throw away.
pub fn local_ops_lost_to_import<'a>(
    import: &Operation,
    local_ops: impl IntoIterator<Item = &'a Operation>,
) -> Vec<Operation> {
    local_ops
        .into_iter()
        .filter(|op| op.id != import.id && !is_aware_of_import(&op.vector_clock, &import.vector_clock))
        .cloned()
        .collect()
}
