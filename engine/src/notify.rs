//! User-facing notification boundary.
//!
//! The orchestrator reports outcomes here and asks for a decision in the one
//! case it refuses to guess: a remote import that would discard local work.

use crate::conflict::Resolution;
use crate::error::Error;
use crate::operation::Operation;
use async_trait::async_trait;
use tracing::{info, warn};

/// Answer to "a remote import would drop your unsynced changes".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportConflictChoice {
    /// Keep local state and publish it as the new import.
    KeepLocal,
    /// Take the remote import and drop the local changes.
    AcceptRemote,
}

/// Receives sync outcomes. Every method has a no-op default.
#[async_trait]
pub trait SyncNotifier: Send + Sync {
    async fn conflicts_resolved(&self, _resolutions: &[Resolution]) {}

    async fn ops_invalidated_by_import(&self, _import: &Operation, _dropped: &[Operation]) {}

    /// `lost` are the pending local operations the import would discard.
    async fn choose_import_resolution(
        &self,
        _import: &Operation,
        _lost: &[Operation],
    ) -> ImportConflictChoice {
        ImportConflictChoice::AcceptRemote
    }

    /// Applying an operation failed: a remote one, or a local one replayed
    /// over a remote snapshot. The user should be offered a reload.
    async fn apply_failed(&self, _op: &Operation, _error: &Error) {}

    /// The remote refused local operations for good.
    async fn ops_rejected_by_remote(&self, _ops: &[Operation]) {}

    async fn sync_error(&self, _error: &Error) {}
}

/// Notifier that ignores everything and accepts remote imports.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

impl SyncNotifier for NoopNotifier {}

/// Notifier that logs every outcome.
#[derive(Debug, Clone, Copy)]
pub struct TracingNotifier {
    import_choice: ImportConflictChoice,
}

impl TracingNotifier {
    pub fn new(import_choice: ImportConflictChoice) -> Self {
        Self { import_choice }
    }
}

impl Default for TracingNotifier {
    fn default() -> Self {
        Self::new(ImportConflictChoice::AcceptRemote)
    }
}

#[async_trait]
impl SyncNotifier for TracingNotifier {
    async fn conflicts_resolved(&self, resolutions: &[Resolution]) {
        for r in resolutions {
            info!(entity = %r.key, winner = ?r.winner, reason = ?r.reason, "conflict resolved");
        }
    }

    async fn ops_invalidated_by_import(&self, import: &Operation, dropped: &[Operation]) {
        warn!(import_id = %import.id, count = dropped.len(), "operations discarded by import");
    }

    async fn choose_import_resolution(
        &self,
        import: &Operation,
        lost: &[Operation],
    ) -> ImportConflictChoice {
        warn!(
            import_id = %import.id,
            lost = lost.len(),
            choice = ?self.import_choice,
            "remote import conflicts with local changes"
        );
        self.import_choice
    }

    async fn apply_failed(&self, op: &Operation, error: &Error) {
        warn!(op_id = %op.id, %error, remediation = ?error.remediation(), "apply failed");
    }

    async fn ops_rejected_by_remote(&self, ops: &[Operation]) {
        for op in ops {
            warn!(op_id = %op.id, "operation rejected by remote");
        }
    }

    async fn sync_error(&self, error: &Error) {
        warn!(%error, remediation = ?error.remediation(), "sync failed");
    }
}
