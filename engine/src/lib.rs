//! # Tandem Engine
//!
//! A causal operation-log sync engine for local-first applications.
//!
//! Clients change a shared application state offline and exchange the
//! operations they performed. The engine decides, for every operation that
//! arrives, whether it is new, already known, obsolete or conflicting, and
//! settles conflicts the same way on every client without a coordinating
//! server.
//!
//! ## Design Principles
//!
//! - **Causal, not chronological**: ordering decisions use vector clocks;
//!   wall-clock time only breaks ties between truly concurrent edits
//! - **State stays outside**: the engine computes change sets and hands them
//!   to a [`StateStore`]; it never owns application state
//! - **Ordering over transactions**: losers are recorded before anything is
//!   applied, so a crash mid-cycle resumes into a consistent log
//! - **Closed entity kinds**: per-kind behaviour matches on [`EntityType`]
//!
//! ## Core Concepts
//!
//! ### Vector clocks
//!
//! [`VectorClock`] maps client ids to counters. Clocks are pruned to
//! [`clock::MAX_VECTOR_CLOCK_SIZE`] entries; comparisons between two pruned
//! clocks never claim dominance over history that may have been evicted.
//!
//! ### Operations and the log
//!
//! An [`Operation`] is one user action. The [`OperationLog`] stores every
//! operation this client knows about together with its lifecycle (applied,
//! rejected, failed, synced) and the client's own clock.
//!
//! ### Conflicts
//!
//! [`conflict::detect_conflicts`] compares each remote operation against the
//! local frontier of every entity it touches. [`ConflictResolver`] settles
//! conflicts: archiving beats editing, otherwise last write wins and ties go
//! to the remote side.
//!
//! ### Clean-slate imports
//!
//! A `SyncImport` or `BackupImport` replaces the whole state. Operations not
//! causally aware of the latest import are dropped
//! ([`import_filter::filter_with_import`]).
//!
//! ### Transport
//!
//! [`OperationSyncProvider`] is the remote side. [`FileBasedSyncAdapter`]
//! implements it on whole-file storage with optimistic concurrency;
//! the protocol types in [`protocol`] describe the server API.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use tandem_engine::{
//!     EngineConfig, EntityType, FileBasedSyncAdapter, MemoryFileProvider,
//!     MemoryStateStore, OpType, Operation, OperationLog, SyncEngine, VectorClock,
//! };
//! use serde_json::json;
//!
//! # tokio_test_runtime(async {
//! let files = MemoryFileProvider::new();
//! let config = EngineConfig::new("laptop");
//! let store = Arc::new(MemoryStateStore::new());
//! // the adapter snapshots the same store the engine applies to
//! let provider = FileBasedSyncAdapter::new(Arc::new(files.clone()), store.clone(), &config);
//! let engine = SyncEngine::new(config, Arc::new(OperationLog::new()), store, Arc::new(provider));
//!
//! let op = Operation::new(
//!     "laptop",
//!     OpType::Create,
//!     EntityType::Task,
//!     Some("t1".into()),
//!     json!({"title": "Write docs"}),
//!     VectorClock::new(),
//!     1706745600000,
//! );
//! engine.record_local_op(op).await.unwrap();
//!
//! let outcome = engine.sync().await.unwrap();
//! assert_eq!(outcome.uploaded, 1);
//! # });
//! # fn tokio_test_runtime<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread()
//! #         .enable_all()
//! #         .build()
//! #         .unwrap()
//! #         .block_on(f)
//! # }
//! ```

pub mod applier;
pub mod clock;
pub mod config;
pub mod conflict;
pub mod entity;
pub mod envelope;
pub mod error;
pub mod file_sync;
pub mod import_filter;
pub mod log;
pub mod notify;
pub mod operation;
pub mod protocol;
pub mod snapshot;
pub mod state;
pub mod sync;

// Re-export main types at crate root
pub use applier::{ApplyResult, OperationApplier};
pub use clock::{ClockComparison, VectorClock};
pub use config::{EngineConfig, RetryConfig};
pub use conflict::{ConflictResolver, EntityConflict, Resolution, ResolutionPlan, Winner};
pub use entity::{EntityKey, EntityType, StoragePattern};
pub use envelope::{FileBasedSyncData, PayloadCodec, PlainJsonCodec};
pub use error::{Error, Remediation};
pub use file_sync::{FileBasedSyncAdapter, FileProvider, MemoryFileProvider, RemoteFile};
pub use import_filter::ImportFilterResult;
pub use log::{ApplicationStatus, LogEntry, OpSource, OperationLog};
pub use notify::{ImportConflictChoice, NoopNotifier, SyncNotifier, TracingNotifier};
pub use operation::{ChangeType, EntityChange, OpType, Operation};
pub use protocol::{DownloadResult, OperationSyncProvider, SnapshotReason, UploadResult};
pub use snapshot::{LogPersistence, LogSnapshot, SNAPSHOT_FORMAT_VERSION};
pub use state::{ChangeSet, MemoryStateStore, StateStore};
pub use sync::{SyncCycleOutcome, SyncEngine};

/// Type aliases for clarity
pub type ClientId = String;
pub type EntityId = String;
pub type OperationId = String;
/// Milliseconds since the Unix epoch
pub type Timestamp = i64;
/// Position in the local operation log
pub type Seq = u64;
pub type SchemaVersion = u32;
