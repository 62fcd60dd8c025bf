#![deny(missing_docs)]
//! points_core: shared building blocks for the points service (config, KV,
//! logging, per-record locks and the accrual subsystem).

/// Configuration helpers (AppId, dirs, load_or_init, etc.)
pub mod cfg;
/// Simple file-backed KV store with serde helpers.
pub mod store;
/// Tracing/log initialization helpers.
pub mod logx;
/// Error taxonomy shared by the lock manager, store adapter and service.
pub mod error;
/// Person records and the record store adapter over [`store::Kv`].
pub mod record;
/// Per-record mutual exclusion.
pub mod lock;
/// Accrual job state machine and point sources.
pub mod job;
/// Owner of the record id -> accrual job mapping.
pub mod scheduler;
/// Handler-facing operations combining store, locks and scheduler.
pub mod service;

pub use error::{Error, Result};
pub use job::{AccrualJob, AccrualSettings, JobProgress, JobState, PointsSource, SequencePoints, UniformPoints};
pub use lock::{Holder, RecordGuard, RecordLockManager};
pub use record::{NewRecord, Record, RecordChanges, RecordId, Records};
pub use scheduler::AccrualScheduler;
pub use service::PeopleService;
