//! Autosave: durable editing on top of a flaky network.
//!
//! Responsibilities:
//! - tracking the live document against its last acknowledged snapshot
//! - write-through local backups so edits survive a crash
//! - coalescing edit bursts (debounce), a periodic guard, and a teardown flush
//! - a single retrying save coordinator per document with bounded backoff

pub mod backup;
pub mod buffer;
pub mod config;
pub mod coordinator;
pub mod session;
pub mod status;
pub mod timer;

pub use backup::{
    backup_key, BackupError, BackupRecord, BackupStore, FileBackupStore, InMemoryBackupStore,
};
pub use buffer::{DocumentField, EditableDocument};
pub use config::{AutosaveConfig, RetryPolicy};
pub use coordinator::{SaveAttempt, SaveCoordinator, SaveOutcome, SavePhase, SaveTrigger, SkipReason};
pub use session::DocumentSession;
pub use status::{SaveNotice, SaveStatus};
pub use timer::Timer;
