//! Storage trait abstraction.

use async_trait::async_trait;
use batchq_core::Task;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::lock::FileLock;
use crate::markers::MarkerEvent;

/// Error type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Event log error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Lock held by someone else for too long
    #[error("timed out waiting for {path} (held for {age:?}); remove it if no other bq process is running")]
    LockTimeout {
        /// Lock file
        path: PathBuf,
        /// How long the lock has existed
        age: Duration,
    },

    /// Persisted document could not be understood
    #[error("malformed {path}: {reason}")]
    Malformed {
        /// Offending file
        path: PathBuf,
        /// What was wrong
        reason: String,
    },

    /// Snapshot written by an incompatible version
    #[error("{path} has unsupported version {version}")]
    UnsupportedVersion {
        /// Offending file
        path: PathBuf,
        /// Version found
        version: u64,
    },
}

/// Persistent state of one project queue.
///
/// Everything lives in the project's state directory: the task snapshot,
/// the append-only event log, the lock and the marker files.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Project root that persisted paths are relative to.
    fn root(&self) -> &Path;

    /// State directory.
    fn dir(&self) -> &Path;

    // === Snapshot ===

    /// Load the task snapshot (empty if none was written yet).
    async fn load_tasks(&self) -> Result<Vec<Task>>;

    /// Replace the task snapshot.
    async fn save_tasks(&mut self, tasks: &[Task]) -> Result<()>;

    // === Event log ===

    /// Append one row per task to the event log.
    async fn append_log(&mut self, tasks: &[Task]) -> Result<()>;

    /// Read every row of the event log.
    async fn load_log(&self) -> Result<Vec<Task>>;

    // === Locking ===

    /// Acquire the exclusive lock, waiting up to `timeout`.
    async fn lock(&self, timeout: Duration) -> Result<FileLock>;

    /// Try once to acquire the lock.
    async fn try_lock(&self) -> Result<Option<FileLock>>;

    // === Markers ===

    /// All pending marker files, oldest first.
    async fn pending_markers(&self) -> Result<Vec<MarkerEvent>>;

    /// Delete marker files once their signals are persisted.
    async fn remove_markers(&mut self, paths: &[PathBuf]) -> Result<()>;
}
