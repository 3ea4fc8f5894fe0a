//! Queue errors.

use batchq_core::{TaskId, TaskState};
use std::path::PathBuf;

/// Result alias for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

/// Errors raised by a queue session.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The backend rejected a task; earlier tasks of the batch were accepted
    #[error("submission aborted after {} accepted task(s): {source}", accepted.len())]
    Submission {
        /// Tasks accepted before the failure
        accepted: Vec<PathBuf>,
        /// Backend error
        #[source]
        source: batchq_execution::SchedulerError,
    },

    /// Operator asked for a state change that is not allowed
    #[error("cannot change {id} from {from} to {to}")]
    InvalidTransition {
        /// Task
        id: TaskId,
        /// Current state
        from: TaskState,
        /// Requested state
        to: TaskState,
    },

    /// No task with this id
    #[error("no task with id {0}")]
    NoSuchTask(TaskId),

    /// Mutating call on a session that does not hold the lock
    #[error("queue is not locked")]
    NotLocked,

    /// No `.bq` directory above the given folder
    #[error("no queue found above {0}; run `bq init` first")]
    NoQueue(PathBuf),

    /// `config.json` could not be parsed
    #[error("invalid configuration {path}: {source}")]
    Config {
        /// Config file
        path: PathBuf,
        /// Parse error
        #[source]
        source: serde_json::Error,
    },

    /// Storage error
    #[error(transparent)]
    Storage(#[from] batchq_storage::StorageError),

    /// Backend error outside submission
    #[error(transparent)]
    Scheduler(#[from] batchq_execution::SchedulerError),

    /// Task model error
    #[error(transparent)]
    Core(#[from] batchq_core::CoreError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
