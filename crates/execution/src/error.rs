//! Scheduler errors.

use std::path::PathBuf;

/// Result alias for scheduler operations.
pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Errors raised while talking to a batch system or the local executor.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// External command exited unsuccessfully
    #[error("{program} failed with exit code {exit_code}: {stderr}")]
    CommandFailed {
        /// Program name
        program: String,
        /// Exit code (-1 if killed by a signal)
        exit_code: i32,
        /// Captured standard error
        stderr: String,
    },

    /// Output of an external command was not understood
    #[error("could not parse output of {program}: {output:?}")]
    Parse {
        /// Program name
        program: String,
        /// Offending output
        output: String,
    },

    /// The in-process executor has shut down
    #[error("local executor is not running")]
    ExecutorGone,

    /// Folder to run in does not exist
    #[error("no such folder: {0}")]
    MissingFolder(PathBuf),

    /// Resource selection failed
    #[error(transparent)]
    Core(#[from] batchq_core::CoreError),

    /// Marker file could not be written
    #[error(transparent)]
    Storage(#[from] batchq_storage::StorageError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
