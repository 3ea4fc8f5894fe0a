//! Errors raised by the data model.

/// Result alias for model operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur while building or parsing model values.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Resource string could not be parsed
    #[error("invalid resources {0:?}: expected cores[:nodename][:processes]:tmax")]
    InvalidResources(String),

    /// Time string could not be parsed
    #[error("invalid time {0:?}: expected a number followed by s, m, h or d")]
    InvalidTime(String),

    /// Requested node class is not in the pool
    #[error("no such node class: {0}")]
    UnknownNode(String),

    /// State name or letter not recognised
    #[error("unknown state: {0}")]
    UnknownState(String),

    /// Command string could not be parsed
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    /// Bad name/error pattern
    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    /// I/O error while touching workflow files
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
