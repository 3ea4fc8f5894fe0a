//! batchq core data models.
//!
//! Tasks, their resource requests and state machine, and the pure
//! selection and dependency-graph logic the queue is built on.

#![warn(missing_docs)]

// Identities and errors
mod error;
mod id;

// Task model
mod command;
mod resources;
mod state;
mod task;

// Queries over task collections
mod graph;
mod selection;

// Re-exports
pub use error::{CoreError, Result};
pub use id::TaskId;

pub use command::{shell_quote, Command, CommandKind};
pub use resources::{format_time, parse_time, NodeClass, NodeSelection, Resources, DEFAULT_TMAX, MAX_TMAX};
pub use state::{Outcome, StateFamily, TaskState};
pub use task::{normalize_path, Task, TaskRow, OOM_SIGNATURES};

pub use graph::{cancel_dependents, find_depending};
pub use selection::{glob_regex, Selection};

/// Timestamp type
pub type Time = chrono::DateTime<chrono::Utc>;
