//! Queue layer - the per-project task set and everything that mutates it.
//!
//! A [`Queue`] is one locked session over the project's `.bq/` directory:
//! it loads the snapshot, applies pending completion markers, lets the
//! caller submit, remove, modify or reconcile tasks, and writes the
//! snapshot and event log back on [`Queue::close`].

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod queue;
mod reconcile;
mod submit;

pub use config::{find_root, QueueConfig, CONFIG_FILE};
pub use error::{QueueError, Result};
pub use queue::{OpenOptions, Queue, TaskInfo};
pub use submit::{SkipReason, SubmitReport};
