//! Storage for batchq project queues.
//!
//! This crate provides a trait-based storage interface with a JSON
//! snapshot + CSV log implementation, the advisory lock guarding a
//! session and the marker-file protocol used by the backends.

#![warn(missing_docs)]

pub mod trait_;
pub mod json_storage;
pub mod lock;
pub mod log;
pub mod markers;
pub mod snapshot;

pub use trait_::{Storage, StorageError, Result};
pub use json_storage::{JsonStorage, STATE_DIR};
pub use lock::FileLock;
pub use log::LogRecord;
pub use markers::{collect_markers, marker_path, parse_marker_name, write_marker, MarkerEvent, MARKER_PREFIXES};
