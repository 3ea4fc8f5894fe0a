//! JSON snapshot of the task set.

use batchq_core::Task;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;

use crate::trait_::{Result, StorageError};

/// Snapshot format version.
pub const SNAPSHOT_VERSION: u64 = 1;

#[derive(Serialize)]
struct SnapshotOut<'a> {
    version: u64,
    tasks: &'a [Task],
}

#[derive(Deserialize)]
struct SnapshotIn {
    version: u64,
    #[serde(default)]
    tasks: serde_json::Value,
}

/// Read a snapshot, resolving stored paths against `root`.
///
/// A missing file is an empty queue.
pub async fn read_snapshot(path: &Path, root: &Path) -> Result<Vec<Task>> {
    let text = match fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let malformed = |e: serde_json::Error| StorageError::Malformed {
        path: path.to_path_buf(),
        reason: e.to_string(),
    };
    let doc: SnapshotIn = serde_json::from_str(&text).map_err(malformed)?;
    if doc.version != SNAPSHOT_VERSION {
        return Err(StorageError::UnsupportedVersion {
            path: path.to_path_buf(),
            version: doc.version,
        });
    }
    let tasks: Vec<Task> = serde_json::from_value(doc.tasks).map_err(malformed)?;
    Ok(tasks.into_iter().map(|t| t.join_root(root)).collect())
}

/// Write a snapshot with paths relative to `root`, via a temporary file.
pub async fn write_snapshot(path: &Path, root: &Path, tasks: &[Task]) -> Result<()> {
    let relative: Vec<Task> = tasks.iter().map(|t| t.strip_root(root)).collect();
    let json = serde_json::to_string_pretty(&SnapshotOut {
        version: SNAPSHOT_VERSION,
        tasks: &relative,
    })?;

    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json.as_bytes()).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}
