//! JSON file storage implementation.
//!
//! Keeps the queue state of one project in its `.bq` directory:
//! `queue.json` (snapshot), `log.csv` (event log), `queue.json.lock`
//! and the marker files dropped by the backends.

use async_trait::async_trait;
use batchq_core::Task;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info};

use crate::lock::FileLock;
use crate::markers::{collect_markers, MarkerEvent};
use crate::{log, snapshot};
use super::{Result, Storage};

/// Name of the per-project state directory.
pub const STATE_DIR: &str = ".bq";

/// File-based storage backend.
pub struct JsonStorage {
    root: PathBuf,
    dir: PathBuf,
}

impl JsonStorage {
    /// Open the storage of the project rooted at `root`, creating `.bq/`.
    pub async fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let dir = root.join(STATE_DIR);
        fs::create_dir_all(&dir).await?;
        Ok(Self { root, dir })
    }

    fn snapshot_path(&self) -> PathBuf {
        self.dir.join("queue.json")
    }

    fn log_path(&self) -> PathBuf {
        self.dir.join("log.csv")
    }

    fn lock_path(&self) -> PathBuf {
        self.dir.join("queue.json.lock")
    }
}

#[async_trait]
impl Storage for JsonStorage {
    fn root(&self) -> &Path {
        &self.root
    }

    fn dir(&self) -> &Path {
        &self.dir
    }

    async fn load_tasks(&self) -> Result<Vec<Task>> {
        let tasks = snapshot::read_snapshot(&self.snapshot_path(), &self.root).await?;
        debug!("Loaded {} tasks from {}", tasks.len(), self.snapshot_path().display());
        Ok(tasks)
    }

    async fn save_tasks(&mut self, tasks: &[Task]) -> Result<()> {
        snapshot::write_snapshot(&self.snapshot_path(), &self.root, tasks).await?;
        debug!("Saved {} tasks", tasks.len());
        Ok(())
    }

    async fn append_log(&mut self, tasks: &[Task]) -> Result<()> {
        log::append_log(&self.log_path(), &self.root, tasks).await
    }

    async fn load_log(&self) -> Result<Vec<Task>> {
        log::read_log(&self.log_path(), &self.root).await
    }

    async fn lock(&self, timeout: Duration) -> Result<FileLock> {
        FileLock::acquire(self.lock_path(), timeout).await
    }

    async fn try_lock(&self) -> Result<Option<FileLock>> {
        FileLock::try_acquire(self.lock_path())
    }

    async fn pending_markers(&self) -> Result<Vec<MarkerEvent>> {
        collect_markers(&self.dir).await
    }

    async fn remove_markers(&mut self, paths: &[PathBuf]) -> Result<()> {
        for path in paths {
            match fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        if !paths.is_empty() {
            info!("Consumed {} marker files", paths.len());
        }
        Ok(())
    }
}
