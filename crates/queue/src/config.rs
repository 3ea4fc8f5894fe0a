//! Queue configuration - `.bq/config.json`.

use batchq_execution::SchedulerConfig;
use batchq_storage::STATE_DIR;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::error::{QueueError, Result};

/// Name of the configuration file inside the state directory.
pub const CONFIG_FILE: &str = "config.json";

/// Settings of one project queue.
///
/// Loaded once per session and passed down explicitly; missing fields take
/// their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Backend settings
    pub scheduler: SchedulerConfig,

    /// Disk-space quota enforced by hold/release (none = unlimited)
    pub maximum_diskspace: Option<u64>,

    /// How long to wait for the queue lock
    pub lock_timeout_secs: u64,

    /// Extra time a running task gets past `tmax` before it is marked TIMEOUT
    pub timeout_grace_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            maximum_diskspace: None,
            lock_timeout_secs: 6,
            timeout_grace_secs: 1800,
        }
    }
}

impl QueueConfig {
    /// Read `<root>/.bq/config.json`, or defaults if it does not exist.
    pub async fn load(root: &Path) -> Result<Self> {
        let path = Self::path(root);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&text).map_err(|source| QueueError::Config { path, source })
    }

    /// Write `<root>/.bq/config.json`.
    pub async fn save(&self, root: &Path) -> Result<()> {
        let path = Self::path(root);
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let text = serde_json::to_string_pretty(self)
            .map_err(|source| QueueError::Config { path: path.clone(), source })?;
        tokio::fs::write(&path, text + "\n").await?;
        Ok(())
    }

    /// Lock wait as a duration.
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    fn path(root: &Path) -> PathBuf {
        root.join(STATE_DIR).join(CONFIG_FILE)
    }
}

/// Closest directory at or above `start` that contains `.bq/`.
pub fn find_root(start: &Path) -> Result<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join(STATE_DIR).is_dir())
        .map(Path::to_path_buf)
        .ok_or_else(|| QueueError::NoQueue(start.to_path_buf()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchq_execution::SchedulerKind;

    #[tokio::test]
    async fn test_defaults_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let config = QueueConfig::load(dir.path()).await.unwrap();
        assert_eq!(config, QueueConfig::default());
        assert_eq!(config.lock_timeout(), Duration::from_secs(6));
    }

    #[tokio::test]
    async fn test_save_and_partial_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = QueueConfig::default();
        config.scheduler.kind = SchedulerKind::Slurm;
        config.maximum_diskspace = Some(100);
        config.save(dir.path()).await.unwrap();
        assert_eq!(QueueConfig::load(dir.path()).await.unwrap(), config);

        std::fs::write(dir.path().join(".bq/config.json"), r#"{"timeout_grace_secs": 60}"#).unwrap();
        let partial = QueueConfig::load(dir.path()).await.unwrap();
        assert_eq!(partial.timeout_grace_secs, 60);
        assert_eq!(partial.lock_timeout_secs, 6);

        std::fs::write(dir.path().join(".bq/config.json"), "{").unwrap();
        assert!(matches!(
            QueueConfig::load(dir.path()).await,
            Err(QueueError::Config { .. })
        ));
    }

    #[test]
    fn test_find_root() {
        let dir = tempfile::tempdir().unwrap();
        let deep = dir.path().join("a/b");
        std::fs::create_dir_all(&deep).unwrap();
        assert!(matches!(find_root(&deep), Err(QueueError::NoQueue(_))));
        std::fs::create_dir(dir.path().join(".bq")).unwrap();
        assert_eq!(find_root(&deep).unwrap(), dir.path());
    }
}
