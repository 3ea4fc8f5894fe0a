//! Advisory lock file guarding a read-mutate-write session.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, warn};

use crate::trait_::{Result, StorageError};

/// First retry delay.
const INITIAL_BACKOFF: Duration = Duration::from_millis(10);

/// Longest delay between retries.
const MAX_BACKOFF: Duration = Duration::from_secs(1);

/// An exclusively created lock file holding the owner's pid.
///
/// The file is removed on [`FileLock::release`] or when dropped.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    held: bool,
}

impl FileLock {
    /// Try once to create the lock file.
    pub fn try_acquire(path: impl AsRef<Path>) -> Result<Option<Self>> {
        let path = path.as_ref().to_path_buf();
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                writeln!(file, "{}", std::process::id())?;
                debug!("Acquired {}", path.display());
                Ok(Some(Self { path, held: true }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Acquire the lock, retrying with exponential backoff until `timeout`.
    pub async fn acquire(path: impl AsRef<Path>, timeout: Duration) -> Result<Self> {
        let path = path.as_ref();
        let start = Instant::now();
        let mut delay = INITIAL_BACKOFF;
        loop {
            if let Some(lock) = Self::try_acquire(path)? {
                return Ok(lock);
            }
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                let age = lock_age(path).unwrap_or(elapsed);
                warn!("Giving up on {} after {:?}", path.display(), elapsed);
                return Err(StorageError::LockTimeout {
                    path: path.to_path_buf(),
                    age,
                });
            }
            tokio::time::sleep(delay.min(timeout - elapsed)).await;
            delay = (delay * 2).min(MAX_BACKOFF);
        }
    }

    /// Path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the lock file.
    pub fn release(mut self) -> Result<()> {
        self.held = false;
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if self.held {
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!("Could not remove {}: {}", self.path.display(), e);
            }
        }
    }
}

fn lock_age(path: &Path) -> Option<Duration> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    SystemTime::now().duration_since(modified).ok()
}
