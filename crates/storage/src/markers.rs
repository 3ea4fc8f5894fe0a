//! Marker files - zero-byte `<prefix>-<id>-<code>` completion signals.
//!
//! Batch-system epilogues and the local executor drop these in the state
//! directory; a locked session turns them into typed events, oldest first.

use batchq_core::{Outcome, TaskId, Time};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

use crate::trait_::Result;

/// Prefixes written by the known backends.
pub const MARKER_PREFIXES: [&str; 4] = ["local", "pbs", "slurm", "lsf"];

/// A completion signal read from a marker file.
#[derive(Debug, Clone, PartialEq)]
pub struct MarkerEvent {
    /// Task id
    pub id: TaskId,
    /// What happened
    pub outcome: Outcome,
    /// File change time
    pub timestamp: Time,
    /// Marker file
    pub path: PathBuf,
}

/// Parse a marker file name into prefix, id and outcome.
pub fn parse_marker_name(name: &str) -> Option<(&str, TaskId, Outcome)> {
    let mut parts = name.split('-');
    let prefix = parts.next()?;
    let id = parts.next()?.parse::<u64>().ok()?;
    let code = parts.next()?.parse::<u8>().ok()?;
    if parts.next().is_some() || !MARKER_PREFIXES.contains(&prefix) {
        return None;
    }
    Some((prefix, TaskId::new(id), Outcome::from_code(code)?))
}

/// Path of the marker for `id` and `outcome`.
pub fn marker_path(dir: &Path, prefix: &str, id: TaskId, outcome: Outcome) -> PathBuf {
    dir.join(format!("{}-{}-{}", prefix, id, outcome.code()))
}

/// Touch a marker file.
pub async fn write_marker(dir: &Path, prefix: &str, id: TaskId, outcome: Outcome) -> Result<()> {
    let path = marker_path(dir, prefix, id, outcome);
    fs::write(&path, b"").await?;
    debug!("Wrote marker {}", path.display());
    Ok(())
}

/// All marker files in `dir`, sorted by change time, then id and outcome.
pub async fn collect_markers(dir: &Path) -> Result<Vec<MarkerEvent>> {
    let mut events = Vec::new();
    let mut rd = match fs::read_dir(dir).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(events),
        Err(e) => return Err(e.into()),
    };

    while let Some(entry) = rd.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(prefix) = name.split('-').next() else { continue };
        if !MARKER_PREFIXES.contains(&prefix) || !name.contains('-') {
            continue;
        }
        match parse_marker_name(name) {
            Some((_, id, outcome)) => {
                let metadata = entry.metadata().await?;
                events.push(MarkerEvent {
                    id,
                    outcome,
                    timestamp: change_time(&metadata),
                    path: entry.path(),
                });
            }
            None => warn!("Ignoring unrecognised marker file {}", entry.path().display()),
        }
    }

    events.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then(a.id.cmp(&b.id))
            .then(a.outcome.cmp(&b.outcome))
    });
    Ok(events)
}

#[cfg(unix)]
fn change_time(metadata: &std::fs::Metadata) -> Time {
    use std::os::unix::fs::MetadataExt;
    DateTime::from_timestamp(metadata.ctime(), metadata.ctime_nsec() as u32).unwrap_or_else(Utc::now)
}

#[cfg(not(unix))]
fn change_time(metadata: &std::fs::Metadata) -> Time {
    metadata
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_names() {
        assert_eq!(
            parse_marker_name("slurm-42-1"),
            Some(("slurm", TaskId::new(42), Outcome::Done))
        );
        assert_eq!(parse_marker_name("local-3-0").map(|m| m.2), Some(Outcome::Started));
        assert!(parse_marker_name("slurm-42-7").is_none());
        assert!(parse_marker_name("slurm-x-1").is_none());
        assert!(parse_marker_name("other-1-1").is_none());
        assert!(parse_marker_name("pbs-1-1-1").is_none());
    }

    #[tokio::test]
    async fn test_collect_in_order() {
        let dir = tempfile::tempdir().unwrap();
        write_marker(dir.path(), "local", TaskId::new(2), Outcome::Started).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        write_marker(dir.path(), "local", TaskId::new(2), Outcome::Done).await.unwrap();
        write_marker(dir.path(), "local", TaskId::new(1), Outcome::Done).await.unwrap();
        std::fs::write(dir.path().join("queue.json"), "{}").unwrap();
        std::fs::write(dir.path().join("local-9-9"), "").unwrap();

        let events = collect_markers(dir.path()).await.unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!((events[0].id, events[0].outcome), (TaskId::new(2), Outcome::Started));
        assert!(events[1].timestamp <= events[2].timestamp);
        assert!(dir.path().join("local-9-9").exists());
    }

    #[tokio::test]
    async fn test_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let events = collect_markers(&dir.path().join("nope")).await.unwrap();
        assert!(events.is_empty());
    }
}
