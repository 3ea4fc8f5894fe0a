//! Append-only CSV event log.

use batchq_core::{normalize_path, Command, CommandKind, Resources, Task, TaskId, TaskState, Time};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::trait_::{Result, StorageError};

/// One row of the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Task id
    pub id: TaskId,
    /// Folder relative to the project root
    pub folder: PathBuf,
    /// Command type
    pub kind: CommandKind,
    /// Command
    pub cmd: String,
    /// Arguments as a JSON array
    pub args: String,
    /// Command name
    pub name: String,
    /// Resources in `cores:tmax` form
    pub resources: String,
    /// State at the time of writing
    pub state: TaskState,
    /// Remaining restarts
    pub restart: u32,
    /// Workflow flag
    pub workflow: bool,
    /// Disk space
    pub diskspace: u64,
    /// Dependencies as a JSON array of relative dnames
    pub deps: String,
    /// Created files as a JSON array
    pub creates: String,
    /// Queued at
    pub tqueued: Option<Time>,
    /// Started at
    pub trunning: Option<Time>,
    /// Stopped at
    pub tstop: Option<Time>,
    /// Peak memory
    pub memory_usage: u64,
    /// Error line
    pub error: String,
}

impl LogRecord {
    /// Flatten a task, with paths relative to `root`.
    pub fn from_task(task: &Task, root: &Path) -> Result<Self> {
        let rel = task.strip_root(root);
        Ok(Self {
            id: rel.id,
            folder: rel.folder,
            kind: rel.cmd.kind,
            cmd: rel.cmd.cmd,
            args: serde_json::to_string(&rel.cmd.args)?,
            name: rel.cmd.name,
            resources: rel.resources.to_string(),
            state: rel.state,
            restart: rel.restart,
            workflow: rel.workflow,
            diskspace: rel.diskspace,
            deps: serde_json::to_string(&rel.deps)?,
            creates: serde_json::to_string(&rel.creates)?,
            tqueued: rel.tqueued,
            trunning: rel.trunning,
            tstop: rel.tstop,
            memory_usage: rel.memory_usage,
            error: rel.error,
        })
    }

    /// Rebuild a task, resolving paths against `root`.
    pub fn into_task(self, root: &Path, log: &Path) -> Result<Task> {
        let resources: Resources = self.resources.parse().map_err(|e| StorageError::Malformed {
            path: log.to_path_buf(),
            reason: format!("{e}"),
        })?;
        let cmd = Command {
            kind: self.kind,
            cmd: self.cmd,
            args: serde_json::from_str(&self.args)?,
            name: self.name,
        };
        let folder = normalize_path(&root.join(&self.folder));
        let deps: Vec<PathBuf> = serde_json::from_str(&self.deps)?;

        let mut task = Task::new(cmd, folder)
            .with_resources(resources)
            .with_restart(self.restart)
            .with_workflow(self.workflow)
            .with_diskspace(self.diskspace)
            .with_creates(serde_json::from_str(&self.creates)?);
        task.deps = deps.iter().map(|d| normalize_path(&root.join(d))).collect();
        task.id = self.id;
        task.state = self.state;
        task.tqueued = self.tqueued;
        task.trunning = self.trunning;
        task.tstop = self.tstop;
        task.memory_usage = self.memory_usage;
        task.error = self.error;
        Ok(task)
    }
}

/// Append rows for `tasks`, writing the header if the file is new.
pub async fn append_log(path: &Path, root: &Path, tasks: &[Task]) -> Result<()> {
    if tasks.is_empty() {
        return Ok(());
    }
    let write_header = fs::metadata(path).await.map(|m| m.len() == 0).unwrap_or(true);

    let mut wtr = csv::WriterBuilder::new()
        .has_headers(write_header)
        .from_writer(Vec::new());
    for task in tasks {
        wtr.serialize(LogRecord::from_task(task, root)?)?;
    }
    let bytes = wtr.into_inner().map_err(|e| e.into_error())?;

    let mut file = OpenOptions::new().create(true).append(true).open(path).await?;
    file.write_all(&bytes).await?;
    file.flush().await?;
    Ok(())
}

/// Read every row of the log.
pub async fn read_log(path: &Path, root: &Path) -> Result<Vec<Task>> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut rdr = csv::Reader::from_reader(bytes.as_slice());
    let mut tasks = Vec::new();
    for record in rdr.deserialize::<LogRecord>() {
        tasks.push(record?.into_task(root, path)?);
    }
    Ok(tasks)
}
