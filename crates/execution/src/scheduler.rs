//! Scheduler abstraction and backend selection.

use async_trait::async_trait;
use batchq_core::{NodeClass, Task, TaskId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::Result;
use crate::local::LocalScheduler;
use crate::lsf::Lsf;
use crate::pbs::Pbs;
use crate::runner::{CommandRunner, SystemRunner};
use crate::slurm::Slurm;

/// A batch system (or the local executor) that runs tasks.
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Marker-file prefix and display name.
    fn name(&self) -> &'static str;

    /// Submit a task and set its id. Uses `task.dtasks` for dependencies.
    async fn submit(&self, task: &mut Task, dry_run: bool) -> Result<()>;

    /// Remove a queued, held or running task.
    async fn cancel(&self, task: &Task) -> Result<()>;

    /// Hold a queued task.
    async fn hold(&self, task: &Task) -> Result<()>;

    /// Release a held task.
    async fn release_hold(&self, task: &Task) -> Result<()>;

    /// Ids the backend currently knows as queued, held or running.
    async fn get_ids(&self) -> Result<HashSet<TaskId>>;

    /// File the task's standard error goes to.
    fn error_file(&self, task: &Task) -> PathBuf;

    /// Peak memory of a finished task in bytes (0 if unknown).
    async fn maxrss(&self, id: TaskId) -> Result<u64>;

    /// Whether the backend killed the task for exceeding its wall-clock limit.
    async fn has_timed_out(&self, task: &Task) -> Result<bool>;

    /// Discover the node classes offered (optionally for one queue/partition).
    async fn get_config(&self, queue: Option<&str>) -> Result<Vec<NodeClass>>;
}

/// Which backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerKind {
    /// In-process executor
    #[default]
    Local,
    /// PBS / Torque
    Pbs,
    /// Slurm
    Slurm,
    /// IBM Spectrum LSF
    Lsf,
}

impl std::str::FromStr for SchedulerKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "pbs" => Ok(Self::Pbs),
            "slurm" => Ok(Self::Slurm),
            "lsf" => Ok(Self::Lsf),
            other => Err(format!("unknown scheduler: {other} (expected local, pbs, slurm or lsf)")),
        }
    }
}

/// Immutable backend settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Backend
    pub kind: SchedulerKind,

    /// Queue passed to the submit command (`-q`)
    pub queue_name: Option<String>,

    /// User whose jobs are listed (defaults to `$USER`)
    pub user: Option<String>,

    /// Node classes, in preference order
    pub nodes: Vec<NodeClass>,

    /// Extra arguments for every submission
    pub extra_args: Vec<String>,

    /// Python interpreter
    pub python: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            kind: SchedulerKind::Local,
            queue_name: None,
            user: None,
            nodes: Vec::new(),
            extra_args: Vec::new(),
            python: "python3".to_string(),
        }
    }
}

impl SchedulerConfig {
    /// Configured user or `$USER`.
    pub fn user(&self) -> String {
        self.user
            .clone()
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_default()
    }

    /// Extra submit arguments for a node class.
    pub fn submit_args(&self, node: &NodeClass) -> Vec<String> {
        self.extra_args.iter().chain(&node.extra_args).cloned().collect()
    }
}

/// The closed set of backends, chosen once from the configuration.
pub enum Backend {
    /// In-process executor
    Local(LocalScheduler),
    /// PBS
    Pbs(Pbs),
    /// Slurm
    Slurm(Slurm),
    /// LSF
    Lsf(Lsf),
}

impl Backend {
    /// Build the configured backend; markers go to `state_dir`.
    ///
    /// The local executor spawns its runner task, so this must be called
    /// inside a tokio runtime.
    pub fn from_config(config: &SchedulerConfig, state_dir: &Path) -> Self {
        let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
        Self::with_runner(config, state_dir, runner)
    }

    /// Like [`Backend::from_config`] with an explicit command runner.
    pub fn with_runner(config: &SchedulerConfig, state_dir: &Path, runner: Arc<dyn CommandRunner>) -> Self {
        match config.kind {
            SchedulerKind::Local => Self::Local(LocalScheduler::new(state_dir, &config.python)),
            SchedulerKind::Pbs => Self::Pbs(Pbs::new(config.clone(), state_dir, runner)),
            SchedulerKind::Slurm => Self::Slurm(Slurm::new(config.clone(), state_dir, runner)),
            SchedulerKind::Lsf => Self::Lsf(Lsf::new(config.clone(), state_dir, runner)),
        }
    }

    fn inner(&self) -> &dyn Scheduler {
        match self {
            Self::Local(s) => s,
            Self::Pbs(s) => s,
            Self::Slurm(s) => s,
            Self::Lsf(s) => s,
        }
    }
}

#[async_trait]
impl Scheduler for Backend {
    fn name(&self) -> &'static str {
        self.inner().name()
    }

    async fn submit(&self, task: &mut Task, dry_run: bool) -> Result<()> {
        self.inner().submit(task, dry_run).await
    }

    async fn cancel(&self, task: &Task) -> Result<()> {
        self.inner().cancel(task).await
    }

    async fn hold(&self, task: &Task) -> Result<()> {
        self.inner().hold(task).await
    }

    async fn release_hold(&self, task: &Task) -> Result<()> {
        self.inner().release_hold(task).await
    }

    async fn get_ids(&self) -> Result<HashSet<TaskId>> {
        self.inner().get_ids().await
    }

    fn error_file(&self, task: &Task) -> PathBuf {
        self.inner().error_file(task)
    }

    async fn maxrss(&self, id: TaskId) -> Result<u64> {
        self.inner().maxrss(id).await
    }

    async fn has_timed_out(&self, task: &Task) -> Result<bool> {
        self.inner().has_timed_out(task).await
    }

    async fn get_config(&self, queue: Option<&str>) -> Result<Vec<NodeClass>> {
        self.inner().get_config(queue).await
    }
}

/// Whether a file contains `needle` (false if it is missing).
pub(crate) async fn file_contains(path: &Path, needle: &str) -> Result<bool> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).contains(needle)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}
