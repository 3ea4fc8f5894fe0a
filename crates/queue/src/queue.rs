//! Queue sessions and the operator-facing operations.

use batchq_core::{find_depending, Selection, Task, TaskId, TaskState};
use batchq_execution::{run_tasks, Backend, Scheduler};
use batchq_storage::{FileLock, JsonStorage, Storage};
use chrono::Utc;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::QueueConfig;
use crate::error::{QueueError, Result};

/// How a session is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenOptions {
    /// Wait for the lock (otherwise try once and continue read-only)
    pub need_lock: bool,
    /// Never call the backend for real and never write anything
    pub dry_run: bool,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            need_lock: true,
            dry_run: false,
        }
    }
}

impl OpenOptions {
    /// Options for listing: no waiting for the lock.
    pub fn read_only() -> Self {
        Self {
            need_lock: false,
            dry_run: false,
        }
    }

    /// Set dry-run mode.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

/// A task together with what its error file says.
#[derive(Debug, Clone)]
pub struct TaskInfo {
    /// The task
    pub task: Task,
    /// Where the backend writes its standard error
    pub error_file: PathBuf,
    /// Contents of the error file, if it exists
    pub error_text: Option<String>,
}

/// One session over a project's queue.
///
/// Changes are kept in memory and persisted by [`Queue::close`]: the
/// snapshot is rewritten and every changed or removed task gets a row in the
/// event log.
pub struct Queue<S: Scheduler = Backend> {
    pub(crate) storage: Box<dyn Storage>,
    pub(crate) scheduler: S,
    pub(crate) config: QueueConfig,
    pub(crate) options: OpenOptions,
    lock: Option<FileLock>,
    pub(crate) tasks: Vec<Task>,
    changed: HashSet<PathBuf>,
    removed: Vec<Task>,
    pub(crate) consumed: Vec<PathBuf>,
}

impl Queue<Backend> {
    /// Open the queue of the project rooted at `root` with the configured backend.
    pub async fn open(root: &Path, options: OpenOptions) -> Result<Self> {
        let config = QueueConfig::load(root).await?;
        let storage = JsonStorage::new(root).await?;
        let backend = Backend::from_config(&config.scheduler, storage.dir());
        Self::with_parts(Box::new(storage), backend, config, options).await
    }
}

impl<S: Scheduler> Queue<S> {
    /// Open a session from explicit parts.
    ///
    /// A locked, non-dry-run session consumes pending marker files and runs
    /// [`Queue::check`] before returning.
    pub async fn with_parts(
        storage: Box<dyn Storage>,
        scheduler: S,
        config: QueueConfig,
        options: OpenOptions,
    ) -> Result<Self> {
        let lock = if options.need_lock {
            Some(storage.lock(config.lock_timeout()).await?)
        } else {
            let lock = storage.try_lock().await?;
            if lock.is_none() {
                debug!("Queue is busy, reading without the lock");
            }
            lock
        };

        let tasks = storage.load_tasks().await?;
        let mut queue = Self {
            storage,
            scheduler,
            config,
            options,
            lock,
            tasks,
            changed: HashSet::new(),
            removed: Vec::new(),
            consumed: Vec::new(),
        };

        if queue.is_locked() && !options.dry_run {
            queue.apply_markers().await?;
            queue.check().await?;
        }
        Ok(queue)
    }

    /// Persist changes (unless dry-run or unlocked) and release the lock.
    ///
    /// Marker files applied in this session are deleted only after the
    /// snapshot is saved. Hands the backend back so the caller can keep
    /// waiting on it.
    pub async fn close(mut self) -> Result<S> {
        if self.is_locked() && !self.options.dry_run {
            if self.is_dirty() {
                self.storage.save_tasks(&self.tasks).await?;
                let mut rows = std::mem::take(&mut self.removed);
                rows.extend(
                    self.tasks
                        .iter()
                        .filter(|task| self.changed.contains(&task.dname))
                        .cloned(),
                );
                self.storage.append_log(&rows).await?;
                info!("Saved {} tasks ({} log rows)", self.tasks.len(), rows.len());
            }
            let consumed = std::mem::take(&mut self.consumed);
            self.storage.remove_markers(&consumed).await?;
        }
        if let Some(lock) = self.lock.take() {
            lock.release()?;
        }
        Ok(self.scheduler)
    }

    /// Whether this session holds the lock.
    pub fn is_locked(&self) -> bool {
        self.lock.is_some()
    }

    /// Whether anything changed since the session was opened.
    pub fn is_dirty(&self) -> bool {
        !self.changed.is_empty() || !self.removed.is_empty()
    }

    /// All tasks of the snapshot.
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    /// The backend.
    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }

    /// The configuration the session was opened with.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Project root.
    pub fn root(&self) -> &Path {
        self.storage.root()
    }

    pub(crate) fn require_lock(&self) -> Result<()> {
        if self.is_locked() {
            Ok(())
        } else {
            Err(QueueError::NotLocked)
        }
    }

    pub(crate) fn mark(&mut self, index: usize) {
        self.changed.insert(self.tasks[index].dname.clone());
    }

    /// Take tasks out of the snapshot; they still get a log row.
    pub(crate) fn detach(&mut self, mut indices: Vec<usize>) -> Vec<Task> {
        indices.sort_unstable();
        indices.dedup();
        let mut taken = Vec::with_capacity(indices.len());
        for index in indices.into_iter().rev() {
            taken.push(self.tasks.remove(index));
        }
        taken.reverse();
        self.removed.extend(taken.iter().cloned());
        taken
    }

    pub(crate) fn position(&self, id: TaskId) -> Option<usize> {
        self.tasks.iter().position(|task| task.id == id)
    }

    // === Reading ===

    /// Tasks of the snapshot matching `selection`.
    pub fn list(&self, selection: &Selection) -> Vec<&Task> {
        selection
            .select(&self.tasks)
            .into_iter()
            .map(|i| &self.tasks[i])
            .collect()
    }

    /// Rows of the event log matching `selection`, oldest first.
    pub async fn list_log(&self, selection: &Selection) -> Result<Vec<Task>> {
        let rows = self.storage.load_log().await?;
        Ok(rows.into_iter().filter(|task| selection.matches(task)).collect())
    }

    /// A task and the text of its error file.
    pub async fn info(&self, id: TaskId) -> Result<TaskInfo> {
        let index = self.position(id).ok_or(QueueError::NoSuchTask(id))?;
        let task = self.tasks[index].clone();
        let error_file = self.scheduler.error_file(&task);
        let error_text = match tokio::fs::read(&error_file).await {
            Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        Ok(TaskInfo {
            task,
            error_file,
            error_text,
        })
    }

    // === Operator actions ===

    /// Remove the selected tasks and everything depending on them.
    ///
    /// Active tasks are canceled in the backend first; a backend that
    /// refuses is logged and the task is removed anyway. Returns the removed
    /// tasks (what would be removed, in dry-run mode).
    pub async fn remove(&mut self, selection: &Selection) -> Result<Vec<Task>> {
        self.require_lock()?;
        let roots = selection.select(&self.tasks);
        let closure = find_depending(&self.tasks, &roots);
        if self.options.dry_run {
            return Ok(closure.iter().map(|&i| self.tasks[i].clone()).collect());
        }

        let now = Utc::now();
        for &index in &closure {
            if self.tasks[index].state.is_active() {
                if let Err(e) = self.scheduler.cancel(&self.tasks[index]).await {
                    warn!("Could not cancel {}: {}", self.tasks[index], e);
                }
                let task = &mut self.tasks[index];
                task.state = TaskState::Canceled;
                task.tstop = Some(now);
            }
        }
        let removed = self.detach(closure);
        info!("Removed {} tasks", removed.len());
        Ok(removed)
    }

    /// Change the state of the selected tasks without resubmitting them.
    ///
    /// Allowed: queued and hold in both directions, FAILED to MEMORY or
    /// TIMEOUT, TIMEOUT to MEMORY. Nothing changes if any selected task
    /// cannot make the transition.
    pub async fn modify(&mut self, selection: &Selection, state: TaskState) -> Result<usize> {
        self.require_lock()?;
        let indices: Vec<usize> = selection
            .select(&self.tasks)
            .into_iter()
            .filter(|&i| self.tasks[i].state != state)
            .collect();

        for &index in &indices {
            let task = &self.tasks[index];
            let allowed = matches!(
                (task.state, state),
                (TaskState::Queued, TaskState::Hold)
                    | (TaskState::Hold, TaskState::Queued)
                    | (TaskState::Failed, TaskState::Memory)
                    | (TaskState::Failed, TaskState::Timeout)
                    | (TaskState::Timeout, TaskState::Memory)
            );
            if !allowed {
                return Err(QueueError::InvalidTransition {
                    id: task.id,
                    from: task.state,
                    to: state,
                });
            }
        }
        if self.options.dry_run {
            return Ok(indices.len());
        }

        for &index in &indices {
            let task = &self.tasks[index];
            match (task.state, state) {
                (TaskState::Queued, TaskState::Hold) => self.scheduler.hold(task).await?,
                (TaskState::Hold, TaskState::Queued) => self.scheduler.release_hold(task).await?,
                _ => task.remove_failed_file()?,
            }
            info!("{}: {} -> {}", task, task.state, state);
            self.tasks[index].state = state;
            self.mark(index);
        }
        Ok(indices.len())
    }

    /// Reconcile active tasks with what the backend still knows about.
    ///
    /// An active task the backend has lost is CANCELED, or dropped entirely
    /// if its folder is gone. Returns the number of tasks touched.
    pub async fn sync(&mut self) -> Result<usize> {
        self.require_lock()?;
        let ids = self.scheduler.get_ids().await?;
        let lost: Vec<usize> = self
            .tasks
            .iter()
            .enumerate()
            .filter(|(_, task)| task.state.is_active() && !ids.contains(&task.id))
            .map(|(i, _)| i)
            .collect();
        if lost.is_empty() || self.options.dry_run {
            return Ok(lost.len());
        }

        let now = Utc::now();
        let mut gone = Vec::new();
        for &index in &lost {
            if self.tasks[index].folder.is_dir() {
                warn!("{} is unknown to {}, marking it CANCELED", self.tasks[index], self.scheduler.name());
                self.tasks[index].state = TaskState::Canceled;
                self.tasks[index].tstop = Some(now);
                self.mark(index);
            } else {
                warn!("{} lost its folder, removing it", self.tasks[index]);
                gone.push(index);
            }
        }
        self.detach(gone);
        Ok(lost.len())
    }

    /// Run tasks in this process, bypassing the backend.
    ///
    /// Same-dname entries are removed from the queue first; nothing about
    /// the run itself is persisted.
    pub async fn run(&mut self, tasks: Vec<Task>) -> Result<Vec<(PathBuf, TaskState)>> {
        self.require_lock()?;
        let dnames: HashSet<&Path> = tasks.iter().map(|t| t.dname.as_path()).collect();
        let stale: Vec<usize> = self
            .tasks
            .iter()
            .enumerate()
            .filter(|(_, task)| dnames.contains(task.dname.as_path()))
            .map(|(i, _)| i)
            .collect();
        if self.options.dry_run {
            for task in &tasks {
                info!("Would run {}", task.dname.display());
            }
            return Ok(Vec::new());
        }
        self.detach(stale);
        Ok(run_tasks(&tasks, &self.config.scheduler.python).await?)
    }
}
