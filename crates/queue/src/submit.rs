//! Submission: filtering, dependency resolution and ordered hand-off.

use batchq_core::{Resources, Selection, Task, TaskId, TaskState};
use batchq_execution::Scheduler;
use chrono::Utc;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{QueueError, Result};
use crate::queue::Queue;

/// Why a task was not submitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Workflow task that already finished
    Done,
    /// Workflow task with a FAILED marker (use force)
    Failed,
    /// Workflow task already in the queue in this state
    InQueue(TaskState),
    /// A dependency ended in a failed state
    DependencyFailed(PathBuf),
    /// A dependency is neither queued, in the batch, nor done
    DependencyMissing(PathBuf),
    /// A dependency from the same batch was itself skipped
    DependencySkipped(PathBuf),
    /// Cut off by `max_tasks`
    MaxTasks,
    /// Part of a dependency cycle within the batch
    Cycle,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Done => write!(f, "already done"),
            Self::Failed => write!(f, "failed before (use --force)"),
            Self::InQueue(state) => write!(f, "already in the queue ({state})"),
            Self::DependencyFailed(dep) => write!(f, "dependency {} failed", dep.display()),
            Self::DependencyMissing(dep) => write!(f, "dependency {} not found", dep.display()),
            Self::DependencySkipped(dep) => write!(f, "dependency {} was not submitted", dep.display()),
            Self::MaxTasks => write!(f, "over --max-tasks"),
            Self::Cycle => write!(f, "dependency cycle"),
        }
    }
}

/// Outcome of one [`Queue::submit`] call.
#[derive(Debug, Clone, Default)]
pub struct SubmitReport {
    /// Tasks handed to the backend, in submission order
    pub submitted: Vec<Task>,
    /// Tasks left out, with the reason
    pub skipped: Vec<(PathBuf, SkipReason)>,
}

impl SubmitReport {
    fn skip(&mut self, dname: PathBuf, reason: SkipReason) {
        debug!("Skipping {}: {}", dname.display(), reason);
        self.skipped.push((dname, reason));
    }

    /// Number of tasks skipped for `reason`.
    pub fn count(&self, reason: &SkipReason) -> usize {
        self.skipped.iter().filter(|(_, r)| r == reason).count()
    }
}

/// How one dependency of a batch task is satisfied.
enum Edge {
    /// Another task of the batch
    Batch,
    /// An active task already in the queue
    Queued(TaskId),
    /// Already done, no edge needed
    Done,
}

impl<S: Scheduler> Queue<S> {
    /// Submit a batch of tasks.
    ///
    /// Workflow tasks that are done, marked FAILED (unless `force`) or
    /// already active are skipped. Dependencies resolve against the batch,
    /// the queue and finished work; a task with a failed or unknown
    /// dependency is skipped, and so is everything in the batch depending
    /// on it. Tasks go to the backend only after their batch dependencies,
    /// so native dependency ids are known.
    ///
    /// A backend error stops the batch. Tasks accepted up to that point
    /// stay in the queue and are named in [`QueueError::Submission`].
    pub async fn submit(
        &mut self,
        tasks: Vec<Task>,
        force: bool,
        max_tasks: Option<usize>,
    ) -> Result<SubmitReport> {
        self.require_lock()?;
        let mut report = SubmitReport::default();

        let latest: HashMap<PathBuf, usize> = self
            .tasks
            .iter()
            .enumerate()
            .map(|(i, task)| (task.dname.clone(), i))
            .collect();
        let mut done: HashSet<PathBuf> = self
            .tasks
            .iter()
            .filter(|task| task.state == TaskState::Done)
            .map(|task| task.dname.clone())
            .collect();

        let mut batch = Vec::new();
        for task in tasks {
            if task.workflow {
                if task.is_done() {
                    done.insert(task.dname.clone());
                    report.skip(task.dname, SkipReason::Done);
                    continue;
                }
                if task.has_failed() {
                    if !force {
                        report.skip(task.dname, SkipReason::Failed);
                        continue;
                    }
                    if !self.options.dry_run {
                        task.remove_failed_file()?;
                    }
                }
                if let Some(&i) = latest.get(&task.dname) {
                    let state = self.tasks[i].state;
                    if state.is_active() {
                        report.skip(task.dname, SkipReason::InQueue(state));
                        continue;
                    }
                }
            }
            batch.push(task);
        }

        let in_batch: HashSet<PathBuf> = batch.iter().map(|t| t.dname.clone()).collect();
        let mut dropped: HashSet<PathBuf> = HashSet::new();
        if let Some(max) = max_tasks {
            for task in batch.iter().skip(max) {
                dropped.insert(task.dname.clone());
                report.skip(task.dname.clone(), SkipReason::MaxTasks);
            }
            batch.truncate(max);
        }

        // Drop tasks with unusable dependencies until nothing changes.
        loop {
            let mut newly = Vec::new();
            for task in batch.iter().filter(|t| !dropped.contains(&t.dname)) {
                let problem = task.deps.iter().find_map(|dep| {
                    match self.resolve(dep, &in_batch, &latest, &done) {
                        Ok(_) if dropped.contains(dep) => Some(SkipReason::DependencySkipped(dep.clone())),
                        Ok(_) => None,
                        Err(reason) => Some(reason),
                    }
                });
                if let Some(reason) = problem {
                    newly.push((task.dname.clone(), reason));
                }
            }
            if newly.is_empty() {
                break;
            }
            for (dname, reason) in newly {
                dropped.insert(dname.clone());
                report.skip(dname, reason);
            }
        }
        batch.retain(|task| !dropped.contains(&task.dname));

        // Only unfinished dependencies stay as edges.
        let mut pending: VecDeque<Task> = VecDeque::with_capacity(batch.len());
        for mut task in batch {
            let mut dtasks = Vec::new();
            let mut deps = Vec::new();
            for dep in std::mem::take(&mut task.deps) {
                match self.resolve(&dep, &in_batch, &latest, &done) {
                    Ok(Edge::Done) => {}
                    Ok(Edge::Queued(id)) => {
                        dtasks.push(id);
                        deps.push(dep);
                    }
                    Ok(Edge::Batch) | Err(_) => deps.push(dep),
                }
            }
            task.deps = deps;
            task.dtasks = dtasks;
            pending.push_back(task);
        }

        let now = Utc::now();
        let dry_run = self.options.dry_run;
        let mut assigned: HashMap<PathBuf, TaskId> = HashMap::new();
        let mut stalled = 0;
        while let Some(mut task) = pending.pop_front() {
            let waiting_on = task
                .deps
                .iter()
                .find(|dep| in_batch.contains(*dep) && !assigned.contains_key(*dep));
            if let Some(dep) = waiting_on {
                debug!("Deferring {} until {} is submitted", task.dname.display(), dep.display());
                pending.push_back(task);
                stalled += 1;
                if stalled >= pending.len() {
                    for task in pending.drain(..) {
                        warn!("{} is part of a dependency cycle", task.dname.display());
                        report.skip(task.dname, SkipReason::Cycle);
                    }
                }
                continue;
            }
            stalled = 0;

            for dep in task.deps.iter().filter(|dep| in_batch.contains(*dep)) {
                if let Some(&id) = assigned.get(dep) {
                    task.dtasks.push(id);
                }
            }

            if let Err(source) = self.scheduler.submit(&mut task, dry_run).await {
                return Err(QueueError::Submission {
                    accepted: report.submitted.iter().map(|t| t.dname.clone()).collect(),
                    source,
                });
            }
            task.state = TaskState::Queued;
            task.tqueued = Some(now);
            assigned.insert(task.dname.clone(), task.id);
            if !dry_run {
                info!("Submitted {}", task);
                self.accept(task.clone());
            }
            report.submitted.push(task);
        }
        Ok(report)
    }

    /// Resubmit the selected inactive tasks as fresh tasks.
    ///
    /// FAILED markers are cleared on submission; `resources` replaces the old request when
    /// given. The old records are evicted once their replacement is accepted.
    pub async fn resubmit(&mut self, selection: &Selection, resources: Option<Resources>) -> Result<SubmitReport> {
        self.require_lock()?;
        let mut fresh = Vec::new();
        for index in selection.select(&self.tasks) {
            let task = &self.tasks[index];
            if task.state.is_active() {
                warn!("{} is still {}, not resubmitting it", task, task.state);
                continue;
            }
            let resources = resources.clone().unwrap_or_else(|| task.resources.clone());
            fresh.push(task.fresh_copy(resources));
        }
        self.submit(fresh, true, None).await
    }

    fn resolve(
        &self,
        dep: &Path,
        in_batch: &HashSet<PathBuf>,
        latest: &HashMap<PathBuf, usize>,
        done: &HashSet<PathBuf>,
    ) -> std::result::Result<Edge, SkipReason> {
        if in_batch.contains(dep) {
            return Ok(Edge::Batch);
        }
        if let Some(&i) = latest.get(dep) {
            let task = &self.tasks[i];
            return match task.state {
                state if state.is_active() => Ok(Edge::Queued(task.id)),
                TaskState::Done => Ok(Edge::Done),
                _ => Err(SkipReason::DependencyFailed(dep.to_path_buf())),
            };
        }
        if done.contains(dep) {
            return Ok(Edge::Done);
        }
        Err(SkipReason::DependencyMissing(dep.to_path_buf()))
    }

    /// Add an accepted task, evicting inactive entries with the same dname.
    fn accept(&mut self, task: Task) {
        let stale: Vec<usize> = self
            .tasks
            .iter()
            .enumerate()
            .filter(|(_, old)| old.dname == task.dname && !old.state.is_active())
            .map(|(i, _)| i)
            .collect();
        if !stale.is_empty() {
            debug!("Replacing {} old record(s) of {}", stale.len(), task.dname.display());
            self.detach(stale);
        }
        self.tasks.push(task);
        self.mark(self.tasks.len() - 1);
    }
}
