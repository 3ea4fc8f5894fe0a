//! Reconciliation: completion signals, stall detection, retries and quota.

use batchq_core::{cancel_dependents, find_depending, TaskId, TaskState, Time};
use batchq_execution::Scheduler;
use chrono::{Duration, Utc};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::queue::Queue;
use crate::submit::SubmitReport;

/// States whose disk space counts against the quota.
const QUOTA_STATES: [TaskState; 5] = [
    TaskState::Queued,
    TaskState::Running,
    TaskState::Failed,
    TaskState::Timeout,
    TaskState::Memory,
];

impl<S: Scheduler> Queue<S> {
    /// Apply pending marker files in change-time order.
    ///
    /// The files are deleted by [`Queue::close`] once the snapshot holding
    /// their effect is saved; a session that fails before that leaves them
    /// for the next one.
    pub async fn apply_markers(&mut self) -> Result<usize> {
        self.require_lock()?;
        let events = self.storage.pending_markers().await?;
        let mut applied = 0;
        for event in events {
            if self.update(event.id, event.outcome.state(), event.timestamp).await? {
                applied += 1;
            }
            self.consumed.push(event.path);
        }
        Ok(applied)
    }

    /// Apply a completion signal for task `id`.
    ///
    /// `done` unblocks dependents; a failure cancels the transitive
    /// dependents. Signals for unknown or already finished tasks are
    /// ignored. Returns whether anything changed.
    pub async fn update(&mut self, id: TaskId, state: TaskState, t: Time) -> Result<bool> {
        self.require_lock()?;
        let Some(index) = self.position(id) else {
            warn!("Signal {} for unknown task {}", state, id);
            return Ok(false);
        };
        if self.tasks[index].state.is_terminal() {
            debug!("Ignoring {} for finished task {}", state, self.tasks[index]);
            return Ok(false);
        }

        info!("{}: {} -> {}", self.tasks[index], self.tasks[index].state, state);
        let dname = self.tasks[index].dname.clone();
        self.tasks[index].state = state;
        match state {
            TaskState::Running => self.tasks[index].trunning = Some(t),
            TaskState::Done => {
                self.tasks[index].tstop = Some(t);
                self.tasks[index].write_done_file()?;
                self.unblock(&dname);
            }
            TaskState::Failed | TaskState::Timeout | TaskState::Memory => {
                self.tasks[index].tstop = Some(t);
                if state == TaskState::Failed {
                    self.tasks[index].write_failed_file()?;
                }
                self.cascade(&dname, t);
            }
            TaskState::Canceled => self.tasks[index].tstop = Some(t),
            TaskState::Queued | TaskState::Hold => {}
        }
        if state != TaskState::Running {
            self.tasks[index].memory_usage = self.scheduler.maxrss(id).await?;
        }
        self.mark(index);
        Ok(true)
    }

    fn unblock(&mut self, dname: &Path) {
        let mut touched = Vec::new();
        for (i, task) in self.tasks.iter_mut().enumerate() {
            let before = task.deps.len();
            task.deps.retain(|dep| dep.as_path() != dname);
            if task.deps.len() != before {
                touched.push(i);
            }
        }
        for i in touched {
            self.mark(i);
        }
    }

    fn cascade(&mut self, dname: &Path, t: Time) {
        let canceled = cancel_dependents(&mut self.tasks, dname, t);
        if !canceled.is_empty() {
            info!("Canceled {} tasks depending on {}", canceled.len(), dname.display());
        }
        for i in canceled {
            self.mark(i);
        }
    }

    /// Repair what no signal reported.
    ///
    /// Running tasks past `tmax` become TIMEOUT when the backend says so or
    /// the grace window has passed; queued tasks waiting on a failed task
    /// are canceled; FAILED tasks without an error read their error file
    /// and become MEMORY on an out-of-memory signature. Running it twice in
    /// a row changes nothing the second time. Returns the number of tasks
    /// changed.
    pub async fn check(&mut self) -> Result<usize> {
        self.require_lock()?;
        let now = Utc::now();
        let grace = i64::try_from(self.config.timeout_grace_secs).unwrap_or(i64::MAX);
        let mut changed = 0;

        for index in 0..self.tasks.len() {
            let task = &self.tasks[index];
            let (TaskState::Running, Some(start)) = (task.state, task.trunning) else {
                continue;
            };
            let tmax = i64::try_from(task.resources.tmax).unwrap_or(i64::MAX);
            let overdue = (now - start).num_seconds().saturating_sub(tmax);
            if overdue <= 0 {
                continue;
            }
            if overdue > grace || self.scheduler.has_timed_out(task).await? {
                warn!("{} ran past its limit, marking it TIMEOUT", task);
                let dname = task.dname.clone();
                let t = start + Duration::seconds(tmax);
                self.tasks[index].state = TaskState::Timeout;
                self.tasks[index].tstop = Some(t);
                self.mark(index);
                self.cascade(&dname, t);
                changed += 1;
            }
        }

        let failed: HashSet<PathBuf> = self
            .tasks
            .iter()
            .filter(|task| task.state.is_failed_family())
            .map(|task| task.dname.clone())
            .collect();
        let stuck: Vec<usize> = self
            .tasks
            .iter()
            .enumerate()
            .filter(|(_, task)| task.state == TaskState::Queued && task.deps.iter().any(|d| failed.contains(d)))
            .map(|(i, _)| i)
            .collect();
        for index in stuck {
            if self.tasks[index].state != TaskState::Queued {
                continue;
            }
            warn!("{} waits on a failed task, canceling it", self.tasks[index]);
            if let Err(e) = self.scheduler.cancel(&self.tasks[index]).await {
                warn!("Could not cancel {}: {}", self.tasks[index], e);
            }
            let dname = self.tasks[index].dname.clone();
            self.tasks[index].state = TaskState::Canceled;
            self.tasks[index].tstop = Some(now);
            self.mark(index);
            self.cascade(&dname, now);
            changed += 1;
        }

        for index in 0..self.tasks.len() {
            if self.tasks[index].state != TaskState::Failed || !self.tasks[index].error.is_empty() {
                continue;
            }
            let path = self.scheduler.error_file(&self.tasks[index]);
            let oom = self.tasks[index].read_error(&path)?;
            if oom {
                info!("{} ran out of memory", self.tasks[index]);
                self.tasks[index].state = TaskState::Memory;
                self.tasks[index].remove_failed_file()?;
            }
            if oom || !self.tasks[index].error.is_empty() {
                self.mark(index);
                changed += 1;
            }
        }

        if changed > 0 {
            debug!("Check changed {} tasks", changed);
        }
        Ok(changed)
    }

    /// Retry TIMEOUT and MEMORY tasks that have restarts left, then apply the
    /// disk quota.
    ///
    /// Each retry is a new task with escalated resources and one restart
    /// less; the CANCELED tasks downstream of it are resubmitted with it.
    /// A task whose request is already at the limit keeps its budget and
    /// stays where it is.
    pub async fn kick(&mut self) -> Result<SubmitReport> {
        self.require_lock()?;
        let retry: Vec<usize> = self
            .tasks
            .iter()
            .enumerate()
            .filter(|(_, task)| matches!(task.state, TaskState::Timeout | TaskState::Memory) && task.restart > 0)
            .map(|(i, _)| i)
            .collect();

        let mut report = SubmitReport::default();
        if !retry.is_empty() {
            let pool = &self.config.scheduler.nodes;
            let mut fresh = Vec::new();
            let mut retried = Vec::new();
            for &index in &retry {
                let task = &self.tasks[index];
                let resources = task.resources.bigger(task.state, pool);
                if resources == task.resources {
                    warn!("{} ({}) cannot get more than {}, not restarting it", task, task.state, resources);
                    continue;
                }
                info!("Restarting {} ({}) with {}", task, task.state, resources);
                let mut copy = task.fresh_copy(resources);
                copy.restart = task.restart - 1;
                fresh.push(copy);
                retried.push(index);
            }
            for index in find_depending(&self.tasks, &retried) {
                let task = &self.tasks[index];
                if !retried.contains(&index) && task.state == TaskState::Canceled {
                    fresh.push(task.fresh_copy(task.resources.clone()));
                }
            }
            report = self.submit(fresh, true, None).await?;
        }

        self.hold_or_release().await?;
        Ok(report)
    }

    /// Hold or release queued tasks to keep disk usage under the quota.
    ///
    /// Over quota, the most recently queued tasks are held first; under
    /// quota, held tasks are released oldest first while they fit.
    pub async fn hold_or_release(&mut self) -> Result<()> {
        self.require_lock()?;
        let Some(quota) = self.config.maximum_diskspace else {
            return Ok(());
        };
        let mut usage: u64 = self
            .tasks
            .iter()
            .filter(|task| QUOTA_STATES.contains(&task.state))
            .map(|task| task.diskspace)
            .sum();

        if usage > quota {
            let mut queued: Vec<usize> = (0..self.tasks.len())
                .filter(|&i| self.tasks[i].state == TaskState::Queued && self.tasks[i].diskspace > 0)
                .collect();
            queued.sort_by_key(|&i| std::cmp::Reverse((self.tasks[i].tqueued, self.tasks[i].id)));
            for index in queued {
                if usage <= quota {
                    break;
                }
                if !self.options.dry_run {
                    self.scheduler.hold(&self.tasks[index]).await?;
                }
                info!("Holding {} (disk usage {} > {})", self.tasks[index], usage, quota);
                usage -= self.tasks[index].diskspace;
                self.tasks[index].state = TaskState::Hold;
                self.mark(index);
            }
        } else {
            let mut held: Vec<usize> = (0..self.tasks.len())
                .filter(|&i| self.tasks[i].state == TaskState::Hold)
                .collect();
            held.sort_by_key(|&i| (self.tasks[i].tqueued, self.tasks[i].id));
            for index in held {
                let need = self.tasks[index].diskspace;
                if usage + need > quota {
                    continue;
                }
                if !self.options.dry_run {
                    self.scheduler.release_hold(&self.tasks[index]).await?;
                }
                info!("Releasing {}", self.tasks[index]);
                usage += need;
                self.tasks[index].state = TaskState::Queued;
                self.mark(index);
            }
        }
        Ok(())
    }
}
