//! Local backend - an in-process executor.
//!
//! A runner task owns the job table and answers requests sent over an mpsc
//! channel. At most one job runs at a time (a size-1 semaphore guards the
//! slot). Every launched job gets a worker task running `sh -c` in the
//! job's folder and a timer task that sends the worker a stop message once
//! the wall-clock limit has passed. Outcomes are reported through the same
//! marker files the batch systems use.
//!
//! Each executor lists its queued and running ids in
//! `local.<pid>.<n>.jobs` so that other processes sharing the state
//! directory see them as active.

use async_trait::async_trait;
use batchq_core::{NodeClass, Outcome, Task, TaskId, TaskState};
use batchq_storage::write_marker;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{Result, SchedulerError};
use crate::scheduler::Scheduler;
use crate::script::task_command;

/// File holding the next local job id.
const ID_FILE: &str = "local.next_id";

/// Suffix of the per-executor job lists.
const JOBS_SUFFIX: &str = ".jobs";

/// Executors started by this process, for unique job-list names.
static EXECUTORS: AtomicU64 = AtomicU64::new(0);

/// A job as seen by the runner.
#[derive(Debug, Clone)]
struct Job {
    id: TaskId,
    name: String,
    folder: PathBuf,
    command: String,
    tmax: Duration,
    deps: Vec<TaskId>,
    held: bool,
}

/// Requests handled by the runner task.
enum Request {
    Submit {
        job: Job,
        reply: oneshot::Sender<()>,
    },
    Cancel {
        id: TaskId,
        reply: oneshot::Sender<()>,
    },
    Hold {
        id: TaskId,
        held: bool,
        reply: oneshot::Sender<bool>,
    },
    List {
        reply: oneshot::Sender<HashSet<TaskId>>,
    },
    WaitIdle {
        reply: oneshot::Sender<()>,
    },
}

/// Message telling a worker to kill its child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    Timeout,
    Cancel,
}

/// How a job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobOutcome {
    Done,
    Failed,
    Timeout,
    Canceled,
}

struct Finished {
    id: TaskId,
    outcome: JobOutcome,
}

struct RunningJob {
    id: TaskId,
    stop: mpsc::Sender<Stop>,
    timer: JoinHandle<()>,
}

/// Executes tasks on this machine, one at a time.
pub struct LocalScheduler {
    requests: mpsc::Sender<Request>,
    state_dir: PathBuf,
    python: String,
}

impl LocalScheduler {
    /// Start the runner task. Must be called inside a tokio runtime.
    pub fn new(state_dir: &Path, python: &str) -> Self {
        let (requests, rx) = mpsc::channel(64);
        let jobs_file = state_dir.join(format!(
            "local.{}.{}{}",
            std::process::id(),
            EXECUTORS.fetch_add(1, Ordering::Relaxed),
            JOBS_SUFFIX
        ));
        let runner = Runner::new(state_dir.to_path_buf(), jobs_file);
        tokio::spawn(runner.run(rx));
        Self {
            requests,
            state_dir: state_dir.to_path_buf(),
            python: python.to_string(),
        }
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Request) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(make(tx))
            .await
            .map_err(|_| SchedulerError::ExecutorGone)?;
        rx.await.map_err(|_| SchedulerError::ExecutorGone)
    }

    /// Wait until nothing is running and nothing runnable is left.
    pub async fn wait_idle(&self) -> Result<()> {
        self.call(|reply| Request::WaitIdle { reply }).await
    }

    async fn next_id(&self) -> Result<TaskId> {
        let path = self.state_dir.join(ID_FILE);
        let id = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text.trim().parse::<u64>().unwrap_or(1).max(1),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 1,
            Err(e) => return Err(e.into()),
        };
        tokio::fs::write(&path, format!("{}\n", id + 1)).await?;
        Ok(TaskId::new(id))
    }
}

#[async_trait]
impl Scheduler for LocalScheduler {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn submit(&self, task: &mut Task, dry_run: bool) -> Result<()> {
        if !task.folder.is_dir() {
            return Err(SchedulerError::MissingFolder(task.folder.clone()));
        }
        if dry_run {
            info!("Would run {} in {}", task.name(), task.folder.display());
            return Ok(());
        }

        let id = self.next_id().await?;
        let job = Job {
            id,
            name: task.name(),
            folder: task.folder.clone(),
            command: task_command(task, &self.python),
            tmax: Duration::from_secs(task.resources.tmax),
            deps: task.dtasks.clone(),
            held: false,
        };
        self.call(|reply| Request::Submit { job, reply }).await?;
        task.id = id;
        Ok(())
    }

    async fn cancel(&self, task: &Task) -> Result<()> {
        let id = task.id;
        self.call(|reply| Request::Cancel { id, reply }).await
    }

    async fn hold(&self, task: &Task) -> Result<()> {
        let id = task.id;
        if !self.call(|reply| Request::Hold { id, held: true, reply }).await? {
            warn!("Local job {} is not queued, cannot hold it", id);
        }
        Ok(())
    }

    async fn release_hold(&self, task: &Task) -> Result<()> {
        let id = task.id;
        if !self.call(|reply| Request::Hold { id, held: false, reply }).await? {
            warn!("Local job {} is not queued, cannot release it", id);
        }
        Ok(())
    }

    /// Jobs of this executor plus those published by every live executor
    /// sharing the state directory.
    async fn get_ids(&self) -> Result<HashSet<TaskId>> {
        let mut ids = self.call(|reply| Request::List { reply }).await?;
        ids.extend(published_ids(&self.state_dir).await?);
        Ok(ids)
    }

    fn error_file(&self, task: &Task) -> PathBuf {
        task.folder.join(format!("{}.{}.err", task.name(), task.id))
    }

    async fn maxrss(&self, _id: TaskId) -> Result<u64> {
        Ok(0)
    }

    async fn has_timed_out(&self, _task: &Task) -> Result<bool> {
        Ok(false)
    }

    async fn get_config(&self, _queue: Option<&str>) -> Result<Vec<NodeClass>> {
        let cores = std::thread::available_parallelism().map(|n| n.get() as u32).unwrap_or(1);
        Ok(vec![NodeClass::new("local", cores, 0)])
    }
}

/// Owner of the job table.
struct Runner {
    state_dir: PathBuf,
    jobs_file: PathBuf,
    published: HashSet<TaskId>,
    queue: Vec<Job>,
    running: Option<RunningJob>,
    finished: HashMap<TaskId, bool>,
    slot: Arc<Semaphore>,
    idle_waiters: Vec<oneshot::Sender<()>>,
}

impl Runner {
    fn new(state_dir: PathBuf, jobs_file: PathBuf) -> Self {
        Self {
            state_dir,
            jobs_file,
            published: HashSet::new(),
            queue: Vec::new(),
            running: None,
            finished: HashMap::new(),
            slot: Arc::new(Semaphore::new(1)),
            idle_waiters: Vec::new(),
        }
    }

    async fn run(mut self, mut requests: mpsc::Receiver<Request>) {
        let (done_tx, mut done_rx) = mpsc::channel::<Finished>(8);
        let mut open = true;
        loop {
            self.drop_doomed();
            self.launch_next(&done_tx);
            self.publish();
            if self.is_idle() {
                for waiter in self.idle_waiters.drain(..) {
                    let _ = waiter.send(());
                }
                if !open {
                    debug!("Local executor idle and detached, stopping");
                    self.queue.clear();
                    self.publish();
                    break;
                }
            }

            tokio::select! {
                request = requests.recv(), if open => match request {
                    Some(request) => self.handle(request),
                    None => open = false,
                },
                Some(finished) = done_rx.recv() => self.finish(finished),
            }
        }
    }

    fn handle(&mut self, request: Request) {
        match request {
            Request::Submit { job, reply } => {
                debug!("Queued local job {} ({})", job.id, job.name);
                self.queue.push(job);
                self.publish();
                let _ = reply.send(());
            }
            Request::Cancel { id, reply } => {
                match &self.running {
                    Some(running) if running.id == id => {
                        let _ = running.stop.try_send(Stop::Cancel);
                    }
                    _ => {
                        self.queue.retain(|job| job.id != id);
                        self.finished.insert(id, false);
                    }
                }
                let _ = reply.send(());
            }
            Request::Hold { id, held, reply } => {
                let found = self.queue.iter_mut().find(|job| job.id == id);
                let ok = match found {
                    Some(job) => {
                        job.held = held;
                        true
                    }
                    None => false,
                };
                let _ = reply.send(ok);
            }
            Request::List { reply } => {
                let _ = reply.send(self.active_ids());
            }
            Request::WaitIdle { reply } => self.idle_waiters.push(reply),
        }
    }

    fn active_ids(&self) -> HashSet<TaskId> {
        let mut ids: HashSet<TaskId> = self.queue.iter().map(|job| job.id).collect();
        ids.extend(self.running.as_ref().map(|r| r.id));
        ids
    }

    /// Rewrite the job list when the active set changed; drop it when empty.
    fn publish(&mut self) {
        let active = self.active_ids();
        if active == self.published {
            return;
        }
        let result = if active.is_empty() {
            match std::fs::remove_file(&self.jobs_file) {
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                other => other,
            }
        } else {
            let mut ids: Vec<u64> = active.iter().map(|id| id.get()).collect();
            ids.sort_unstable();
            let text: String = ids.iter().map(|id| format!("{id}\n")).collect();
            std::fs::write(&self.jobs_file, text)
        };
        match result {
            Ok(()) => self.published = active,
            Err(e) => warn!("Could not update {}: {}", self.jobs_file.display(), e),
        }
    }

    fn finish(&mut self, finished: Finished) {
        info!("Local job {} finished: {:?}", finished.id, finished.outcome);
        if let Some(running) = self.running.take() {
            running.timer.abort();
        }
        self.finished
            .insert(finished.id, finished.outcome == JobOutcome::Done);
    }

    fn is_known(&self, id: TaskId) -> bool {
        self.queue.iter().any(|job| job.id == id)
            || self.running.as_ref().is_some_and(|r| r.id == id)
    }

    /// Ready when every dependency finished successfully or is unknown.
    fn is_runnable(&self, job: &Job) -> bool {
        !job.held
            && job.deps.iter().all(|dep| match self.finished.get(dep) {
                Some(ok) => *ok,
                None => !self.is_known(*dep),
            })
    }

    fn drop_doomed(&mut self) {
        loop {
            let doomed: Vec<TaskId> = self
                .queue
                .iter()
                .filter(|job| job.deps.iter().any(|dep| self.finished.get(dep) == Some(&false)))
                .map(|job| job.id)
                .collect();
            if doomed.is_empty() {
                return;
            }
            for id in doomed {
                warn!("Dropping local job {}: a dependency did not succeed", id);
                self.queue.retain(|job| job.id != id);
                self.finished.insert(id, false);
            }
        }
    }

    fn is_idle(&self) -> bool {
        self.running.is_none() && !self.queue.iter().any(|job| self.is_runnable(job))
    }

    fn launch_next(&mut self, done: &mpsc::Sender<Finished>) {
        let Some(index) = self.queue.iter().position(|job| self.is_runnable(job)) else {
            return;
        };
        let Ok(permit) = self.slot.clone().try_acquire_owned() else {
            return;
        };
        let job = self.queue.remove(index);
        info!("Starting local job {} ({})", job.id, job.name);

        let (stop_tx, stop_rx) = mpsc::channel(2);
        let timer_tx = stop_tx.clone();
        let tmax = job.tmax;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(tmax).await;
            let _ = timer_tx.send(Stop::Timeout).await;
        });

        self.running = Some(RunningJob {
            id: job.id,
            stop: stop_tx,
            timer,
        });
        tokio::spawn(work(job, self.state_dir.clone(), stop_rx, permit, done.clone()));
    }
}

async fn work(
    job: Job,
    state_dir: PathBuf,
    stop: mpsc::Receiver<Stop>,
    permit: OwnedSemaphorePermit,
    done: mpsc::Sender<Finished>,
) {
    let id = job.id;
    let outcome = match execute(&job, &state_dir, stop).await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!("Local job {} could not run: {}", id, e);
            if let Err(e) = write_marker(&state_dir, "local", id, Outcome::Failed).await {
                error!("Could not write marker for {}: {}", id, e);
            }
            JobOutcome::Failed
        }
    };
    drop(permit);
    let _ = done.send(Finished { id, outcome }).await;
}

async fn execute(job: &Job, state_dir: &Path, mut stop: mpsc::Receiver<Stop>) -> Result<JobOutcome> {
    write_marker(state_dir, "local", job.id, Outcome::Started).await?;

    let out = std::fs::File::create(job.folder.join(format!("{}.{}.out", job.name, job.id)))?;
    let err = std::fs::File::create(job.folder.join(format!("{}.{}.err", job.name, job.id)))?;
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(&job.command)
        .current_dir(&job.folder)
        .stdin(Stdio::null())
        .stdout(Stdio::from(out))
        .stderr(Stdio::from(err))
        .kill_on_drop(true)
        .spawn()?;

    let outcome = tokio::select! {
        status = child.wait() => {
            if status?.success() { JobOutcome::Done } else { JobOutcome::Failed }
        }
        Some(reason) = stop.recv() => {
            if let Err(e) = child.kill().await {
                warn!("Could not kill local job {}: {}", job.id, e);
            }
            match reason {
                Stop::Timeout => JobOutcome::Timeout,
                Stop::Cancel => JobOutcome::Canceled,
            }
        }
    };

    let marker = match outcome {
        JobOutcome::Done => Some(Outcome::Done),
        JobOutcome::Failed => Some(Outcome::Failed),
        JobOutcome::Timeout => Some(Outcome::Timeout),
        JobOutcome::Canceled => None,
    };
    if let Some(marker) = marker {
        write_marker(state_dir, "local", job.id, marker).await?;
    }
    Ok(outcome)
}

/// Ids listed by the job files of live executors in `state_dir`.
///
/// Files left behind by processes that no longer exist are removed.
async fn published_ids(state_dir: &Path) -> Result<HashSet<TaskId>> {
    let mut ids = HashSet::new();
    let mut rd = match tokio::fs::read_dir(state_dir).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = rd.next_entry().await? {
        let name = entry.file_name();
        let Some(pid) = name.to_str().and_then(owner_pid) else {
            continue;
        };
        if !process_alive(pid).await {
            debug!("Removing job list of exited process {}", pid);
            if let Err(e) = tokio::fs::remove_file(entry.path()).await {
                warn!("Could not remove {}: {}", entry.path().display(), e);
            }
            continue;
        }
        let text = match tokio::fs::read_to_string(entry.path()).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        ids.extend(
            text.lines()
                .filter_map(|line| line.trim().parse::<u64>().ok())
                .map(TaskId::new),
        );
    }
    Ok(ids)
}

/// Pid encoded in a job-list name `local.<pid>.<n>.jobs`.
fn owner_pid(name: &str) -> Option<u32> {
    let rest = name.strip_prefix("local.")?.strip_suffix(JOBS_SUFFIX)?;
    rest.split('.').next()?.parse().ok()
}

async fn process_alive(pid: u32) -> bool {
    if pid == std::process::id() {
        return true;
    }
    let proc_dir = Path::new("/proc");
    if proc_dir.is_dir() {
        return proc_dir.join(pid.to_string()).exists();
    }
    Command::new("kill")
        .arg("-0")
        .arg(pid.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(true)
}

/// Run tasks one after the other in this process, without markers.
///
/// Tasks run in dependency order within the batch; a task whose dependency
/// did not finish `done` is reported as CANCELED without running.
pub async fn run_tasks(tasks: &[Task], python: &str) -> Result<Vec<(PathBuf, TaskState)>> {
    let mut results: Vec<(PathBuf, TaskState)> = Vec::new();
    let mut pending: Vec<&Task> = tasks.iter().collect();
    let in_batch: HashSet<&Path> = tasks.iter().map(|t| t.dname.as_path()).collect();

    while !pending.is_empty() {
        let state_of = |dname: &Path| results.iter().find(|(d, _)| d == dname).map(|(_, s)| *s);
        let ready = pending.iter().position(|task| {
            task.deps
                .iter()
                .filter(|dep| in_batch.contains(dep.as_path()))
                .all(|dep| state_of(dep).is_some())
        });
        let Some(index) = ready else {
            for task in pending.drain(..) {
                warn!("Not running {}: dependency cycle", task.dname.display());
                results.push((task.dname.clone(), TaskState::Canceled));
            }
            break;
        };
        let task = pending.remove(index);

        let blocked = task
            .deps
            .iter()
            .any(|dep| state_of(dep).is_some_and(|s| s != TaskState::Done));
        let state = if blocked {
            TaskState::Canceled
        } else {
            run_one(task, python).await?
        };
        info!("{}: {}", task.dname.display(), state);
        results.push((task.dname.clone(), state));
    }
    Ok(results)
}

async fn run_one(task: &Task, python: &str) -> Result<TaskState> {
    let command = task_command(task, python);
    println!("{}: {}", task.folder.display(), command);
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(&command)
        .current_dir(&task.folder)
        .kill_on_drop(true)
        .spawn()?;
    let limit = Duration::from_secs(task.resources.tmax);
    match tokio::time::timeout(limit, child.wait()).await {
        Ok(status) => Ok(if status?.success() { TaskState::Done } else { TaskState::Failed }),
        Err(_) => {
            child.kill().await?;
            Ok(TaskState::Timeout)
        }
    }
}
