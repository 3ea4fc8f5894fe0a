use async_trait::async_trait;
use batchq_core::{Command, NodeClass, Outcome, Resources, Selection, Task, TaskId, TaskState, MAX_TMAX};
use batchq_execution::{LocalScheduler, Scheduler, SchedulerError};
use batchq_queue::{OpenOptions, Queue, QueueConfig, QueueError, SkipReason};
use batchq_storage::{write_marker, JsonStorage, Storage};
use chrono::{Duration, Utc};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct MockState {
    next_id: u64,
    active: HashSet<TaskId>,
    submitted: Vec<(PathBuf, Vec<TaskId>)>,
    canceled: Vec<TaskId>,
    held: Vec<TaskId>,
    released: Vec<TaskId>,
    fail_after: Option<usize>,
    fail_cancel: Option<TaskId>,
    fail_maxrss: bool,
    timed_out: bool,
}

/// In-memory backend shared between the test and the queue.
#[derive(Clone, Default)]
struct MockScheduler {
    state: Arc<Mutex<MockState>>,
}

impl MockScheduler {
    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }
}

#[async_trait]
impl Scheduler for MockScheduler {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn submit(&self, task: &mut Task, dry_run: bool) -> batchq_execution::Result<()> {
        let mut state = self.state();
        if dry_run {
            return Ok(());
        }
        if state.fail_after == Some(state.submitted.len()) {
            return Err(SchedulerError::CommandFailed {
                program: "mock".to_string(),
                exit_code: 1,
                stderr: "queue full".to_string(),
            });
        }
        state.next_id += 1;
        task.id = TaskId::new(state.next_id);
        state.active.insert(task.id);
        state.submitted.push((task.dname.clone(), task.dtasks.clone()));
        Ok(())
    }

    async fn cancel(&self, task: &Task) -> batchq_execution::Result<()> {
        let mut state = self.state();
        if state.fail_cancel == Some(task.id) {
            return Err(SchedulerError::CommandFailed {
                program: "mock".to_string(),
                exit_code: 1,
                stderr: "unknown job".to_string(),
            });
        }
        state.active.remove(&task.id);
        state.canceled.push(task.id);
        Ok(())
    }

    async fn hold(&self, task: &Task) -> batchq_execution::Result<()> {
        self.state().held.push(task.id);
        Ok(())
    }

    async fn release_hold(&self, task: &Task) -> batchq_execution::Result<()> {
        self.state().released.push(task.id);
        Ok(())
    }

    async fn get_ids(&self) -> batchq_execution::Result<HashSet<TaskId>> {
        Ok(self.state().active.clone())
    }

    fn error_file(&self, task: &Task) -> PathBuf {
        task.folder.join(format!("{}.{}.err", task.name(), task.id))
    }

    async fn maxrss(&self, _id: TaskId) -> batchq_execution::Result<u64> {
        if self.state().fail_maxrss {
            return Err(SchedulerError::ExecutorGone);
        }
        Ok(1000)
    }

    async fn has_timed_out(&self, _task: &Task) -> batchq_execution::Result<bool> {
        Ok(self.state().timed_out)
    }

    async fn get_config(&self, _queue: Option<&str>) -> batchq_execution::Result<Vec<NodeClass>> {
        Ok(Vec::new())
    }
}

async fn open_with(root: &Path, mock: &MockScheduler, config: QueueConfig) -> Queue<MockScheduler> {
    let storage = JsonStorage::new(root).await.unwrap();
    Queue::with_parts(Box::new(storage), mock.clone(), config, OpenOptions::default())
        .await
        .unwrap()
}

async fn open(root: &Path, mock: &MockScheduler) -> Queue<MockScheduler> {
    open_with(root, mock, QueueConfig::default()).await
}

fn task(root: &Path, name: &str) -> Task {
    Task::new(Command::parse(&format!("shell:{name}"), vec![], Some(name)).unwrap(), root)
}

fn state_of(queue: &Queue<MockScheduler>, name: &str) -> TaskState {
    queue
        .tasks()
        .iter()
        .rev()
        .find(|t| t.name() == name)
        .map(|t| t.state)
        .unwrap()
}

fn id_of(queue: &Queue<MockScheduler>, name: &str) -> TaskId {
    queue.tasks().iter().rev().find(|t| t.name() == name).unwrap().id
}

/// a <- b <- c
async fn submit_chain(root: &Path, mock: &MockScheduler) -> Queue<MockScheduler> {
    let mut queue = open(root, mock).await;
    let tasks = vec![
        task(root, "c").with_deps(["b"]),
        task(root, "b").with_deps(["a"]),
        task(root, "a"),
    ];
    let report = queue.submit(tasks, false, None).await.unwrap();
    assert_eq!(report.submitted.len(), 3);
    queue
}

#[tokio::test]
async fn test_submit_orders_by_dependencies() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockScheduler::default();
    let queue = submit_chain(dir.path(), &mock).await;

    let submitted = mock.state().submitted.clone();
    let names: Vec<String> = submitted
        .iter()
        .map(|(d, _)| d.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["a", "b", "c"]);
    assert_eq!(submitted[1].1, vec![id_of(&queue, "a")]);
    assert_eq!(submitted[2].1, vec![id_of(&queue, "b")]);
    assert!(queue.tasks().iter().all(|t| t.state == TaskState::Queued && t.tqueued.is_some()));
    queue.close().await.unwrap();

    let reopened = open(dir.path(), &mock).await;
    assert_eq!(reopened.tasks().len(), 3);
    let rows = reopened.list_log(&Selection::default()).await.unwrap();
    assert_eq!(rows.len(), 3);
}

#[tokio::test]
async fn test_failure_cascades_down_the_chain() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockScheduler::default();
    let mut queue = submit_chain(dir.path(), &mock).await;

    let a = id_of(&queue, "a");
    assert!(queue.update(a, TaskState::Failed, Utc::now()).await.unwrap());
    assert_eq!(state_of(&queue, "a"), TaskState::Failed);
    assert_eq!(state_of(&queue, "b"), TaskState::Canceled);
    assert_eq!(state_of(&queue, "c"), TaskState::Canceled);
    assert!(queue.tasks().iter().all(|t| t.tstop.is_some()));
    assert_eq!(queue.tasks()[0].memory_usage, 1000);
    assert_eq!(queue.tasks()[1].memory_usage, 0);

    // A late signal for a finished task changes nothing.
    assert!(!queue.update(a, TaskState::Done, Utc::now()).await.unwrap());
    assert!(!queue.update(TaskId::new(99), TaskState::Done, Utc::now()).await.unwrap());
}

#[tokio::test]
async fn test_done_unblocks_dependents() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockScheduler::default();
    let mut queue = submit_chain(dir.path(), &mock).await;

    let a = id_of(&queue, "a");
    queue.update(a, TaskState::Running, Utc::now()).await.unwrap();
    queue.update(a, TaskState::Done, Utc::now()).await.unwrap();
    let b = queue.tasks().iter().find(|t| t.name() == "b").unwrap();
    assert!(b.deps.is_empty());
    assert_eq!(b.state, TaskState::Queued);
    let done = queue.tasks().iter().find(|t| t.name() == "a").unwrap();
    assert!(done.trunning.is_some() && done.tstop.is_some());
    assert_eq!(done.memory_usage, 1000);
}

#[tokio::test]
async fn test_markers_are_applied_on_open() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockScheduler::default();
    let queue = submit_chain(dir.path(), &mock).await;
    let (a, b) = (id_of(&queue, "a"), id_of(&queue, "b"));
    queue.close().await.unwrap();

    let state_dir = dir.path().join(".bq");
    write_marker(&state_dir, "local", a, Outcome::Started).await.unwrap();
    write_marker(&state_dir, "local", a, Outcome::Done).await.unwrap();
    write_marker(&state_dir, "local", b, Outcome::Started).await.unwrap();
    write_marker(&state_dir, "local", b, Outcome::Failed).await.unwrap();

    let queue = open(dir.path(), &mock).await;
    assert_eq!(state_of(&queue, "a"), TaskState::Done);
    assert_eq!(state_of(&queue, "b"), TaskState::Failed);
    assert_eq!(state_of(&queue, "c"), TaskState::Canceled);
    queue.close().await.unwrap();

    let leftovers: Vec<_> = std::fs::read_dir(&state_dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("local-"))
        .collect();
    assert!(leftovers.is_empty());

    // Persisted across sessions.
    let queue = open(dir.path(), &mock).await;
    assert_eq!(state_of(&queue, "c"), TaskState::Canceled);
}

fn marker_files(state_dir: &Path) -> usize {
    std::fs::read_dir(state_dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("local-"))
        .count()
}

#[tokio::test]
async fn test_failed_open_keeps_markers_for_next_session() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockScheduler::default();
    let queue = submit_chain(dir.path(), &mock).await;
    let (a, b) = (id_of(&queue, "a"), id_of(&queue, "b"));
    queue.close().await.unwrap();

    let state_dir = dir.path().join(".bq");
    write_marker(&state_dir, "local", a, Outcome::Done).await.unwrap();
    write_marker(&state_dir, "local", b, Outcome::Failed).await.unwrap();

    mock.state().fail_maxrss = true;
    let storage = JsonStorage::new(dir.path()).await.unwrap();
    let failed = Queue::with_parts(Box::new(storage), mock.clone(), QueueConfig::default(), OpenOptions::default()).await;
    assert!(matches!(failed, Err(QueueError::Scheduler(_))));
    assert_eq!(marker_files(&state_dir), 2);

    mock.state().fail_maxrss = false;
    let queue = open(dir.path(), &mock).await;
    assert_eq!(state_of(&queue, "a"), TaskState::Done);
    assert_eq!(state_of(&queue, "b"), TaskState::Failed);
    assert_eq!(state_of(&queue, "c"), TaskState::Canceled);
    assert_eq!(marker_files(&state_dir), 2);
    queue.close().await.unwrap();
    assert_eq!(marker_files(&state_dir), 0);

    let queue = open(dir.path(), &mock).await;
    assert_eq!(state_of(&queue, "a"), TaskState::Done);
    assert_eq!(state_of(&queue, "b"), TaskState::Failed);
}

#[tokio::test]
async fn test_binary_error_file_does_not_lose_signals() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockScheduler::default();
    let mut queue = open(dir.path(), &mock).await;
    queue.submit(vec![task(dir.path(), "a"), task(dir.path(), "b")], false, None).await.unwrap();
    let (a, b) = (id_of(&queue, "a"), id_of(&queue, "b"));
    queue.close().await.unwrap();

    std::fs::write(dir.path().join(format!("a.{a}.err")), b"\xff\xfe\nfatal error: bad pointer\n").unwrap();
    let state_dir = dir.path().join(".bq");
    write_marker(&state_dir, "local", a, Outcome::Failed).await.unwrap();
    write_marker(&state_dir, "local", b, Outcome::Done).await.unwrap();

    let queue = open(dir.path(), &mock).await;
    assert_eq!(state_of(&queue, "a"), TaskState::Failed);
    assert_eq!(state_of(&queue, "b"), TaskState::Done);
    let failed = queue.tasks().iter().find(|t| t.id == a).unwrap();
    assert_eq!(failed.error, "fatal error: bad pointer");
    assert!(queue.info(a).await.unwrap().error_text.unwrap().contains("bad pointer"));
    queue.close().await.unwrap();

    let queue = open(dir.path(), &mock).await;
    assert_eq!(state_of(&queue, "b"), TaskState::Done);
}

#[tokio::test]
async fn test_check_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockScheduler::default();
    let mut queue = submit_chain(dir.path(), &mock).await;

    let a = id_of(&queue, "a");
    let long_ago = Utc::now() - Duration::hours(2);
    queue.update(a, TaskState::Running, long_ago).await.unwrap();

    assert_eq!(queue.check().await.unwrap(), 1);
    assert_eq!(state_of(&queue, "a"), TaskState::Timeout);
    assert_eq!(state_of(&queue, "b"), TaskState::Canceled);
    assert_eq!(state_of(&queue, "c"), TaskState::Canceled);
    assert_eq!(queue.check().await.unwrap(), 0);
}

#[tokio::test]
async fn test_check_respects_grace_unless_backend_confirms() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockScheduler::default();
    let mut queue = open(dir.path(), &mock).await;
    queue
        .submit(vec![task(dir.path(), "slow").with_resources(Resources::new(1, 60))], false, None)
        .await
        .unwrap();
    let id = id_of(&queue, "slow");
    queue
        .update(id, TaskState::Running, Utc::now() - Duration::seconds(120))
        .await
        .unwrap();

    assert_eq!(queue.check().await.unwrap(), 0);
    assert_eq!(state_of(&queue, "slow"), TaskState::Running);

    mock.state().timed_out = true;
    assert_eq!(queue.check().await.unwrap(), 1);
    assert_eq!(state_of(&queue, "slow"), TaskState::Timeout);
}

#[tokio::test]
async fn test_check_reclassifies_out_of_memory() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockScheduler::default();
    let mut queue = open(dir.path(), &mock).await;
    queue.submit(vec![task(dir.path(), "big"), task(dir.path(), "bad")], false, None).await.unwrap();

    let big = id_of(&queue, "big");
    let bad = id_of(&queue, "bad");
    std::fs::write(dir.path().join(format!("big.{big}.err")), "step 1\nMemoryError\n").unwrap();
    std::fs::write(dir.path().join(format!("bad.{bad}.err")), "ValueError: wrong input\n").unwrap();
    queue.update(big, TaskState::Failed, Utc::now()).await.unwrap();
    queue.update(bad, TaskState::Failed, Utc::now()).await.unwrap();

    assert_eq!(queue.check().await.unwrap(), 2);
    assert_eq!(state_of(&queue, "big"), TaskState::Memory);
    assert_eq!(state_of(&queue, "bad"), TaskState::Failed);
    let bad_task = queue.tasks().iter().find(|t| t.id == bad).unwrap();
    assert_eq!(bad_task.error, "ValueError: wrong input");
    assert_eq!(queue.check().await.unwrap(), 0);
}

#[tokio::test]
async fn test_kick_escalates_and_spends_budget() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockScheduler::default();
    let mut queue = open(dir.path(), &mock).await;
    let tasks = vec![
        task(dir.path(), "sim").with_resources(Resources::new(1, 600)).with_restart(1),
        task(dir.path(), "post").with_deps(["sim"]),
    ];
    queue.submit(tasks, false, None).await.unwrap();
    let sim = id_of(&queue, "sim");
    queue.update(sim, TaskState::Timeout, Utc::now()).await.unwrap();
    assert_eq!(state_of(&queue, "post"), TaskState::Canceled);

    let report = queue.kick().await.unwrap();
    assert_eq!(report.submitted.len(), 2);
    let retried = queue.tasks().iter().find(|t| t.name() == "sim").unwrap();
    assert_ne!(retried.id, sim);
    assert_eq!(retried.resources.tmax, 1200);
    assert_eq!(retried.restart, 0);
    assert_eq!(retried.state, TaskState::Queued);
    assert_eq!(state_of(&queue, "post"), TaskState::Queued);
    assert_eq!(queue.tasks().len(), 2);

    let post = queue.tasks().iter().find(|t| t.name() == "post").unwrap();
    assert_eq!(post.deps, vec![dir.path().join("sim")]);
    let submitted = mock.state().submitted.clone();
    assert_eq!(submitted.last().unwrap().1, vec![retried.id]);

    // No budget left: a second timeout stays put.
    let new_sim = retried.id;
    queue.update(new_sim, TaskState::Timeout, Utc::now()).await.unwrap();
    assert!(queue.kick().await.unwrap().submitted.is_empty());
    assert_eq!(state_of(&queue, "sim"), TaskState::Timeout);
}

#[tokio::test]
async fn test_kick_keeps_budget_at_the_time_limit() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockScheduler::default();
    let mut queue = open(dir.path(), &mock).await;
    queue
        .submit(
            vec![task(dir.path(), "long").with_resources(Resources::new(1, MAX_TMAX)).with_restart(1)],
            false,
            None,
        )
        .await
        .unwrap();
    let id = id_of(&queue, "long");
    queue.update(id, TaskState::Timeout, Utc::now()).await.unwrap();

    assert!(queue.kick().await.unwrap().submitted.is_empty());
    let long = queue.tasks().iter().find(|t| t.name() == "long").unwrap();
    assert_eq!((long.id, long.state, long.restart), (id, TaskState::Timeout, 1));
    assert_eq!(mock.state().submitted.len(), 1);
}

#[tokio::test]
async fn test_kick_moves_memory_failures_to_bigger_nodes() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockScheduler::default();
    let mut config = QueueConfig::default();
    config.scheduler.nodes = vec![
        NodeClass::new("small", 8, 8 << 30),
        NodeClass::new("fat", 8, 64 << 30),
    ];
    let mut queue = open_with(dir.path(), &mock, config).await;
    queue
        .submit(
            vec![task(dir.path(), "fit").with_resources(Resources::new(8, 600)).with_restart(2)],
            false,
            None,
        )
        .await
        .unwrap();
    let id = id_of(&queue, "fit");
    queue.update(id, TaskState::Memory, Utc::now()).await.unwrap();

    queue.kick().await.unwrap();
    let retried = queue.tasks().iter().find(|t| t.name() == "fit").unwrap();
    assert_eq!(retried.resources.nodename, "fat");
    assert_eq!(retried.restart, 1);
}

#[tokio::test]
async fn test_hold_and_release_follow_quota() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockScheduler::default();
    let mut config = QueueConfig::default();
    config.maximum_diskspace = Some(10);
    let mut queue = open_with(dir.path(), &mock, config).await;

    for name in ["t1", "t2", "t3"] {
        queue
            .submit(vec![task(dir.path(), name).with_diskspace(4)], false, None)
            .await
            .unwrap();
    }
    queue.hold_or_release().await.unwrap();
    assert_eq!(state_of(&queue, "t3"), TaskState::Hold);
    assert_eq!(state_of(&queue, "t1"), TaskState::Queued);
    assert_eq!(state_of(&queue, "t2"), TaskState::Queued);
    assert_eq!(mock.state().held, vec![id_of(&queue, "t3")]);

    // Done tasks no longer count against the quota.
    let t1 = id_of(&queue, "t1");
    queue.update(t1, TaskState::Done, Utc::now()).await.unwrap();
    queue.hold_or_release().await.unwrap();
    assert_eq!(state_of(&queue, "t3"), TaskState::Queued);
    assert_eq!(mock.state().released, vec![id_of(&queue, "t3")]);
}

#[tokio::test]
async fn test_modify_transitions() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockScheduler::default();
    let mut queue = submit_chain(dir.path(), &mock).await;
    let a = id_of(&queue, "a");

    assert_eq!(queue.modify(&Selection::ids([a]), TaskState::Hold).await.unwrap(), 1);
    assert_eq!(state_of(&queue, "a"), TaskState::Hold);
    queue.modify(&Selection::ids([a]), TaskState::Queued).await.unwrap();
    assert_eq!(mock.state().released, vec![a]);

    let err = queue.modify(&Selection::ids([a]), TaskState::Done).await.unwrap_err();
    assert!(matches!(err, QueueError::InvalidTransition { .. }));

    queue.update(a, TaskState::Failed, Utc::now()).await.unwrap();
    queue.modify(&Selection::ids([a]), TaskState::Memory).await.unwrap();
    assert_eq!(state_of(&queue, "a"), TaskState::Memory);
}

#[tokio::test]
async fn test_remove_takes_dependents() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockScheduler::default();
    let mut queue = submit_chain(dir.path(), &mock).await;
    queue.submit(vec![task(dir.path(), "other")], false, None).await.unwrap();
    let b = id_of(&queue, "b");

    let removed = queue.remove(&Selection::ids([b])).await.unwrap();
    let names: Vec<String> = removed.iter().map(|t| t.name()).collect();
    assert_eq!(names, vec!["b", "c"]);
    assert!(removed.iter().all(|t| t.state == TaskState::Canceled));
    assert_eq!(mock.state().canceled.len(), 2);
    assert_eq!(queue.tasks().len(), 2);
    queue.close().await.unwrap();

    let queue = open(dir.path(), &mock).await;
    let log = queue.list_log(&Selection::default()).await.unwrap();
    assert!(log.iter().any(|t| t.name() == "c" && t.state == TaskState::Canceled));
}

#[tokio::test]
async fn test_remove_survives_cancel_errors() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockScheduler::default();
    let mut queue = submit_chain(dir.path(), &mock).await;
    let (b, c) = (id_of(&queue, "b"), id_of(&queue, "c"));
    mock.state().fail_cancel = Some(b);

    let removed = queue.remove(&Selection::ids([b])).await.unwrap();
    assert_eq!(removed.len(), 2);
    assert!(removed.iter().all(|t| t.state == TaskState::Canceled));
    assert_eq!(mock.state().canceled, vec![c]);
    queue.close().await.unwrap();

    let queue = open(dir.path(), &mock).await;
    let names: Vec<String> = queue.tasks().iter().map(|t| t.name()).collect();
    assert_eq!(names, vec!["a"]);
    assert_eq!(state_of(&queue, "a"), TaskState::Queued);
}

#[tokio::test]
async fn test_sync_keeps_jobs_of_another_local_executor() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let open_local = |local: LocalScheduler| async move {
        let storage = JsonStorage::new(root).await.unwrap();
        Queue::with_parts(Box::new(storage), local, QueueConfig::default(), OpenOptions::default())
            .await
            .unwrap()
    };
    let state_dir = root.join(".bq");

    let mut queue = open_local(LocalScheduler::new(&state_dir, "python3")).await;
    let nap = Task::new(Command::parse("shell:sleep 1", vec![], Some("nap")).unwrap(), root);
    queue.submit(vec![nap], false, None).await.unwrap();
    let first = queue.close().await.unwrap();

    let mut queue = open_local(LocalScheduler::new(&state_dir, "python3")).await;
    assert_eq!(queue.sync().await.unwrap(), 0);
    assert!(queue.tasks()[0].state.is_active());
    queue.close().await.unwrap();

    first.wait_idle().await.unwrap();
    let queue = open_local(LocalScheduler::new(&state_dir, "python3")).await;
    assert_eq!(queue.tasks()[0].state, TaskState::Done);
}

#[tokio::test]
async fn test_sync_repairs_drift() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockScheduler::default();
    let gone = dir.path().join("gone");
    std::fs::create_dir(&gone).unwrap();
    let mut queue = open(dir.path(), &mock).await;
    queue
        .submit(vec![task(dir.path(), "kept"), task(&gone, "lost"), task(dir.path(), "alive")], false, None)
        .await
        .unwrap();

    std::fs::remove_dir(&gone).unwrap();
    {
        let mut state = mock.state();
        state.active.clear();
        let alive = queue.tasks().iter().find(|t| t.name() == "alive").unwrap().id;
        state.active.insert(alive);
    }

    assert_eq!(queue.sync().await.unwrap(), 2);
    assert_eq!(state_of(&queue, "kept"), TaskState::Canceled);
    assert_eq!(state_of(&queue, "alive"), TaskState::Queued);
    assert!(queue.tasks().iter().all(|t| t.name() != "lost"));
}

#[tokio::test]
async fn test_workflow_filters() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockScheduler::default();
    let root = dir.path();
    std::fs::write(root.join("finished.done"), "").unwrap();
    std::fs::write(root.join("broken.FAILED"), "boom\n").unwrap();

    let mut queue = open(root, &mock).await;
    queue
        .submit(vec![task(root, "running").with_workflow(true)], false, None)
        .await
        .unwrap();

    let batch = || {
        vec![
            task(root, "finished").with_workflow(true),
            task(root, "broken").with_workflow(true),
            task(root, "running").with_workflow(true),
            task(root, "after").with_workflow(true).with_deps(["finished"]),
        ]
    };
    let report = queue.submit(batch(), false, None).await.unwrap();
    assert_eq!(report.count(&SkipReason::Done), 1);
    assert_eq!(report.count(&SkipReason::Failed), 1);
    assert_eq!(report.count(&SkipReason::InQueue(TaskState::Queued)), 1);
    assert_eq!(report.submitted.len(), 1);
    assert!(report.submitted[0].deps.is_empty());

    let report = queue.submit(batch(), true, None).await.unwrap();
    assert_eq!(report.submitted.len(), 1);
    assert_eq!(report.submitted[0].name(), "broken");
    assert!(!root.join("broken.FAILED").exists());
}

#[tokio::test]
async fn test_unusable_dependencies_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockScheduler::default();
    let root = dir.path();
    let mut queue = open(root, &mock).await;
    queue.submit(vec![task(root, "first")], false, None).await.unwrap();
    let first = id_of(&queue, "first");
    queue.update(first, TaskState::Failed, Utc::now()).await.unwrap();

    let report = queue
        .submit(
            vec![
                task(root, "x").with_deps(["first"]),
                task(root, "y").with_deps(["x"]),
                task(root, "z").with_deps(["nowhere"]),
                task(root, "p").with_deps(["q"]),
                task(root, "q").with_deps(["p"]),
                task(root, "free"),
            ],
            false,
            None,
        )
        .await
        .unwrap();

    assert_eq!(report.count(&SkipReason::DependencyFailed(root.join("first"))), 1);
    assert_eq!(report.count(&SkipReason::DependencySkipped(root.join("x"))), 1);
    assert_eq!(report.count(&SkipReason::DependencyMissing(root.join("nowhere"))), 1);
    assert_eq!(report.count(&SkipReason::Cycle), 2);
    let names: Vec<String> = report.submitted.iter().map(|t| t.name()).collect();
    assert_eq!(names, vec!["free"]);
}

#[tokio::test]
async fn test_backend_error_keeps_accepted_tasks() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockScheduler::default();
    mock.state().fail_after = Some(2);
    let mut queue = open(dir.path(), &mock).await;

    let err = queue
        .submit(
            vec![task(dir.path(), "a"), task(dir.path(), "b"), task(dir.path(), "c")],
            false,
            Some(10),
        )
        .await
        .unwrap_err();
    match err {
        QueueError::Submission { accepted, .. } => assert_eq!(accepted.len(), 2),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(queue.tasks().len(), 2);
    queue.close().await.unwrap();
    assert_eq!(open(dir.path(), &mock).await.tasks().len(), 2);
}

#[tokio::test]
async fn test_max_tasks_and_dry_run() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockScheduler::default();
    let storage = JsonStorage::new(dir.path()).await.unwrap();
    let options = OpenOptions::default().with_dry_run(true);
    let mut queue = Queue::with_parts(Box::new(storage), mock.clone(), QueueConfig::default(), options)
        .await
        .unwrap();

    let report = queue
        .submit(vec![task(dir.path(), "a"), task(dir.path(), "b")], false, Some(1))
        .await
        .unwrap();
    assert_eq!(report.submitted.len(), 1);
    assert_eq!(report.count(&SkipReason::MaxTasks), 1);
    assert!(queue.tasks().is_empty());
    assert!(mock.state().submitted.is_empty());
    queue.close().await.unwrap();
    assert!(!dir.path().join(".bq/queue.json").exists());
}

#[tokio::test]
async fn test_resubmit_with_new_resources() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockScheduler::default();
    let mut queue = open(dir.path(), &mock).await;
    queue
        .submit(vec![task(dir.path(), "job").with_workflow(true)], false, None)
        .await
        .unwrap();
    let id = id_of(&queue, "job");
    queue.update(id, TaskState::Failed, Utc::now()).await.unwrap();
    assert!(dir.path().join("job.FAILED").exists());

    let resources: Resources = "4:2h".parse().unwrap();
    let selection = Selection::default().with_states([TaskState::Failed]);
    let report = queue.resubmit(&selection, Some(resources.clone())).await.unwrap();
    assert_eq!(report.submitted.len(), 1);
    assert_eq!(queue.tasks().len(), 1);
    assert_eq!(queue.tasks()[0].resources, resources);
    assert_eq!(queue.tasks()[0].state, TaskState::Queued);
    assert!(!dir.path().join("job.FAILED").exists());
}

#[tokio::test]
async fn test_lock_excludes_second_session() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockScheduler::default();
    let first = open(dir.path(), &mock).await;

    let mut config = QueueConfig::default();
    config.lock_timeout_secs = 0;
    let storage = JsonStorage::new(dir.path()).await.unwrap();
    let blocked = Queue::with_parts(Box::new(storage), mock.clone(), config, OpenOptions::default()).await;
    assert!(matches!(
        blocked,
        Err(QueueError::Storage(batchq_storage::StorageError::LockTimeout { .. }))
    ));

    let storage = JsonStorage::new(dir.path()).await.unwrap();
    let mut reader = Queue::with_parts(Box::new(storage), mock.clone(), QueueConfig::default(), OpenOptions::read_only())
        .await
        .unwrap();
    assert!(!reader.is_locked());
    assert!(matches!(reader.sync().await, Err(QueueError::NotLocked)));
    reader.close().await.unwrap();

    first.close().await.unwrap();
    let storage = JsonStorage::new(dir.path()).await.unwrap();
    assert!(storage.try_lock().await.unwrap().is_some());
}

#[tokio::test]
async fn test_info_reads_error_file() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockScheduler::default();
    let mut queue = open(dir.path(), &mock).await;
    queue.submit(vec![task(dir.path(), "j")], false, None).await.unwrap();
    let id = id_of(&queue, "j");

    assert!(queue.info(id).await.unwrap().error_text.is_none());
    std::fs::write(dir.path().join(format!("j.{id}.err")), "oops\n").unwrap();
    let info = queue.info(id).await.unwrap();
    assert_eq!(info.error_text.as_deref(), Some("oops\n"));
    assert!(matches!(queue.info(TaskId::new(77)).await, Err(QueueError::NoSuchTask(_))));
}
