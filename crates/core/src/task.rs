//! Task model - one job in the queue.

use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};

use crate::command::Command;
use crate::error::Result;
use crate::id::TaskId;
use crate::resources::Resources;
use crate::state::TaskState;
use crate::Time;

/// Lines that mark an out-of-memory failure in an error file.
pub const OOM_SIGNATURES: [&str; 5] = [
    "MemoryError",
    "malloc",
    "oom-kill",
    "out of memory",
    "memory limit at some point.",
];

/// A job: a command run in a folder with a resource request.
///
/// Dependencies are matched by `dname` (folder joined with the short
/// command name) because backend ids only exist after submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Backend id (0 until submitted)
    #[serde(default)]
    pub id: TaskId,

    /// What to run
    pub cmd: Command,

    /// Working directory
    pub folder: PathBuf,

    /// Dependency key
    pub dname: PathBuf,

    /// Outstanding dependencies (dnames)
    #[serde(default)]
    pub deps: Vec<PathBuf>,

    /// Backend ids of resolved dependencies, filled right before submission
    #[serde(skip)]
    pub dtasks: Vec<TaskId>,

    /// Resource request
    pub resources: Resources,

    /// Reserved disk space (arbitrary units)
    #[serde(default)]
    pub diskspace: u64,

    /// Remaining automatic restarts
    #[serde(default)]
    pub restart: u32,

    /// Subject to skip-if-done and dedup rules
    #[serde(default)]
    pub workflow: bool,

    /// Files whose existence means the task is done
    #[serde(default)]
    pub creates: Vec<String>,

    /// Current state
    pub state: TaskState,

    /// When the backend accepted the task
    #[serde(default)]
    pub tqueued: Option<Time>,

    /// When it started running
    #[serde(default)]
    pub trunning: Option<Time>,

    /// When it stopped
    #[serde(default)]
    pub tstop: Option<Time>,

    /// Peak memory in bytes
    #[serde(default)]
    pub memory_usage: u64,

    /// Last error line
    #[serde(default)]
    pub error: String,

    /// Virtual-environment activation script sourced before running
    #[serde(default)]
    pub activation_script: Option<PathBuf>,
}

/// Flattened, printable view of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskRow {
    /// Id
    pub id: String,
    /// Folder
    pub folder: String,
    /// Command name
    pub name: String,
    /// Arguments
    pub args: String,
    /// Restarts, dependencies and disk flags
    pub info: String,
    /// Resources
    pub resources: String,
    /// Time since queued
    pub age: String,
    /// State
    pub state: String,
    /// Running time
    pub time: String,
    /// Error
    pub error: String,
}

impl Task {
    /// Create an unsubmitted task running `cmd` in `folder`.
    pub fn new(cmd: Command, folder: impl Into<PathBuf>) -> Self {
        let folder = normalize_path(&folder.into());
        let dname = folder.join(cmd.short_name());
        Self {
            id: TaskId::UNSUBMITTED,
            cmd,
            folder,
            dname,
            deps: Vec::new(),
            dtasks: Vec::new(),
            resources: Resources::default(),
            diskspace: 0,
            restart: 0,
            workflow: false,
            creates: Vec::new(),
            state: TaskState::Queued,
            tqueued: None,
            trunning: None,
            tstop: None,
            memory_usage: 0,
            error: String::new(),
            activation_script: None,
        }
    }

    /// Add dependencies; relative names are resolved against the folder.
    pub fn with_deps<P: AsRef<Path>>(mut self, deps: impl IntoIterator<Item = P>) -> Self {
        for dep in deps {
            let dname = normalize_path(&self.folder.join(dep.as_ref()));
            if !self.deps.contains(&dname) {
                self.deps.push(dname);
            }
        }
        self
    }

    /// Set the resource request.
    pub fn with_resources(mut self, resources: Resources) -> Self {
        self.resources = resources;
        self
    }

    /// Set the restart budget.
    pub fn with_restart(mut self, restart: u32) -> Self {
        self.restart = restart;
        self
    }

    /// Mark as a workflow task.
    pub fn with_workflow(mut self, workflow: bool) -> Self {
        self.workflow = workflow;
        self
    }

    /// Set reserved disk space.
    pub fn with_diskspace(mut self, diskspace: u64) -> Self {
        self.diskspace = diskspace;
        self
    }

    /// Set files whose existence means the task is done.
    pub fn with_creates(mut self, creates: Vec<String>) -> Self {
        self.creates = creates;
        self
    }

    /// Short name (command name plus arguments).
    pub fn name(&self) -> String {
        self.cmd.short_name()
    }

    /// A fresh, unsubmitted copy with the same identity and settings.
    pub fn fresh_copy(&self, resources: Resources) -> Task {
        let mut task = Task::new(self.cmd.clone(), self.folder.clone())
            .with_resources(resources)
            .with_restart(self.restart)
            .with_workflow(self.workflow)
            .with_diskspace(self.diskspace)
            .with_creates(self.creates.clone());
        task.deps = self.deps.clone();
        task.dname = self.dname.clone();
        task
    }

    fn done_file(&self) -> PathBuf {
        self.folder.join(format!("{}.done", self.name()))
    }

    fn failed_file(&self) -> PathBuf {
        self.folder.join(format!("{}.FAILED", self.name()))
    }

    /// Workflow check: the done file or every `creates` file exists.
    pub fn is_done(&self) -> bool {
        if self.done_file().is_file() {
            return true;
        }
        !self.creates.is_empty() && self.creates.iter().all(|f| self.folder.join(f).exists())
    }

    /// Workflow check: the FAILED file exists.
    pub fn has_failed(&self) -> bool {
        self.failed_file().is_file()
    }

    /// Write `<name>.done` for workflow tasks.
    pub fn write_done_file(&self) -> Result<()> {
        if self.workflow && self.folder.is_dir() {
            std::fs::write(self.done_file(), "")?;
        }
        Ok(())
    }

    /// Write `<name>.FAILED` (holding the error text) for workflow tasks.
    pub fn write_failed_file(&self) -> Result<()> {
        if self.workflow && self.folder.is_dir() {
            std::fs::write(self.failed_file(), format!("{}\n", self.error))?;
        }
        Ok(())
    }

    /// Remove `<name>.FAILED` if present.
    pub fn remove_failed_file(&self) -> Result<()> {
        match std::fs::remove_file(self.failed_file()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Pick the last error-like line of an error file into `error`.
    ///
    /// Returns whether the file carries an out-of-memory signature. A
    /// missing file leaves the task untouched; bytes that are not UTF-8 are
    /// replaced.
    pub fn read_error(&mut self, path: &Path) -> Result<bool> {
        let text = match std::fs::read(path) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        let lines: Vec<&str> = text.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
        let oom = lines
            .iter()
            .any(|line| OOM_SIGNATURES.iter().any(|sig| line.contains(sig)));

        let error_like = |line: &&&str| {
            let lower = line.to_lowercase();
            lower.contains("error") || lower.contains("killed") || lower.contains("oom")
        };
        let line = lines
            .iter()
            .rev()
            .find(error_like)
            .or_else(|| lines.last())
            .copied()
            .unwrap_or("");

        self.error = line.chars().take(200).collect();
        Ok(oom)
    }

    /// Flattened view for printing.
    pub fn row(&self, now: Time) -> TaskRow {
        let mut info = Vec::new();
        if self.restart > 0 {
            info.push(format!("*{}", self.restart));
        }
        if !self.deps.is_empty() {
            info.push(format!("d{}", self.deps.len()));
        }
        if self.diskspace > 0 {
            info.push("D".to_string());
        }

        let age = self
            .tqueued
            .map(|t| short_duration((now - t).num_seconds()))
            .unwrap_or_default();
        let time = match (self.trunning, self.tstop) {
            (Some(start), Some(stop)) => short_duration((stop - start).num_seconds()),
            (Some(start), None) => short_duration((now - start).num_seconds()),
            _ => String::new(),
        };

        TaskRow {
            id: self.id.to_string(),
            folder: self.folder.display().to_string(),
            name: self.cmd.name.clone(),
            args: self.cmd.args.join(" "),
            info: info.join(","),
            resources: self.resources.to_string(),
            age,
            state: self.state.to_string(),
            time,
            error: self.error.clone(),
        }
    }

    /// Copy with folder, dname, deps and activation script made relative to `root`.
    pub fn strip_root(&self, root: &Path) -> Task {
        let mut task = self.clone();
        task.folder = relative_to(&self.folder, root);
        task.dname = relative_to(&self.dname, root);
        task.deps = self.deps.iter().map(|d| relative_to(d, root)).collect();
        task.activation_script = self.activation_script.as_deref().map(|p| relative_to(p, root));
        task
    }

    /// Inverse of [`Task::strip_root`].
    pub fn join_root(mut self, root: &Path) -> Task {
        self.folder = normalize_path(&root.join(&self.folder));
        self.dname = normalize_path(&root.join(&self.dname));
        self.deps = self.deps.iter().map(|d| normalize_path(&root.join(d))).collect();
        self.activation_script = self
            .activation_script
            .map(|p| normalize_path(&root.join(p)));
        self
    }
}

impl std::fmt::Display for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.dname.display(), self.id)
    }
}

/// Lexically resolve `.` and `..` components.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

fn relative_to(path: &Path, root: &Path) -> PathBuf {
    match path.strip_prefix(root) {
        Ok(rel) if rel.as_os_str().is_empty() => PathBuf::from("."),
        Ok(rel) => rel.to_path_buf(),
        Err(_) => path.to_path_buf(),
    }
}

fn short_duration(seconds: i64) -> String {
    let seconds = seconds.max(0) as u64;
    if seconds < 100 {
        format!("{seconds}s")
    } else if seconds < 6000 {
        format!("{}m", seconds / 60)
    } else if seconds < 360_000 {
        format!("{}h", seconds / 3600)
    } else {
        format!("{}d", seconds / 86400)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn task(folder: &Path, cmd: &str) -> Task {
        Task::new(Command::parse(cmd, vec![], None).unwrap(), folder)
    }

    #[test]
    fn test_dname_and_deps() {
        let t = task(Path::new("/w/a"), "relax.py+Cu").with_deps(["../b/prep.py", "/w/a/./x.py"]);
        assert_eq!(t.dname, PathBuf::from("/w/a/relax.py+Cu"));
        assert_eq!(t.deps, vec![PathBuf::from("/w/b/prep.py"), PathBuf::from("/w/a/x.py")]);
    }

    #[test]
    fn test_workflow_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = task(dir.path(), "a.py").with_workflow(true);
        assert!(!t.is_done());
        t.write_done_file().unwrap();
        assert!(t.is_done());

        t.error = "boom".to_string();
        t.write_failed_file().unwrap();
        assert!(t.has_failed());
        t.remove_failed_file().unwrap();
        assert!(!t.has_failed());
        t.remove_failed_file().unwrap();
    }

    #[test]
    fn test_creates_means_done() {
        let dir = tempfile::tempdir().unwrap();
        let t = task(dir.path(), "a.py").with_creates(vec!["out.txt".to_string()]);
        assert!(!t.is_done());
        std::fs::write(dir.path().join("out.txt"), "x").unwrap();
        assert!(t.is_done());
    }

    #[test]
    fn test_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.err");
        std::fs::write(&path, "Traceback\n  File x\nMemoryError: cannot allocate\n\n").unwrap();
        let mut t = task(dir.path(), "a.py");
        assert!(t.read_error(&path).unwrap());
        assert_eq!(t.error, "MemoryError: cannot allocate");

        std::fs::write(&path, "ValueError: bad input\nsome trailing output\n").unwrap();
        assert!(!t.read_error(&path).unwrap());
        assert_eq!(t.error, "ValueError: bad input");

        let mut untouched = task(dir.path(), "b.py");
        assert!(!untouched.read_error(&dir.path().join("missing")).unwrap());
        assert!(untouched.error.is_empty());
    }

    #[test]
    fn test_read_error_with_binary_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.err");
        std::fs::write(&path, b"\xff\xfe\x00garbage\nSegfault error in solver\n").unwrap();
        let mut t = task(dir.path(), "c.py");
        assert!(!t.read_error(&path).unwrap());
        assert_eq!(t.error, "Segfault error in solver");
    }

    #[test]
    fn test_root_round_trip() {
        let root = Path::new("/w");
        let t = task(Path::new("/w"), "a.py").with_deps(["sub/b.py"]);
        let rel = t.strip_root(root);
        assert_eq!(rel.folder, PathBuf::from("."));
        assert_eq!(rel.deps, vec![PathBuf::from("sub/b.py")]);
        assert_eq!(rel.join_root(root), t);
    }

    #[test]
    fn test_row() {
        let now = Utc::now();
        let mut t = task(Path::new("/w"), "a.py").with_restart(2).with_deps(["b.py"]);
        t.id = TaskId::new(7);
        t.tqueued = Some(now - Duration::seconds(30));
        t.trunning = Some(now - Duration::seconds(20));
        t.state = TaskState::Running;
        let row = t.row(now);
        assert_eq!(row.id, "7");
        assert_eq!(row.info, "*2,d1");
        assert_eq!(row.age, "30s");
        assert_eq!(row.time, "20s");
        assert_eq!(row.state, "running");
    }

    #[test]
    fn test_fresh_copy_keeps_identity() {
        let mut t = task(Path::new("/w"), "a.py").with_restart(1);
        t.id = TaskId::new(3);
        t.state = TaskState::Timeout;
        t.error = "x".to_string();
        let copy = t.fresh_copy(t.resources.bigger(TaskState::Timeout, &[]));
        assert_eq!(copy.dname, t.dname);
        assert_eq!(copy.id, TaskId::UNSUBMITTED);
        assert!(copy.error.is_empty());
        assert_eq!(copy.resources.tmax, 1200);
    }
}
