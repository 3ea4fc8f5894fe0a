//! batchq CLI - submit and track jobs on a batch system.

use anyhow::{bail, Result};
use batchq_core::{normalize_path, Command, Resources, Selection, Task, TaskId, TaskRow, TaskState};
use batchq_execution::{Backend, Scheduler, SchedulerKind};
use batchq_queue::{find_root, OpenOptions, Queue, QueueConfig, SubmitReport};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Pause between polls while waiting on a batch system.
const POLL_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "bq")]
#[command(about = "Job queue for PBS, Slurm, LSF or the local machine", long_about = None)]
struct Cli {
    /// More logging (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a queue in the current folder
    Init {
        /// Backend: local, pbs, slurm or lsf
        #[arg(long, default_value = "local")]
        scheduler: SchedulerKind,
        /// Queue or partition to submit to
        #[arg(long)]
        queue: Option<String>,
        /// Ask the backend for its node classes
        #[arg(long)]
        discover: bool,
    },
    /// List tasks
    #[command(alias = "ls")]
    List {
        #[command(flatten)]
        select: SelectArgs,
        /// Read the event log instead of the current queue
        #[arg(long)]
        log: bool,
    },
    /// Submit a task in one or more folders
    Submit {
        /// Command, e.g. `relax.py`, `module@func`, `shell:make all` or `run.sh arg`
        command: String,
        /// Folders to run in (default: current folder)
        folders: Vec<PathBuf>,
        #[command(flatten)]
        submit: SubmitArgs,
    },
    /// Submit fresh copies of finished tasks
    Resubmit {
        #[command(flatten)]
        select: SelectArgs,
        /// New resources, e.g. `8:2h`
        #[arg(short = 'R', long)]
        resources: Option<Resources>,
        /// Show what would happen
        #[arg(short = 'z', long)]
        dry_run: bool,
        /// Wait until the tasks have finished
        #[arg(long)]
        wait: bool,
    },
    /// Remove tasks and everything depending on them
    #[command(alias = "rm")]
    Remove {
        #[command(flatten)]
        select: SelectArgs,
        /// Show what would happen
        #[arg(short = 'z', long)]
        dry_run: bool,
    },
    /// Change the state of tasks (hold, queued, MEMORY, TIMEOUT)
    Modify {
        /// New state, by name or letter
        state: TaskState,
        #[command(flatten)]
        select: SelectArgs,
        /// Show what would happen
        #[arg(short = 'z', long)]
        dry_run: bool,
    },
    /// Reconcile the queue with the backend
    Sync {
        /// Show what would happen
        #[arg(short = 'z', long)]
        dry_run: bool,
    },
    /// Restart timed-out and out-of-memory tasks and apply the disk quota
    Kick {
        /// Show what would happen
        #[arg(short = 'z', long)]
        dry_run: bool,
        /// Wait until restarted tasks have finished
        #[arg(long)]
        wait: bool,
    },
    /// Show everything about one task
    Info {
        /// Task id
        id: u64,
    },
    /// Run a task right here, bypassing the backend
    Run {
        /// Command
        command: String,
        /// Folders to run in (default: current folder)
        folders: Vec<PathBuf>,
        /// Show what would happen
        #[arg(short = 'z', long)]
        dry_run: bool,
    },
}

#[derive(Args)]
struct SelectArgs {
    /// Folders (default: current folder)
    folders: Vec<PathBuf>,
    /// States as letters: q h r d F T M C, a = active and done, A = failed
    #[arg(short, long)]
    states: Option<String>,
    /// Comma-separated ids
    #[arg(short, long, value_delimiter = ',')]
    id: Vec<u64>,
    /// Name pattern (`*` and `?` allowed)
    #[arg(short, long)]
    name: Option<String>,
    /// Error pattern
    #[arg(short, long)]
    error: Option<String>,
    /// Include subfolders
    #[arg(short, long)]
    recursive: bool,
}

#[derive(Args)]
struct SubmitArgs {
    /// Dependencies (names relative to each folder), comma-separated
    #[arg(short, long, value_delimiter = ',')]
    deps: Vec<String>,
    /// Resources: cores[:nodename][:processes]:tmax
    #[arg(short = 'R', long)]
    resources: Option<Resources>,
    /// Name to use instead of the command's
    #[arg(long)]
    name: Option<String>,
    /// Automatic restarts after TIMEOUT or MEMORY
    #[arg(long, default_value = "0")]
    restart: u32,
    /// Workflow task: skip if done or already queued
    #[arg(short, long)]
    workflow: bool,
    /// Submit even if it failed before
    #[arg(short, long)]
    force: bool,
    /// Submit at most this many tasks
    #[arg(long)]
    max_tasks: Option<usize>,
    /// Disk space the task will use
    #[arg(long, default_value = "0")]
    diskspace: u64,
    /// Script to source before running
    #[arg(long)]
    activation_script: Option<PathBuf>,
    /// Show what would happen
    #[arg(short = 'z', long)]
    dry_run: bool,
    /// Wait until the tasks have finished
    #[arg(long)]
    wait: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .init();

    let cwd = std::env::current_dir()?;

    match cli.command {
        Commands::Init { scheduler, queue, discover } => {
            let mut config = QueueConfig::default();
            config.scheduler.kind = scheduler;
            config.scheduler.queue_name = queue;
            if discover {
                let backend = Backend::from_config(&config.scheduler, &cwd.join(batchq_storage::STATE_DIR));
                config.scheduler.nodes = backend.get_config(config.scheduler.queue_name.as_deref()).await?;
                for node in &config.scheduler.nodes {
                    println!("{}: {} cores, {} bytes", node.name, node.cores, node.memory);
                }
            }
            config.save(&cwd).await?;
            println!("Created queue in {}", cwd.display());
        }
        Commands::List { select, log } => {
            let root = find_root(&cwd)?;
            let selection = select.build(&cwd, true)?;
            let queue = Queue::open(&root, OpenOptions::read_only()).await?;
            let now = Utc::now();
            let rows: Vec<TaskRow> = if log {
                queue.list_log(&selection).await?.iter().map(|t| t.row(now)).collect()
            } else {
                queue.list(&selection).iter().map(|t| t.row(now)).collect()
            };
            queue.close().await?;
            print_rows(&rows, &root);
        }
        Commands::Submit { command, folders, submit } => {
            let folders = absolute_folders(&cwd, &folders);
            let root = find_root(&folders[0])?;
            let tasks = submit.tasks(&command, &folders, &cwd)?;
            let mut queue = Queue::open(&root, OpenOptions::default().with_dry_run(submit.dry_run)).await?;
            let result = queue.submit(tasks, submit.force, submit.max_tasks).await;
            let ids = submitted_ids(&result);
            let report = finish(queue, result).await?;
            print_report(&report, submit.dry_run);
            wait_for(&root, ids, submit.wait).await?;
        }
        Commands::Resubmit { select, resources, dry_run, wait } => {
            let root = find_root(&cwd)?;
            let selection = select.build(&cwd, false)?;
            let mut queue = Queue::open(&root, OpenOptions::default().with_dry_run(dry_run)).await?;
            let result = queue.resubmit(&selection, resources).await;
            let ids = submitted_ids(&result);
            let report = finish(queue, result).await?;
            print_report(&report, dry_run);
            wait_for(&root, ids, wait).await?;
        }
        Commands::Remove { select, dry_run } => {
            let root = find_root(&cwd)?;
            let selection = select.build(&cwd, false)?;
            let mut queue = Queue::open(&root, OpenOptions::default().with_dry_run(dry_run)).await?;
            let result = queue.remove(&selection).await;
            queue.close().await?;
            let removed = result?;
            let verb = if dry_run { "Would remove" } else { "Removed" };
            println!("{} {} task(s)", verb, removed.len());
        }
        Commands::Modify { state, select, dry_run } => {
            let root = find_root(&cwd)?;
            let selection = select.build(&cwd, false)?;
            let mut queue = Queue::open(&root, OpenOptions::default().with_dry_run(dry_run)).await?;
            let result = queue.modify(&selection, state).await;
            queue.close().await?;
            println!("{} task(s) -> {}", result?, state);
        }
        Commands::Sync { dry_run } => {
            let root = find_root(&cwd)?;
            let mut queue = Queue::open(&root, OpenOptions::default().with_dry_run(dry_run)).await?;
            let result = queue.sync().await;
            queue.close().await?;
            println!("{} task(s) out of sync", result?);
        }
        Commands::Kick { dry_run, wait } => {
            let root = find_root(&cwd)?;
            let mut queue = Queue::open(&root, OpenOptions::default().with_dry_run(dry_run)).await?;
            let result = queue.kick().await;
            let ids = submitted_ids(&result);
            let report = finish(queue, result).await?;
            print_report(&report, dry_run);
            wait_for(&root, ids, wait).await?;
        }
        Commands::Info { id } => {
            let root = find_root(&cwd)?;
            let queue = Queue::open(&root, OpenOptions::read_only()).await?;
            let result = queue.info(TaskId::new(id)).await;
            queue.close().await?;
            let info = result?;
            let task = &info.task;
            println!("Task: {}", task.id);
            println!("  Command: {}", task.cmd);
            println!("  Folder: {}", task.folder.display());
            println!("  State: {}", task.state);
            println!("  Resources: {}", task.resources);
            println!("  Restarts left: {}", task.restart);
            for dep in &task.deps {
                println!("  Waiting for: {}", dep.display());
            }
            if task.memory_usage > 0 {
                println!("  Peak memory: {} bytes", task.memory_usage);
            }
            if !task.error.is_empty() {
                println!("  Error: {}", task.error);
            }
            if let Some(text) = info.error_text {
                println!("\n{}:\n{}", info.error_file.display(), text);
            }
        }
        Commands::Run { command, folders, dry_run } => {
            let folders = absolute_folders(&cwd, &folders);
            let root = find_root(&folders[0])?;
            let cmd = parse_command(&command, None)?;
            let tasks: Vec<Task> = folders.iter().map(|f| Task::new(cmd.clone(), f.clone())).collect();
            let mut queue = Queue::open(&root, OpenOptions::default().with_dry_run(dry_run)).await?;
            let result = queue.run(tasks).await;
            queue.close().await?;
            for (dname, state) in result? {
                println!("{}: {}", dname.display(), state);
            }
        }
    }

    Ok(())
}

impl SelectArgs {
    fn build(&self, cwd: &Path, recursive_default: bool) -> Result<Selection> {
        if !self.id.is_empty() {
            return Ok(Selection::ids(self.id.iter().copied().map(TaskId::new)));
        }
        let mut selection = Selection::default()
            .with_folders(absolute_folders(cwd, &self.folders), self.recursive || recursive_default);
        if let Some(letters) = &self.states {
            selection = selection.with_states(TaskState::parse_letters(letters)?);
        }
        if let Some(name) = &self.name {
            selection = selection.with_name(name)?;
        }
        if let Some(error) = &self.error {
            selection = selection.with_error(error)?;
        }
        Ok(selection)
    }
}

impl SubmitArgs {
    fn tasks(&self, command: &str, folders: &[PathBuf], cwd: &Path) -> Result<Vec<Task>> {
        let cmd = parse_command(command, self.name.as_deref())?;
        let resources = self.resources.clone().unwrap_or_default();
        let activation = self
            .activation_script
            .as_ref()
            .map(|p| normalize_path(&cwd.join(p)));
        Ok(folders
            .iter()
            .map(|folder| {
                let mut task = Task::new(cmd.clone(), folder.clone())
                    .with_deps(&self.deps)
                    .with_resources(resources.clone())
                    .with_restart(self.restart)
                    .with_workflow(self.workflow)
                    .with_diskspace(self.diskspace);
                task.activation_script = activation.clone();
                task
            })
            .collect())
    }
}

/// `shell:` commands keep their spaces; otherwise words after the first are arguments.
fn parse_command(command: &str, name: Option<&str>) -> Result<Command> {
    if command.trim_start().starts_with("shell:") {
        return Ok(Command::parse(command, Vec::new(), name)?);
    }
    let mut words = command.split_whitespace();
    let Some(first) = words.next() else {
        bail!("empty command");
    };
    let args = words.map(str::to_string).collect();
    Ok(Command::parse(first, args, name)?)
}

fn absolute_folders(cwd: &Path, folders: &[PathBuf]) -> Vec<PathBuf> {
    if folders.is_empty() {
        return vec![cwd.to_path_buf()];
    }
    folders.iter().map(|f| normalize_path(&cwd.join(f))).collect()
}

fn submitted_ids(result: &batchq_queue::Result<SubmitReport>) -> HashSet<TaskId> {
    match result {
        Ok(report) => report.submitted.iter().map(|t| t.id).filter(|id| id.is_submitted()).collect(),
        Err(_) => HashSet::new(),
    }
}

/// Close the session, then let the local executor drain before exiting.
async fn finish(queue: Queue, result: batchq_queue::Result<SubmitReport>) -> Result<SubmitReport> {
    let backend = queue.close().await?;
    let report = result?;
    if let Backend::Local(local) = &backend {
        if !report.submitted.is_empty() {
            info!("Running {} task(s) locally", report.submitted.len());
            local.wait_idle().await?;
        }
    }
    Ok(report)
}

/// Block until none of `ids` is active any more, then print their states.
async fn wait_for(root: &Path, ids: HashSet<TaskId>, wait: bool) -> Result<()> {
    if ids.is_empty() {
        return Ok(());
    }
    let local = QueueConfig::load(root).await?.scheduler.kind == SchedulerKind::Local;
    if !wait && !local {
        return Ok(());
    }
    loop {
        let queue = Queue::open(root, OpenOptions::default()).await?;
        let mine: Vec<&Task> = queue.tasks().iter().filter(|t| ids.contains(&t.id)).collect();
        let active = mine.iter().filter(|t| t.state.is_active()).count();
        if active == 0 || local {
            for task in &mine {
                println!("{}: {}", task.dname.strip_prefix(root).unwrap_or(&task.dname).display(), task.state);
            }
            queue.close().await?;
            return Ok(());
        }
        queue.close().await?;
        info!("{} task(s) still active", active);
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

fn print_report(report: &SubmitReport, dry_run: bool) {
    for (dname, reason) in &report.skipped {
        println!("Skipped {}: {}", dname.display(), reason);
    }
    let verb = if dry_run { "Would submit" } else { "Submitted" };
    println!("{} {} task(s)", verb, report.submitted.len());
}

fn print_rows(rows: &[TaskRow], root: &Path) {
    let table: Vec<[String; 9]> = rows
        .iter()
        .map(|r| {
            let folder = Path::new(&r.folder);
            let folder = folder.strip_prefix(root).unwrap_or(folder).display().to_string();
            [
                r.id.clone(),
                if folder.is_empty() { ".".to_string() } else { folder },
                r.name.clone(),
                r.args.clone(),
                r.info.clone(),
                r.resources.clone(),
                r.age.clone(),
                r.state.clone(),
                r.time.clone(),
            ]
        })
        .collect();
    let header = ["id", "folder", "name", "args", "info", "res.", "age", "state", "time"];
    let mut widths = header.map(str::len);
    for row in &table {
        for (w, cell) in widths.iter_mut().zip(row) {
            *w = (*w).max(cell.chars().count());
        }
    }

    let line = |cells: Vec<&str>| {
        let padded: Vec<String> = cells
            .iter()
            .zip(widths)
            .map(|(cell, w)| format!("{cell:<w$}"))
            .collect();
        padded.join(" ").trim_end().to_string()
    };
    println!("{}", line(header.to_vec()));
    for (row, source) in table.iter().zip(rows) {
        println!("{}", line(row.iter().map(String::as_str).collect()));
        if !source.error.is_empty() {
            println!("    {}", source.error);
        }
    }
    println!("{} task(s)", rows.len());
}
