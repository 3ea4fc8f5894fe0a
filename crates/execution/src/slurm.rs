//! Slurm backend.

use async_trait::async_trait;
use batchq_core::{NodeClass, Task, TaskId};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{Result, SchedulerError};
use crate::runner::{run_checked, CommandRunner};
use crate::scheduler::{file_contains, Scheduler, SchedulerConfig};
use crate::script::{batch_script, format_hms, leading_id};

/// Submits through `sbatch` and friends.
pub struct Slurm {
    config: SchedulerConfig,
    state_dir: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl Slurm {
    /// Create a Slurm backend.
    pub fn new(config: SchedulerConfig, state_dir: &Path, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            config,
            state_dir: state_dir.to_path_buf(),
            runner,
        }
    }

    fn submit_args(&self, task: &Task) -> Result<Vec<String>> {
        let resources = &task.resources;
        let sel = resources.select(&self.config.nodes)?;
        let name = task.name();
        let folder = task.folder.display();

        let mut args = Vec::new();
        if !self.config.nodes.is_empty() && !sel.node.name.is_empty() {
            args.push(format!("--partition={}", sel.node.name));
        } else if let Some(queue) = &self.config.queue_name {
            args.push(format!("--partition={queue}"));
        }
        args.push(format!("--job-name={name}"));
        args.push(format!("--time={}", format_hms(resources.tmax)));
        args.push(format!("--nodes={}", sel.nodes));
        args.push(format!("--ntasks={}", resources.processes.max(1)));
        if resources.processes > 0 && resources.cores > resources.processes {
            args.push(format!("--cpus-per-task={}", resources.cores / resources.processes));
        }
        args.push(format!("--output={folder}/{name}.%j.out"));
        args.push(format!("--error={folder}/{name}.%j.err"));
        if !task.dtasks.is_empty() {
            let ids: Vec<String> = task.dtasks.iter().map(|id| id.to_string()).collect();
            args.push(format!("--dependency=afterok:{}", ids.join(":")));
        }
        args.extend(self.config.submit_args(&sel.node));
        Ok(args)
    }
}

#[async_trait]
impl Scheduler for Slurm {
    fn name(&self) -> &'static str {
        "slurm"
    }

    async fn submit(&self, task: &mut Task, dry_run: bool) -> Result<()> {
        let args = self.submit_args(task)?;
        let script = batch_script(task, &self.config.python, &self.state_dir, "slurm", "$SLURM_JOB_ID");
        if dry_run {
            info!("Would run sbatch {}", args.join(" "));
            return Ok(());
        }

        let out = run_checked(self.runner.as_ref(), "sbatch", &args, Some(&script)).await?;
        let id = out
            .split_whitespace()
            .last()
            .and_then(leading_id)
            .filter(|_| out.contains("Submitted batch job"))
            .ok_or_else(|| SchedulerError::Parse {
                program: "sbatch".to_string(),
                output: out.clone(),
            })?;
        task.id = TaskId::new(id);
        debug!("sbatch accepted {} as {}", task.dname.display(), id);
        Ok(())
    }

    async fn cancel(&self, task: &Task) -> Result<()> {
        run_checked(self.runner.as_ref(), "scancel", &[task.id.to_string()], None).await?;
        Ok(())
    }

    async fn hold(&self, task: &Task) -> Result<()> {
        let args = vec!["hold".to_string(), task.id.to_string()];
        run_checked(self.runner.as_ref(), "scontrol", &args, None).await?;
        Ok(())
    }

    async fn release_hold(&self, task: &Task) -> Result<()> {
        let args = vec!["release".to_string(), task.id.to_string()];
        run_checked(self.runner.as_ref(), "scontrol", &args, None).await?;
        Ok(())
    }

    async fn get_ids(&self) -> Result<HashSet<TaskId>> {
        let args = vec![
            "--noheader".to_string(),
            "--format=%i".to_string(),
            "--user".to_string(),
            self.config.user(),
        ];
        let out = run_checked(self.runner.as_ref(), "squeue", &args, None).await?;
        Ok(out
            .lines()
            .filter_map(|line| leading_id(line.trim()))
            .map(TaskId::new)
            .collect())
    }

    fn error_file(&self, task: &Task) -> PathBuf {
        task.folder.join(format!("{}.{}.err", task.name(), task.id))
    }

    async fn maxrss(&self, id: TaskId) -> Result<u64> {
        let args = vec![
            "-j".to_string(),
            id.to_string(),
            "-o".to_string(),
            "MaxRSS".to_string(),
            "-n".to_string(),
            "-P".to_string(),
        ];
        match run_checked(self.runner.as_ref(), "sacct", &args, None).await {
            Ok(out) => Ok(out.lines().filter_map(parse_memory).max().unwrap_or(0)),
            Err(e) => {
                warn!("Could not read MaxRSS of {}: {}", id, e);
                Ok(0)
            }
        }
    }

    async fn has_timed_out(&self, task: &Task) -> Result<bool> {
        file_contains(&self.error_file(task), "DUE TO TIME LIMIT").await
    }

    async fn get_config(&self, queue: Option<&str>) -> Result<Vec<NodeClass>> {
        let mut args = vec!["--noheader".to_string(), "--format=%P %c %m".to_string()];
        if let Some(queue) = queue {
            args.push(format!("--partition={queue}"));
        }
        let out = run_checked(self.runner.as_ref(), "sinfo", &args, None).await?;
        Ok(parse_sinfo(&out))
    }
}

/// `1234K`, `2.5M`, `3G` or plain bytes.
fn parse_memory(value: &str) -> Option<u64> {
    let value = value.trim();
    let last = value.chars().last()?;
    let (number, factor) = match last.to_ascii_uppercase() {
        'K' => (&value[..value.len() - 1], 1u64 << 10),
        'M' => (&value[..value.len() - 1], 1 << 20),
        'G' => (&value[..value.len() - 1], 1 << 30),
        'T' => (&value[..value.len() - 1], 1 << 40),
        _ => (value, 1),
    };
    let number: f64 = number.parse().ok()?;
    Some((number * factor as f64) as u64)
}

/// Partition, cpus per node, memory in MB.
fn parse_sinfo(text: &str) -> Vec<NodeClass> {
    let mut classes: Vec<NodeClass> = Vec::new();
    for line in text.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let [partition, cpus, memory] = fields[..] else { continue };
        let name = partition.trim_end_matches('*');
        let Ok(cores) = cpus.trim_end_matches('+').parse::<u32>() else { continue };
        let memory = memory
            .trim_end_matches('+')
            .parse::<u64>()
            .map(|mb| mb << 20)
            .unwrap_or(0);
        if !classes.iter().any(|c| c.name == name && c.cores == cores) {
            classes.push(NodeClass::new(name, cores, memory));
        }
    }
    classes
}
