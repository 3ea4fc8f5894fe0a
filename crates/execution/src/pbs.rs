//! PBS / Torque backend.

use async_trait::async_trait;
use batchq_core::{NodeClass, Task, TaskId};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{Result, SchedulerError};
use crate::runner::{run_checked, CommandRunner};
use crate::scheduler::{file_contains, Scheduler, SchedulerConfig};
use crate::script::{batch_script, format_hms, leading_id};

/// Submits through `qsub` and friends.
pub struct Pbs {
    config: SchedulerConfig,
    state_dir: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl Pbs {
    /// Create a PBS backend.
    pub fn new(config: SchedulerConfig, state_dir: &Path, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            config,
            state_dir: state_dir.to_path_buf(),
            runner,
        }
    }

    fn submit_args(&self, task: &Task) -> Result<Vec<String>> {
        let sel = task.resources.select(&self.config.nodes)?;
        let mut nodes = format!("nodes={}:ppn={}", sel.nodes, sel.cores_per_node);
        if !self.config.nodes.is_empty() && !sel.node.name.is_empty() {
            nodes.push(':');
            nodes.push_str(&sel.node.name);
        }

        let folder = task.folder.to_string_lossy().into_owned();
        let mut args = vec![
            "-N".to_string(),
            task.name(),
            "-l".to_string(),
            format!("walltime={}", format_hms(task.resources.tmax)),
            "-l".to_string(),
            nodes,
            "-o".to_string(),
            folder.clone(),
            "-e".to_string(),
            folder,
        ];
        if let Some(queue) = &self.config.queue_name {
            args.push("-q".to_string());
            args.push(queue.clone());
        }
        if !task.dtasks.is_empty() {
            let ids: Vec<String> = task.dtasks.iter().map(|id| id.to_string()).collect();
            args.push("-W".to_string());
            args.push(format!("depend=afterok:{}", ids.join(":")));
        }
        args.extend(self.config.submit_args(&sel.node));
        Ok(args)
    }
}

#[async_trait]
impl Scheduler for Pbs {
    fn name(&self) -> &'static str {
        "pbs"
    }

    async fn submit(&self, task: &mut Task, dry_run: bool) -> Result<()> {
        let args = self.submit_args(task)?;
        let script = batch_script(task, &self.config.python, &self.state_dir, "pbs", "${PBS_JOBID%%.*}");
        if dry_run {
            info!("Would run qsub {}", args.join(" "));
            return Ok(());
        }

        let out = run_checked(self.runner.as_ref(), "qsub", &args, Some(&script)).await?;
        let id = leading_id(out.trim()).ok_or_else(|| SchedulerError::Parse {
            program: "qsub".to_string(),
            output: out.clone(),
        })?;
        task.id = TaskId::new(id);
        debug!("qsub accepted {} as {}", task.dname.display(), id);
        Ok(())
    }

    async fn cancel(&self, task: &Task) -> Result<()> {
        run_checked(self.runner.as_ref(), "qdel", &[task.id.to_string()], None).await?;
        Ok(())
    }

    async fn hold(&self, task: &Task) -> Result<()> {
        run_checked(self.runner.as_ref(), "qhold", &[task.id.to_string()], None).await?;
        Ok(())
    }

    async fn release_hold(&self, task: &Task) -> Result<()> {
        run_checked(self.runner.as_ref(), "qrls", &[task.id.to_string()], None).await?;
        Ok(())
    }

    async fn get_ids(&self) -> Result<HashSet<TaskId>> {
        let args = vec!["-u".to_string(), self.config.user()];
        let out = run_checked(self.runner.as_ref(), "qstat", &args, None).await?;
        Ok(out
            .lines()
            .filter_map(|line| line.split_whitespace().next())
            .filter_map(leading_id)
            .map(TaskId::new)
            .collect())
    }

    fn error_file(&self, task: &Task) -> PathBuf {
        task.folder.join(format!("{}.e{}", task.name(), task.id))
    }

    async fn maxrss(&self, _id: TaskId) -> Result<u64> {
        Ok(0)
    }

    async fn has_timed_out(&self, task: &Task) -> Result<bool> {
        file_contains(&self.error_file(task), "walltime").await
    }

    async fn get_config(&self, _queue: Option<&str>) -> Result<Vec<NodeClass>> {
        let out = run_checked(self.runner.as_ref(), "pbsnodes", &["-a".to_string()], None).await?;
        Ok(parse_pbsnodes(&out))
    }
}

/// One node class per distinct property (or host when there is none).
fn parse_pbsnodes(text: &str) -> Vec<NodeClass> {
    let mut classes: Vec<NodeClass> = Vec::new();
    for block in text.split("\n\n") {
        let mut lines = block.lines().filter(|l| !l.trim().is_empty());
        let Some(host) = lines.next() else { continue };
        let mut name = host.trim().to_string();
        let mut cores = 0;
        let mut memory = 0;
        for line in lines {
            let Some((key, value)) = line.split_once('=') else { continue };
            let (key, value) = (key.trim(), value.trim());
            match key {
                "np" | "pcpus" | "resources_available.ncpus" => cores = value.parse().unwrap_or(0),
                "properties" => {
                    if let Some(first) = value.split(',').next().filter(|p| !p.is_empty()) {
                        name = first.to_string();
                    }
                }
                "resources_available.mem" => memory = parse_kb(value),
                "status" => {
                    if let Some(mem) = value
                        .split(',')
                        .find_map(|kv| kv.strip_prefix("physmem="))
                    {
                        memory = parse_kb(mem);
                    }
                }
                _ => {}
            }
        }
        if cores > 0 && !classes.iter().any(|c| c.name == name) {
            classes.push(NodeClass::new(name, cores, memory));
        }
    }
    classes
}

fn parse_kb(value: &str) -> u64 {
    value
        .trim()
        .trim_end_matches("kb")
        .parse::<u64>()
        .map(|kb| kb * 1024)
        .unwrap_or(0)
}
