//! LSF backend.

use async_trait::async_trait;
use batchq_core::{NodeClass, Task, TaskId};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{Result, SchedulerError};
use crate::runner::{run_checked, CommandRunner};
use crate::scheduler::{file_contains, Scheduler, SchedulerConfig};
use crate::script::{batch_script, leading_id};

/// Submits through `bsub` and friends.
pub struct Lsf {
    config: SchedulerConfig,
    state_dir: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl Lsf {
    /// Create an LSF backend.
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

        let mut args = vec![
            "-J".to_string(),
            name.clone(),
            "-W".to_string(),
            resources.tmax.div_ceil(60).max(1).to_string(),
            "-n".to_string(),
            resources.cores.to_string(),
            "-R".to_string(),
            format!("span[ptile={}]", sel.cores_per_node),
        ];
        if !self.config.nodes.is_empty() && !sel.node.name.is_empty() {
            args.push("-R".to_string());
            args.push(format!("select[model=={}]", sel.node.name));
        }
        if let Some(queue) = &self.config.queue_name {
            args.push("-q".to_string());
            args.push(queue.clone());
        }
        args.push("-o".to_string());
        args.push(format!("{folder}/{name}.%J.out"));
        args.push("-e".to_string());
        args.push(format!("{folder}/{name}.%J.err"));
        if !task.dtasks.is_empty() {
            let conditions: Vec<String> = task.dtasks.iter().map(|id| format!("done({id})")).collect();
            args.push("-w".to_string());
            args.push(conditions.join("&&"));
        }
        args.extend(self.config.submit_args(&sel.node));
        Ok(args)
    }
}

#[async_trait]
impl Scheduler for Lsf {
    fn name(&self) -> &'static str {
        "lsf"
    }

    async fn submit(&self, task: &mut Task, dry_run: bool) -> Result<()> {
        let args = self.submit_args(task)?;
        let script = batch_script(task, &self.config.python, &self.state_dir, "lsf", "$LSB_JOBID");
        if dry_run {
            info!("Would run bsub {}", args.join(" "));
            return Ok(());
        }

        let out = run_checked(self.runner.as_ref(), "bsub", &args, Some(&script)).await?;
        let id = parse_submitted(&out).ok_or_else(|| SchedulerError::Parse {
            program: "bsub".to_string(),
            output: out.clone(),
        })?;
        task.id = TaskId::new(id);
        debug!("bsub accepted {} as {}", task.dname.display(), id);
        Ok(())
    }

    async fn cancel(&self, task: &Task) -> Result<()> {
        run_checked(self.runner.as_ref(), "bkill", &[task.id.to_string()], None).await?;
        Ok(())
    }

    async fn hold(&self, task: &Task) -> Result<()> {
        run_checked(self.runner.as_ref(), "bstop", &[task.id.to_string()], None).await?;
        Ok(())
    }

    async fn release_hold(&self, task: &Task) -> Result<()> {
        run_checked(self.runner.as_ref(), "bresume", &[task.id.to_string()], None).await?;
        Ok(())
    }

    async fn get_ids(&self) -> Result<HashSet<TaskId>> {
        let args = vec!["-u".to_string(), self.config.user()];
        let out = run_checked(self.runner.as_ref(), "bjobs", &args, None).await?;
        Ok(out
            .lines()
            .filter_map(|line| line.split_whitespace().next())
            .filter_map(leading_id)
            .map(TaskId::new)
            .collect())
    }

    fn error_file(&self, task: &Task) -> PathBuf {
        task.folder.join(format!("{}.{}.err", task.name(), task.id))
    }

    async fn maxrss(&self, _id: TaskId) -> Result<u64> {
        Ok(0)
    }

    async fn has_timed_out(&self, task: &Task) -> Result<bool> {
        file_contains(&self.error_file(task), "TERM_RUNLIMIT").await
    }

    async fn get_config(&self, _queue: Option<&str>) -> Result<Vec<NodeClass>> {
        let out = run_checked(self.runner.as_ref(), "lshosts", &["-w".to_string()], None).await?;
        Ok(parse_lshosts(&out))
    }
}

/// `Job <123> is submitted to queue <normal>.`
fn parse_submitted(out: &str) -> Option<u64> {
    let start = out.find("Job <")? + "Job <".len();
    let end = out[start..].find('>')? + start;
    out[start..end].parse().ok()
}

/// One class per host model: `HOST_NAME type model cpuf ncpus maxmem ...`.
fn parse_lshosts(text: &str) -> Vec<NodeClass> {
    let mut classes: Vec<NodeClass> = Vec::new();
    for line in text.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 6 {
            continue;
        }
        let Ok(cores) = fields[4].parse::<u32>() else { continue };
        let model = fields[2];
        if !classes.iter().any(|c| c.name == model) {
            classes.push(NodeClass::new(model, cores, parse_size(fields[5])));
        }
    }
    classes
}

fn parse_size(value: &str) -> u64 {
    let (number, factor) = match value.chars().last() {
        Some('K') => (&value[..value.len() - 1], 1u64 << 10),
        Some('M') => (&value[..value.len() - 1], 1 << 20),
        Some('G') => (&value[..value.len() - 1], 1 << 30),
        Some('T') => (&value[..value.len() - 1], 1 << 40),
        _ => (value, 1 << 20),
    };
    number.parse::<f64>().map(|n| (n * factor as f64) as u64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::testing::ScriptedRunner;
    use batchq_core::{Command, Resources};

    fn lsf(runner: Arc<ScriptedRunner>) -> Lsf {
        let config = SchedulerConfig {
            queue_name: Some("normal".to_string()),
            ..Default::default()
        };
        Lsf::new(config, Path::new("/w/.bq"), runner)
    }

    #[tokio::test]
    async fn test_submit() {
        let runner = Arc::new(ScriptedRunner::new().reply("Job <987> is submitted to queue <normal>.\n"));
        let mut task = Task::new(Command::parse("a.py", vec![], None).unwrap(), "/w")
            .with_resources(Resources::new(4, 61));
        task.dtasks = vec![TaskId::new(5), TaskId::new(6)];

        lsf(runner.clone()).submit(&mut task, false).await.unwrap();
        assert_eq!(task.id, TaskId::new(987));

        let calls = runner.calls();
        let args = &calls[0].args;
        assert_eq!(calls[0].program, "bsub");
        assert_eq!(&args[..6], &["-J", "a.py", "-W", "2", "-n", "4"]);
        assert!(args.contains(&"done(5)&&done(6)".to_string()));
        assert!(args.contains(&"/w/a.py.%J.err".to_string()));
        assert!(args.contains(&"normal".to_string()));
    }

    #[tokio::test]
    async fn test_control_commands() {
        let runner = Arc::new(ScriptedRunner::new());
        let backend = lsf(runner.clone());
        let mut task = Task::new(Command::parse("a.py", vec![], None).unwrap(), "/w");
        task.id = TaskId::new(9);
        backend.cancel(&task).await.unwrap();
        backend.hold(&task).await.unwrap();
        backend.release_hold(&task).await.unwrap();
        let programs: Vec<String> = runner.calls().into_iter().map(|c| c.program).collect();
        assert_eq!(programs, vec!["bkill", "bstop", "bresume"]);
    }

    #[test]
    fn test_parsers() {
        assert_eq!(parse_submitted("Job <42> is submitted to default queue <normal>."), Some(42));
        assert_eq!(parse_submitted("Request aborted"), None);

        let text = "HOST_NAME type model cpuf ncpus maxmem maxswp server RESOURCES\nh1 X86_64 xeon24 60.0 24 255.9G 4G Yes (mg)\nh2 X86_64 xeon24 60.0 24 255.9G 4G Yes (mg)\n";
        let classes = parse_lshosts(text);
        assert_eq!(classes.len(), 1);
        assert_eq!(classes[0].cores, 24);
        assert!(classes[0].memory > 255 << 30);
    }
}
