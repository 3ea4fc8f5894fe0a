//! Job scripts handed to batch systems.

use batchq_core::{shell_quote, CommandKind, Task};
use std::path::Path;

/// Shell line that runs a task, including MPI launch and venv activation.
pub fn task_command(task: &Task, python: &str) -> String {
    let mut line = task.cmd.command_line(python);
    let is_python = !matches!(task.cmd.kind, CommandKind::Shell | CommandKind::ShellScript);
    if is_python && task.resources.processes > 1 {
        line = format!("mpiexec -n {} {line}", task.resources.processes);
    }
    match &task.activation_script {
        Some(script) => format!(". {} && {line}", shell_quote(&script.to_string_lossy())),
        None => line,
    }
}

/// Submission script for a batch system.
///
/// `job_id` is the shell expression yielding the numeric job id inside the
/// job. The script touches the started marker, runs the task in its folder
/// and touches the done or failed marker.
pub fn batch_script(task: &Task, python: &str, state_dir: &Path, prefix: &str, job_id: &str) -> String {
    let marker = format!("{}/{prefix}-{job_id}", shell_quote(&state_dir.to_string_lossy()));
    format!(
        "#!/bin/bash -l\n\
         marker={marker}\n\
         touch \"$marker-0\"\n\
         cd {folder} || {{ touch \"$marker-2\"; exit 1; }}\n\
         ({cmd}) && touch \"$marker-1\" || {{ touch \"$marker-2\"; exit 1; }}\n",
        folder = shell_quote(&task.folder.to_string_lossy()),
        cmd = task_command(task, python),
    )
}

/// `H:MM:SS` (hours may exceed 24).
pub fn format_hms(seconds: u64) -> String {
    format!("{}:{:02}:{:02}", seconds / 3600, seconds / 60 % 60, seconds % 60)
}

/// Leading digits of a token (`12345.server` -> 12345).
pub fn leading_id(token: &str) -> Option<u64> {
    let digits: String = token.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}
