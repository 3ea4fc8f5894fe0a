//! Command model - what a task actually executes.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{CoreError, Result};

/// How a command is launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommandKind {
    /// Arbitrary shell command (`shell:<cmd>`)
    Shell,
    /// Shell script (`*.sh`)
    ShellScript,
    /// Python script (`*.py`)
    PythonScript,
    /// Python module run with `-m`
    PythonModule,
    /// Python function (`module@function`)
    PythonFunction,
}

/// A command plus its arguments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Command {
    /// Launch style
    #[serde(rename = "type")]
    pub kind: CommandKind,

    /// Script path, module, function or shell command
    pub cmd: String,

    /// Arguments
    #[serde(default)]
    pub args: Vec<String>,

    /// Short name without arguments
    pub name: String,
}

impl Command {
    /// Parse a command string.
    ///
    /// A `+a_b` suffix on the last path component is split off into the
    /// arguments `a` and `b`, placed before `args`.
    pub fn parse(cmd: &str, args: Vec<String>, name: Option<&str>) -> Result<Self> {
        let cmd = cmd.trim();
        if cmd.is_empty() {
            return Err(CoreError::InvalidCommand("empty command".to_string()));
        }

        if let Some(shell) = cmd.strip_prefix("shell:") {
            let shell = shell.trim();
            let first = shell
                .split_whitespace()
                .next()
                .ok_or_else(|| CoreError::InvalidCommand(cmd.to_string()))?;
            let default_name = file_name(first);
            return Ok(Self {
                kind: CommandKind::Shell,
                cmd: shell.to_string(),
                args,
                name: name.map(str::to_string).unwrap_or(default_name),
            });
        }

        let (dir, last) = match cmd.rfind('/') {
            Some(i) => cmd.split_at(i + 1),
            None => ("", cmd),
        };
        let (base, mut all_args) = match last.split_once('+') {
            Some((base, rest)) => (base, rest.split('_').map(str::to_string).collect::<Vec<_>>()),
            None => (last, Vec::new()),
        };
        if base.is_empty() {
            return Err(CoreError::InvalidCommand(cmd.to_string()));
        }
        all_args.extend(args);
        let full = format!("{dir}{base}");

        let kind = if full.ends_with(".py") {
            CommandKind::PythonScript
        } else if full.contains('@') {
            CommandKind::PythonFunction
        } else if full.ends_with(".sh") {
            CommandKind::ShellScript
        } else {
            CommandKind::PythonModule
        };

        let default_name = match kind {
            CommandKind::PythonScript | CommandKind::ShellScript => file_name(&full),
            _ => full.clone(),
        };

        Ok(Self {
            kind,
            cmd: full,
            args: all_args,
            name: name.map(str::to_string).unwrap_or(default_name),
        })
    }

    /// Name including arguments, e.g. `relax.py+Cu_fcc`.
    pub fn short_name(&self) -> String {
        if self.args.is_empty() {
            self.name.clone()
        } else {
            format!("{}+{}", self.name, self.args.join("_"))
        }
    }

    /// Shell line that runs this command.
    pub fn command_line(&self, python: &str) -> String {
        let args: Vec<String> = self.args.iter().map(|a| shell_quote(a)).collect();
        let args = args.join(" ");
        let line = match self.kind {
            CommandKind::Shell => self.cmd.clone(),
            CommandKind::ShellScript => format!("sh {}", shell_quote(&self.cmd)),
            CommandKind::PythonScript => format!("{python} {}", shell_quote(&self.cmd)),
            CommandKind::PythonModule => format!("{python} -m {}", self.cmd),
            CommandKind::PythonFunction => {
                let (module, function) = self.cmd.split_once('@').unwrap_or((&self.cmd, "main"));
                let call_args: Vec<String> = self.args.iter().map(|a| python_literal(a)).collect();
                let code = format!("import {module}; {module}.{function}({})", call_args.join(", "));
                return format!("{python} -c {}", shell_quote(&code));
            }
        };
        if args.is_empty() {
            line
        } else {
            format!("{line} {args}")
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.short_name())
    }
}

fn file_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

/// Quote a word for `sh` if it contains anything beyond a safe set.
pub fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@%+".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

fn python_literal(arg: &str) -> String {
    let is_number = arg.parse::<i64>().is_ok() || arg.parse::<f64>().is_ok();
    if is_number || matches!(arg, "True" | "False" | "None") {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\\', r"\\").replace('\'', r"\'"))
    }
}
