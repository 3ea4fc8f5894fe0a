//! Selection - declarative filter over a task collection.

use regex::Regex;
use std::collections::HashSet;
use std::path::PathBuf;

use crate::error::Result;
use crate::id::TaskId;
use crate::state::TaskState;
use crate::task::Task;

/// Which tasks an operation applies to.
///
/// An explicit id set bypasses every other field. Otherwise all given
/// predicates must hold; an empty state set or folder list does not
/// restrict anything.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    /// Explicit ids
    pub ids: Option<HashSet<TaskId>>,

    /// Full-match pattern on the task name
    pub name: Option<Regex>,

    /// Allowed states
    pub states: HashSet<TaskState>,

    /// Folder roots
    pub folders: Vec<PathBuf>,

    /// Match folders below the roots too
    pub recursive: bool,

    /// Full-match pattern on the error text
    pub error: Option<Regex>,
}

impl Selection {
    /// Select exactly these ids.
    pub fn ids(ids: impl IntoIterator<Item = TaskId>) -> Self {
        Self {
            ids: Some(ids.into_iter().collect()),
            ..Default::default()
        }
    }

    /// Restrict to states.
    pub fn with_states(mut self, states: impl IntoIterator<Item = TaskState>) -> Self {
        self.states = states.into_iter().collect();
        self
    }

    /// Restrict to names matching a glob (`*`, `?`).
    pub fn with_name(mut self, glob: &str) -> Result<Self> {
        self.name = Some(glob_regex(glob)?);
        Ok(self)
    }

    /// Restrict to errors matching a glob.
    pub fn with_error(mut self, glob: &str) -> Result<Self> {
        self.error = Some(glob_regex(glob)?);
        Ok(self)
    }

    /// Restrict to folders.
    pub fn with_folders(mut self, folders: Vec<PathBuf>, recursive: bool) -> Self {
        self.folders = folders;
        self.recursive = recursive;
        self
    }

    /// Whether a single task is selected.
    pub fn matches(&self, task: &Task) -> bool {
        if let Some(ids) = &self.ids {
            return ids.contains(&task.id);
        }
        if !self.states.is_empty() && !self.states.contains(&task.state) {
            return false;
        }
        if let Some(name) = &self.name {
            if !name.is_match(&task.name()) {
                return false;
            }
        }
        if !self.folders.is_empty() {
            let inside = self.folders.iter().any(|root| {
                if self.recursive {
                    task.folder.starts_with(root)
                } else {
                    &task.folder == root
                }
            });
            if !inside {
                return false;
            }
        }
        if let Some(error) = &self.error {
            if !error.is_match(&task.error) {
                return false;
            }
        }
        true
    }

    /// Indices of the selected tasks, in input order.
    pub fn select(&self, tasks: &[Task]) -> Vec<usize> {
        tasks
            .iter()
            .enumerate()
            .filter(|(_, task)| self.matches(task))
            .map(|(i, _)| i)
            .collect()
    }
}

/// Convert a shell glob into an anchored regex.
pub fn glob_regex(glob: &str) -> Result<Regex> {
    let mut pattern = String::from("^");
    for c in glob.chars() {
        match c {
            '*' => pattern.push_str(".*"),
            '?' => pattern.push('.'),
            c => pattern.push_str(&regex::escape(&c.to_string())),
        }
    }
    pattern.push('$');
    Ok(Regex::new(&pattern)?)
}
