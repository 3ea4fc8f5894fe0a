//! Dependency graph helpers over `dname` edges.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::state::TaskState;
use crate::task::Task;
use crate::Time;

/// `roots` plus everything that transitively depends on them.
///
/// Returns indices into `tasks`, deduplicated and ordered by task id.
pub fn find_depending(tasks: &[Task], roots: &[usize]) -> Vec<usize> {
    let mut by_dname: HashMap<&Path, Vec<usize>> = HashMap::new();
    for (i, task) in tasks.iter().enumerate() {
        by_dname.entry(task.dname.as_path()).or_default().push(i);
    }

    let mut children: HashMap<usize, Vec<usize>> = HashMap::new();
    for (i, task) in tasks.iter().enumerate() {
        for dep in &task.deps {
            for &parent in by_dname.get(dep.as_path()).into_iter().flatten() {
                children.entry(parent).or_default().push(i);
            }
        }
    }

    let mut seen = HashSet::new();
    let mut stack: Vec<usize> = roots.to_vec();
    while let Some(i) = stack.pop() {
        if seen.insert(i) {
            stack.extend(children.get(&i).into_iter().flatten().copied());
        }
    }

    let mut found: Vec<usize> = seen.into_iter().collect();
    found.sort_by_key(|&i| (tasks[i].id, i));
    found
}

/// Cancel every active task that transitively depends on `dname`.
///
/// Returns the indices of the tasks that changed.
pub fn cancel_dependents(tasks: &mut [Task], dname: &Path, t: Time) -> Vec<usize> {
    let mut changed = Vec::new();
    let mut pending = vec![dname.to_path_buf()];
    while let Some(dname) = pending.pop() {
        for (i, task) in tasks.iter_mut().enumerate() {
            if task.state.is_active() && task.deps.contains(&dname) {
                task.state = TaskState::Canceled;
                task.tstop = Some(t);
                changed.push(i);
                pending.push(task.dname.clone());
            }
        }
    }
    changed
}
