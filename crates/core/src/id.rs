//! Backend-assigned task identifiers.

use serde::{Deserialize, Serialize};

/// Identifier handed out by a scheduler backend.
///
/// Zero means "not submitted yet"; ids only become meaningful once a backend
/// has accepted the task, which is why dependencies are matched by `dname`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(u64);

impl TaskId {
    /// Id of a task no backend has seen.
    pub const UNSUBMITTED: TaskId = TaskId(0);

    /// Wrap a raw backend id.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Raw numeric value.
    pub fn get(self) -> u64 {
        self.0
    }

    /// Whether a backend has assigned this id.
    pub fn is_submitted(self) -> bool {
        self.0 != 0
    }
}

impl From<u64> for TaskId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for TaskId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.trim().parse()?))
    }
}
