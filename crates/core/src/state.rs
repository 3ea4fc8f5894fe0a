//! Task state machine and marker outcomes.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::{CoreError, Result};

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TaskState {
    /// Accepted by the backend, waiting to run
    #[serde(rename = "queued")]
    Queued,
    /// Held back (operator or disk quota)
    #[serde(rename = "hold")]
    Hold,
    /// Currently running
    #[serde(rename = "running")]
    Running,
    /// Finished successfully
    #[serde(rename = "done")]
    Done,
    /// Finished with an error
    #[serde(rename = "FAILED")]
    Failed,
    /// Killed by the wall-clock limit
    #[serde(rename = "TIMEOUT")]
    Timeout,
    /// Failed and classified as out-of-memory
    #[serde(rename = "MEMORY")]
    Memory,
    /// Canceled because a dependency failed or the backend lost it
    #[serde(rename = "CANCELED")]
    Canceled,
}

/// Explicit classification of states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateFamily {
    /// queued, hold, running
    Active,
    /// done
    Succeeded,
    /// FAILED, TIMEOUT, MEMORY, CANCELED
    Failed,
}

impl TaskState {
    /// All states in display order.
    pub const ALL: [TaskState; 8] = [
        TaskState::Queued,
        TaskState::Hold,
        TaskState::Running,
        TaskState::Done,
        TaskState::Failed,
        TaskState::Canceled,
        TaskState::Timeout,
        TaskState::Memory,
    ];

    /// Family this state belongs to.
    pub fn family(self) -> StateFamily {
        match self {
            Self::Queued | Self::Hold | Self::Running => StateFamily::Active,
            Self::Done => StateFamily::Succeeded,
            Self::Failed | Self::Timeout | Self::Memory | Self::Canceled => StateFamily::Failed,
        }
    }

    /// Known to the backend and not finished.
    pub fn is_active(self) -> bool {
        self.family() == StateFamily::Active
    }

    /// Finished, successfully or not.
    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }

    /// Any terminal state other than done.
    pub fn is_failed_family(self) -> bool {
        self.family() == StateFamily::Failed
    }

    /// Name as persisted and printed.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Hold => "hold",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "FAILED",
            Self::Timeout => "TIMEOUT",
            Self::Memory => "MEMORY",
            Self::Canceled => "CANCELED",
        }
    }

    /// Single-letter code used on the command line.
    pub fn letter(self) -> char {
        match self {
            Self::Queued => 'q',
            Self::Hold => 'h',
            Self::Running => 'r',
            Self::Done => 'd',
            Self::Failed => 'F',
            Self::Timeout => 'T',
            Self::Memory => 'M',
            Self::Canceled => 'C',
        }
    }

    /// Parse a single-letter code.
    pub fn from_letter(c: char) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|s| s.letter() == c)
            .ok_or_else(|| CoreError::UnknownState(c.to_string()))
    }

    /// Expand a string of state letters into a set.
    ///
    /// `a` stands for every non-failed state and `A` for the failed family.
    pub fn parse_letters(letters: &str) -> Result<HashSet<TaskState>> {
        let mut states = HashSet::new();
        for c in letters.chars() {
            match c {
                'a' => states.extend(Self::ALL.into_iter().filter(|s| !s.is_failed_family())),
                'A' => states.extend(Self::ALL.into_iter().filter(|s| s.is_failed_family())),
                _ => {
                    states.insert(Self::from_letter(c)?);
                }
            }
        }
        Ok(states)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(state) = Self::ALL.into_iter().find(|st| st.as_str() == s) {
            return Ok(state);
        }
        let mut chars = s.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => Self::from_letter(c),
            _ => Err(CoreError::UnknownState(s.to_string())),
        }
    }
}

/// Outcome code carried by a marker file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Outcome {
    /// Job started
    Started = 0,
    /// Job succeeded
    Done = 1,
    /// Job failed
    Failed = 2,
    /// Job hit its wall-clock limit
    Timeout = 3,
}

impl Outcome {
    /// Parse the numeric marker code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Started),
            1 => Some(Self::Done),
            2 => Some(Self::Failed),
            3 => Some(Self::Timeout),
            _ => None,
        }
    }

    /// Numeric marker code.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// State a task moves to when this outcome is observed.
    pub fn state(self) -> TaskState {
        match self {
            Self::Started => TaskState::Running,
            Self::Done => TaskState::Done,
            Self::Failed => TaskState::Failed,
            Self::Timeout => TaskState::Timeout,
        }
    }
}
