//! Resource requests and node-class selection.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::error::{CoreError, Result};
use crate::state::TaskState;

/// Default wall-clock limit (10 minutes).
pub const DEFAULT_TMAX: u64 = 600;

/// Upper bound for escalated wall-clock limits (two days).
pub const MAX_TMAX: u64 = 2 * 24 * 3600;

/// Logical resource request of a task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resources {
    /// Number of cores
    pub cores: u32,

    /// Number of processes (MPI ranks)
    pub processes: u32,

    /// Wall-clock limit in seconds
    pub tmax: u64,

    /// Node-class hint (empty = let the pool decide)
    #[serde(default)]
    pub nodename: String,
}

/// One class of nodes offered by a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeClass {
    /// Name (partition, queue or node property)
    pub name: String,

    /// Cores per node
    pub cores: u32,

    /// Memory per node in bytes
    #[serde(default)]
    pub memory: u64,

    /// Extra arguments appended to the submit command
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl NodeClass {
    /// Create a node class without extra arguments.
    pub fn new(name: impl Into<String>, cores: u32, memory: u64) -> Self {
        Self {
            name: name.into(),
            cores,
            memory,
            extra_args: Vec::new(),
        }
    }

    fn memory_per_core(&self) -> f64 {
        self.memory as f64 / self.cores.max(1) as f64
    }
}

/// A request mapped onto a concrete node class.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSelection {
    /// Number of nodes
    pub nodes: u32,

    /// Chosen class
    pub node: NodeClass,

    /// Cores used on the last, partially filled node (0 = all nodes full)
    pub remainder: u32,

    /// Cores to request per node
    pub cores_per_node: u32,
}

impl Default for Resources {
    fn default() -> Self {
        Self {
            cores: 1,
            processes: 1,
            tmax: DEFAULT_TMAX,
            nodename: String::new(),
        }
    }
}

impl Resources {
    /// Request `cores` cores (one process per core) for `tmax` seconds.
    pub fn new(cores: u32, tmax: u64) -> Self {
        Self {
            cores,
            processes: cores,
            tmax,
            nodename: String::new(),
        }
    }

    /// Set the node-class hint.
    pub fn with_nodename(mut self, nodename: impl Into<String>) -> Self {
        self.nodename = nodename.into();
        self
    }

    /// Set the number of processes.
    pub fn with_processes(mut self, processes: u32) -> Self {
        self.processes = processes;
        self
    }

    /// Map the request onto a node class from `pool`.
    ///
    /// A node hint must name a class in the pool. Without a hint the first
    /// class whose core count divides the request wins, falling back to the
    /// first class. An empty pool behaves like one node with exactly the
    /// requested cores.
    pub fn select(&self, pool: &[NodeClass]) -> Result<NodeSelection> {
        let cores = self.cores.max(1);
        let node = if let Some(first) = pool.first() {
            if !self.nodename.is_empty() {
                pool.iter()
                    .find(|n| n.name == self.nodename)
                    .cloned()
                    .ok_or_else(|| CoreError::UnknownNode(self.nodename.clone()))?
            } else {
                pool.iter()
                    .find(|n| n.cores > 0 && cores % n.cores == 0)
                    .unwrap_or(first)
                    .clone()
            }
        } else {
            NodeClass::new(self.nodename.clone(), cores, 0)
        };

        let node_cores = node.cores.max(1);
        let nodes = cores.div_ceil(node_cores);
        let remainder = cores % node_cores;
        let cores_per_node = if nodes == 1 { cores } else { node_cores };

        Ok(NodeSelection {
            nodes,
            node,
            remainder,
            cores_per_node,
        })
    }

    /// Escalated copy of this request after a failure of kind `kind`.
    ///
    /// TIMEOUT doubles `tmax` (bounded by [`MAX_TMAX`]). MEMORY moves to a
    /// class with more memory per core, preferring one with the same core
    /// count; without such a class the request grows to one more node.
    pub fn bigger(&self, kind: TaskState, pool: &[NodeClass]) -> Resources {
        match kind {
            TaskState::Timeout => {
                let mut new = self.clone();
                new.tmax = self.tmax.saturating_mul(2).min(MAX_TMAX).max(self.tmax);
                new
            }
            TaskState::Memory => self.more_memory(pool),
            _ => self.clone(),
        }
    }

    fn more_memory(&self, pool: &[NodeClass]) -> Resources {
        let mut new = self.clone();
        let current = match self.select(pool) {
            Ok(current) => current,
            Err(_) => return new,
        };

        let base = current.node.memory_per_core();
        let same_cores = current.node.cores;
        let candidate = pool
            .iter()
            .filter(|n| n.memory_per_core() > base)
            .min_by(|a, b| {
                (a.cores != same_cores)
                    .cmp(&(b.cores != same_cores))
                    .then(
                        a.memory_per_core()
                            .partial_cmp(&b.memory_per_core())
                            .unwrap_or(Ordering::Equal),
                    )
            });

        if let Some(node) = candidate {
            new.nodename = node.name.clone();
            return new;
        }

        let node_cores = current.node.cores.max(1);
        let nodes = if current.remainder == 0 {
            current.nodes + 1
        } else {
            current.nodes
        };
        let cores = nodes * node_cores;
        if self.processes == self.cores {
            new.processes = cores;
        }
        new.cores = cores;
        new
    }
}

impl std::fmt::Display for Resources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.cores)?;
        if !self.nodename.is_empty() {
            write!(f, ":{}", self.nodename)?;
        }
        if self.processes != self.cores {
            write!(f, ":{}", self.processes)?;
        }
        write!(f, ":{}", format_time(self.tmax))
    }
}

impl std::str::FromStr for Resources {
    type Err = CoreError;

    /// Parse `cores[:nodename][:processes]:tmax`, e.g. `8:1h` or `24:xeon24:2d`.
    fn from_str(s: &str) -> Result<Self> {
        let bad = || CoreError::InvalidResources(s.to_string());
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() < 2 || parts.len() > 4 {
            return Err(bad());
        }
        let cores: u32 = parts[0].parse().map_err(|_| bad())?;
        if cores == 0 {
            return Err(bad());
        }
        let tmax = parse_time(parts[parts.len() - 1])?;

        let mut resources = Resources::new(cores, tmax);
        for part in &parts[1..parts.len() - 1] {
            if let Ok(processes) = part.parse::<u32>() {
                resources.processes = processes;
            } else if resources.nodename.is_empty() && !part.is_empty() {
                resources.nodename = part.to_string();
            } else {
                return Err(bad());
            }
        }
        Ok(resources)
    }
}

/// Parse `30s`, `10m`, `2h`, `1d` (plain numbers are seconds).
pub fn parse_time(s: &str) -> Result<u64> {
    let bad = || CoreError::InvalidTime(s.to_string());
    let s = s.trim();
    let (number, unit) = match s.char_indices().last() {
        Some((i, c)) if c.is_ascii_alphabetic() => (&s[..i], c),
        Some(_) => (s, 's'),
        None => return Err(bad()),
    };
    let factor = match unit {
        's' => 1.0,
        'm' => 60.0,
        'h' => 3600.0,
        'd' => 86400.0,
        _ => return Err(bad()),
    };
    let value: f64 = number.parse().map_err(|_| bad())?;
    if !value.is_finite() || value <= 0.0 {
        return Err(bad());
    }
    Ok((value * factor).round() as u64)
}

/// Format seconds with the largest unit that divides them.
pub fn format_time(seconds: u64) -> String {
    if seconds > 0 && seconds % 86400 == 0 {
        format!("{}d", seconds / 86400)
    } else if seconds > 0 && seconds % 3600 == 0 {
        format!("{}h", seconds / 3600)
    } else if seconds > 0 && seconds % 60 == 0 {
        format!("{}m", seconds / 60)
    } else {
        format!("{}s", seconds)
    }
}
