//! Execution layer - batch-system backends and the local executor.

#![warn(missing_docs)]

pub mod error;
pub mod runner;
pub mod script;
pub mod scheduler;
pub mod local;
pub mod pbs;
pub mod slurm;
pub mod lsf;

pub use error::{Result, SchedulerError};
pub use runner::{run_checked, CommandOutput, CommandRunner, SystemRunner};
pub use scheduler::{Backend, Scheduler, SchedulerConfig, SchedulerKind};
pub use local::{run_tasks, LocalScheduler};
pub use pbs::Pbs;
pub use slurm::Slurm;
pub use lsf::Lsf;
