//! AsyncOp Executor
//!
//! Launches isolated execution contexts and reports how they stopped.

#![warn(missing_docs)]

pub mod executor;
pub mod local;
pub mod process;

pub use executor::{ExecutorError, ExitInfo, LaunchError, LaunchSpec, TaskExecutor};
pub use local::{Entrypoint, LocalTaskExecutor};
pub use process::{ProcessTaskExecutor, TaskDefinition};
