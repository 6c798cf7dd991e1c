//! AsyncOp Operations
//!
//! Submission, execution and completion of asynchronous operations:
//! - [`OperationLauncher`] records an operation as RUNNING and launches an
//!   execution context for it
//! - [`OperationRunner`] runs inside that context and writes the terminal
//!   status exactly once
//! - [`CompletionWaiter`] blocks until the context stopped and the record is
//!   terminal

#![warn(missing_docs)]

pub mod launcher;
pub mod runner;
pub mod waiter;

#[cfg(test)]
mod test_support;

pub use launcher::{OperationLauncher, Payload, StartRequest, StartResponse, SubmissionError};
pub use runner::{OperationRunner, RunFailure, RunnerConfig, RunnerError};
pub use waiter::{CompletionWaiter, WaitError, WaiterConfig};
