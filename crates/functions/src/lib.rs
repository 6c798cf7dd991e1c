//! Target functions
//!
//! Named units of business logic the runner invokes by identifier.

#![warn(missing_docs)]

pub mod r#trait;
pub mod builtin;
pub mod registry;

pub use r#trait::{FunctionError, FunctionInvoker, InvokeError, TargetFunction};
pub use builtin::{CommandFunction, EchoFunction, FailFunction, SleepFunction};
pub use registry::FunctionRegistry;
