//! Job execution.
//!
//! - [`Executor`]: a fixed set of worker tasks fed by a channel of
//!   [`Assignment`]s. Each worker reads the payload, runs it, and reports the
//!   outcome to the dispatcher exactly once.
//! - [`JobRunner`]: the work itself. [`SimulatedRunner`] sleeps and flips a
//!   coin; [`CommandRunner`] pipes the payload into a shell command.

pub mod executor;
pub mod runner;

pub use executor::{Assignment, ExecutionResult, Executor};
pub use runner::{CommandRunner, JobContext, JobRunner, RunResult, SimulatedRunner};
