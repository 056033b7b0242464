//! Step execution module.

mod handlers;
mod step;

pub use step::{ExecutionOutcome, StepExecutor};
