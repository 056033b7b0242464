//! Carepath Worker
//!
//! Executes workflow steps delivered by the queue broker.
//!
//! This crate provides:
//! - Per-lane consumer loops with bounded concurrency
//! - A step executor loading step/patient/doctor/workflow and
//!   dispatching to the five action handlers
//! - Recurring step re-submission and next-step resolution on success
//! - Failure-branch routing once a job is dead-lettered

pub mod config;
pub mod executor;
pub mod worker;

pub use config::WorkerConfig;
pub use executor::StepExecutor;
pub use worker::Worker;
