//! Carepath Engine
//!
//! Workflow execution core for multi-step clinical follow-up protocols.
//!
//! This crate provides:
//! - Typed workflow/step documents with status state machines
//! - Condition evaluation and recurrence computation
//! - A dispatcher that turns steps into delayed, prioritized queue jobs
//! - A next-step resolver driving branch and ordinal progression
//! - Store, queue-broker, audit and notification seams with in-memory
//!   implementations for embedding and testing

pub mod audit;
pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod notify;
pub mod queue;
pub mod store;

pub use config::EngineConfig;
pub use error::{EngineError, EngineResult};
