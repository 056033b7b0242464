//! Queue broker seam.
//!
//! The engine never talks to a concrete queue directly: the dispatcher
//! enqueues through [`QueueBroker`] and the worker pool consumes
//! deliveries from it, with at-least-once, ack/retry semantics. Delays
//! are honored by the broker, never by the engine.

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::EngineResult;
use crate::model::{Lane, StepJob};

pub use memory::InMemoryBroker;

/// Retry backoff strategy for a lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffPolicy {
    /// Same delay before every retry.
    Fixed(Duration),
    /// Base delay doubled per attempt.
    Exponential(Duration),
}

impl BackoffPolicy {
    /// Delay before redelivering attempt `attempt` (1-based: the delay
    /// applied after the first failure is for attempt 2).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match *self {
            BackoffPolicy::Fixed(base) => base,
            BackoffPolicy::Exponential(base) => {
                let shift = attempt.saturating_sub(2).min(16);
                base.saturating_mul(1u32 << shift)
            }
        }
    }
}

/// Options controlling a single enqueue.
#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    /// Minimum time before the job may be delivered.
    pub delay: Duration,
    pub priority: i32,
    /// Maximum delivery attempts before dead-lettering.
    pub attempts: u32,
    pub backoff: BackoffPolicy,
    /// Deduplicates concurrent enqueues of the same logical unit of work.
    pub idempotency_key: String,
}

/// A job handed to a consumer. Must be acked, retried or discarded.
#[derive(Debug)]
pub struct Delivery {
    pub job: StepJob,
    pub lane: Lane,
    /// 1-based delivery attempt.
    pub attempt: u32,
    pub(crate) token: u64,
}

/// Outcome of asking the broker to redeliver a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Requeued with the lane's backoff delay.
    Requeued,
    /// Attempts exhausted; the job moved to the dead-letter store.
    DeadLettered,
}

/// A job that exhausted its attempts or failed fatally.
#[derive(Debug, Clone)]
pub struct DeadJob {
    pub job: StepJob,
    pub lane: Lane,
    pub attempts: u32,
    pub reason: String,
}

/// Queue primitive exposed to the engine.
#[async_trait]
pub trait QueueBroker: Send + Sync {
    /// Submit a job. Returns `false` when an in-flight job with the
    /// same idempotency key suppressed the enqueue.
    async fn enqueue(&self, lane: Lane, job: StepJob, opts: EnqueueOptions)
        -> EngineResult<bool>;

    /// Wait for the next due job on a lane. Returns `None` once the
    /// broker is closed.
    async fn receive(&self, lane: Lane) -> Option<Delivery>;

    /// Acknowledge successful (or fatally skipped) processing.
    async fn ack(&self, delivery: Delivery);

    /// Report a retryable failure; the broker requeues with backoff or
    /// dead-letters once attempts are exhausted.
    async fn retry(&self, delivery: Delivery, reason: &str) -> RetryOutcome;

    /// Report a non-retryable failure; the job goes straight to the
    /// dead-letter store.
    async fn discard(&self, delivery: Delivery, reason: &str);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_backoff() {
        let policy = BackoffPolicy::Fixed(Duration::from_secs(3));
        assert_eq!(policy.delay_for(2), Duration::from_secs(3));
        assert_eq!(policy.delay_for(5), Duration::from_secs(3));
    }

    #[test]
    fn test_exponential_backoff_doubles() {
        let policy = BackoffPolicy::Exponential(Duration::from_secs(5));
        assert_eq!(policy.delay_for(2), Duration::from_secs(5));
        assert_eq!(policy.delay_for(3), Duration::from_secs(10));
        assert_eq!(policy.delay_for(4), Duration::from_secs(20));
    }
}
