//! In-memory queue broker.
//!
//! Single-process stand-in for an external job queue, used for
//! embedding and tests. Honors delays, lane priority, bounded attempts
//! with backoff, idempotency-key de-duplication and dead-lettering.

use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::error::EngineResult;
use crate::model::{Lane, StepJob};

use super::{BackoffPolicy, DeadJob, Delivery, EnqueueOptions, QueueBroker, RetryOutcome};

struct QueuedEntry {
    job: StepJob,
    /// Delivery attempt this entry represents (1-based).
    attempt: u32,
    max_attempts: u32,
    backoff: BackoffPolicy,
    priority: i32,
    key: String,
    token: u64,
}

struct Scheduled {
    wake_at: Instant,
    entry: QueuedEntry,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}
impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

// BinaryHeap is a max-heap: greatest = earliest wake, then highest
// priority, then lowest sequence token.
impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .wake_at
            .cmp(&self.wake_at)
            .then(self.entry.priority.cmp(&other.entry.priority))
            .then(other.entry.token.cmp(&self.entry.token))
    }
}

#[derive(Default)]
struct LaneState {
    heap: BinaryHeap<Scheduled>,
    /// Idempotency keys of queued + in-flight jobs.
    pending_keys: HashSet<String>,
    inflight: HashMap<u64, QueuedEntry>,
    dead: Vec<DeadJob>,
    closed: bool,
}

struct LaneQueue {
    state: Mutex<LaneState>,
    notify: Notify,
}

impl LaneQueue {
    fn new() -> Self {
        Self {
            state: Mutex::new(LaneState::default()),
            notify: Notify::new(),
        }
    }
}

/// Among all entries already due, the highest priority wins, then FIFO
/// by sequence token. Entries not yet due go back on the heap.
fn pop_best_due(heap: &mut BinaryHeap<Scheduled>, now: Instant) -> QueuedEntry {
    let mut due: Vec<Scheduled> = Vec::new();
    while let Some(top) = heap.peek() {
        if top.wake_at <= now {
            due.push(heap.pop().expect("peeked entry"));
        } else {
            break;
        }
    }
    let best = due
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| {
            a.entry
                .priority
                .cmp(&b.entry.priority)
                .then(b.entry.token.cmp(&a.entry.token))
        })
        .map(|(i, _)| i)
        .expect("at least one due entry");
    let chosen = due.swap_remove(best);
    for other in due {
        heap.push(other);
    }
    chosen.entry
}

/// In-memory [`QueueBroker`] implementation.
pub struct InMemoryBroker {
    lanes: HashMap<Lane, LaneQueue>,
    seq: AtomicU64,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        let mut lanes = HashMap::new();
        for lane in Lane::ALL {
            lanes.insert(lane, LaneQueue::new());
        }
        Self {
            lanes,
            seq: AtomicU64::new(0),
        }
    }

    fn lane(&self, lane: Lane) -> &LaneQueue {
        // All lanes are created in `new`.
        self.lanes.get(&lane).expect("lane initialized")
    }

    /// Close every lane; consumers drain out of `receive` with `None`.
    pub async fn close(&self) {
        for queue in self.lanes.values() {
            queue.state.lock().await.closed = true;
            queue.notify.notify_waiters();
        }
    }

    /// Jobs queued (not yet delivered) on a lane.
    pub async fn depth(&self, lane: Lane) -> usize {
        self.lane(lane).state.lock().await.heap.len()
    }

    /// Dead-lettered jobs on a lane.
    pub async fn dead_letters(&self, lane: Lane) -> Vec<DeadJob> {
        self.lane(lane).state.lock().await.dead.clone()
    }

    /// Whether any lane still has queued or in-flight jobs.
    pub async fn is_idle(&self) -> bool {
        for queue in self.lanes.values() {
            let state = queue.state.lock().await;
            if !state.heap.is_empty() || !state.inflight.is_empty() {
                return false;
            }
        }
        true
    }
}

#[async_trait]
impl QueueBroker for InMemoryBroker {
    async fn enqueue(
        &self,
        lane: Lane,
        job: StepJob,
        opts: EnqueueOptions,
    ) -> EngineResult<bool> {
        let queue = self.lane(lane);
        let mut state = queue.state.lock().await;

        if state.pending_keys.contains(&opts.idempotency_key) {
            tracing::debug!(
                lane = %lane,
                step_id = %job.step_id,
                key = %opts.idempotency_key,
                "Duplicate enqueue suppressed"
            );
            return Ok(false);
        }

        let token = self.seq.fetch_add(1, Ordering::Relaxed);
        state.pending_keys.insert(opts.idempotency_key.clone());
        state.heap.push(Scheduled {
            wake_at: Instant::now() + opts.delay,
            entry: QueuedEntry {
                job,
                attempt: 1,
                max_attempts: opts.attempts.max(1),
                backoff: opts.backoff,
                priority: opts.priority,
                key: opts.idempotency_key,
                token,
            },
        });
        drop(state);

        queue.notify.notify_one();
        Ok(true)
    }

    async fn receive(&self, lane: Lane) -> Option<Delivery> {
        let queue = self.lane(lane);
        loop {
            // Created before the state check so a close() or enqueue()
            // racing with it still wakes this consumer.
            let notified = queue.notify.notified();

            let wait_until = {
                let mut state = queue.state.lock().await;
                if state.closed {
                    return None;
                }
                let now = Instant::now();
                match state.heap.peek() {
                    Some(top) if top.wake_at <= now => {
                        let entry = pop_best_due(&mut state.heap, now);
                        let delivery = Delivery {
                            job: entry.job.clone(),
                            lane,
                            attempt: entry.attempt,
                            token: entry.token,
                        };
                        state.inflight.insert(entry.token, entry);
                        return Some(delivery);
                    }
                    Some(top) => Some(top.wake_at),
                    None => None,
                }
            };

            match wait_until {
                Some(at) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(at) => {}
                        _ = notified => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn ack(&self, delivery: Delivery) {
        let queue = self.lane(delivery.lane);
        let mut state = queue.state.lock().await;
        if let Some(entry) = state.inflight.remove(&delivery.token) {
            state.pending_keys.remove(&entry.key);
        }
    }

    async fn retry(&self, delivery: Delivery, reason: &str) -> RetryOutcome {
        let queue = self.lane(delivery.lane);
        let mut state = queue.state.lock().await;
        let Some(mut entry) = state.inflight.remove(&delivery.token) else {
            return RetryOutcome::DeadLettered;
        };

        if entry.attempt >= entry.max_attempts {
            state.pending_keys.remove(&entry.key);
            tracing::warn!(
                lane = %delivery.lane,
                step_id = %entry.job.step_id,
                attempts = entry.attempt,
                reason = %reason,
                "Job dead-lettered after exhausting attempts"
            );
            state.dead.push(DeadJob {
                job: entry.job,
                lane: delivery.lane,
                attempts: entry.attempt,
                reason: reason.to_string(),
            });
            return RetryOutcome::DeadLettered;
        }

        entry.attempt += 1;
        let delay = entry.backoff.delay_for(entry.attempt);
        tracing::debug!(
            lane = %delivery.lane,
            step_id = %entry.job.step_id,
            attempt = entry.attempt,
            delay_ms = delay.as_millis() as u64,
            "Job requeued with backoff"
        );
        state.heap.push(Scheduled {
            wake_at: Instant::now() + delay,
            entry,
        });
        drop(state);

        queue.notify.notify_one();
        RetryOutcome::Requeued
    }

    async fn discard(&self, delivery: Delivery, reason: &str) {
        let queue = self.lane(delivery.lane);
        let mut state = queue.state.lock().await;
        if let Some(entry) = state.inflight.remove(&delivery.token) {
            state.pending_keys.remove(&entry.key);
            tracing::error!(
                lane = %delivery.lane,
                step_id = %entry.job.step_id,
                reason = %reason,
                "Job discarded as non-retryable"
            );
            state.dead.push(DeadJob {
                job: entry.job,
                lane: delivery.lane,
                attempts: delivery.attempt,
                reason: reason.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use uuid::Uuid;

    fn job() -> StepJob {
        StepJob::new(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4())
    }

    fn opts(key: &str) -> EnqueueOptions {
        EnqueueOptions {
            delay: Duration::ZERO,
            priority: 0,
            attempts: 3,
            backoff: BackoffPolicy::Fixed(Duration::from_millis(10)),
            idempotency_key: key.to_string(),
        }
    }

    #[tokio::test]
    async fn test_enqueue_receive_ack() {
        let broker = InMemoryBroker::new();
        let queued = broker
            .enqueue(Lane::Normal, job(), opts("k1"))
            .await
            .unwrap();
        assert!(queued);

        let delivery = broker.receive(Lane::Normal).await.unwrap();
        assert_eq!(delivery.attempt, 1);
        broker.ack(delivery).await;
        assert!(broker.is_idle().await);
    }

    #[tokio::test]
    async fn test_duplicate_key_suppressed_until_ack() {
        let broker = InMemoryBroker::new();
        assert!(broker.enqueue(Lane::Normal, job(), opts("dup")).await.unwrap());
        assert!(!broker.enqueue(Lane::Normal, job(), opts("dup")).await.unwrap());

        let delivery = broker.receive(Lane::Normal).await.unwrap();
        // Still in flight: key is held.
        assert!(!broker.enqueue(Lane::Normal, job(), opts("dup")).await.unwrap());
        broker.ack(delivery).await;
        // Acked: the key is released for the next bucket.
        assert!(broker.enqueue(Lane::Normal, job(), opts("dup")).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_honored() {
        let broker = InMemoryBroker::new();
        let mut options = opts("delayed");
        options.delay = Duration::from_secs(60);
        broker.enqueue(Lane::Scheduled, job(), options).await.unwrap();

        let early =
            tokio::time::timeout(Duration::from_secs(30), broker.receive(Lane::Scheduled)).await;
        assert!(early.is_err(), "job must not be delivered before its wake time");

        let late =
            tokio::time::timeout(Duration::from_secs(60), broker.receive(Lane::Scheduled)).await;
        assert!(late.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_then_dead_letter() {
        let broker = InMemoryBroker::new();
        let mut options = opts("retry");
        options.attempts = 2;
        broker.enqueue(Lane::Normal, job(), options).await.unwrap();

        let first = broker.receive(Lane::Normal).await.unwrap();
        assert_eq!(
            broker.retry(first, "smtp unavailable").await,
            RetryOutcome::Requeued
        );

        let second = broker.receive(Lane::Normal).await.unwrap();
        assert_eq!(second.attempt, 2);
        assert_eq!(
            broker.retry(second, "smtp unavailable").await,
            RetryOutcome::DeadLettered
        );

        let dead = broker.dead_letters(Lane::Normal).await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts, 2);
        assert_eq!(dead[0].reason, "smtp unavailable");
    }

    #[tokio::test]
    async fn test_priority_wins_among_due_jobs() {
        let broker = InMemoryBroker::new();
        let low = job();
        let high = job();
        broker
            .enqueue(Lane::Priority, low.clone(), opts("low"))
            .await
            .unwrap();
        let mut urgent = opts("high");
        urgent.priority = 1;
        broker
            .enqueue(Lane::Priority, high.clone(), urgent)
            .await
            .unwrap();

        // Let both become due at the same instant, then the higher
        // priority job is delivered first.
        tokio::time::sleep(Duration::from_millis(5)).await;
        let delivery = broker.receive(Lane::Priority).await.unwrap();
        assert_eq!(delivery.job.step_id, high.step_id);
        broker.ack(delivery).await;
    }

    #[tokio::test]
    async fn test_close_unblocks_consumers() {
        let broker = std::sync::Arc::new(InMemoryBroker::new());
        let consumer = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.receive(Lane::Normal).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        broker.close().await;
        assert!(consumer.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_discard_goes_to_dead_letter() {
        let broker = InMemoryBroker::new();
        broker.enqueue(Lane::Normal, job(), opts("fatal")).await.unwrap();
        let delivery = broker.receive(Lane::Normal).await.unwrap();
        broker.discard(delivery, "step not found").await;

        let dead = broker.dead_letters(Lane::Normal).await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, "step not found");
        assert!(broker.is_idle().await);
    }
}
