//! Worker lifecycle management.

use anyhow::Result;
use std::sync::Arc;
use tokio::sync::Semaphore;

use carepath_engine::model::Lane;
use carepath_engine::queue::{Delivery, QueueBroker, RetryOutcome};

use crate::config::WorkerConfig;
use crate::executor::StepExecutor;

/// Worker pool draining the three queue lanes with bounded concurrency.
pub struct Worker {
    /// Worker configuration.
    config: WorkerConfig,

    /// Queue broker the lanes are consumed from.
    broker: Arc<dyn QueueBroker>,

    /// Step executor.
    executor: Arc<StepExecutor>,
}

impl Worker {
    /// Create a new worker.
    pub fn new(
        config: WorkerConfig,
        broker: Arc<dyn QueueBroker>,
        executor: Arc<StepExecutor>,
    ) -> Self {
        Self {
            config,
            broker,
            executor,
        }
    }

    /// Run consumer loops for all lanes until the broker closes.
    pub async fn run(&self) -> Result<()> {
        tracing::info!(worker_id = %self.config.worker_id, "Worker started");

        let lanes = [
            (Lane::Normal, self.config.normal_concurrency),
            (Lane::Priority, self.config.priority_concurrency),
            (Lane::Scheduled, self.config.scheduled_concurrency),
        ];
        let mut handles = Vec::with_capacity(lanes.len());
        for (lane, concurrency) in lanes {
            let broker = self.broker.clone();
            let executor = self.executor.clone();
            handles.push(tokio::spawn(async move {
                consume_lane(broker, executor, lane, concurrency).await;
            }));
        }
        for handle in handles {
            handle.await?;
        }

        tracing::info!(worker_id = %self.config.worker_id, "Worker stopped");
        Ok(())
    }
}

/// Drain one lane. Each delivery takes a semaphore permit for its whole
/// processing, bounding in-flight executions per lane.
async fn consume_lane(
    broker: Arc<dyn QueueBroker>,
    executor: Arc<StepExecutor>,
    lane: Lane,
    concurrency: usize,
) {
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    loop {
        let permit = match semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let Some(delivery) = broker.receive(lane).await else {
            tracing::info!(lane = %lane, "Lane closed, consumer stopping");
            break;
        };

        let broker = broker.clone();
        let executor = executor.clone();
        tokio::spawn(async move {
            // Keep permit until done
            let _permit = permit;
            process_delivery(broker, executor, delivery).await;
        });
    }
}

async fn process_delivery(
    broker: Arc<dyn QueueBroker>,
    executor: Arc<StepExecutor>,
    delivery: Delivery,
) {
    let job = delivery.job.clone();
    match executor.execute(&job).await {
        Ok(outcome) => {
            tracing::debug!(
                step_id = %job.step_id,
                lane = %delivery.lane,
                outcome = ?outcome,
                "Delivery processed"
            );
            broker.ack(delivery).await;
        }
        Err(err) if err.is_retryable() => {
            tracing::warn!(
                step_id = %job.step_id,
                attempt = delivery.attempt,
                error = %err,
                "Delivery failed, handing back for retry"
            );
            if broker.retry(delivery, &err.to_string()).await == RetryOutcome::DeadLettered {
                if let Err(route_err) = executor.handle_permanent_failure(&job).await {
                    tracing::error!(
                        step_id = %job.step_id,
                        error = %route_err,
                        "Failure routing after dead-letter failed"
                    );
                }
            }
        }
        Err(err) => {
            tracing::error!(
                step_id = %job.step_id,
                error = %err,
                "Delivery failed fatally, discarding"
            );
            broker.discard(delivery, &err.to_string()).await;
        }
    }
}
