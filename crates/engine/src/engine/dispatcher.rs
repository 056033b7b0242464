//! Dispatcher: turns a runnable step into time-ordered jobs on the
//! right lane.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::model::{idempotency_key, Lane, StepJob, StepStatus, StepType, Workflow, WorkflowStep};
use crate::queue::{EnqueueOptions, QueueBroker};
use crate::store::{update_step, StepStore};

use super::{parse_duration_token, recurrence};

/// Computes delay, lane and priority for a step and submits one job per
/// target patient.
pub struct Dispatcher {
    steps: Arc<dyn StepStore>,
    broker: Arc<dyn QueueBroker>,
    config: EngineConfig,
}

impl Dispatcher {
    pub fn new(
        steps: Arc<dyn StepStore>,
        broker: Arc<dyn QueueBroker>,
        config: EngineConfig,
    ) -> Self {
        Self {
            steps,
            broker,
            config,
        }
    }

    /// Schedule a step for the given patients.
    ///
    /// Unmet dependencies park the step in `waiting_condition` without
    /// enqueueing; the resolver re-invokes this on every dependency
    /// completion. An exhausted schedule marks the step `skipped`.
    pub async fn schedule(
        &self,
        step: &WorkflowStep,
        workflow: &Workflow,
        patient_ids: &[Uuid],
    ) -> EngineResult<()> {
        if !self
            .steps
            .dependencies_completed(&step.dependencies)
            .await?
        {
            tracing::debug!(
                step_id = %step.id,
                workflow_id = %workflow.id,
                "Dependencies not yet completed, step parked"
            );
            update_step(self.steps.as_ref(), step.id, |s| {
                if !s.status.is_terminal() && s.status != StepStatus::WaitingCondition {
                    s.status = StepStatus::WaitingCondition;
                    s.log(
                        "waiting_condition",
                        "Waiting for dependencies to complete",
                        None,
                    );
                }
            })
            .await?;
            return Ok(());
        }

        let now = Utc::now();
        let lane = lane_for(step);

        // Wake delay: schedule-bearing steps follow the recurrence
        // calculator; relative condition timing is converted here, once.
        let (delay, occurrence) = match step.schedule.as_ref() {
            Some(schedule) => match recurrence::next_execution(schedule, now) {
                Some(at) => {
                    let delay = (at - now).to_std().unwrap_or(Duration::ZERO);
                    (delay, Some(at))
                }
                None => {
                    tracing::info!(
                        step_id = %step.id,
                        workflow_id = %workflow.id,
                        "Schedule exhausted, step skipped"
                    );
                    update_step(self.steps.as_ref(), step.id, |s| {
                        s.status = StepStatus::Skipped;
                        s.log("skipped", "Schedule exhausted", None);
                    })
                    .await?;
                    return Ok(());
                }
            },
            None => (self.relative_delay(step), None),
        };

        let wake_at =
            now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        update_step(self.steps.as_ref(), step.id, |s| {
            s.status = StepStatus::Queued;
            if let (Some(schedule), Some(at)) = (s.schedule.as_mut(), occurrence) {
                schedule.last_executed = Some(at);
            }
            s.log(
                "queued",
                "Step added to execution queue",
                Some(serde_json::json!({
                    "lane": lane.to_string(),
                    "wake_at": wake_at,
                })),
            );
        })
        .await?;

        let policy = self.config.lane_policy(lane);
        for &patient_id in patient_ids {
            let job = StepJob::new(step.id, patient_id, workflow.doctor_id, workflow.id);
            let opts = EnqueueOptions {
                delay,
                priority: policy.priority,
                attempts: policy.attempts,
                backoff: policy.backoff,
                idempotency_key: idempotency_key(step.id, patient_id, now),
            };
            let queued = self.broker.enqueue(lane, job, opts).await?;
            if queued {
                tracing::info!(
                    step_id = %step.id,
                    patient_id = %patient_id,
                    lane = %lane,
                    delay_ms = delay.as_millis() as u64,
                    "Step job enqueued"
                );
            }
        }
        Ok(())
    }

    fn relative_delay(&self, step: &WorkflowStep) -> Duration {
        let Some(token) = step
            .condition
            .as_ref()
            .and_then(|c| c.timing.as_ref())
            .and_then(|t| t.after_previous.as_deref())
        else {
            return Duration::ZERO;
        };
        match parse_duration_token(token) {
            Some(delay) => delay,
            None => {
                tracing::warn!(step_id = %step.id, token, "Malformed duration token, no delay");
                Duration::ZERO
            }
        }
    }
}

fn lane_for(step: &WorkflowStep) -> Lane {
    if step.step_type == StepType::Alert {
        Lane::Priority
    } else if step.schedule.is_some() {
        Lane::Scheduled
    } else {
        Lane::Normal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        ActionSpec, AlertSeverity, Condition, ConditionKind, ConditionTiming, NotifyTarget,
        Schedule, ScheduleType,
    };
    use crate::queue::InMemoryBroker;
    use crate::store::InMemoryStepStore;

    struct Fixture {
        steps: Arc<InMemoryStepStore>,
        broker: Arc<InMemoryBroker>,
        dispatcher: Dispatcher,
        workflow: Workflow,
    }

    fn fixture() -> Fixture {
        let steps = Arc::new(InMemoryStepStore::new());
        let broker = Arc::new(InMemoryBroker::new());
        let dispatcher = Dispatcher::new(
            steps.clone() as Arc<dyn StepStore>,
            broker.clone() as Arc<dyn QueueBroker>,
            EngineConfig::default(),
        );
        let workflow = Workflow::new("post-op", None, Uuid::new_v4(), vec![Uuid::new_v4()]);
        Fixture {
            steps,
            broker,
            dispatcher,
            workflow,
        }
    }

    fn reminder(workflow_id: Uuid, order: u32) -> WorkflowStep {
        WorkflowStep::new(
            workflow_id,
            format!("step-{order}"),
            order,
            ActionSpec::Reminder {
                message: "hydration check".to_string(),
                target: NotifyTarget::Patient,
            },
        )
    }

    #[tokio::test]
    async fn test_dependency_free_step_dispatches_immediately() {
        let fx = fixture();
        let step = fx
            .steps
            .insert_step(reminder(fx.workflow.id, 1))
            .await
            .unwrap();

        fx.dispatcher
            .schedule(&step, &fx.workflow, &fx.workflow.patient_ids)
            .await
            .unwrap();

        assert_eq!(fx.broker.depth(Lane::Normal).await, 1);
        let saved = fx.steps.find_step(step.id).await.unwrap().unwrap();
        assert_eq!(saved.status, StepStatus::Queued);
        assert_eq!(saved.execution_logs.len(), 1);
    }

    #[tokio::test]
    async fn test_unmet_dependencies_park_without_enqueue() {
        let fx = fixture();
        let blocker = fx
            .steps
            .insert_step(reminder(fx.workflow.id, 1))
            .await
            .unwrap();
        let mut blocked = reminder(fx.workflow.id, 2);
        blocked.dependencies = vec![blocker.id];
        let blocked = fx.steps.insert_step(blocked).await.unwrap();

        fx.dispatcher
            .schedule(&blocked, &fx.workflow, &fx.workflow.patient_ids)
            .await
            .unwrap();

        assert_eq!(fx.broker.depth(Lane::Normal).await, 0);
        let saved = fx.steps.find_step(blocked.id).await.unwrap().unwrap();
        assert_eq!(saved.status, StepStatus::WaitingCondition);
    }

    #[tokio::test]
    async fn test_alert_routes_to_priority_lane() {
        let fx = fixture();
        let mut step = reminder(fx.workflow.id, 1);
        step.action = ActionSpec::Alert {
            message: "creatinine above threshold".to_string(),
            severity: AlertSeverity::Critical,
        };
        step.step_type = StepType::Alert;
        let step = fx.steps.insert_step(step).await.unwrap();

        fx.dispatcher
            .schedule(&step, &fx.workflow, &fx.workflow.patient_ids)
            .await
            .unwrap();

        assert_eq!(fx.broker.depth(Lane::Priority).await, 1);
        assert_eq!(fx.broker.depth(Lane::Normal).await, 0);
    }

    #[tokio::test]
    async fn test_schedule_bearing_step_uses_scheduled_lane_and_arms_recurrence() {
        let fx = fixture();
        let mut step = reminder(fx.workflow.id, 1);
        step.schedule = Some(Schedule {
            schedule_type: ScheduleType::Daily,
            start_date: Utc::now() - chrono::Duration::days(1),
            end_date: None,
            interval: Some(1),
            cron_expression: None,
            last_executed: None,
        });
        let step = fx.steps.insert_step(step).await.unwrap();

        fx.dispatcher
            .schedule(&step, &fx.workflow, &fx.workflow.patient_ids)
            .await
            .unwrap();

        assert_eq!(fx.broker.depth(Lane::Scheduled).await, 1);
        let saved = fx.steps.find_step(step.id).await.unwrap().unwrap();
        assert!(saved.schedule.unwrap().last_executed.is_some());
    }

    #[tokio::test]
    async fn test_exhausted_schedule_skips_step() {
        let fx = fixture();
        let mut step = reminder(fx.workflow.id, 1);
        step.schedule = Some(Schedule {
            schedule_type: ScheduleType::Once,
            start_date: Utc::now() - chrono::Duration::days(2),
            end_date: None,
            interval: None,
            cron_expression: None,
            last_executed: None,
        });
        let step = fx.steps.insert_step(step).await.unwrap();

        fx.dispatcher
            .schedule(&step, &fx.workflow, &fx.workflow.patient_ids)
            .await
            .unwrap();

        assert_eq!(fx.broker.depth(Lane::Scheduled).await, 0);
        let saved = fx.steps.find_step(step.id).await.unwrap().unwrap();
        assert_eq!(saved.status, StepStatus::Skipped);
    }

    #[tokio::test]
    async fn test_concurrent_schedule_calls_deduplicate() {
        let fx = fixture();
        let step = fx
            .steps
            .insert_step(reminder(fx.workflow.id, 1))
            .await
            .unwrap();

        fx.dispatcher
            .schedule(&step, &fx.workflow, &fx.workflow.patient_ids)
            .await
            .unwrap();
        fx.dispatcher
            .schedule(&step, &fx.workflow, &fx.workflow.patient_ids)
            .await
            .unwrap();

        assert_eq!(fx.broker.depth(Lane::Normal).await, 1);
    }

    #[tokio::test]
    async fn test_after_previous_timing_becomes_wake_delay() {
        let fx = fixture();
        let mut step = reminder(fx.workflow.id, 1);
        step.condition = Some(Condition {
            kind: ConditionKind::TimeBased,
            parameter: None,
            operator: None,
            threshold: None,
            branch: Default::default(),
            timing: Some(ConditionTiming {
                specific_time: None,
                after_previous: Some("2h".to_string()),
            }),
        });
        let step = fx.steps.insert_step(step).await.unwrap();

        fx.dispatcher
            .schedule(&step, &fx.workflow, &fx.workflow.patient_ids)
            .await
            .unwrap();

        let saved = fx.steps.find_step(step.id).await.unwrap().unwrap();
        assert_eq!(saved.status, StepStatus::Queued);
        let details = saved.execution_logs[0].details.as_ref().unwrap();
        assert_eq!(details["lane"], "normal");
        // Queued but not deliverable for two hours.
        assert_eq!(fx.broker.depth(Lane::Normal).await, 1);
    }
}
