//! Engine configuration: per-lane retry, priority and concurrency policy.

use std::time::Duration;

use crate::model::Lane;
use crate::queue::BackoffPolicy;

/// Policy for one queue lane.
#[derive(Debug, Clone)]
pub struct LanePolicy {
    /// Maximum delivery attempts before dead-lettering.
    pub attempts: u32,
    pub backoff: BackoffPolicy,
    /// Dispatch priority within the lane (higher wins among due jobs).
    pub priority: i32,
    /// Worker concurrency bound for this lane.
    pub concurrency: usize,
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub normal: LanePolicy,
    pub priority: LanePolicy,
    pub scheduled: LanePolicy,
    /// Audit outbox channel capacity.
    pub audit_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            normal: LanePolicy {
                attempts: 3,
                backoff: BackoffPolicy::Exponential(Duration::from_secs(5)),
                priority: 0,
                concurrency: 8,
            },
            priority: LanePolicy {
                attempts: 5,
                backoff: BackoffPolicy::Fixed(Duration::from_secs(3)),
                priority: 1,
                concurrency: 4,
            },
            scheduled: LanePolicy {
                attempts: 3,
                backoff: BackoffPolicy::Fixed(Duration::from_secs(5)),
                priority: 0,
                concurrency: 2,
            },
            audit_buffer: 256,
        }
    }
}

impl EngineConfig {
    /// The policy governing a lane.
    pub fn lane_policy(&self, lane: Lane) -> &LanePolicy {
        match lane {
            Lane::Normal => &self.normal,
            Lane::Priority => &self.priority,
            Lane::Scheduled => &self.scheduled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_lane_policies() {
        let config = EngineConfig::default();
        assert_eq!(config.lane_policy(Lane::Normal).attempts, 3);
        assert_eq!(config.lane_policy(Lane::Priority).attempts, 5);
        assert_eq!(config.lane_policy(Lane::Priority).priority, 1);
        // Alerts must never be starved behind bulk traffic, but bulk
        // traffic gets the widest pool.
        assert!(config.normal.concurrency > config.priority.concurrency);
        assert!(config.priority.concurrency > config.scheduled.concurrency);
    }
}
