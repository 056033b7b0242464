//! Worker configuration.

use anyhow::Result;

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Unique worker identifier (UUID).
    pub worker_id: String,

    /// Concurrency bound for the normal lane.
    pub normal_concurrency: usize,

    /// Concurrency bound for the priority (alert) lane.
    pub priority_concurrency: usize,

    /// Concurrency bound for the scheduled lane.
    pub scheduled_concurrency: usize,
}

impl WorkerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let worker_id =
            std::env::var("WORKER_ID").unwrap_or_else(|_| uuid::Uuid::new_v4().to_string());

        let normal_concurrency: usize = std::env::var("WORKER_NORMAL_CONCURRENCY")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(8);

        let priority_concurrency: usize = std::env::var("WORKER_PRIORITY_CONCURRENCY")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(4);

        let scheduled_concurrency: usize = std::env::var("WORKER_SCHEDULED_CONCURRENCY")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(2);

        Ok(Self {
            worker_id,
            normal_concurrency,
            priority_concurrency,
            scheduled_concurrency,
        })
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: uuid::Uuid::new_v4().to_string(),
            normal_concurrency: 8,
            priority_concurrency: 4,
            scheduled_concurrency: 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = WorkerConfig::default();
        assert!(!config.worker_id.is_empty());
        // Bulk traffic gets the widest pool; alerts stay responsive.
        assert!(config.normal_concurrency > config.priority_concurrency);
        assert!(config.priority_concurrency > config.scheduled_concurrency);
    }
}
