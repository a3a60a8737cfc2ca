use crate::balancer::BalancingStrategy;
use flotilla_core::{FlotillaError, JobDefaults};
use flotilla_runtime::HeartbeatMonitorConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the scheduler core
///
/// Every field has a default, so a config file only needs the keys it
/// changes. Call [`SchedulerConfig::validate`] before building a scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum number of admitted, non-terminal jobs
    pub queue_capacity: usize,
    /// Number of priority bands (priorities run 0..priority_levels)
    pub priority_levels: u8,
    /// Expected heartbeat cadence and monitor sweep interval
    pub heartbeat_interval_secs: u64,
    /// Missed intervals tolerated before a node is declared Inactive
    pub missed_threshold: u32,
    /// Default and maximum retry budget per job
    pub retry_limit: u32,
    /// Delay before the first retry; doubles on each further retry
    pub retry_backoff_base_secs: u64,
    /// Upper bound on the retry delay
    pub retry_backoff_max_secs: u64,
    /// Execution timeout for jobs that do not set their own
    pub job_timeout_secs: u64,
    /// Maximum number of jobs executing at once
    pub max_concurrent_jobs: usize,
    /// How long terminal jobs stay queryable
    pub job_retention_secs: u64,
    /// Pause before retrying dispatch when no node can take a job
    pub dispatch_backoff_ms: u64,
    /// Largest accepted job payload
    pub max_payload_bytes: usize,
    /// Node selection strategy
    pub strategy: BalancingStrategy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            priority_levels: 10,
            heartbeat_interval_secs: 30,
            missed_threshold: 3,
            retry_limit: 3,
            retry_backoff_base_secs: 60,
            retry_backoff_max_secs: 600,
            job_timeout_secs: 3600,
            max_concurrent_jobs: 100,
            job_retention_secs: 3600,
            dispatch_backoff_ms: 100,
            max_payload_bytes: 1024 * 1024,
            strategy: BalancingStrategy::default(),
        }
    }
}

impl SchedulerConfig {
    /// Reject values that would make the scheduler misbehave
    pub fn validate(&self) -> flotilla_core::Result<()> {
        if self.queue_capacity == 0 {
            return Err(FlotillaError::invalid_config(
                "queue_capacity must be greater than zero",
                "Set queue_capacity to the number of jobs you expect in flight, e.g. 1000",
            ));
        }
        if self.priority_levels == 0 {
            return Err(FlotillaError::invalid_config(
                "priority_levels must be at least 1",
                "Use the default of 10 priority bands",
            ));
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(FlotillaError::invalid_config(
                "heartbeat_interval_secs must be greater than zero",
                "Nodes typically heartbeat every 10-30 seconds",
            ));
        }
        if self.missed_threshold == 0 {
            return Err(FlotillaError::invalid_config(
                "missed_threshold must be at least 1",
                "A threshold of 3 tolerates short network blips",
            ));
        }
        if self.retry_backoff_max_secs < self.retry_backoff_base_secs {
            return Err(FlotillaError::invalid_config(
                format!(
                    "retry_backoff_max_secs ({}) is below retry_backoff_base_secs ({})",
                    self.retry_backoff_max_secs, self.retry_backoff_base_secs
                ),
                "Raise retry_backoff_max_secs or lower retry_backoff_base_secs",
            ));
        }
        if self.job_timeout_secs == 0 {
            return Err(FlotillaError::invalid_config(
                "job_timeout_secs must be greater than zero",
                "Use a generous default such as 3600 and let jobs set tighter timeouts",
            ));
        }
        if self.max_concurrent_jobs == 0 {
            return Err(FlotillaError::invalid_config(
                "max_concurrent_jobs must be greater than zero",
                "Set it to roughly the total job slots across your nodes",
            ));
        }
        Ok(())
    }

    /// Limits applied when turning a spec into a job
    pub fn job_defaults(&self) -> JobDefaults {
        JobDefaults {
            priority_levels: self.priority_levels,
            max_retries: self.retry_limit,
            timeout: Duration::from_secs(self.job_timeout_secs),
            max_payload_bytes: self.max_payload_bytes,
        }
    }

    pub fn heartbeat_monitor(&self) -> HeartbeatMonitorConfig {
        HeartbeatMonitorConfig {
            check_interval: Duration::from_secs(self.heartbeat_interval_secs),
            missed_threshold: self.missed_threshold,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            backoff_base: Duration::from_secs(self.retry_backoff_base_secs),
            backoff_max: Duration::from_secs(self.retry_backoff_max_secs),
        }
    }

    pub fn job_retention(&self) -> Duration {
        Duration::from_secs(self.job_retention_secs)
    }

    pub fn dispatch_backoff(&self) -> Duration {
        Duration::from_millis(self.dispatch_backoff_ms)
    }
}

/// Exponential retry backoff
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        SchedulerConfig::default().retry_policy()
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry_count` (1-based): base * 2^(n-1), capped
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(31);
        self.backoff_base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max)
    }
}
