use crate::error::{FlotillaError, Result};
use crate::resources::ResourceRequirements;
use crate::types::{JobId, NodeId};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Lifecycle state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Retrying,
    Cancelled,
}

impl JobStatus {
    /// Completed, Failed and Cancelled accept no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether the state machine allows moving from `self` to `to`
    pub fn can_transition_to(&self, to: JobStatus) -> bool {
        use JobStatus::*;
        match (self, to) {
            (from, Cancelled) => !from.is_terminal(),
            (Pending, Queued) => true,
            (Queued, Running) => true,
            (Running, Completed) => true,
            (Running, Retrying) => true,
            (Retrying, Queued) => true,
            (Retrying, Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Retrying => "retrying",
            JobStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Why a job stopped running without completing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The executor reported an error
    ExecutionError,
    /// The job exceeded its execution timeout
    Timeout,
    /// The node hosting the job was declared dead
    NodeLost,
    /// Operator-initiated cancellation
    Cancelled,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureReason::ExecutionError => "execution_error",
            FailureReason::Timeout => "timeout",
            FailureReason::NodeLost => "node_lost",
            FailureReason::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Limits and defaults applied when a spec is turned into a job
#[derive(Debug, Clone)]
pub struct JobDefaults {
    /// Number of priority bands; priorities are clamped into `0..priority_levels`
    pub priority_levels: u8,
    /// Retry budget for jobs that do not set one, and the upper bound for those that do
    pub max_retries: u32,
    /// Execution timeout for jobs that do not set one
    pub timeout: Duration,
    /// Largest accepted payload
    pub max_payload_bytes: usize,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            priority_levels: 10,
            max_retries: 3,
            timeout: Duration::from_secs(3600),
            max_payload_bytes: 1024 * 1024,
        }
    }
}

/// What a caller submits
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobSpec {
    #[serde(default)]
    pub name: String,
    /// Requested priority; out-of-range values are clamped, not rejected
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub resources: ResourceRequirements,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Opaque blob handed to the executor untouched
    #[serde(default)]
    pub payload: Bytes,
}

impl JobSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_resources(mut self, resources: ResourceRequirements) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = Some(timeout.as_secs().max(1));
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }
}

/// A unit of submitted work and its lifecycle state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    /// Higher is more urgent
    pub priority: u8,
    pub resources: ResourceRequirements,
    pub status: JobStatus,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Number of dispatches so far; identifies the current execution attempt
    pub attempt: u32,
    /// Earliest time a retried job may be dispatched again
    pub next_retry_at: Option<DateTime<Utc>>,
    pub timeout: Duration,
    pub assigned_node: Option<NodeId>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub last_failure: Option<FailureReason>,
    #[serde(skip_serializing_if = "Bytes::is_empty", default)]
    pub payload: Bytes,
}

impl Job {
    /// Validate a spec and build a Pending job from it
    pub fn from_spec(spec: JobSpec, defaults: &JobDefaults, now: DateTime<Utc>) -> Result<Self> {
        spec.resources.validate()?;

        let name = spec.name.trim();
        if name.len() > 253 {
            return Err(FlotillaError::validation_failed(
                "name",
                format!("{} characters exceeds the 253 character limit", name.len()),
                "Use a shorter job name",
            ));
        }

        if spec.payload.len() > defaults.max_payload_bytes {
            return Err(FlotillaError::validation_failed(
                "payload",
                format!(
                    "{} bytes exceeds the {} byte limit",
                    spec.payload.len(),
                    defaults.max_payload_bytes
                ),
                "Store large inputs externally and pass a reference in the payload",
            ));
        }

        let max_retries = match spec.max_retries {
            Some(n) if n > defaults.max_retries => {
                return Err(FlotillaError::validation_failed(
                    "max_retries",
                    format!("{} exceeds the configured limit of {}", n, defaults.max_retries),
                    "Lower max_retries or raise the scheduler retry limit",
                ));
            }
            Some(n) => n,
            None => defaults.max_retries,
        };

        let timeout = match spec.timeout_secs {
            Some(0) => {
                return Err(FlotillaError::validation_failed(
                    "timeout_secs",
                    "must be at least one second",
                    "Omit timeout_secs to use the scheduler default",
                ));
            }
            Some(secs) => Duration::from_secs(secs),
            None => defaults.timeout,
        };

        let top = i64::from(defaults.priority_levels.max(1) - 1);
        let priority = spec.priority.unwrap_or(top / 2).clamp(0, top) as u8;

        Ok(Self {
            id: JobId::new(),
            name: if name.is_empty() {
                "unnamed-job".to_string()
            } else {
                name.to_string()
            },
            priority,
            resources: spec.resources,
            status: JobStatus::Pending,
            submitted_at: now,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries,
            attempt: 0,
            next_retry_at: None,
            timeout,
            assigned_node: None,
            result: None,
            error: None,
            last_failure: None,
            payload: spec.payload,
        })
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn has_retry_budget(&self) -> bool {
        self.retry_count < self.max_retries
    }

    fn transition(&mut self, to: JobStatus) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(FlotillaError::invalid_transition(
                self.id.to_string(),
                self.status.to_string(),
                to.to_string(),
            ));
        }
        self.status = to;
        Ok(())
    }

    /// Pending -> Queued on admission
    pub fn mark_queued(&mut self) -> Result<()> {
        self.transition(JobStatus::Queued)
    }

    /// Queued -> Running on dispatch to `node`
    pub fn mark_running(&mut self, node: NodeId, now: DateTime<Utc>) -> Result<()> {
        self.transition(JobStatus::Running)?;
        self.attempt += 1;
        self.started_at = Some(now);
        self.assigned_node = Some(node);
        self.next_retry_at = None;
        Ok(())
    }

    /// Running -> Completed with the executor's result
    pub fn mark_completed(&mut self, result: serde_json::Value, now: DateTime<Utc>) -> Result<()> {
        self.transition(JobStatus::Completed)?;
        self.completed_at = Some(now);
        self.result = Some(result);
        self.error = None;
        Ok(())
    }

    /// Running -> Retrying after a failure, recording why
    pub fn mark_retrying(&mut self, reason: FailureReason, detail: impl Into<String>) -> Result<()> {
        self.transition(JobStatus::Retrying)?;
        self.last_failure = Some(reason);
        self.error = Some(detail.into());
        Ok(())
    }

    /// Retrying -> Queued, consuming one unit of retry budget
    pub fn requeue_for_retry(&mut self, next_retry_at: DateTime<Utc>) -> Result<()> {
        if !self.has_retry_budget() {
            return Err(FlotillaError::invalid_transition(
                self.id.to_string(),
                format!("{} (retry budget exhausted)", self.status),
                JobStatus::Queued.to_string(),
            ));
        }
        self.transition(JobStatus::Queued)?;
        self.retry_count += 1;
        self.assigned_node = None;
        self.next_retry_at = Some(next_retry_at);
        Ok(())
    }

    /// Retrying -> Failed once the retry budget is spent
    pub fn mark_failed(&mut self, error: impl Into<String>, now: DateTime<Utc>) -> Result<()> {
        self.transition(JobStatus::Failed)?;
        self.completed_at = Some(now);
        self.error = Some(error.into());
        self.result = None;
        Ok(())
    }

    /// Any non-terminal state -> Cancelled
    pub fn mark_cancelled(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(JobStatus::Cancelled)?;
        self.completed_at = Some(now);
        self.last_failure = Some(FailureReason::Cancelled);
        self.result = None;
        Ok(())
    }
}
