// Allow unused assignments for diagnostic fields - they're used by the macros
#![allow(unused_assignments)]

use miette::Diagnostic;
use thiserror::Error;

/// Scheduler error type
#[derive(Error, Debug, Diagnostic)]
pub enum SchedulerError {
    /// Admission refused because the queue is at capacity
    #[error("Queue is full ({capacity} admitted jobs)")]
    #[diagnostic(
        code(scheduler::queue_full),
        help("Wait for running jobs to finish or raise `queue_capacity`")
    )]
    QueueFull { capacity: usize },

    /// Job id not known to the scheduler
    #[error("Job not found: {job_id}")]
    #[diagnostic(
        code(scheduler::job_not_found),
        help("Terminal jobs are evicted after `job_retention`. Check the id or the retention window")
    )]
    JobNotFound { job_id: String },

    /// No node can take the job right now
    #[error("No suitable node found for job {job_id}")]
    #[diagnostic(
        code(scheduler::no_suitable_node),
        help("Check node resources and liveness. The job stays queued and is retried without penalty")
    )]
    NoSuitableNode { job_id: String, reason: String },

    /// Runtime error
    #[error(transparent)]
    #[diagnostic(transparent)]
    RuntimeError(#[from] flotilla_runtime::RuntimeError),

    /// Core error
    #[error(transparent)]
    #[diagnostic(transparent)]
    CoreError(#[from] flotilla_core::FlotillaError),
}

/// Result type for scheduler operations
pub type Result<T> = std::result::Result<T, SchedulerError>;

impl SchedulerError {
    /// Create a QueueFull error
    pub fn queue_full(capacity: usize) -> Self {
        Self::QueueFull { capacity }
    }

    /// Create a JobNotFound error
    pub fn job_not_found(job_id: impl Into<String>) -> Self {
        Self::JobNotFound {
            job_id: job_id.into(),
        }
    }

    /// Create a NoSuitableNode error
    pub fn no_suitable_node(job_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::NoSuitableNode {
            job_id: job_id.into(),
            reason: reason.into(),
        }
    }
}
