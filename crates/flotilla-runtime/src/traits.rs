use crate::error::Result;
use async_trait::async_trait;
use flotilla_core::{Job, JobId, NodeId};

/// What an executor reports back for a dispatched job
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    /// The job ran to completion with this result
    Completed(serde_json::Value),
    /// The job ran and failed
    Failed(String),
    /// The work was handed off; the outcome arrives later through the
    /// scheduler's `report_success` / `report_failure` callbacks
    Detached,
}

/// Trait for the component that actually runs jobs on nodes
///
/// The scheduler never inspects the payload. It calls `on_job_assigned`
/// once per dispatch attempt, bounded by the job's timeout, and routes
/// the outcome through the recovery path. Implementations must tolerate
/// `cancel` for jobs they no longer know about.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// Run (or hand off) `job` on `node`
    async fn on_job_assigned(&self, node: &NodeId, job: &Job) -> Result<ExecutionOutcome>;

    /// Best-effort stop of a running job
    async fn cancel(&self, node: &NodeId, job_id: JobId) -> Result<()>;
}

/// Receives the jobs reclaimed from a node declared dead
///
/// Called exactly once per Active/Suspected -> Inactive transition.
#[async_trait]
pub trait NodeLossHandler: Send + Sync {
    async fn on_node_lost(&self, node: &NodeId, jobs: Vec<JobId>);
}
