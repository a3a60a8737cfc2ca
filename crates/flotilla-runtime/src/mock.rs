use crate::error::Result;
use crate::traits::{ExecutionOutcome, JobExecutor};
use async_trait::async_trait;
use flotilla_core::{Job, JobId, NodeId};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Behaviour hint a job can carry in its payload when run by `MockExecutor`
///
/// ```json
/// {"duration_ms": 250, "fail_attempts": 2, "result": {"rows": 10}}
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MockHint {
    /// Simulated run time
    pub duration_ms: u64,
    /// The first `fail_attempts` attempts fail
    pub fail_attempts: u32,
    /// Result reported on success
    pub result: Option<serde_json::Value>,
    /// Hand the job off and never report inline
    pub detach: bool,
}

impl MockHint {
    /// Read the hint from a job payload; anything unparseable means "succeed at once"
    pub fn from_job(job: &Job) -> Self {
        if job.payload.is_empty() {
            return Self::default();
        }
        serde_json::from_slice(&job.payload).unwrap_or_default()
    }
}

/// A single call observed by the mock
#[derive(Debug, Clone, PartialEq)]
pub struct MockExecution {
    pub node: NodeId,
    pub job_id: JobId,
    pub attempt: u32,
}

/// Simulated node agent for tests and the `simulate` command
///
/// Sleeps for the hinted duration (tokio time, so paused-clock tests stay
/// instant), then fails or succeeds according to the payload hint.
#[derive(Default)]
pub struct MockExecutor {
    executions: Mutex<Vec<MockExecution>>,
    cancelled: Mutex<Vec<JobId>>,
    running: Mutex<HashMap<JobId, CancellationToken>>,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every dispatch seen so far, in call order
    pub fn executions(&self) -> Vec<MockExecution> {
        self.executions.lock().clone()
    }

    /// Number of dispatches seen for one job
    pub fn attempts_for(&self, job_id: JobId) -> usize {
        self.executions
            .lock()
            .iter()
            .filter(|e| e.job_id == job_id)
            .count()
    }

    pub fn cancelled(&self) -> Vec<JobId> {
        self.cancelled.lock().clone()
    }
}

#[async_trait]
impl JobExecutor for MockExecutor {
    async fn on_job_assigned(&self, node: &NodeId, job: &Job) -> Result<ExecutionOutcome> {
        let hint = MockHint::from_job(job);
        self.executions.lock().push(MockExecution {
            node: node.clone(),
            job_id: job.id,
            attempt: job.attempt,
        });
        debug!(
            "Mock: job {} attempt {} on node {} ({:?})",
            job.id, job.attempt, node, hint
        );

        if hint.detach {
            return Ok(ExecutionOutcome::Detached);
        }

        let token = CancellationToken::new();
        self.running.lock().insert(job.id, token.clone());

        if hint.duration_ms > 0 {
            tokio::select! {
                _ = token.cancelled() => {
                    self.running.lock().remove(&job.id);
                    return Ok(ExecutionOutcome::Failed("cancelled".to_string()));
                }
                _ = tokio::time::sleep(Duration::from_millis(hint.duration_ms)) => {}
            }
        }
        self.running.lock().remove(&job.id);

        if job.attempt <= hint.fail_attempts {
            return Ok(ExecutionOutcome::Failed(format!(
                "simulated failure on attempt {}",
                job.attempt
            )));
        }

        Ok(ExecutionOutcome::Completed(hint.result.unwrap_or_else(|| {
            serde_json::json!({ "node": node.as_str(), "attempt": job.attempt })
        })))
    }

    async fn cancel(&self, node: &NodeId, job_id: JobId) -> Result<()> {
        debug!("Mock: cancel job {} on node {}", job_id, node);
        self.cancelled.lock().push(job_id);
        if let Some(token) = self.running.lock().remove(&job_id) {
            token.cancel();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_core::{JobDefaults, JobSpec};
    use std::sync::Arc;

    fn make_job(payload: &str) -> Job {
        let mut job = Job::from_spec(
            JobSpec::new("mock-job").with_payload(payload.as_bytes().to_vec()),
            &JobDefaults::default(),
            chrono::Utc::now(),
        )
        .unwrap();
        job.mark_queued().unwrap();
        job.mark_running(NodeId::from("node-1"), chrono::Utc::now())
            .unwrap();
        job
    }

    #[tokio::test]
    async fn test_empty_payload_succeeds() {
        let executor = MockExecutor::new();
        let job = make_job("");
        let outcome = executor
            .on_job_assigned(&NodeId::from("node-1"), &job)
            .await
            .unwrap();
        assert!(matches!(outcome, ExecutionOutcome::Completed(_)));
        assert_eq!(executor.attempts_for(job.id), 1);
    }

    #[tokio::test]
    async fn test_fail_attempts_hint() {
        let executor = MockExecutor::new();
        let job = make_job(r#"{"fail_attempts": 1, "result": 42}"#);
        let node = NodeId::from("node-1");

        let first = executor.on_job_assigned(&node, &job).await.unwrap();
        assert!(matches!(first, ExecutionOutcome::Failed(_)));

        let mut retry = job.clone();
        retry.attempt = 2;
        let second = executor.on_job_assigned(&node, &retry).await.unwrap();
        assert_eq!(second, ExecutionOutcome::Completed(serde_json::json!(42)));
    }

    #[tokio::test]
    async fn test_detach_hint() {
        let executor = MockExecutor::new();
        let job = make_job(r#"{"detach": true}"#);
        let outcome = executor
            .on_job_assigned(&NodeId::from("node-1"), &job)
            .await
            .unwrap();
        assert_eq!(outcome, ExecutionOutcome::Detached);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_running_job() {
        let executor = Arc::new(MockExecutor::new());
        let job = make_job(r#"{"duration_ms": 60000}"#);
        let job_id = job.id;
        let node = NodeId::from("node-1");

        let runner = executor.clone();
        let run_node = node.clone();
        let handle = tokio::spawn(async move { runner.on_job_assigned(&run_node, &job).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        executor.cancel(&node, job_id).await.unwrap();

        let outcome = handle.await.unwrap().unwrap();
        assert!(matches!(outcome, ExecutionOutcome::Failed(_)));
        assert_eq!(executor.cancelled(), vec![job_id]);
    }
}
