use crate::manifest::Manifest;
use flotilla_core::{Clock, FailureReason, Job, JobId, JobStatus, NodeId, SystemClock};
use flotilla_runtime::MockExecutor;
use flotilla_scheduler::{QueueStats, Scheduler, SchedulerConfig, SchedulerError};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// One line of the final job table
#[derive(Debug, Clone, Serialize)]
pub struct JobRow {
    pub id: JobId,
    pub name: String,
    pub status: JobStatus,
    pub priority: u8,
    pub node: Option<NodeId>,
    pub attempts: u32,
    pub retry_count: u32,
    pub last_failure: Option<FailureReason>,
    pub error: Option<String>,
    pub result: Option<serde_json::Value>,
}

impl From<&Job> for JobRow {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            name: job.name.clone(),
            status: job.status,
            priority: job.priority,
            node: job.assigned_node.clone(),
            attempts: job.attempt,
            retry_count: job.retry_count,
            last_failure: job.last_failure,
            error: job.error.clone(),
            result: job.result.clone(),
        }
    }
}

/// What `flotilla simulate` prints
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub jobs: Vec<JobRow>,
    pub counts: BTreeMap<String, usize>,
    /// Submissions refused because the queue was full
    pub rejected: Vec<String>,
    pub queue: QueueStats,
    pub elapsed_ms: u64,
    /// False when the deadline passed with jobs still active
    pub finished: bool,
}

/// Boot a scheduler with a mock executor, feed it the manifest and run
/// until every job is terminal or `deadline` passes
pub async fn run(
    config: SchedulerConfig,
    manifest: Manifest,
    deadline: Duration,
) -> miette::Result<SimulationReport> {
    let started = tokio::time::Instant::now();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let executor = Arc::new(MockExecutor::new());
    let heartbeat_every = Duration::from_secs(config.heartbeat_interval_secs);
    let scheduler = Scheduler::new(config, executor, clock)?;

    let token = CancellationToken::new();
    let mut heartbeats = Vec::new();
    for node in &manifest.nodes {
        let capacity = node.capacity()?;
        let registered = scheduler.register_node(node.name.as_str(), capacity);
        info!(
            "Registered node {} ({} cores, {:.2} GB)",
            registered.id, registered.capacity.cpu_cores, registered.capacity.memory_gb
        );
        heartbeats.push(tokio::spawn(heartbeat_loop(
            scheduler.clone(),
            registered.id,
            node.load,
            heartbeat_every,
            node.fail_after(),
            token.clone(),
        )));
    }

    let runner = scheduler.clone();
    let run_token = token.clone();
    let run_handle = tokio::spawn(async move { runner.run(run_token).await });

    let mut rejected = Vec::new();
    for job in &manifest.jobs {
        for spec in job.to_specs()? {
            let name = spec.name.clone();
            match scheduler.submit(spec) {
                Ok(_) => {}
                Err(e @ SchedulerError::QueueFull { .. }) => {
                    warn!("Job {} rejected: {}", name, e);
                    rejected.push(name);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    let finished = tokio::time::timeout(deadline, async {
        while scheduler.active_jobs() > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .is_ok();
    if !finished {
        warn!(
            "Deadline of {:?} passed with {} job(s) still active",
            deadline,
            scheduler.active_jobs()
        );
    }

    token.cancel();
    match run_handle.await {
        Ok(Err(e)) => error!("Scheduler error: {}", e),
        Err(e) => error!("Scheduler task panicked: {}", e),
        Ok(Ok(())) => {}
    }
    for handle in heartbeats {
        let _ = handle.await;
    }

    let jobs = scheduler.list_all();
    Ok(SimulationReport {
        jobs: jobs.iter().map(JobRow::from).collect(),
        counts: scheduler.job_counts(),
        rejected,
        queue: scheduler.queue_stats(),
        elapsed_ms: started.elapsed().as_millis() as u64,
        finished,
    })
}

async fn heartbeat_loop(
    scheduler: Scheduler,
    node_id: NodeId,
    load: f64,
    every: Duration,
    fail_after: Option<Duration>,
    token: CancellationToken,
) {
    let started = tokio::time::Instant::now();
    // Beat twice per interval so jitter never looks like a missed heartbeat
    let mut interval = tokio::time::interval(every / 2);

    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = interval.tick() => {
                if fail_after.is_some_and(|after| started.elapsed() >= after) {
                    warn!("Node {} stops heartbeating", node_id);
                    return;
                }
                if let Err(e) = scheduler.heartbeat(&node_id, load) {
                    warn!("Heartbeat from {} failed: {}", node_id, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> SchedulerConfig {
        SchedulerConfig {
            heartbeat_interval_secs: 1,
            missed_threshold: 1,
            retry_backoff_base_secs: 0,
            retry_backoff_max_secs: 0,
            dispatch_backoff_ms: 10,
            ..Default::default()
        }
    }

    fn manifest(yaml: &str) -> Manifest {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[tokio::test]
    async fn test_simulation_runs_to_completion() {
        let manifest = manifest(
            r#"
nodes:
  - name: node-a
    cpu: "2"
    memory: 4Gi
  - name: node-b
    cpu: "2"
    memory: 4Gi
jobs:
  - name: quick
    replicas: 4
    cpu: 500m
    memory: 512Mi
    hint: { duration_ms: 5 }
  - name: flaky
    hint: { fail_attempts: 2, result: "ok" }
  - name: doomed
    max_retries: 1
    hint: { fail_attempts: 5 }
"#,
        );

        let report = run(fast_config(), manifest, Duration::from_secs(30))
            .await
            .unwrap();

        assert!(report.finished);
        assert_eq!(report.jobs.len(), 6);
        assert_eq!(report.counts.get("completed"), Some(&5));
        assert_eq!(report.counts.get("failed"), Some(&1));
        assert_eq!(report.queue.admitted, 0);

        let flaky = report.jobs.iter().find(|j| j.name == "flaky").unwrap();
        assert_eq!(flaky.retry_count, 2);
        assert_eq!(flaky.result, Some(serde_json::json!("ok")));

        let doomed = report.jobs.iter().find(|j| j.name == "doomed").unwrap();
        assert_eq!(doomed.status, JobStatus::Failed);
        assert_eq!(doomed.attempts, 2);
    }

    #[tokio::test]
    async fn test_simulation_reports_rejected_jobs() {
        let config = SchedulerConfig {
            queue_capacity: 2,
            ..fast_config()
        };
        let manifest = manifest(
            r#"
nodes: []
jobs:
  - name: batch
    replicas: 3
"#,
        );

        let report = run(config, manifest, Duration::from_millis(200))
            .await
            .unwrap();

        assert!(!report.finished);
        assert_eq!(report.rejected, vec!["batch-2".to_string()]);
        assert_eq!(report.counts.get("queued"), Some(&2));
    }
}
