use crate::config::RetryPolicy;
use crate::error::Result;
use crate::queue::PriorityJobQueue;
use crate::store::JobStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flotilla_core::{
    clock::to_chrono, Clock, FailureReason, FailureRecord, Job, JobId, JobStatus, NodeId,
    SchedulerEvent,
};
use flotilla_runtime::NodeLossHandler;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// What recovery did with a job
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryOutcome {
    /// Back in the queue, dispatchable from `next_retry_at`
    Requeued {
        retry_count: u32,
        next_retry_at: DateTime<Utc>,
    },
    /// Retry budget exhausted
    Failed(FailureRecord),
    Cancelled,
    /// The report no longer matches the job (already terminal, re-dispatched
    /// or moved to another node); nothing changed
    Stale,
}

/// Conditions a failure report must still match to be applied
#[derive(Debug, Clone, Copy, Default)]
struct Expect<'a> {
    node: Option<&'a NodeId>,
    attempt: Option<u32>,
}

impl Expect<'_> {
    fn matches(&self, job: &Job) -> bool {
        if job.status != JobStatus::Running {
            return false;
        }
        if let Some(node) = self.node {
            if job.assigned_node.as_ref() != Some(node) {
                return false;
            }
        }
        if let Some(attempt) = self.attempt {
            if job.attempt != attempt {
                return false;
            }
        }
        true
    }
}

enum Decision {
    Requeue(Job),
    Fail(FailureRecord),
    Stale,
}

/// Decides between retry and permanent failure for jobs that stopped running
pub struct RecoveryManager {
    store: Arc<JobStore>,
    queue: Arc<PriorityJobQueue>,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<SchedulerEvent>,
}

impl RecoveryManager {
    pub fn new(
        store: Arc<JobStore>,
        queue: Arc<PriorityJobQueue>,
        policy: RetryPolicy,
        clock: Arc<dyn Clock>,
        events: broadcast::Sender<SchedulerEvent>,
    ) -> Self {
        Self {
            store,
            queue,
            policy,
            clock,
            events,
        }
    }

    /// Route a failure for a Running job
    ///
    /// `Cancelled` finalizes any non-terminal job. Every other reason
    /// applies only while the job is Running and either re-queues it with
    /// backoff or fails it permanently.
    pub fn handle_failure(
        &self,
        job_id: JobId,
        reason: FailureReason,
        detail: impl Into<String>,
    ) -> Result<RecoveryOutcome> {
        self.recover(job_id, reason, detail.into(), Expect::default())
    }

    /// Like [`handle_failure`](Self::handle_failure), but ignored unless the
    /// job is still on dispatch attempt `attempt`
    pub fn handle_attempt_failure(
        &self,
        job_id: JobId,
        attempt: u32,
        reason: FailureReason,
        detail: impl Into<String>,
    ) -> Result<RecoveryOutcome> {
        self.recover(
            job_id,
            reason,
            detail.into(),
            Expect {
                node: None,
                attempt: Some(attempt),
            },
        )
    }

    /// Recover several jobs; each one succeeds or fails on its own
    pub fn batch_recover(
        &self,
        jobs: &[JobId],
        reason: FailureReason,
        detail: &str,
    ) -> Vec<(JobId, Result<RecoveryOutcome>)> {
        jobs.iter()
            .map(|job_id| (*job_id, self.handle_failure(*job_id, reason, detail)))
            .collect()
    }

    fn recover(
        &self,
        job_id: JobId,
        reason: FailureReason,
        detail: String,
        expect: Expect<'_>,
    ) -> Result<RecoveryOutcome> {
        if reason == FailureReason::Cancelled {
            return self.cancel(job_id);
        }

        let now = self.clock.now();
        let policy = &self.policy;

        let decision = self.store.update(job_id, |job| {
            if !expect.matches(job) {
                return Ok(Decision::Stale);
            }

            job.mark_retrying(reason, detail.clone())?;

            if job.has_retry_budget() {
                let next_retry_at = now + to_chrono(policy.backoff(job.retry_count + 1));
                job.requeue_for_retry(next_retry_at)?;
                Ok(Decision::Requeue(job.clone()))
            } else {
                job.mark_failed(detail.clone(), now)?;
                Ok(Decision::Fail(FailureRecord {
                    job_id,
                    reason,
                    timestamp: now,
                    retry_count: job.retry_count,
                    error: detail.clone(),
                }))
            }
        })?;

        match decision {
            Decision::Stale => {
                debug!("Ignoring stale {} report for job {}", reason, job_id);
                Ok(RecoveryOutcome::Stale)
            }
            Decision::Requeue(job) => {
                let next_retry_at = job.next_retry_at.unwrap_or(now);
                if !self.requeue(&job)? {
                    return Ok(RecoveryOutcome::Stale);
                }
                warn!(
                    job = %job_id,
                    %reason,
                    retry = job.retry_count,
                    max_retries = job.max_retries,
                    %next_retry_at,
                    "Job failed, scheduling retry"
                );
                let _ = self.events.send(SchedulerEvent::retrying(
                    job_id,
                    reason,
                    job.retry_count,
                    next_retry_at,
                    now,
                ));
                Ok(RecoveryOutcome::Requeued {
                    retry_count: job.retry_count,
                    next_retry_at,
                })
            }
            Decision::Fail(record) => {
                self.queue.release(job_id);
                error!(
                    job = %job_id,
                    %reason,
                    retries = record.retry_count,
                    error = %record.error,
                    "Job failed permanently"
                );
                let _ = self.events.send(SchedulerEvent::failed(record.clone()));
                Ok(RecoveryOutcome::Failed(record))
            }
        }
    }

    /// Put a Queued job back into the queue
    ///
    /// The store is read again after the enqueue. If the job finished or was
    /// evicted in the meantime its admission slot is handed back and false
    /// is returned.
    pub fn requeue(&self, job: &Job) -> Result<bool> {
        self.queue.enqueue(job)?;
        match self.store.get(job.id) {
            Some(current) if !current.is_terminal() => Ok(true),
            _ => {
                debug!("Job {} finished before it was re-queued", job.id);
                self.queue.release(job.id);
                Ok(false)
            }
        }
    }

    fn cancel(&self, job_id: JobId) -> Result<RecoveryOutcome> {
        let now = self.clock.now();
        let cancelled = self.store.update(job_id, |job| {
            if job.is_terminal() {
                return Ok(false);
            }
            job.mark_cancelled(now)?;
            Ok(true)
        })?;

        if !cancelled {
            return Ok(RecoveryOutcome::Stale);
        }
        self.queue.release(job_id);
        info!("Job {} cancelled", job_id);
        let _ = self.events.send(SchedulerEvent::cancelled(job_id, now));
        Ok(RecoveryOutcome::Cancelled)
    }
}

#[async_trait]
impl NodeLossHandler for RecoveryManager {
    async fn on_node_lost(&self, node: &NodeId, jobs: Vec<JobId>) {
        warn!("Node {} lost, recovering {} job(s)", node, jobs.len());
        let _ = self.events.send(SchedulerEvent::node_inactive(
            node.clone(),
            jobs.len(),
            self.clock.now(),
        ));

        let detail = format!("node {} stopped sending heartbeats", node);
        for job_id in jobs {
            let expect = Expect {
                node: Some(node),
                attempt: None,
            };
            match self.recover(job_id, FailureReason::NodeLost, detail.clone(), expect) {
                Ok(outcome) => debug!("Recovered job {} from node {}: {:?}", job_id, node, outcome),
                Err(e) => error!("Failed to recover job {} from node {}: {}", job_id, node, e),
            }
        }
    }
}
