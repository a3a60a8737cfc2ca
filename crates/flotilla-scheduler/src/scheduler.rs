use crate::balancer::LoadBalancer;
use crate::config::SchedulerConfig;
use crate::queue::{PriorityJobQueue, QueueStats, QueuedEntry};
use crate::recovery::{RecoveryManager, RecoveryOutcome};
use crate::store::JobStore;
use crate::types::SchedulingContext;
use crate::{Result, SchedulerError};
use async_trait::async_trait;
use flotilla_core::{
    Clock, FailureReason, Job, JobDefaults, JobId, JobSpec, JobStatus, Node, NodeCapacity, NodeId,
    SchedulerEvent,
};
use flotilla_runtime::{
    ExecutionOutcome, HeartbeatMonitor, JobExecutor, NodeLossHandler, NodeRegistry, RuntimeError,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long one dispatch-loop wait on the queue lasts before re-checking shutdown
const DEQUEUE_POLL: Duration = Duration::from_millis(500);

/// Event bus depth; slow subscribers lag and skip, they never block the core
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Result of one dispatch attempt
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Bound to a node and handed to the executor
    Dispatched { job_id: JobId, node_id: NodeId },
    /// Nothing ready fits any node; this is the highest-priority job that was
    /// put back unchanged
    NoSuitableNode(JobId),
    /// The dequeued entry no longer matched a Queued job
    Skipped(JobId),
    /// Nothing ready to dispatch
    Idle,
    /// All execution slots are busy
    AtCapacity,
}

struct Inner {
    config: SchedulerConfig,
    job_defaults: JobDefaults,
    queue: Arc<PriorityJobQueue>,
    store: Arc<JobStore>,
    registry: Arc<NodeRegistry>,
    recovery: Arc<RecoveryManager>,
    balancer: LoadBalancer,
    executor: Arc<dyn JobExecutor>,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<SchedulerEvent>,
    permits: Arc<Semaphore>,
    watchdogs: Arc<Watchdogs>,
}

/// Stop tokens of in-flight attempts: job -> (attempt, token)
///
/// Cancelling a token ends the attempt's execution task, which frees its
/// concurrency permit.
#[derive(Default)]
struct Watchdogs {
    tokens: Mutex<HashMap<JobId, (u32, CancellationToken)>>,
}

impl Watchdogs {
    /// Track a new attempt, stopping anything an earlier attempt left behind
    fn arm(&self, job_id: JobId, attempt: u32) -> CancellationToken {
        let token = CancellationToken::new();
        let previous = self.tokens.lock().insert(job_id, (attempt, token.clone()));
        if let Some((_, previous)) = previous {
            previous.cancel();
        }
        token
    }

    fn stop(&self, job_id: JobId) {
        let removed = self.tokens.lock().remove(&job_id);
        if let Some((_, token)) = removed {
            token.cancel();
        }
    }

    /// Forget attempt `attempt` without cancelling it
    fn clear(&self, job_id: JobId, attempt: u32) {
        let mut tokens = self.tokens.lock();
        if matches!(tokens.get(&job_id), Some((a, _)) if *a == attempt) {
            tokens.remove(&job_id);
        }
    }
}

/// Ends the attempts still running on a lost node, then lets recovery
/// re-queue their jobs
struct ReclaimingHandler {
    recovery: Arc<RecoveryManager>,
    watchdogs: Arc<Watchdogs>,
}

#[async_trait]
impl NodeLossHandler for ReclaimingHandler {
    async fn on_node_lost(&self, node: &NodeId, jobs: Vec<JobId>) {
        for job_id in &jobs {
            self.watchdogs.stop(*job_id);
        }
        self.recovery.on_node_lost(node, jobs).await;
    }
}

/// Result of trying to bind one dequeued entry
enum Bind {
    Bound(Job, NodeId, CancellationToken),
    NoNode(Job),
    Stale(JobId),
}

/// Resources reserved on a node for a job that is not yet Running
enum Reservation {
    Reserved(Job, NodeId),
    NoNode(Job),
    Stale(JobId),
}

/// Job scheduler
///
/// Cheap to clone; clones share the same queue, registry and job store.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Create a new scheduler
    pub fn new(
        config: SchedulerConfig,
        executor: Arc<dyn JobExecutor>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let queue = Arc::new(PriorityJobQueue::new(config.queue_capacity, clock.clone()));
        let store = Arc::new(JobStore::new(clock.clone()));
        let registry = Arc::new(NodeRegistry::new(clock.clone()));
        let recovery = Arc::new(RecoveryManager::new(
            store.clone(),
            queue.clone(),
            config.retry_policy(),
            clock.clone(),
            events.clone(),
        ));

        Ok(Self {
            inner: Arc::new(Inner {
                job_defaults: config.job_defaults(),
                balancer: LoadBalancer::new(config.strategy),
                permits: Arc::new(Semaphore::new(config.max_concurrent_jobs)),
                config,
                queue,
                store,
                registry,
                recovery,
                executor,
                clock,
                events,
                watchdogs: Arc::new(Watchdogs::default()),
            }),
        })
    }

    // --- Submission side ---

    /// Validate a spec and admit the job into the queue
    pub fn submit(&self, spec: JobSpec) -> Result<JobId> {
        let inner = &self.inner;
        let mut job = Job::from_spec(spec, &inner.job_defaults, inner.clock.now())?;
        job.mark_queued()?;
        let job_id = job.id;

        // Stored first so a dispatcher never dequeues an id the store lacks
        inner.store.insert(job.clone());
        if let Err(e) = inner.queue.enqueue(&job) {
            inner.store.remove(job_id);
            warn!("Rejected job {}: {}", job.name, e);
            return Err(e);
        }

        info!(
            job = %job_id,
            name = %job.name,
            priority = job.priority,
            "Job submitted"
        );
        let _ = inner
            .events
            .send(SchedulerEvent::submitted(job_id, job.priority, job.submitted_at));
        Ok(job_id)
    }

    pub fn status(&self, job_id: JobId) -> Result<Job> {
        self.inner
            .store
            .get(job_id)
            .ok_or_else(|| SchedulerError::job_not_found(job_id.to_string()))
    }

    /// Cancel a job; false if it is unknown or already terminal
    pub async fn cancel(&self, job_id: JobId) -> bool {
        let inner = &self.inner;
        let Some(job) = inner.store.get(job_id) else {
            return false;
        };
        let running_on = match job.status {
            JobStatus::Running => job.assigned_node.clone(),
            _ => None,
        };

        match inner
            .recovery
            .handle_failure(job_id, FailureReason::Cancelled, "cancelled by operator")
        {
            Ok(RecoveryOutcome::Cancelled) => {}
            Ok(_) => return false,
            Err(e) => {
                warn!("Failed to cancel job {}: {}", job_id, e);
                return false;
            }
        }

        inner.watchdogs.stop(job_id);
        if let Some(node_id) = running_on {
            inner.registry.release(&node_id, job_id);
            self.cancel_on_executor(&node_id, job_id).await;
        }
        true
    }

    /// Every known job, oldest first
    pub fn list_all(&self) -> Vec<Job> {
        self.inner.store.list_all()
    }

    /// Receive lifecycle events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.inner.events.subscribe()
    }

    // --- Liveness side ---

    pub fn register_node(&self, node_id: impl Into<NodeId>, capacity: NodeCapacity) -> Node {
        self.inner
            .registry
            .register_or_update(node_id.into(), capacity)
    }

    pub fn heartbeat(&self, node_id: &NodeId, load: f64) -> Result<()> {
        self.inner.registry.heartbeat(node_id, load).map_err(|e| {
            warn!("Dropping heartbeat: {}", e);
            SchedulerError::from(e)
        })
    }

    /// Remove a node and re-route the jobs it was running
    pub async fn deregister_node(&self, node_id: &NodeId) -> Result<usize> {
        let jobs = self.inner.registry.deregister(node_id)?;
        let count = jobs.len();
        if !jobs.is_empty() {
            self.loss_handler().on_node_lost(node_id, jobs).await;
        }
        Ok(count)
    }

    pub fn nodes(&self) -> Vec<Node> {
        self.inner.registry.list()
    }

    // --- Execution side ---

    /// Callback for executors that returned `Detached`
    ///
    /// Returns false when the job is no longer Running (late or duplicate report).
    pub fn report_success(&self, job_id: JobId, result: serde_json::Value) -> Result<bool> {
        let job = self.status(job_id)?;
        if job.status != JobStatus::Running {
            debug!("Ignoring success report for {} job {}", job.status, job_id);
            return Ok(false);
        }
        self.inner.watchdogs.stop(job_id);
        Ok(self.complete_attempt(job_id, job.attempt, result))
    }

    /// Callback for executors that returned `Detached`
    pub fn report_failure(
        &self,
        job_id: JobId,
        reason: FailureReason,
        detail: impl Into<String>,
    ) -> Result<bool> {
        let job = self.status(job_id)?;
        if job.status != JobStatus::Running {
            debug!("Ignoring failure report for {} job {}", job.status, job_id);
            return Ok(false);
        }
        self.inner.watchdogs.stop(job_id);
        let outcome = self.fail_attempt(job_id, job.attempt, reason, detail.into())?;
        Ok(outcome != RecoveryOutcome::Stale)
    }

    // --- Introspection ---

    pub fn queue_stats(&self) -> QueueStats {
        self.inner.queue.stats()
    }

    pub fn queued(&self) -> Vec<QueuedEntry> {
        self.inner.queue.peek_all()
    }

    /// Jobs not yet Completed, Failed or Cancelled
    pub fn active_jobs(&self) -> usize {
        self.inner.store.active_count()
    }

    pub fn job_counts(&self) -> BTreeMap<String, usize> {
        self.inner.store.count_by_status()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Heartbeat monitor wired to this scheduler's registry and recovery
    pub fn heartbeat_monitor(&self) -> HeartbeatMonitor {
        let handler: Arc<dyn NodeLossHandler> = self.loss_handler();
        HeartbeatMonitor::new(
            self.inner.registry.clone(),
            handler,
            self.inner.clock.clone(),
            self.inner.config.heartbeat_monitor(),
        )
    }

    fn loss_handler(&self) -> Arc<ReclaimingHandler> {
        Arc::new(ReclaimingHandler {
            recovery: self.inner.recovery.clone(),
            watchdogs: self.inner.watchdogs.clone(),
        })
    }

    /// Drop terminal jobs older than the retention window
    pub fn evict_expired(&self) -> usize {
        self.inner
            .store
            .evict_expired(self.inner.config.job_retention())
    }

    // --- Loops ---

    /// Run the dispatch loop, heartbeat monitor and janitor until `token` is cancelled
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        info!(
            strategy = %self.inner.config.strategy,
            queue_capacity = self.inner.config.queue_capacity,
            max_concurrent_jobs = self.inner.config.max_concurrent_jobs,
            "Starting scheduler"
        );

        let monitor = self.heartbeat_monitor();
        let monitor_token = token.clone();
        let monitor_handle = tokio::spawn(async move { monitor.run(monitor_token).await });

        let janitor = self.clone();
        let janitor_token = token.clone();
        let janitor_handle = tokio::spawn(async move { janitor.janitor_loop(janitor_token).await });

        self.dispatch_loop(token).await;

        match monitor_handle.await {
            Ok(Err(e)) => error!("Heartbeat monitor failed: {}", e),
            Err(e) => error!("Heartbeat monitor task panicked: {}", e),
            Ok(Ok(())) => {}
        }
        if let Err(e) = janitor_handle.await {
            error!("Janitor task panicked: {}", e);
        }

        info!("Scheduler shutting down");
        Ok(())
    }

    async fn dispatch_loop(&self, token: CancellationToken) {
        let backoff = self.inner.config.dispatch_backoff();

        loop {
            let permit = tokio::select! {
                _ = token.cancelled() => return,
                permit = self.inner.permits.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => return,
                },
            };

            let entry = tokio::select! {
                _ = token.cancelled() => return,
                entry = self.inner.queue.dequeue(DEQUEUE_POLL) => entry,
            };
            let Some(entry) = entry else {
                continue;
            };

            match self.dispatch_pass(Some(entry), permit).await {
                DispatchOutcome::NoSuitableNode(_) => {
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
                outcome => debug!("Dispatch: {:?}", outcome),
            }
        }
    }

    async fn janitor_loop(&self, token: CancellationToken) {
        let period = (self.inner.config.job_retention() / 2).max(Duration::from_secs(1));
        let mut interval = tokio::time::interval(period);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = interval.tick() => {
                    self.evict_expired();
                }
            }
        }
    }

    /// Dispatch at most one ready job without waiting
    pub async fn dispatch_next(&self) -> DispatchOutcome {
        let Ok(permit) = self.inner.permits.clone().try_acquire_owned() else {
            return DispatchOutcome::AtCapacity;
        };
        self.dispatch_pass(None, permit).await
    }

    /// Walk the ready queue in priority order until one job binds
    ///
    /// Jobs that fit no node are held aside and put back unchanged once the
    /// pass ends, so one unplaceable job never blocks the jobs behind it.
    async fn dispatch_pass(
        &self,
        first: Option<QueuedEntry>,
        permit: OwnedSemaphorePermit,
    ) -> DispatchOutcome {
        let inner = &self.inner;
        let mut next = first;
        let mut deferred: Vec<Job> = Vec::new();
        let mut skipped = None;

        let bound = loop {
            let Some(entry) = next.take().or_else(|| inner.queue.try_dequeue()) else {
                break None;
            };
            match self.bind(entry.job_id) {
                Bind::Bound(job, node_id, watchdog) => break Some((job, node_id, watchdog)),
                Bind::NoNode(job) => deferred.push(job),
                Bind::Stale(job_id) => {
                    skipped.get_or_insert(job_id);
                }
            }
        };

        for job in &deferred {
            self.defer(job);
        }

        let Some((job, node_id, watchdog)) = bound else {
            return match (deferred.first(), skipped) {
                (Some(job), _) => DispatchOutcome::NoSuitableNode(job.id),
                (None, Some(job_id)) => DispatchOutcome::Skipped(job_id),
                (None, None) => DispatchOutcome::Idle,
            };
        };

        let job_id = job.id;
        let now = inner.clock.now();
        info!("Dispatched job {} to node {} (attempt {})", job_id, node_id, job.attempt);
        let _ = inner.events.send(SchedulerEvent::dispatched(
            job_id,
            node_id.clone(),
            job.attempt,
            now,
        ));

        let scheduler = self.clone();
        let exec_node = node_id.clone();
        tokio::spawn(async move {
            scheduler.execute(exec_node, job, watchdog, permit).await;
        });

        DispatchOutcome::Dispatched { job_id, node_id }
    }

    fn bind(&self, job_id: JobId) -> Bind {
        match self.reserve(job_id) {
            Reservation::Reserved(job, node_id) => match self.start(&job, &node_id) {
                Some((job, watchdog)) => Bind::Bound(job, node_id, watchdog),
                None => Bind::Stale(job_id),
            },
            Reservation::NoNode(job) => Bind::NoNode(job),
            Reservation::Stale(job_id) => Bind::Stale(job_id),
        }
    }

    /// Pick a node for a Queued job and reserve its resources there
    fn reserve(&self, job_id: JobId) -> Reservation {
        let inner = &self.inner;

        let job = match inner.store.get(job_id) {
            Some(job) if job.status == JobStatus::Queued => job,
            Some(job) if !job.is_terminal() => {
                debug!("Skipping queue entry for {} job {}", job.status, job_id);
                return Reservation::Stale(job_id);
            }
            _ => {
                // Terminal or evicted: the slot must not outlive the job
                debug!("Dropping stale queue entry for job {}", job_id);
                inner.queue.release(job_id);
                return Reservation::Stale(job_id);
            }
        };

        let context = SchedulingContext::new(
            job.name.clone(),
            job.resources.clone(),
            inner.registry.active_nodes(),
        );
        let Some(node_id) = inner.balancer.select(&context) else {
            let err =
                SchedulerError::no_suitable_node(job_id.to_string(), "no active node has capacity");
            debug!("{}", err);
            return Reservation::NoNode(job);
        };

        match inner.registry.assign(
            &node_id,
            job_id,
            &job.resources,
            inner.balancer.strategy().enforces_capacity(),
        ) {
            Ok(()) => Reservation::Reserved(job, node_id),
            Err(RuntimeError::AlreadyAssigned { .. }) => {
                warn!("Job {} is already bound, skipping", job_id);
                Reservation::Stale(job_id)
            }
            Err(e) => {
                debug!("Could not reserve node {} for job {}: {}", node_id, job_id, e);
                Reservation::NoNode(job)
            }
        }
    }

    /// Mark a reserved job Running and arm its watchdog
    ///
    /// Returns `None` when the job cannot start: it moved on since it was
    /// dequeued, or its node was declared lost after the reservation.
    fn start(&self, job: &Job, node_id: &NodeId) -> Option<(Job, CancellationToken)> {
        let inner = &self.inner;
        let job_id = job.id;
        let now = inner.clock.now();

        let running = inner.store.update(job_id, |job| {
            job.mark_running(node_id.clone(), now)?;
            Ok(job.clone())
        });
        let job = match running {
            Ok(job) => job,
            Err(e) => {
                // Cancelled or otherwise moved on between dequeue and bind
                inner.registry.release(node_id, job_id);
                debug!("Could not start job {}: {}", job_id, e);
                return None;
            }
        };
        let watchdog = inner.watchdogs.arm(job_id, job.attempt);

        // A sweep between reserve and mark_running strips the reservation
        // while the job still looks Queued, so recovery never sees it
        if inner.registry.node_for_job(job_id).as_ref() != Some(node_id) {
            warn!("Node {} was lost while job {} was being dispatched", node_id, job_id);
            inner.watchdogs.clear(job_id, job.attempt);
            let detail = format!("node {} lost during dispatch", node_id);
            let outcome = self.fail_attempt(job_id, job.attempt, FailureReason::NodeLost, detail);
            if let Err(e) = outcome {
                error!("Failed to route failure of job {}: {}", job_id, e);
            }
            return None;
        }

        Some((job, watchdog))
    }

    /// Put a job back unchanged because no node can take it right now
    fn defer(&self, job: &Job) {
        if let Err(e) = self.inner.recovery.requeue(job) {
            error!("Failed to re-queue job {}: {}", job.id, e);
        }
    }

    /// Run one attempt on the executor and route its outcome
    ///
    /// Cancelling `watchdog` abandons the attempt without reporting anything;
    /// whoever cancelled it has already moved the job on.
    async fn execute(
        &self,
        node_id: NodeId,
        job: Job,
        watchdog: CancellationToken,
        _permit: OwnedSemaphorePermit,
    ) {
        let inner = &self.inner;
        let started = tokio::time::Instant::now();
        let run = tokio::time::timeout(job.timeout, inner.executor.on_job_assigned(&node_id, &job));

        let result = tokio::select! {
            _ = watchdog.cancelled() => {
                debug!("Attempt {} of job {} stopped", job.attempt, job.id);
                return;
            }
            result = run => result,
        };

        let outcome = match result {
            Ok(Ok(ExecutionOutcome::Completed(result))) => {
                inner.watchdogs.clear(job.id, job.attempt);
                self.complete_attempt(job.id, job.attempt, result);
                return;
            }
            Ok(Ok(ExecutionOutcome::Failed(message))) => {
                (FailureReason::ExecutionError, message)
            }
            Ok(Err(e)) => (FailureReason::ExecutionError, e.to_string()),
            Ok(Ok(ExecutionOutcome::Detached)) => {
                // The permit stays held until the outcome is reported or the timeout fires
                let remaining = job.timeout.saturating_sub(started.elapsed());
                tokio::select! {
                    _ = watchdog.cancelled() => return,
                    _ = tokio::time::sleep(remaining) => {}
                }
                self.cancel_on_executor(&node_id, job.id).await;
                (
                    FailureReason::Timeout,
                    format!("no report within {:?}", job.timeout),
                )
            }
            Err(_) => {
                self.cancel_on_executor(&node_id, job.id).await;
                (
                    FailureReason::Timeout,
                    format!("execution exceeded {:?}", job.timeout),
                )
            }
        };

        inner.watchdogs.clear(job.id, job.attempt);
        let (reason, detail) = outcome;
        if let Err(e) = self.fail_attempt(job.id, job.attempt, reason, detail) {
            error!("Failed to route failure of job {}: {}", job.id, e);
        }
    }

    async fn cancel_on_executor(&self, node_id: &NodeId, job_id: JobId) {
        if let Err(e) = self.inner.executor.cancel(node_id, job_id).await {
            warn!(
                "Executor did not confirm cancel of job {} on node {}: {}",
                job_id, node_id, e
            );
        }
    }

    /// Mark attempt `attempt` of a job Completed; false if the attempt is stale
    fn complete_attempt(&self, job_id: JobId, attempt: u32, result: serde_json::Value) -> bool {
        let inner = &self.inner;
        let now = inner.clock.now();
        let completed = inner.store.update(job_id, |job| {
            if job.status != JobStatus::Running || job.attempt != attempt {
                return Ok(None);
            }
            job.mark_completed(result, now)?;
            Ok(job.assigned_node.clone())
        });

        match completed {
            Ok(Some(node_id)) => {
                inner.registry.release(&node_id, job_id);
                inner.queue.release(job_id);
                info!("Job {} completed on node {}", job_id, node_id);
                let _ = inner
                    .events
                    .send(SchedulerEvent::completed(job_id, Some(node_id), now));
                true
            }
            Ok(None) => {
                debug!("Ignoring stale completion of job {} attempt {}", job_id, attempt);
                false
            }
            Err(e) => {
                warn!("Could not complete job {}: {}", job_id, e);
                false
            }
        }
    }

    /// Free the node held by attempt `attempt` and hand the job to recovery
    fn fail_attempt(
        &self,
        job_id: JobId,
        attempt: u32,
        reason: FailureReason,
        detail: String,
    ) -> Result<RecoveryOutcome> {
        let inner = &self.inner;
        if let Some(job) = inner.store.get(job_id) {
            if job.status == JobStatus::Running && job.attempt == attempt {
                if let Some(node_id) = &job.assigned_node {
                    inner.registry.release(node_id, job_id);
                }
            }
        }
        inner
            .recovery
            .handle_attempt_failure(job_id, attempt, reason, detail)
    }
}
