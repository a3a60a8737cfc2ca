//! Bounded priority queue of jobs waiting for dispatch.
//!
//! Entries are ordered by priority (highest first), then submission time,
//! then an insertion sequence, so dispatch within a priority band is FIFO.
//! Jobs carrying a future `next_retry_at` wait in a delay set and are moved
//! into the ready index once the clock passes that time.
//!
//! Capacity bounds *admitted* jobs: a job is admitted on its first enqueue
//! and keeps its slot until [`PriorityJobQueue::release`] is called for it,
//! so a retried or backpressured job can always be put back.

use crate::error::{Result, SchedulerError};
use chrono::{DateTime, Utc};
use flotilla_core::{Clock, Job, JobId};
use parking_lot::Mutex;
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

type ReadyKey = (Reverse<u8>, DateTime<Utc>, u64);
type DelayKey = (DateTime<Utc>, u64);

/// A job waiting in the queue
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueuedEntry {
    pub job_id: JobId,
    pub priority: u8,
    pub submitted_at: DateTime<Utc>,
    /// Not dispatchable before this time
    pub not_before: Option<DateTime<Utc>>,
    #[serde(skip)]
    seq: u64,
}

impl QueuedEntry {
    fn ready_key(&self) -> ReadyKey {
        (Reverse(self.priority), self.submitted_at, self.seq)
    }
}

/// Queue counters for summaries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Entries currently waiting (ready or delayed)
    pub queued: usize,
    /// Non-terminal jobs holding an admission slot
    pub admitted: usize,
    pub capacity: usize,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: BTreeMap<ReadyKey, JobId>,
    delayed: BTreeMap<DelayKey, JobId>,
    entries: HashMap<JobId, QueuedEntry>,
    admitted: HashSet<JobId>,
    next_seq: u64,
}

impl QueueState {
    /// Move every delayed entry that is due into the ready index
    fn promote_due(&mut self, now: DateTime<Utc>) {
        while let Some((&(due, seq), &job_id)) = self.delayed.first_key_value() {
            if due > now {
                break;
            }
            self.delayed.remove(&(due, seq));
            if let Some(entry) = self.entries.get(&job_id) {
                self.ready.insert(entry.ready_key(), job_id);
            }
        }
    }

    fn remove_entry(&mut self, job_id: &JobId) -> Option<QueuedEntry> {
        let entry = self.entries.remove(job_id)?;
        self.ready.remove(&entry.ready_key());
        if let Some(due) = entry.not_before {
            self.delayed.remove(&(due, entry.seq));
        }
        Some(entry)
    }
}

/// Bounded, thread-safe priority queue
pub struct PriorityJobQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    notify: Notify,
    clock: Arc<dyn Clock>,
}

impl PriorityJobQueue {
    pub fn new(capacity: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            capacity,
            notify: Notify::new(),
            clock,
        }
    }

    /// Add a Queued job
    ///
    /// Fails with `QueueFull` only for jobs not already admitted. Enqueueing
    /// a job that is already waiting is a no-op.
    pub fn enqueue(&self, job: &Job) -> Result<()> {
        let now = self.clock.now();
        {
            let mut state = self.state.lock();

            if state.entries.contains_key(&job.id) {
                debug!("Job {} already queued", job.id);
                return Ok(());
            }

            if !state.admitted.contains(&job.id) {
                if state.admitted.len() >= self.capacity {
                    return Err(SchedulerError::queue_full(self.capacity));
                }
                state.admitted.insert(job.id);
            }

            let seq = state.next_seq;
            state.next_seq += 1;

            let not_before = job.next_retry_at.filter(|at| *at > now);
            let entry = QueuedEntry {
                job_id: job.id,
                priority: job.priority,
                submitted_at: job.submitted_at,
                not_before,
                seq,
            };

            match not_before {
                Some(due) => {
                    state.delayed.insert((due, seq), job.id);
                }
                None => {
                    state.ready.insert(entry.ready_key(), job.id);
                }
            }
            state.entries.insert(job.id, entry);
        }

        self.notify.notify_one();
        Ok(())
    }

    /// Pop the next ready entry without waiting
    pub fn try_dequeue(&self) -> Option<QueuedEntry> {
        let mut state = self.state.lock();
        state.promote_due(self.clock.now());
        let (_, job_id) = state.ready.pop_first()?;
        let entry = state.entries.remove(&job_id);
        if let Some(entry) = &entry {
            debug!("Dequeued job {} (priority {})", entry.job_id, entry.priority);
        }
        entry
    }

    /// Wait up to `timeout` for a ready entry
    pub async fn dequeue(&self, timeout: Duration) -> Option<QueuedEntry> {
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(entry) = self.try_dequeue() {
                return Some(entry);
            }

            // Wake early when the next delayed entry comes due
            let wake_at = match self.next_due() {
                Some(due) => {
                    let wait = (due - self.clock.now()).to_std().unwrap_or_default();
                    deadline.min(Instant::now() + wait)
                }
                None => deadline,
            };

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {
                    if Instant::now() >= deadline {
                        return self.try_dequeue();
                    }
                }
            }
        }
    }

    fn next_due(&self) -> Option<DateTime<Utc>> {
        self.state
            .lock()
            .delayed
            .first_key_value()
            .map(|((due, _), _)| *due)
    }

    /// Remove a waiting job and free its slot; false if it was not waiting
    pub fn cancel(&self, job_id: JobId) -> bool {
        let mut state = self.state.lock();
        let removed = state.remove_entry(&job_id).is_some();
        if removed {
            state.admitted.remove(&job_id);
        }
        removed
    }

    /// Free the admission slot of a job that reached a terminal state
    pub fn release(&self, job_id: JobId) {
        let mut state = self.state.lock();
        state.remove_entry(&job_id);
        state.admitted.remove(&job_id);
    }

    /// Snapshot in dispatch order: ready entries, then delayed ones by due time
    pub fn peek_all(&self) -> Vec<QueuedEntry> {
        let mut state = self.state.lock();
        state.promote_due(self.clock.now());
        let ready = state.ready.values();
        let delayed = state.delayed.values();
        ready
            .chain(delayed)
            .filter_map(|id| state.entries.get(id).cloned())
            .collect()
    }

    pub fn contains(&self, job_id: JobId) -> bool {
        self.state.lock().entries.contains_key(&job_id)
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn admitted(&self) -> usize {
        self.state.lock().admitted.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        QueueStats {
            queued: state.entries.len(),
            admitted: state.admitted.len(),
            capacity: self.capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_core::{JobDefaults, JobSpec, ManualClock};
    use std::collections::HashSet;

    fn make_job(priority: i64, clock: &ManualClock) -> Job {
        let mut job = Job::from_spec(
            JobSpec::new(format!("job-p{}", priority)).with_priority(priority),
            &JobDefaults::default(),
            clock.now(),
        )
        .unwrap();
        job.mark_queued().unwrap();
        job
    }

    fn make_queue(capacity: usize) -> (PriorityJobQueue, ManualClock) {
        let clock = ManualClock::default();
        (PriorityJobQueue::new(capacity, Arc::new(clock.clone())), clock)
    }

    #[test]
    fn test_priority_then_fifo_order() {
        let (queue, clock) = make_queue(10);
        let mut jobs = Vec::new();
        for priority in [5, 9, 5, 1] {
            let job = make_job(priority, &clock);
            queue.enqueue(&job).unwrap();
            jobs.push(job);
            clock.advance(Duration::from_millis(1));
        }

        let order: Vec<JobId> = std::iter::from_fn(|| queue.try_dequeue())
            .map(|e| e.job_id)
            .collect();
        assert_eq!(order, vec![jobs[1].id, jobs[0].id, jobs[2].id, jobs[3].id]);
    }

    #[test]
    fn test_same_timestamp_keeps_insertion_order() {
        let (queue, clock) = make_queue(10);
        let a = make_job(3, &clock);
        let b = make_job(3, &clock);
        queue.enqueue(&a).unwrap();
        queue.enqueue(&b).unwrap();

        assert_eq!(queue.try_dequeue().unwrap().job_id, a.id);
        assert_eq!(queue.try_dequeue().unwrap().job_id, b.id);
    }

    #[test]
    fn test_queue_full() {
        let (queue, clock) = make_queue(2);
        queue.enqueue(&make_job(1, &clock)).unwrap();
        queue.enqueue(&make_job(1, &clock)).unwrap();

        let err = queue.enqueue(&make_job(1, &clock)).unwrap_err();
        assert!(matches!(err, SchedulerError::QueueFull { capacity: 2 }));
        assert_eq!(queue.admitted(), 2);
    }

    #[test]
    fn test_readmission_never_fails_on_capacity() {
        let (queue, clock) = make_queue(1);
        let job = make_job(4, &clock);
        queue.enqueue(&job).unwrap();

        // Dispatched: leaves the queue but keeps its slot
        let entry = queue.try_dequeue().unwrap();
        assert_eq!(entry.job_id, job.id);
        assert!(queue.enqueue(&make_job(4, &clock)).is_err());

        // Back-pressured or retried: goes back in
        queue.enqueue(&job).unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.admitted(), 1);
    }

    #[test]
    fn test_release_frees_slot() {
        let (queue, clock) = make_queue(1);
        let job = make_job(4, &clock);
        queue.enqueue(&job).unwrap();
        queue.try_dequeue().unwrap();

        queue.release(job.id);
        assert_eq!(queue.admitted(), 0);
        queue.enqueue(&make_job(4, &clock)).unwrap();
    }

    #[test]
    fn test_cancel_removes_waiting_job() {
        let (queue, clock) = make_queue(10);
        let job = make_job(4, &clock);
        queue.enqueue(&job).unwrap();

        assert!(queue.cancel(job.id));
        assert!(!queue.cancel(job.id));
        assert!(queue.try_dequeue().is_none());
        assert_eq!(queue.admitted(), 0);
    }

    #[test]
    fn test_delayed_entry_waits_for_clock() {
        let (queue, clock) = make_queue(10);
        let mut retried = make_job(9, &clock);
        retried.next_retry_at = Some(clock.now() + chrono::Duration::seconds(30));
        let fresh = make_job(1, &clock);
        queue.enqueue(&retried).unwrap();
        queue.enqueue(&fresh).unwrap();

        let peek: Vec<JobId> = queue.peek_all().iter().map(|e| e.job_id).collect();
        assert_eq!(peek, vec![fresh.id, retried.id]);

        assert_eq!(queue.try_dequeue().unwrap().job_id, fresh.id);
        assert!(queue.try_dequeue().is_none());

        clock.advance(Duration::from_secs(30));
        assert_eq!(queue.try_dequeue().unwrap().job_id, retried.id);
    }

    #[test]
    fn test_duplicate_enqueue_is_noop() {
        let (queue, clock) = make_queue(10);
        let job = make_job(4, &clock);
        queue.enqueue(&job).unwrap();
        queue.enqueue(&job).unwrap();

        assert_eq!(queue.len(), 1);
        assert!(queue.try_dequeue().is_some());
        assert!(queue.try_dequeue().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dequeue_times_out() {
        let (queue, _clock) = make_queue(10);
        assert!(queue.dequeue(Duration::from_millis(50)).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dequeue_wakes_on_enqueue() {
        let (queue, clock) = make_queue(10);
        let queue = Arc::new(queue);
        let job = make_job(4, &clock);
        let job_id = job.id;

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue(Duration::from_secs(60)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.enqueue(&job).unwrap();

        let entry = waiter.await.unwrap().unwrap();
        assert_eq!(entry.job_id, job_id);
    }

    #[tokio::test]
    async fn test_concurrent_dequeue_no_duplicates() {
        let (queue, clock) = make_queue(100);
        let queue = Arc::new(queue);
        let mut expected = HashSet::new();
        for i in 0..50 {
            let job = make_job(i % 10, &clock);
            expected.insert(job.id);
            queue.enqueue(&job).unwrap();
        }

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move {
                    let mut seen = Vec::new();
                    while let Some(entry) = queue.dequeue(Duration::from_millis(20)).await {
                        seen.push(entry.job_id);
                    }
                    seen
                })
            })
            .collect();

        let mut seen = Vec::new();
        for handle in futures_util::future::join_all(workers).await {
            seen.extend(handle.unwrap());
        }

        assert_eq!(seen.len(), 50);
        let unique: HashSet<JobId> = seen.into_iter().collect();
        assert_eq!(unique, expected);
    }
}
