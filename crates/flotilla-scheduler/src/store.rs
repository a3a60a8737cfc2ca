use crate::error::{Result, SchedulerError};
use flotilla_core::{clock::to_chrono, Clock, Job, JobId};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Default)]
struct StoreState {
    active: HashMap<JobId, Job>,
    /// Completed, Failed and Cancelled jobs kept for `status()` until evicted
    finished: HashMap<JobId, Job>,
}

/// Authoritative table of every job the scheduler knows about
///
/// All status changes go through [`JobStore::update`], which applies the
/// mutation to a copy and commits it only when it succeeds, so a rejected
/// transition never leaves a half-updated job behind.
pub struct JobStore {
    state: Mutex<StoreState>,
    clock: Arc<dyn Clock>,
}

impl JobStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            clock,
        }
    }

    pub fn insert(&self, job: Job) {
        let mut state = self.state.lock();
        if job.is_terminal() {
            state.finished.insert(job.id, job);
        } else {
            state.active.insert(job.id, job);
        }
    }

    /// Drop a job that was never admitted
    pub fn remove(&self, job_id: JobId) -> Option<Job> {
        let mut state = self.state.lock();
        state
            .active
            .remove(&job_id)
            .or_else(|| state.finished.remove(&job_id))
    }

    pub fn get(&self, job_id: JobId) -> Option<Job> {
        let state = self.state.lock();
        state
            .active
            .get(&job_id)
            .or_else(|| state.finished.get(&job_id))
            .cloned()
    }

    /// Apply `f` to a job and commit the result if `f` succeeds
    pub fn update<T, F>(&self, job_id: JobId, f: F) -> Result<T>
    where
        F: FnOnce(&mut Job) -> Result<T>,
    {
        let mut state = self.state.lock();
        let current = match state.active.get(&job_id) {
            Some(job) => job,
            None if state.finished.contains_key(&job_id) => {
                // Terminal jobs accept no transitions; let `f` produce the error
                let mut copy = state.finished[&job_id].clone();
                return f(&mut copy);
            }
            None => return Err(SchedulerError::job_not_found(job_id.to_string())),
        };

        let mut updated = current.clone();
        let out = f(&mut updated)?;

        if updated.is_terminal() {
            state.active.remove(&job_id);
            state.finished.insert(job_id, updated);
        } else {
            state.active.insert(job_id, updated);
        }
        Ok(out)
    }

    /// All jobs, oldest submission first
    pub fn list_all(&self) -> Vec<Job> {
        let state = self.state.lock();
        let mut jobs: Vec<Job> = state
            .active
            .values()
            .chain(state.finished.values())
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at).then(a.id.cmp(&b.id)));
        jobs
    }

    /// Number of jobs that have not reached a terminal state
    pub fn active_count(&self) -> usize {
        self.state.lock().active.len()
    }

    pub fn count_by_status(&self) -> BTreeMap<String, usize> {
        let state = self.state.lock();
        let mut counts = BTreeMap::new();
        for job in state.active.values().chain(state.finished.values()) {
            *counts.entry(job.status.to_string()).or_insert(0) += 1;
        }
        counts
    }

    /// Forget terminal jobs that finished more than `retention` ago
    pub fn evict_expired(&self, retention: Duration) -> usize {
        let cutoff = self.clock.now() - to_chrono(retention);
        let mut state = self.state.lock();
        let before = state.finished.len();
        state
            .finished
            .retain(|_, job| job.completed_at.map_or(true, |at| at > cutoff));
        let evicted = before - state.finished.len();
        if evicted > 0 {
            debug!("Evicted {} expired terminal jobs", evicted);
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_core::{FlotillaError, JobDefaults, JobSpec, JobStatus, ManualClock, NodeId};

    fn make_store() -> (JobStore, ManualClock) {
        let clock = ManualClock::default();
        (JobStore::new(Arc::new(clock.clone())), clock)
    }

    fn make_job(clock: &ManualClock) -> Job {
        let mut job =
            Job::from_spec(JobSpec::new("stored"), &JobDefaults::default(), clock.now()).unwrap();
        job.mark_queued().unwrap();
        job
    }

    #[test]
    fn test_update_commits_on_success() {
        let (store, clock) = make_store();
        let job = make_job(&clock);
        let id = job.id;
        store.insert(job);

        store
            .update(id, |job| Ok(job.mark_running(NodeId::from("node-1"), clock.now())?))
            .unwrap();
        let job = store.get(id).unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.attempt, 1);
    }

    #[test]
    fn test_update_rolls_back_on_error() {
        let (store, clock) = make_store();
        let job = make_job(&clock);
        let id = job.id;
        store.insert(job);

        let result: Result<()> = store.update(id, |job| {
            job.retry_count = 99;
            Err(FlotillaError::internal_error("boom").into())
        });
        assert!(result.is_err());
        assert_eq!(store.get(id).unwrap().retry_count, 0);
    }

    #[test]
    fn test_terminal_jobs_reject_transitions() {
        let (store, clock) = make_store();
        let job = make_job(&clock);
        let id = job.id;
        store.insert(job);

        store
            .update(id, |job| Ok(job.mark_cancelled(clock.now())?))
            .unwrap();
        assert_eq!(store.active_count(), 0);

        let err = store
            .update(id, |job| Ok(job.mark_running(NodeId::from("node-1"), clock.now())?))
            .unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::CoreError(FlotillaError::InvalidTransition { .. })
        ));
        assert_eq!(store.get(id).unwrap().status, JobStatus::Cancelled);
    }

    #[test]
    fn test_update_unknown_job() {
        let (store, _) = make_store();
        let err = store.update(JobId::new(), |_| Ok(())).unwrap_err();
        assert!(matches!(err, SchedulerError::JobNotFound { .. }));
    }

    #[test]
    fn test_evict_expired() {
        let (store, clock) = make_store();
        let old = make_job(&clock);
        let old_id = old.id;
        store.insert(old);
        store
            .update(old_id, |job| Ok(job.mark_cancelled(clock.now())?))
            .unwrap();

        clock.advance(Duration::from_secs(120));
        let pending = make_job(&clock);
        let pending_id = pending.id;
        store.insert(pending);

        assert_eq!(store.evict_expired(Duration::from_secs(60)), 1);
        assert!(store.get(old_id).is_none());
        assert!(store.get(pending_id).is_some());
    }
}
