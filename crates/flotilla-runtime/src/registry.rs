use crate::error::{Result, RuntimeError};
use flotilla_core::{
    check_fit, Clock, Fit, JobId, Node, NodeCapacity, NodeId, NodeStatus, ResourceRequirements,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Outcome of a single staleness check
#[derive(Debug, Clone, PartialEq)]
pub enum HeartbeatCheck {
    /// Heartbeat within the interval
    Fresh,
    /// Missed `missed` intervals but still under the threshold
    Suspected { missed: u32 },
    /// Crossed the threshold on this check; the node is now Inactive and
    /// these jobs were taken from it
    Lost { jobs: Vec<JobId> },
    /// Node was already Inactive before this check
    AlreadyInactive,
}

#[derive(Debug, Default)]
struct RegistryState {
    nodes: BTreeMap<NodeId, Node>,
    /// job -> (node holding it, what it reserved there)
    job_index: HashMap<JobId, (NodeId, ResourceRequirements)>,
}

impl RegistryState {
    fn take_jobs(&mut self, node_id: &NodeId) -> Vec<JobId> {
        let Some(node) = self.nodes.get_mut(node_id) else {
            return Vec::new();
        };
        let jobs: Vec<JobId> = std::mem::take(&mut node.assigned_jobs).into_iter().collect();
        node.allocated = Default::default();
        for job_id in &jobs {
            self.job_index.remove(job_id);
        }
        jobs
    }

    /// Flip a node to Inactive and strip its jobs; `None` if it already was
    fn deactivate(&mut self, node_id: &NodeId) -> Option<Vec<JobId>> {
        let node = self.nodes.get_mut(node_id)?;
        if node.status == NodeStatus::Inactive {
            return None;
        }
        node.status = NodeStatus::Inactive;
        Some(self.take_jobs(node_id))
    }
}

/// Tracks nodes, their liveness and which jobs they hold
///
/// All state lives behind one lock so that assignment, release and the
/// Inactive transition are each atomic with respect to one another.
pub struct NodeRegistry {
    state: Mutex<RegistryState>,
    clock: Arc<dyn Clock>,
}

impl NodeRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            clock,
        }
    }

    /// Register a node, or refresh capacity and liveness of a known one
    pub fn register_or_update(&self, node_id: NodeId, capacity: NodeCapacity) -> Node {
        let now = self.clock.now();
        let mut state = self.state.lock();

        let node = state
            .nodes
            .entry(node_id.clone())
            .and_modify(|node| {
                node.capacity = capacity.clone();
                node.status = NodeStatus::Active;
                node.last_heartbeat_at = now;
                node.missed_heartbeats = 0;
            })
            .or_insert_with(|| Node::new(node_id.clone(), capacity.clone(), now));

        info!(
            node = %node_id,
            cpu = capacity.cpu_cores,
            memory_gb = capacity.memory_gb,
            gpus = capacity.gpu_count,
            "Registered node"
        );
        node.clone()
    }

    /// Record a heartbeat with the node's current load (clamped to 0.0 - 1.0)
    pub fn heartbeat(&self, node_id: &NodeId, load: f64) -> Result<()> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let node = state
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| RuntimeError::unknown_node(node_id.as_str()))?;

        if node.status != NodeStatus::Active {
            info!("Node {} is back ({} -> active)", node_id, node.status);
        }

        node.last_heartbeat_at = now;
        node.missed_heartbeats = 0;
        node.status = NodeStatus::Active;
        node.current_load = if load.is_finite() {
            load.clamp(0.0, 1.0)
        } else {
            node.current_load
        };
        Ok(())
    }

    pub fn get(&self, node_id: &NodeId) -> Option<Node> {
        self.state.lock().nodes.get(node_id).cloned()
    }

    /// All nodes sorted by id
    pub fn list(&self) -> Vec<Node> {
        self.state.lock().nodes.values().cloned().collect()
    }

    /// Active nodes sorted by id
    pub fn active_nodes(&self) -> Vec<Node> {
        self.state
            .lock()
            .nodes
            .values()
            .filter(|n| n.is_active())
            .cloned()
            .collect()
    }

    /// Ids of nodes that are not yet Inactive
    pub fn live_node_ids(&self) -> Vec<NodeId> {
        self.state
            .lock()
            .nodes
            .values()
            .filter(|n| n.status != NodeStatus::Inactive)
            .map(|n| n.id.clone())
            .collect()
    }

    /// Move a node to Inactive, returning the jobs it held
    ///
    /// A node that is already Inactive yields an empty set.
    pub fn mark_inactive(&self, node_id: &NodeId) -> Result<Vec<JobId>> {
        let mut state = self.state.lock();
        if !state.nodes.contains_key(node_id) {
            return Err(RuntimeError::unknown_node(node_id.as_str()));
        }
        let Some(jobs) = state.deactivate(node_id) else {
            debug!("Node {} already inactive", node_id);
            return Ok(Vec::new());
        };
        warn!(node = %node_id, reclaimed = jobs.len(), "Node marked inactive");
        Ok(jobs)
    }

    /// Remove a node entirely, returning the jobs it held
    pub fn deregister(&self, node_id: &NodeId) -> Result<Vec<JobId>> {
        let mut state = self.state.lock();
        if !state.nodes.contains_key(node_id) {
            return Err(RuntimeError::unknown_node(node_id.as_str()));
        }
        let jobs = state.take_jobs(node_id);
        state.nodes.remove(node_id);
        info!(node = %node_id, reclaimed = jobs.len(), "Deregistered node");
        Ok(jobs)
    }

    pub fn node_jobs(&self, node_id: &NodeId) -> Result<Vec<JobId>> {
        self.state
            .lock()
            .nodes
            .get(node_id)
            .map(|n| n.assigned_jobs.iter().copied().collect())
            .ok_or_else(|| RuntimeError::unknown_node(node_id.as_str()))
    }

    /// Node currently holding `job_id`, if any
    pub fn node_for_job(&self, job_id: JobId) -> Option<NodeId> {
        self.state
            .lock()
            .job_index
            .get(&job_id)
            .map(|(node_id, _)| node_id.clone())
    }

    /// Bind a job to a node
    ///
    /// Re-checks under the lock that the node is still Active, that the job
    /// is not held anywhere else and, when `enforce_capacity` is set, that
    /// the requirements still fit the node's spare capacity.
    pub fn assign(
        &self,
        node_id: &NodeId,
        job_id: JobId,
        requirements: &ResourceRequirements,
        enforce_capacity: bool,
    ) -> Result<()> {
        let mut state = self.state.lock();

        if let Some((holder, _)) = state.job_index.get(&job_id) {
            return Err(RuntimeError::already_assigned(
                job_id.to_string(),
                holder.as_str(),
            ));
        }

        let node = state
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| RuntimeError::unknown_node(node_id.as_str()))?;

        if !node.is_active() {
            return Err(RuntimeError::node_unavailable(
                node_id.as_str(),
                job_id.to_string(),
                format!("node is {}", node.status),
            ));
        }

        if enforce_capacity {
            if let Fit::Insufficient(reason) = check_fit(requirements, &node.spare()) {
                return Err(RuntimeError::node_unavailable(
                    node_id.as_str(),
                    job_id.to_string(),
                    reason,
                ));
            }
        }

        node.allocated.add(requirements);
        node.assigned_jobs.insert(job_id);
        state
            .job_index
            .insert(job_id, (node_id.clone(), requirements.clone()));
        Ok(())
    }

    /// Release a job from a node; returns false if the node did not hold it
    pub fn release(&self, node_id: &NodeId, job_id: JobId) -> bool {
        let mut state = self.state.lock();
        let requirements = match state.job_index.get(&job_id) {
            Some((holder, reqs)) if holder == node_id => reqs.clone(),
            _ => return false,
        };
        state.job_index.remove(&job_id);
        if let Some(node) = state.nodes.get_mut(node_id) {
            node.allocated.subtract(&requirements);
            node.assigned_jobs.remove(&job_id);
        }
        true
    }

    /// Check one node for a stale heartbeat
    ///
    /// The missed count is the number of whole `interval`s the silence has
    /// strictly exceeded, so a heartbeat exactly one interval old is still
    /// fresh. Counts in `1..=threshold` mark the node Suspected; above
    /// `threshold` the node goes Inactive in the same critical section, so
    /// concurrent checks report `Lost` at most once per outage.
    pub fn record_missed_heartbeat(
        &self,
        node_id: &NodeId,
        now: DateTime<Utc>,
        interval: Duration,
        threshold: u32,
    ) -> Result<HeartbeatCheck> {
        let mut state = self.state.lock();
        let node = state
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| RuntimeError::unknown_node(node_id.as_str()))?;

        if node.status == NodeStatus::Inactive {
            return Ok(HeartbeatCheck::AlreadyInactive);
        }

        let elapsed_ms = (now - node.last_heartbeat_at)
            .to_std()
            .unwrap_or_default()
            .as_millis();
        let interval_ms = interval.as_millis().max(1);
        let missed =
            u32::try_from(elapsed_ms.saturating_sub(1) / interval_ms).unwrap_or(u32::MAX);

        if missed == 0 {
            return Ok(HeartbeatCheck::Fresh);
        }
        node.missed_heartbeats = missed;

        if missed <= threshold {
            if node.status == NodeStatus::Active {
                warn!(
                    node = %node_id,
                    missed,
                    threshold,
                    "Node missed heartbeats, suspending dispatch"
                );
            }
            node.status = NodeStatus::Suspected;
            return Ok(HeartbeatCheck::Suspected { missed });
        }

        let jobs = state.deactivate(node_id).unwrap_or_default();
        warn!(
            node = %node_id,
            missed,
            reclaimed = jobs.len(),
            "Node heartbeat lost, marked inactive"
        );
        Ok(HeartbeatCheck::Lost { jobs })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_core::ManualClock;

    fn make_registry() -> (NodeRegistry, ManualClock) {
        let clock = ManualClock::default();
        (NodeRegistry::new(Arc::new(clock.clone())), clock)
    }

    fn node(id: &str) -> NodeId {
        NodeId::from(id)
    }

    #[test]
    fn test_heartbeat_unknown_node() {
        let (registry, _) = make_registry();
        let err = registry.heartbeat(&node("ghost"), 0.5).unwrap_err();
        assert!(matches!(err, RuntimeError::UnknownNode { .. }));
    }

    #[test]
    fn test_active_nodes_sorted_by_id() {
        let (registry, _) = make_registry();
        registry.register_or_update(node("node-c"), NodeCapacity::new(4.0, 8.0));
        registry.register_or_update(node("node-a"), NodeCapacity::new(4.0, 8.0));
        registry.register_or_update(node("node-b"), NodeCapacity::new(4.0, 8.0));
        registry.mark_inactive(&node("node-b")).unwrap();

        let ids: Vec<String> = registry
            .active_nodes()
            .into_iter()
            .map(|n| n.id.to_string())
            .collect();
        assert_eq!(ids, vec!["node-a", "node-c"]);
    }

    #[test]
    fn test_assign_and_release() {
        let (registry, _) = make_registry();
        registry.register_or_update(node("node-1"), NodeCapacity::new(4.0, 8.0));
        let job = JobId::new();
        let reqs = ResourceRequirements::new(2.0, 4.0);

        registry.assign(&node("node-1"), job, &reqs, true).unwrap();
        assert_eq!(registry.node_jobs(&node("node-1")).unwrap(), vec![job]);
        assert_eq!(registry.node_for_job(job), Some(node("node-1")));

        let snapshot = registry.get(&node("node-1")).unwrap();
        assert!((snapshot.allocated.cpu_cores - 2.0).abs() < 1e-9);

        assert!(registry.release(&node("node-1"), job));
        assert!(!registry.release(&node("node-1"), job));
        let snapshot = registry.get(&node("node-1")).unwrap();
        assert!(snapshot.assigned_jobs.is_empty());
        assert!(snapshot.allocated.cpu_cores.abs() < 1e-9);
    }

    #[test]
    fn test_assign_rejects_second_holder() {
        let (registry, _) = make_registry();
        registry.register_or_update(node("node-1"), NodeCapacity::new(4.0, 8.0));
        registry.register_or_update(node("node-2"), NodeCapacity::new(4.0, 8.0));
        let job = JobId::new();
        let reqs = ResourceRequirements::default();

        registry.assign(&node("node-1"), job, &reqs, true).unwrap();
        let err = registry.assign(&node("node-2"), job, &reqs, true).unwrap_err();
        assert!(matches!(err, RuntimeError::AlreadyAssigned { .. }));
    }

    #[test]
    fn test_assign_enforces_capacity() {
        let (registry, _) = make_registry();
        registry.register_or_update(node("small"), NodeCapacity::new(2.0, 4.0));
        let big = ResourceRequirements::new(4.0, 2.0);

        let err = registry.assign(&node("small"), JobId::new(), &big, true).unwrap_err();
        assert!(matches!(err, RuntimeError::NodeUnavailable { .. }));

        // Overcommit is allowed when the caller opts out of the check
        registry.assign(&node("small"), JobId::new(), &big, false).unwrap();
    }

    #[test]
    fn test_assign_requires_active_node() {
        let (registry, clock) = make_registry();
        registry.register_or_update(node("node-1"), NodeCapacity::new(4.0, 8.0));
        clock.advance(Duration::from_secs(15));
        registry
            .record_missed_heartbeat(&node("node-1"), clock.now(), Duration::from_secs(10), 3)
            .unwrap();

        let err = registry
            .assign(&node("node-1"), JobId::new(), &ResourceRequirements::default(), true)
            .unwrap_err();
        assert!(matches!(err, RuntimeError::NodeUnavailable { .. }));
    }

    #[test]
    fn test_mark_inactive_is_idempotent() {
        let (registry, _) = make_registry();
        registry.register_or_update(node("node-1"), NodeCapacity::new(4.0, 8.0));
        let jobs = [JobId::new(), JobId::new()];
        for job in jobs {
            registry
                .assign(&node("node-1"), job, &ResourceRequirements::default(), true)
                .unwrap();
        }

        let mut first = registry.mark_inactive(&node("node-1")).unwrap();
        first.sort();
        let mut expected = jobs.to_vec();
        expected.sort();
        assert_eq!(first, expected);

        let second = registry.mark_inactive(&node("node-1")).unwrap();
        assert!(second.is_empty());

        let snapshot = registry.get(&node("node-1")).unwrap();
        assert_eq!(snapshot.status, NodeStatus::Inactive);
        assert!(snapshot.assigned_jobs.is_empty());
        assert_eq!(registry.node_for_job(jobs[0]), None);
    }

    #[test]
    fn test_missed_heartbeat_progression() {
        let (registry, clock) = make_registry();
        let id = node("node-1");
        let interval = Duration::from_secs(10);
        registry.register_or_update(id.clone(), NodeCapacity::new(4.0, 8.0));
        let job = JobId::new();
        registry
            .assign(&id, job, &ResourceRequirements::default(), true)
            .unwrap();

        clock.advance(Duration::from_secs(5));
        assert_eq!(
            registry.record_missed_heartbeat(&id, clock.now(), interval, 2).unwrap(),
            HeartbeatCheck::Fresh
        );

        clock.advance(Duration::from_secs(20));
        assert_eq!(
            registry.record_missed_heartbeat(&id, clock.now(), interval, 2).unwrap(),
            HeartbeatCheck::Suspected { missed: 2 }
        );
        // Suspected nodes keep their jobs
        assert_eq!(registry.node_jobs(&id).unwrap(), vec![job]);

        clock.advance(Duration::from_secs(10));
        assert_eq!(
            registry.record_missed_heartbeat(&id, clock.now(), interval, 2).unwrap(),
            HeartbeatCheck::Lost { jobs: vec![job] }
        );
        assert_eq!(
            registry.record_missed_heartbeat(&id, clock.now(), interval, 2).unwrap(),
            HeartbeatCheck::AlreadyInactive
        );
    }

    #[test]
    fn test_missed_heartbeat_requires_exceeding_interval() {
        let (registry, clock) = make_registry();
        let id = node("node-1");
        let interval = Duration::from_secs(10);
        registry.register_or_update(id.clone(), NodeCapacity::new(4.0, 8.0));

        clock.advance(interval);
        assert_eq!(
            registry.record_missed_heartbeat(&id, clock.now(), interval, 2).unwrap(),
            HeartbeatCheck::Fresh
        );
        assert_eq!(registry.get(&id).unwrap().status, NodeStatus::Active);

        clock.advance(Duration::from_millis(1));
        assert_eq!(
            registry.record_missed_heartbeat(&id, clock.now(), interval, 2).unwrap(),
            HeartbeatCheck::Suspected { missed: 1 }
        );

        // Exactly interval * (threshold + 1) is still only Suspected
        clock.advance(Duration::from_millis(19_999));
        assert_eq!(
            registry.record_missed_heartbeat(&id, clock.now(), interval, 2).unwrap(),
            HeartbeatCheck::Suspected { missed: 2 }
        );
        clock.advance(Duration::from_millis(1));
        assert_eq!(
            registry.record_missed_heartbeat(&id, clock.now(), interval, 2).unwrap(),
            HeartbeatCheck::Lost { jobs: vec![] }
        );
        assert!(registry.mark_inactive(&id).unwrap().is_empty());
    }

    #[test]
    fn test_heartbeat_restores_active() {
        let (registry, clock) = make_registry();
        let id = node("node-1");
        registry.register_or_update(id.clone(), NodeCapacity::new(4.0, 8.0));

        clock.advance(Duration::from_secs(12));
        registry
            .record_missed_heartbeat(&id, clock.now(), Duration::from_secs(10), 3)
            .unwrap();
        assert_eq!(registry.get(&id).unwrap().status, NodeStatus::Suspected);

        registry.heartbeat(&id, 0.4).unwrap();
        let snapshot = registry.get(&id).unwrap();
        assert_eq!(snapshot.status, NodeStatus::Active);
        assert_eq!(snapshot.missed_heartbeats, 0);
        assert!((snapshot.current_load - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_deregister_returns_jobs() {
        let (registry, _) = make_registry();
        let id = node("node-1");
        registry.register_or_update(id.clone(), NodeCapacity::new(4.0, 8.0));
        let job = JobId::new();
        registry
            .assign(&id, job, &ResourceRequirements::default(), true)
            .unwrap();

        assert_eq!(registry.deregister(&id).unwrap(), vec![job]);
        assert!(registry.get(&id).is_none());
        assert!(registry.deregister(&id).is_err());
    }
}
