use crate::resources::{Allocation, NodeCapacity};
use crate::types::{JobId, NodeId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Liveness state of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Heartbeats are fresh; eligible for new work
    Active,
    /// Missed at least one heartbeat; keeps its jobs but receives no new ones
    Suspected,
    /// Declared dead; its jobs have been reclaimed
    Inactive,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeStatus::Active => write!(f, "active"),
            NodeStatus::Suspected => write!(f, "suspected"),
            NodeStatus::Inactive => write!(f, "inactive"),
        }
    }
}

/// A compute node tracked for capacity and liveness
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub capacity: NodeCapacity,
    /// Sum of the requirements of the jobs assigned to this node
    pub allocated: Allocation,
    /// Last load sample reported by the node (0.0 - 1.0)
    pub current_load: f64,
    pub status: NodeStatus,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub missed_heartbeats: u32,
    pub assigned_jobs: BTreeSet<JobId>,
}

impl Node {
    pub fn new(id: NodeId, capacity: NodeCapacity, now: DateTime<Utc>) -> Self {
        Self {
            id,
            capacity,
            allocated: Allocation::default(),
            current_load: 0.0,
            status: NodeStatus::Active,
            registered_at: now,
            last_heartbeat_at: now,
            missed_heartbeats: 0,
            assigned_jobs: BTreeSet::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == NodeStatus::Active
    }

    /// Resources not yet reserved by assigned jobs
    pub fn spare(&self) -> Allocation {
        self.allocated.spare(&self.capacity)
    }

    /// Load used for balancing: the reported sample, or the reserved share of
    /// the node if that is higher (dispatches land before the next heartbeat)
    pub fn effective_load(&self) -> f64 {
        self.current_load.max(self.allocated.utilization(&self.capacity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::ResourceRequirements;

    #[test]
    fn test_effective_load_tracks_reservations() {
        let mut node = Node::new(NodeId::from("node-1"), NodeCapacity::new(4.0, 8.0), Utc::now());
        node.current_load = 0.1;
        assert!((node.effective_load() - 0.1).abs() < 1e-9);

        node.allocated.add(&ResourceRequirements::new(2.0, 1.0));
        assert!((node.effective_load() - 0.5).abs() < 1e-9);
        assert!((node.spare().cpu_cores - 2.0).abs() < 1e-9);
    }
}
