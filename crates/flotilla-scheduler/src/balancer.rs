use crate::filter::{default_filters, feasible_nodes, FilterPredicate, NodeIsActive};
use crate::types::SchedulingContext;
use flotilla_core::{Node, NodeId};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use tracing::debug;

/// How a node is chosen for a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalancingStrategy {
    /// Lowest effective load wins; capacity is not checked
    LeastLoaded,
    /// Only nodes with enough spare capacity, then lowest load
    #[default]
    ResourceMatch,
    /// Rotate over nodes with enough spare capacity
    RoundRobin,
}

impl BalancingStrategy {
    /// Whether the registry must re-check capacity when binding
    pub fn enforces_capacity(&self) -> bool {
        !matches!(self, BalancingStrategy::LeastLoaded)
    }
}

impl fmt::Display for BalancingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BalancingStrategy::LeastLoaded => "least_loaded",
            BalancingStrategy::ResourceMatch => "resource_match",
            BalancingStrategy::RoundRobin => "round_robin",
        };
        write!(f, "{}", s)
    }
}

/// Picks a node for a job according to a `BalancingStrategy`
pub struct LoadBalancer {
    strategy: BalancingStrategy,
    filters: Vec<Box<dyn FilterPredicate>>,
    cursor: AtomicUsize,
}

impl LoadBalancer {
    pub fn new(strategy: BalancingStrategy) -> Self {
        let filters: Vec<Box<dyn FilterPredicate>> = if strategy.enforces_capacity() {
            default_filters()
        } else {
            vec![Box::new(NodeIsActive)]
        };

        Self {
            strategy,
            filters,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn strategy(&self) -> BalancingStrategy {
        self.strategy
    }

    /// Select a node, or `None` when nothing qualifies
    ///
    /// Nodes in the context must already be sorted by id; selection is
    /// deterministic for a given node set and cursor position.
    pub fn select(&self, context: &SchedulingContext) -> Option<NodeId> {
        let candidates = feasible_nodes(context, &self.filters);
        if candidates.is_empty() {
            debug!(
                "No node qualifies for job {} under {}",
                context.job_name, self.strategy
            );
            return None;
        }

        let chosen = match self.strategy {
            BalancingStrategy::LeastLoaded | BalancingStrategy::ResourceMatch => {
                least_loaded(&candidates)
            }
            BalancingStrategy::RoundRobin => {
                let turn = self.cursor.fetch_add(1, AtomicOrdering::Relaxed);
                candidates[turn % candidates.len()]
            }
        };

        debug!(
            "Selected node {} for job {} (strategy {}, load {:.2})",
            chosen.id,
            context.job_name,
            self.strategy,
            chosen.effective_load()
        );
        Some(chosen.id.clone())
    }
}

fn least_loaded<'a>(candidates: &[&'a Node]) -> &'a Node {
    // Candidates are non-empty and sorted by id, so min_by keeps the lowest id on ties
    candidates
        .iter()
        .copied()
        .min_by(|a, b| {
            a.effective_load()
                .partial_cmp(&b.effective_load())
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        })
        .unwrap_or(candidates[0])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use flotilla_core::{NodeCapacity, NodeStatus, ResourceRequirements};

    fn create_test_node(name: &str, cpu: f64, memory_gb: f64, load: f64) -> Node {
        let mut node = Node::new(NodeId::from(name), NodeCapacity::new(cpu, memory_gb), Utc::now());
        node.current_load = load;
        node
    }

    fn context(cpu: f64, memory_gb: f64, nodes: Vec<Node>) -> SchedulingContext {
        SchedulingContext::new("test-job", ResourceRequirements::new(cpu, memory_gb), nodes)
    }

    #[test]
    fn test_least_loaded_picks_minimum() {
        let balancer = LoadBalancer::new(BalancingStrategy::LeastLoaded);
        let ctx = context(
            1.0,
            1.0,
            vec![
                create_test_node("node-a", 4.0, 8.0, 0.7),
                create_test_node("node-b", 4.0, 8.0, 0.2),
                create_test_node("node-c", 4.0, 8.0, 0.5),
            ],
        );
        assert_eq!(balancer.select(&ctx), Some(NodeId::from("node-b")));
    }

    #[test]
    fn test_least_loaded_ties_break_by_id() {
        let balancer = LoadBalancer::new(BalancingStrategy::LeastLoaded);
        let ctx = context(
            1.0,
            1.0,
            vec![
                create_test_node("node-a", 4.0, 8.0, 0.3),
                create_test_node("node-b", 4.0, 8.0, 0.3),
            ],
        );
        assert_eq!(balancer.select(&ctx), Some(NodeId::from("node-a")));
    }

    #[test]
    fn test_least_loaded_allows_overcommit() {
        let balancer = LoadBalancer::new(BalancingStrategy::LeastLoaded);
        let ctx = context(16.0, 64.0, vec![create_test_node("small", 2.0, 4.0, 0.0)]);
        assert_eq!(balancer.select(&ctx), Some(NodeId::from("small")));
    }

    #[test]
    fn test_resource_match_never_picks_insufficient_node() {
        let balancer = LoadBalancer::new(BalancingStrategy::ResourceMatch);
        let ctx = context(
            4.0,
            16.0,
            vec![
                // Idle but too small
                create_test_node("node-a", 2.0, 8.0, 0.0),
                create_test_node("node-b", 8.0, 32.0, 0.6),
            ],
        );
        assert_eq!(balancer.select(&ctx), Some(NodeId::from("node-b")));
    }

    #[test]
    fn test_resource_match_no_node() {
        let balancer = LoadBalancer::new(BalancingStrategy::ResourceMatch);
        let ctx = context(64.0, 1.0, vec![create_test_node("node-a", 8.0, 32.0, 0.0)]);
        assert_eq!(balancer.select(&ctx), None);
    }

    #[test]
    fn test_round_robin_rotates_in_id_order() {
        let balancer = LoadBalancer::new(BalancingStrategy::RoundRobin);
        let ctx = context(
            1.0,
            1.0,
            vec![
                create_test_node("node-a", 4.0, 8.0, 0.9),
                create_test_node("node-b", 4.0, 8.0, 0.1),
                create_test_node("node-c", 4.0, 8.0, 0.5),
            ],
        );

        let picks: Vec<String> = (0..4)
            .filter_map(|_| balancer.select(&ctx))
            .map(|id| id.to_string())
            .collect();
        assert_eq!(picks, vec!["node-a", "node-b", "node-c", "node-a"]);
    }

    #[test]
    fn test_inactive_nodes_never_selected() {
        let balancer = LoadBalancer::new(BalancingStrategy::LeastLoaded);
        let mut dead = create_test_node("node-a", 4.0, 8.0, 0.0);
        dead.status = NodeStatus::Inactive;
        let ctx = context(1.0, 1.0, vec![dead, create_test_node("node-b", 4.0, 8.0, 0.9)]);
        assert_eq!(balancer.select(&ctx), Some(NodeId::from("node-b")));
    }
}
