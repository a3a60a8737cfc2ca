use crate::types::{FilterResult, SchedulingContext};
use flotilla_core::{check_fit, Fit, Node};
use tracing::debug;

/// Filter predicate trait
pub trait FilterPredicate: Send + Sync {
    /// Filter a node for the job in `context`
    fn filter(&self, context: &SchedulingContext, node: &Node) -> FilterResult;

    /// Name of the filter
    fn name(&self) -> &str;
}

/// Filter for job resource requirements against a node's spare capacity
pub struct JobFitsResources;

impl FilterPredicate for JobFitsResources {
    fn filter(&self, context: &SchedulingContext, node: &Node) -> FilterResult {
        let spare = node.spare();

        debug!(
            "Node {} has spare CPU: {:.2}, memory: {:.2} GB, GPUs: {}",
            node.id, spare.cpu_cores, spare.memory_gb, spare.gpus
        );

        match check_fit(&context.requirements, &spare) {
            Fit::Fits => FilterResult::pass(node.id.clone()),
            Fit::Insufficient(reason) => FilterResult::fail(node.id.clone(), reason),
        }
    }

    fn name(&self) -> &str {
        "JobFitsResources"
    }
}

/// Filter out nodes that are not Active
pub struct NodeIsActive;

impl FilterPredicate for NodeIsActive {
    fn filter(&self, _context: &SchedulingContext, node: &Node) -> FilterResult {
        if node.is_active() {
            FilterResult::pass(node.id.clone())
        } else {
            FilterResult::fail(node.id.clone(), format!("Node is {}", node.status))
        }
    }

    fn name(&self) -> &str {
        "NodeIsActive"
    }
}

/// Get default filter predicates
pub fn default_filters() -> Vec<Box<dyn FilterPredicate>> {
    vec![Box::new(NodeIsActive), Box::new(JobFitsResources)]
}

/// Run `filters` over the context's nodes and keep the ones that pass all of them
pub fn feasible_nodes<'a>(
    context: &'a SchedulingContext,
    filters: &[Box<dyn FilterPredicate>],
) -> Vec<&'a Node> {
    context
        .nodes
        .iter()
        .filter(|node| {
            filters.iter().all(|filter| {
                let result = filter.filter(context, node);
                if !result.passed {
                    debug!(
                        "Node {} filtered out by {}: {}",
                        result.node_id,
                        filter.name(),
                        result.reason.unwrap_or_default()
                    );
                }
                result.passed
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use flotilla_core::{NodeCapacity, NodeId, NodeStatus, ResourceRequirements};

    fn create_test_node(name: &str, cpu: f64, memory_gb: f64) -> Node {
        Node::new(NodeId::from(name), NodeCapacity::new(cpu, memory_gb), Utc::now())
    }

    fn create_test_context(cpu: f64, memory_gb: f64, nodes: Vec<Node>) -> SchedulingContext {
        SchedulingContext::new("test-job", ResourceRequirements::new(cpu, memory_gb), nodes)
    }

    #[test]
    fn test_job_fits_resources_pass() {
        let node = create_test_node("node1", 4.0, 8.0);
        let context = create_test_context(1.0, 1.0, vec![node.clone()]);

        let result = JobFitsResources.filter(&context, &node);
        assert!(result.passed);
    }

    #[test]
    fn test_job_fits_resources_fail_cpu() {
        let node = create_test_node("node1", 1.0, 8.0);
        let context = create_test_context(2.0, 1.0, vec![node.clone()]);

        let result = JobFitsResources.filter(&context, &node);
        assert!(!result.passed);
        assert!(result.reason.unwrap().contains("Insufficient CPU"));
    }

    #[test]
    fn test_job_fits_resources_counts_reservations() {
        let mut node = create_test_node("node1", 4.0, 8.0);
        node.allocated.add(&ResourceRequirements::new(1.0, 7.0));
        let context = create_test_context(1.0, 2.0, vec![node.clone()]);

        let result = JobFitsResources.filter(&context, &node);
        assert!(!result.passed);
        assert!(result.reason.unwrap().contains("Insufficient memory"));
    }

    #[test]
    fn test_job_fits_resources_fail_gpu() {
        let node = create_test_node("cpu-only", 8.0, 32.0);
        let mut context = create_test_context(1.0, 1.0, vec![node.clone()]);
        context.requirements = context.requirements.clone().with_gpu(Some(8.0));

        let result = JobFitsResources.filter(&context, &node);
        assert!(!result.passed);
        assert!(result.reason.unwrap().contains("GPU"));
    }

    #[test]
    fn test_feasible_nodes_skips_suspected() {
        let healthy = create_test_node("node-a", 4.0, 8.0);
        let mut suspected = create_test_node("node-b", 4.0, 8.0);
        suspected.status = NodeStatus::Suspected;
        let context = create_test_context(1.0, 1.0, vec![healthy, suspected]);

        let feasible = feasible_nodes(&context, &default_filters());
        assert_eq!(feasible.len(), 1);
        assert_eq!(feasible[0].id.as_str(), "node-a");
    }
}
