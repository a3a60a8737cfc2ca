use flotilla_core::{Node, NodeId, ResourceRequirements};

/// Scheduling context: one job's requirements and the candidate nodes
#[derive(Debug, Clone)]
pub struct SchedulingContext {
    /// Job being placed (for log messages)
    pub job_name: String,
    /// What the job needs
    pub requirements: ResourceRequirements,
    /// Candidate nodes, sorted by id
    pub nodes: Vec<Node>,
}

impl SchedulingContext {
    /// Create a new scheduling context
    pub fn new(
        job_name: impl Into<String>,
        requirements: ResourceRequirements,
        nodes: Vec<Node>,
    ) -> Self {
        Self {
            job_name: job_name.into(),
            requirements,
            nodes,
        }
    }
}

/// Result of filtering a node
#[derive(Debug, Clone)]
pub struct FilterResult {
    /// Node id
    pub node_id: NodeId,
    /// Whether the node passed the filter
    pub passed: bool,
    /// Reason for failure (if any)
    pub reason: Option<String>,
}

impl FilterResult {
    /// Create a passing filter result
    pub fn pass(node_id: NodeId) -> Self {
        Self {
            node_id,
            passed: true,
            reason: None,
        }
    }

    /// Create a failing filter result
    pub fn fail(node_id: NodeId, reason: String) -> Self {
        Self {
            node_id,
            passed: false,
            reason: Some(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_result() {
        let pass = FilterResult::pass(NodeId::from("node1"));
        assert!(pass.passed);
        assert!(pass.reason.is_none());

        let fail = FilterResult::fail(NodeId::from("node2"), "Insufficient CPU".to_string());
        assert!(!fail.passed);
        assert_eq!(fail.reason, Some("Insufficient CPU".to_string()));
    }
}
