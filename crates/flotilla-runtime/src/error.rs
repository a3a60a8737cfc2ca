use miette::Diagnostic;
use thiserror::Error;

/// Runtime error type for node registry and execution operations
#[derive(Error, Debug, Diagnostic)]
pub enum RuntimeError {
    /// Node was never registered
    #[error("Unknown node: {node_id}")]
    #[diagnostic(
        code(flotilla::runtime::unknown_node),
        help("Nodes must call `register_node()` before sending heartbeats or receiving jobs")
    )]
    UnknownNode {
        #[allow(unused)]
        node_id: String,
    },

    /// Node cannot take the job right now
    #[error("Node '{node_id}' cannot accept job {job_id}: {reason}")]
    #[diagnostic(
        code(flotilla::runtime::node_unavailable),
        help("The node changed state or filled up after it was selected. The job should be re-queued without penalty")
    )]
    NodeUnavailable {
        #[allow(unused)]
        node_id: String,
        #[allow(unused)]
        job_id: String,
        #[allow(unused)]
        reason: String,
    },

    /// Job is already assigned to a different node
    #[error("Job {job_id} is already assigned to node '{node_id}'")]
    #[diagnostic(
        code(flotilla::runtime::already_assigned),
        help("A job may be held by at most one node. Release it from '{node_id}' first")
    )]
    AlreadyAssigned {
        #[allow(unused)]
        job_id: String,
        #[allow(unused)]
        node_id: String,
    },

    /// Executor failed to run a job
    #[error("Execution of job {job_id} on node '{node_id}' failed: {message}")]
    #[diagnostic(
        code(flotilla::runtime::execution_failed),
        help("The failure is routed to the recovery manager and retried while the job has budget left")
    )]
    ExecutionFailed {
        #[allow(unused)]
        job_id: String,
        #[allow(unused)]
        node_id: String,
        #[allow(unused)]
        message: String,
    },

    /// Core library error
    #[error(transparent)]
    #[diagnostic(transparent)]
    CoreError(#[from] flotilla_core::FlotillaError),
}

/// Result type alias for runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;

impl RuntimeError {
    pub fn unknown_node(node_id: impl Into<String>) -> Self {
        Self::UnknownNode {
            node_id: node_id.into(),
        }
    }

    pub fn node_unavailable(
        node_id: impl Into<String>,
        job_id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::NodeUnavailable {
            node_id: node_id.into(),
            job_id: job_id.into(),
            reason: reason.into(),
        }
    }

    pub fn already_assigned(job_id: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self::AlreadyAssigned {
            job_id: job_id.into(),
            node_id: node_id.into(),
        }
    }

    pub fn execution_failed(
        job_id: impl Into<String>,
        node_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::ExecutionFailed {
            job_id: job_id.into(),
            node_id: node_id.into(),
            message: message.into(),
        }
    }
}
