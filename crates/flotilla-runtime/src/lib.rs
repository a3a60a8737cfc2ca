// Allow unused assignments for diagnostic fields - they're used by the thiserror/miette macros
#![allow(unused_assignments)]

pub mod error;
pub mod mock;
pub mod node_health;
pub mod registry;
pub mod traits;

// Re-export primary types
pub use error::{Result, RuntimeError};
pub use mock::{MockExecution, MockExecutor, MockHint};
pub use node_health::{HeartbeatMonitor, HeartbeatMonitorConfig};
pub use registry::{HeartbeatCheck, NodeRegistry};
pub use traits::{ExecutionOutcome, JobExecutor, NodeLossHandler};
