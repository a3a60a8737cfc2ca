//! Flotilla Core - Job and node model for the Flotilla scheduler
//!
//! This crate provides:
//! - The job record and its state machine
//! - Node records with capacity, reservations and liveness
//! - Resource requirements, fit checks and quantity parsing
//! - Error types with miette diagnostics
//! - The clock abstraction and scheduler events

pub mod clock;
pub mod error;
pub mod events;
pub mod job;
pub mod node;
pub mod resources;
pub mod types;

// Re-export commonly used types
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{FlotillaError, Result};
pub use events::{EventKind, FailureRecord, SchedulerEvent};
pub use job::{FailureReason, Job, JobDefaults, JobSpec, JobStatus};
pub use node::{Node, NodeStatus};
pub use resources::{check_fit, Allocation, Fit, NodeCapacity, ResourceQuantities, ResourceRequirements};
pub use types::{JobId, NodeId};
