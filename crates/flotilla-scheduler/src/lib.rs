//! Flotilla Scheduler - Job queueing, placement and recovery
//!
//! This crate provides:
//! - The bounded priority queue with delayed retries
//! - Filter predicates and load-balancing strategies
//! - Failure recovery with exponential backoff
//! - The scheduler that ties the queue, node registry and executor together

pub mod balancer;
pub mod config;
pub mod error;
pub mod filter;
pub mod queue;
pub mod recovery;
pub mod scheduler;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use balancer::{BalancingStrategy, LoadBalancer};
pub use config::{RetryPolicy, SchedulerConfig};
pub use error::{Result, SchedulerError};
pub use queue::{PriorityJobQueue, QueueStats, QueuedEntry};
pub use recovery::{RecoveryManager, RecoveryOutcome};
pub use scheduler::{DispatchOutcome, Scheduler};
pub use store::JobStore;
pub use types::{FilterResult, SchedulingContext};
