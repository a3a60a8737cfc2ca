use crate::job::FailureReason;
use crate::types::{JobId, NodeId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Record emitted when a job fails permanently
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub job_id: JobId,
    pub reason: FailureReason,
    pub timestamp: DateTime<Utc>,
    pub retry_count: u32,
    pub error: String,
}

/// Kind of scheduler event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    Submitted { priority: u8 },
    Dispatched { node_id: NodeId, attempt: u32 },
    Completed { node_id: Option<NodeId> },
    Retrying {
        reason: FailureReason,
        retry_count: u32,
        next_retry_at: DateTime<Utc>,
    },
    Failed(FailureRecord),
    Cancelled,
    NodeInactive { node_id: NodeId, reclaimed: usize },
}

/// An event emitted by the scheduler core on every lifecycle change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerEvent {
    /// Job the event is about (absent for node-level events)
    pub job_id: Option<JobId>,
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
}

impl SchedulerEvent {
    pub fn submitted(job_id: JobId, priority: u8, timestamp: DateTime<Utc>) -> Self {
        Self {
            job_id: Some(job_id),
            kind: EventKind::Submitted { priority },
            timestamp,
        }
    }

    pub fn dispatched(
        job_id: JobId,
        node_id: NodeId,
        attempt: u32,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id: Some(job_id),
            kind: EventKind::Dispatched { node_id, attempt },
            timestamp,
        }
    }

    pub fn completed(job_id: JobId, node_id: Option<NodeId>, timestamp: DateTime<Utc>) -> Self {
        Self {
            job_id: Some(job_id),
            kind: EventKind::Completed { node_id },
            timestamp,
        }
    }

    pub fn retrying(
        job_id: JobId,
        reason: FailureReason,
        retry_count: u32,
        next_retry_at: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id: Some(job_id),
            kind: EventKind::Retrying {
                reason,
                retry_count,
                next_retry_at,
            },
            timestamp,
        }
    }

    pub fn failed(record: FailureRecord) -> Self {
        Self {
            job_id: Some(record.job_id),
            timestamp: record.timestamp,
            kind: EventKind::Failed(record),
        }
    }

    pub fn cancelled(job_id: JobId, timestamp: DateTime<Utc>) -> Self {
        Self {
            job_id: Some(job_id),
            kind: EventKind::Cancelled,
            timestamp,
        }
    }

    pub fn node_inactive(node_id: NodeId, reclaimed: usize, timestamp: DateTime<Utc>) -> Self {
        Self {
            job_id: None,
            kind: EventKind::NodeInactive { node_id, reclaimed },
            timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_event_serializes_record() {
        let record = FailureRecord {
            job_id: JobId::new(),
            reason: FailureReason::Timeout,
            timestamp: Utc::now(),
            retry_count: 3,
            error: "deadline exceeded".to_string(),
        };
        let event = SchedulerEvent::failed(record.clone());

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"]["type"], "failed");
        assert_eq!(json["kind"]["reason"], "timeout");
        assert_eq!(json["kind"]["retry_count"], 3);

        let back: SchedulerEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back.kind, EventKind::Failed(record));
    }
}
