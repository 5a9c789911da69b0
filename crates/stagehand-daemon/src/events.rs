//! Pipeline event broadcasting.
//!
//! Every phase transition and terminal outcome is published on a broadcast
//! channel so control surfaces (and tests) can watch a job's progress
//! without polling the database.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Capacity of the broadcast channel; slow subscribers lag rather than
/// block the pipeline.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A pipeline lifecycle event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    JobEnqueued {
        job_id: String,
        project_id: String,
    },
    JobClaimed {
        job_id: String,
        worker_id: String,
        attempt: i64,
    },
    PhaseStarted {
        job_id: String,
        phase: String,
    },
    PhaseCompleted {
        job_id: String,
        phase: String,
    },
    ApprovalRequested {
        job_id: String,
        approval_id: i64,
    },
    ApprovalDecided {
        job_id: String,
        approval_id: i64,
        status: String,
    },
    LeaseLost {
        job_id: String,
        worker_id: String,
    },
    JobSucceeded {
        job_id: String,
    },
    JobFailed {
        job_id: String,
        error: String,
    },
    JobCanceled {
        job_id: String,
    },
}

impl PipelineEvent {
    /// The job this event concerns.
    pub fn job_id(&self) -> &str {
        match self {
            Self::JobEnqueued { job_id, .. }
            | Self::JobClaimed { job_id, .. }
            | Self::PhaseStarted { job_id, .. }
            | Self::PhaseCompleted { job_id, .. }
            | Self::ApprovalRequested { job_id, .. }
            | Self::ApprovalDecided { job_id, .. }
            | Self::LeaseLost { job_id, .. }
            | Self::JobSucceeded { job_id }
            | Self::JobFailed { job_id, .. }
            | Self::JobCanceled { job_id } => job_id,
        }
    }
}

/// Shared broadcast bus for pipeline events.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event. Dropped when nobody is subscribed.
    pub fn publish(&self, event: PipelineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(PipelineEvent::JobSucceeded {
            job_id: "job-1".into(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.job_id(), "job-1");
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.publish(PipelineEvent::JobCanceled {
            job_id: "job-1".into(),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let event = PipelineEvent::PhaseStarted {
            job_id: "job-1".into(),
            phase: "plan".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"phase_started""#));

        let back: PipelineEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
