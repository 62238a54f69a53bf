//! Job lifecycle events backed by a `tokio::sync::broadcast` channel.
//!
//! The command layer subscribes to learn about state changes without
//! polling `status`. Share the bus via `Arc<EventBus>`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use vidgen_core::{JobId, JobState, JobSummary, RequesterId};

// ---------------------------------------------------------------------------
// JobEvent
// ---------------------------------------------------------------------------

/// A job changed state or reported progress.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobEvent {
    pub job_id: JobId,
    pub requester: RequesterId,
    pub model_id: String,
    pub state: JobState,
    pub progress: u8,

    /// Failure reason, artifact path or other human-readable detail.
    pub message: Option<String>,

    /// When the event was created (UTC).
    pub timestamp: DateTime<Utc>,
}

impl JobEvent {
    /// Snapshot an event from a job summary.
    ///
    /// The message is the failure reason for failed jobs and the artifact
    /// path for completed ones.
    pub fn from_summary(summary: &JobSummary) -> Self {
        let message = match summary.state {
            JobState::Failed => summary.failure.clone(),
            JobState::Completed => summary
                .artifact
                .as_ref()
                .map(|p| p.display().to_string()),
            _ => None,
        };
        Self {
            job_id: summary.id.clone(),
            requester: summary.requester.clone(),
            model_id: summary.model_id.clone(),
            state: summary.state,
            progress: summary.progress,
            message,
            timestamp: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 1024;

/// In-process fan-out bus for [`JobEvent`]s.
pub struct EventBus {
    sender: broadcast::Sender<JobEvent>,
}

impl EventBus {
    /// Create a bus with a specific channel capacity.
    ///
    /// When the buffer is full, the oldest un-consumed messages are dropped
    /// and slow receivers will observe a `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    ///
    /// If there are no active subscribers the event is silently dropped.
    pub fn publish(&self, event: JobEvent) {
        // Ignore the SendError, it only means there are zero receivers.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
