//! Bus events exchanged between services.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// JSON-encoded control events on the `events` pub/sub channel.
///
/// Delivery is at-least-once with best-effort FIFO per publisher, so
/// every consumer must be idempotent on `(id, event type)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    #[serde(rename = "job.created")]
    JobCreated { job_id: Uuid },
    #[serde(rename = "task.completed")]
    TaskCompleted {
        task_id: Uuid,
        /// Blob reference to the task's output, recorded by the handler.
        #[serde(default)]
        output: Option<String>,
    },
    #[serde(rename = "task.failed")]
    TaskFailed { task_id: Uuid, error: String },
    #[serde(rename = "job.cancel_requested")]
    JobCancelRequested { job_id: Uuid },
    #[serde(rename = "job.completed")]
    JobCompleted { job_id: Uuid },
    #[serde(rename = "job.failed")]
    JobFailed { job_id: Uuid },
    #[serde(rename = "job.cancelled")]
    JobCancelled { job_id: Uuid },
    #[serde(rename = "session.started")]
    SessionStarted { session_id: Uuid },
    #[serde(rename = "session.ended")]
    SessionEnded { session_id: Uuid },
}

impl Event {
    /// Wire name of this event's type tag.
    pub fn type_name(&self) -> &'static str {
        match self {
            Event::JobCreated { .. } => "job.created",
            Event::TaskCompleted { .. } => "task.completed",
            Event::TaskFailed { .. } => "task.failed",
            Event::JobCancelRequested { .. } => "job.cancel_requested",
            Event::JobCompleted { .. } => "job.completed",
            Event::JobFailed { .. } => "job.failed",
            Event::JobCancelled { .. } => "job.cancelled",
            Event::SessionStarted { .. } => "session.started",
            Event::SessionEnded { .. } => "session.ended",
        }
    }
}
