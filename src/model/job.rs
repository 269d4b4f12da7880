//! Job: the unit of work submitted by a client.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a job.
///
/// `Completed`, `Failed`, and `Cancelled` are terminal and immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelling,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelling => "cancelling",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelling" => Some(JobStatus::Cancelling),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    /// Webhook event type published when a job reaches this state, if any.
    pub fn webhook_event(self) -> Option<&'static str> {
        match self {
            JobStatus::Completed => Some("transcription.completed"),
            JobStatus::Failed => Some("transcription.failed"),
            JobStatus::Cancelled => Some("transcription.cancelled"),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client-chosen transcription parameters, fixed at submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobParams {
    /// Public model id (e.g. "fast", "parakeet-0.6b").
    pub model: String,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub word_timestamps: bool,
    /// Speaker detection (diarization).
    #[serde(default)]
    pub speaker_detection: bool,
    #[serde(default)]
    pub llm_cleanup: bool,
    /// Legacy per-job webhook URL override.
    #[serde(default)]
    pub webhook_url: Option<String>,
    /// Opaque client metadata echoed in webhook payloads. Size-capped at
    /// the gateway.
    #[serde(default)]
    pub webhook_metadata: Option<serde_json::Value>,
}

/// A transcription job. Created by the gateway, mutated only by the
/// orchestrator once submitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub tenant_id: String,
    pub status: JobStatus,
    /// Content-addressed reference to the uploaded audio.
    pub audio_blob: String,
    pub params: JobParams,
    /// Reference to the merged transcript, set on completion.
    #[serde(default)]
    pub transcript_blob: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(tenant_id: impl Into<String>, audio_blob: impl Into<String>, params: JobParams) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.into(),
            status: JobStatus::Pending,
            audio_blob: audio_blob.into(),
            params,
            transcript_blob: None,
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Cancelling.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelling,
            JobStatus::Cancelled,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("bogus"), None);
    }

    #[test]
    fn webhook_events_only_for_terminal_states() {
        assert_eq!(
            JobStatus::Completed.webhook_event(),
            Some("transcription.completed")
        );
        assert_eq!(
            JobStatus::Failed.webhook_event(),
            Some("transcription.failed")
        );
        assert_eq!(
            JobStatus::Cancelled.webhook_event(),
            Some("transcription.cancelled")
        );
        assert_eq!(JobStatus::Running.webhook_event(), None);
        assert_eq!(JobStatus::Cancelling.webhook_event(), None);
    }
}
