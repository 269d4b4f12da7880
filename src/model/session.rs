//! Realtime session and worker-pool records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a WebSocket session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
    Error,
    /// Worker crashed mid-session.
    Interrupted,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
            SessionStatus::Error => "error",
            SessionStatus::Interrupted => "interrupted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(SessionStatus::Active),
            "completed" => Some(SessionStatus::Completed),
            "error" => Some(SessionStatus::Error),
            "interrupted" => Some(SessionStatus::Interrupted),
            _ => None,
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One live (or finished) streaming session. A session is assigned to
/// exactly one worker for its whole lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeSession {
    pub id: Uuid,
    pub tenant_id: String,
    pub status: SessionStatus,
    pub worker_id: Option<String>,
    pub model: String,
    #[serde(default)]
    pub language: Option<String>,
    pub encoding: String,
    pub sample_rate: u32,
    #[serde(default)]
    pub store_audio: bool,
    #[serde(default)]
    pub store_transcript: bool,
    #[serde(default)]
    pub enhance_on_end: bool,
    #[serde(default)]
    pub audio_blob: Option<String>,
    #[serde(default)]
    pub transcript_blob: Option<String>,
    /// Batch job created to enhance this session's transcript, if any.
    #[serde(default)]
    pub enhancement_job_id: Option<Uuid>,
    /// Soft resume link to a dropped predecessor session. No partial
    /// transcripts are replayed through this link.
    #[serde(default)]
    pub resumed_from: Option<Uuid>,
    #[serde(default)]
    pub duration_ms: i64,
    #[serde(default)]
    pub utterance_count: i32,
    #[serde(default)]
    pub word_count: i32,
    #[serde(default)]
    pub client_ip: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

impl RealtimeSession {
    pub fn new(tenant_id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.into(),
            status: SessionStatus::Active,
            worker_id: None,
            model: model.into(),
            language: None,
            encoding: "pcm_s16le".to_string(),
            sample_rate: 16_000,
            store_audio: false,
            store_transcript: false,
            enhance_on_end: false,
            audio_blob: None,
            transcript_blob: None,
            enhancement_job_id: None,
            resumed_from: None,
            duration_ms: 0,
            utterance_count: 0,
            word_count: 0,
            client_ip: None,
            started_at: Utc::now(),
            ended_at: None,
            error: None,
        }
    }
}

/// Pool record for one streaming ASR worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeWorker {
    pub id: String,
    /// WebSocket endpoint the gateway relays audio to.
    pub endpoint: String,
    /// Max concurrent sessions this worker accepts.
    pub capacity: u32,
    pub active_sessions: u32,
    pub healthy: bool,
    pub models: Vec<String>,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
}

impl RealtimeWorker {
    pub fn new(id: impl Into<String>, endpoint: impl Into<String>, capacity: u32) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            endpoint: endpoint.into(),
            capacity,
            active_sessions: 0,
            healthy: true,
            models: Vec::new(),
            last_heartbeat: now,
            registered_at: now,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.models.push(model.into());
        self
    }

    pub fn has_free_slot(&self) -> bool {
        self.healthy && self.active_sessions < self.capacity
    }

    pub fn serves_model(&self, model: &str) -> bool {
        self.models.iter().any(|m| m == model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_slot_accounting() {
        let mut worker = RealtimeWorker::new("rt-1", "ws://rt-1:9000", 2).with_model("fast");
        assert!(worker.has_free_slot());
        worker.active_sessions = 2;
        assert!(!worker.has_free_slot());
        worker.active_sessions = 1;
        worker.healthy = false;
        assert!(!worker.has_free_slot());
    }

    #[test]
    fn session_defaults() {
        let session = RealtimeSession::new("acme", "fast");
        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(session.sample_rate, 16_000);
        assert!(session.worker_id.is_none());
    }
}
