//! Tasks, pipeline stages, and engine registrations.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A logical step in the transcription pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Prepare,
    Transcribe,
    Align,
    Diarize,
    Cleanup,
    Merge,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Prepare => "prepare",
            Stage::Transcribe => "transcribe",
            Stage::Align => "align",
            Stage::Diarize => "diarize",
            Stage::Cleanup => "cleanup",
            Stage::Merge => "merge",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "prepare" => Some(Stage::Prepare),
            "transcribe" => Some(Stage::Transcribe),
            "align" => Some(Stage::Align),
            "diarize" => Some(Stage::Diarize),
            "cleanup" => Some(Stage::Cleanup),
            "merge" => Some(Stage::Merge),
            _ => None,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a single task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
    Cancelled,
    Skipped,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::Skipped
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Ready => "ready",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "ready" => Some(TaskStatus::Ready),
            "running" => Some(TaskStatus::Running),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "cancelled" => Some(TaskStatus::Cancelled),
            "skipped" => Some(TaskStatus::Skipped),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One pipeline step belonging to a job.
///
/// A task moves to `ready` only once every dependency is `completed`,
/// to `running` only when a worker claims it, and to a terminal state by
/// exactly one worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub job_id: Uuid,
    pub stage: Stage,
    /// Runtime identity of the engine that will execute this task.
    pub engine_id: String,
    pub depends_on: Vec<Uuid>,
    pub status: TaskStatus,
    /// Engine-facing config, including `runtime_model_id`.
    #[serde(default)]
    pub config: HashMap<String, serde_json::Value>,
    /// Blob reference to this task's output, set on completion.
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    pub attempts: i32,
    /// Propagated trace context, opaque to the core.
    #[serde(default)]
    pub trace: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(job_id: Uuid, stage: Stage, engine_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            job_id,
            stage,
            engine_id: engine_id.into(),
            depends_on: Vec::new(),
            status: TaskStatus::Pending,
            config: HashMap::new(),
            output: None,
            error: None,
            attempts: 0,
            trace: serde_json::Value::Null,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_dependency(mut self, dep: Uuid) -> Self {
        self.depends_on.push(dep);
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }

    /// Engine-native model variant id, when set by the DAG builder.
    pub fn runtime_model_id(&self) -> Option<&str> {
        self.config.get("runtime_model_id").and_then(|v| v.as_str())
    }
}

/// Source-audio facts forwarded alongside the first pipeline task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AudioMetadata {
    pub blob: String,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub size_bytes: u64,
}

/// The message pushed onto an engine queue: the task record plus the
/// outputs of its dependencies and the source-audio facts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPayload {
    pub task: Task,
    /// Dependency task id -> output blob reference.
    #[serde(default)]
    pub inputs: HashMap<Uuid, String>,
    pub audio: AudioMetadata,
}

/// Engine liveness state as reported via heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineStatus {
    Idle,
    Processing,
    Offline,
}

impl EngineStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EngineStatus::Idle => "idle",
            EngineStatus::Processing => "processing",
            EngineStatus::Offline => "offline",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(EngineStatus::Idle),
            "processing" => Some(EngineStatus::Processing),
            "offline" => Some(EngineStatus::Offline),
            _ => None,
        }
    }
}

/// A public model variant served by an engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredModel {
    /// Public model id clients request (e.g. "fast").
    pub id: String,
    /// Engine-native identifier passed in task config to select the
    /// variant at load time.
    pub runtime_model_id: String,
}

/// A worker's announcement to the registry.
///
/// `engine_id` is the runtime identity (e.g. "faster-whisper"), not a
/// model variant; one engine may serve several variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineRegistration {
    pub engine_id: String,
    pub stage: Stage,
    /// Queue this engine consumes from.
    pub queue: String,
    pub models: Vec<RegisteredModel>,
    /// Whether transcription output already carries word timestamps.
    #[serde(default)]
    pub native_word_timestamps: bool,
    /// Whether this runtime can serve realtime streams.
    #[serde(default)]
    pub streaming: bool,
    pub status: EngineStatus,
    #[serde(default)]
    pub current_task: Option<Uuid>,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
}

impl EngineRegistration {
    pub fn new(engine_id: impl Into<String>, stage: Stage) -> Self {
        let engine_id = engine_id.into();
        let now = Utc::now();
        Self {
            queue: format!("queue:{}", engine_id),
            engine_id,
            stage,
            models: Vec::new(),
            native_word_timestamps: false,
            streaming: false,
            status: EngineStatus::Idle,
            current_task: None,
            last_heartbeat: now,
            registered_at: now,
        }
    }

    pub fn with_model(mut self, id: impl Into<String>, runtime_model_id: impl Into<String>) -> Self {
        self.models.push(RegisteredModel {
            id: id.into(),
            runtime_model_id: runtime_model_id.into(),
        });
        self
    }

    pub fn with_native_word_timestamps(mut self, native: bool) -> Self {
        self.native_word_timestamps = native;
        self
    }

    pub fn serves_model(&self, model_id: &str) -> Option<&RegisteredModel> {
        self.models.iter().find(|m| m.id == model_id)
    }
}
