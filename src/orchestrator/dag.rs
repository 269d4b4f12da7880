//! DAG builder: job parameters to an ordered, dependency-linked task
//! list.

use crate::error::OrchestrateError;
use crate::model::{Job, Stage, Task};
use crate::registry::{EngineRegistry, ModelCatalog};

/// Builds the pipeline for a job from the stage templates.
///
/// Stage selection is driven by the job's feature flags; dependencies
/// are linear in stage order. Every resolved engine is checked for
/// availability so a doomed job fails at submit time, not mid-pipeline.
#[derive(Clone)]
pub struct DagBuilder {
    registry: EngineRegistry,
    catalog: ModelCatalog,
}

impl DagBuilder {
    pub fn new(registry: EngineRegistry, catalog: ModelCatalog) -> Self {
        Self { registry, catalog }
    }

    /// Produce the task list for a job.
    ///
    /// Fails with `InvalidPipelineConfig` for an unknown model and
    /// `EngineUnavailable` when any required stage's engine is not live.
    pub async fn build(&self, job: &Job) -> Result<Vec<Task>, OrchestrateError> {
        let transcriber = self.catalog.resolve_model(&job.params.model).await?;

        let wants_alignment = job.params.word_timestamps || job.params.speaker_detection;
        let mut stages = vec![Stage::Prepare, Stage::Transcribe];
        // Align is elided when the transcriber already emits word
        // timestamps natively.
        if wants_alignment && !transcriber.native_word_timestamps {
            stages.push(Stage::Align);
        }
        if job.params.speaker_detection {
            stages.push(Stage::Diarize);
        }
        if job.params.llm_cleanup {
            stages.push(Stage::Cleanup);
        }
        stages.push(Stage::Merge);

        let mut tasks: Vec<Task> = Vec::with_capacity(stages.len());
        for stage in stages {
            let mut task = match stage {
                Stage::Transcribe => {
                    let mut task = Task::new(job.id, stage, transcriber.engine_id.clone())
                        .with_config(
                            "runtime_model_id",
                            serde_json::json!(transcriber.runtime_model_id),
                        )
                        .with_config(
                            "word_timestamps",
                            serde_json::json!(job.params.word_timestamps),
                        );
                    if let Some(language) = &job.params.language {
                        task = task.with_config("language", serde_json::json!(language));
                    }
                    task
                }
                other => {
                    let engine_id = self.catalog.engine_for_stage(other).await?;
                    Task::new(job.id, other, engine_id)
                }
            };

            if !self.registry.is_available(&task.engine_id).await? {
                return Err(OrchestrateError::EngineUnavailable {
                    engine_id: task.engine_id,
                    stage: stage.as_str().to_string(),
                });
            }

            if let Some(previous) = tasks.last() {
                task = task.with_dependency(previous.id);
            }
            tasks.push(task);
        }

        Ok(tasks)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::bus::MemoryBus;
    use crate::model::{EngineRegistration, JobParams};

    fn params(model: &str) -> JobParams {
        JobParams {
            model: model.to_string(),
            language: None,
            word_timestamps: false,
            speaker_detection: false,
            llm_cleanup: false,
            webhook_url: None,
            webhook_metadata: None,
        }
    }

    async fn builder_with_engines(engines: &[EngineRegistration]) -> DagBuilder {
        let registry = EngineRegistry::new(Arc::new(MemoryBus::new()));
        for engine in engines {
            registry.register(engine).await.unwrap();
        }
        let catalog = ModelCatalog::new(registry.clone());
        DagBuilder::new(registry, catalog)
    }

    fn full_fleet() -> Vec<EngineRegistration> {
        vec![
            EngineRegistration::new("ffmpeg", Stage::Prepare),
            EngineRegistration::new("faster-whisper", Stage::Transcribe).with_model("fast", "base"),
            EngineRegistration::new("parakeet", Stage::Transcribe)
                .with_model("parakeet-0.6b", "nvidia/parakeet-tdt-0.6b-v2")
                .with_native_word_timestamps(true),
            EngineRegistration::new("whisper-align", Stage::Align),
            EngineRegistration::new("pyannote", Stage::Diarize),
            EngineRegistration::new("llm-cleanup", Stage::Cleanup),
            EngineRegistration::new("merge", Stage::Merge),
        ]
    }

    fn stages_of(tasks: &[Task]) -> Vec<Stage> {
        tasks.iter().map(|t| t.stage).collect()
    }

    #[tokio::test]
    async fn default_pipeline_is_prepare_transcribe_merge() {
        let builder = builder_with_engines(&full_fleet()).await;
        let job = Job::new("acme", "blob:a", params("fast"));
        let tasks = builder.build(&job).await.unwrap();
        assert_eq!(
            stages_of(&tasks),
            vec![Stage::Prepare, Stage::Transcribe, Stage::Merge]
        );
    }

    #[tokio::test]
    async fn word_timestamps_add_align() {
        let builder = builder_with_engines(&full_fleet()).await;
        let mut p = params("fast");
        p.word_timestamps = true;
        let job = Job::new("acme", "blob:a", p);
        let tasks = builder.build(&job).await.unwrap();
        assert_eq!(
            stages_of(&tasks),
            vec![Stage::Prepare, Stage::Transcribe, Stage::Align, Stage::Merge]
        );
    }

    #[tokio::test]
    async fn diarize_pipeline_orders_align_before_diarize() {
        let builder = builder_with_engines(&full_fleet()).await;
        let mut p = params("fast");
        p.speaker_detection = true;
        let job = Job::new("acme", "blob:a", p);
        let tasks = builder.build(&job).await.unwrap();
        assert_eq!(
            stages_of(&tasks),
            vec![
                Stage::Prepare,
                Stage::Transcribe,
                Stage::Align,
                Stage::Diarize,
                Stage::Merge
            ]
        );
    }

    #[tokio::test]
    async fn cleanup_runs_before_merge() {
        let builder = builder_with_engines(&full_fleet()).await;
        let mut p = params("fast");
        p.llm_cleanup = true;
        let job = Job::new("acme", "blob:a", p);
        let tasks = builder.build(&job).await.unwrap();
        assert_eq!(
            stages_of(&tasks),
            vec![
                Stage::Prepare,
                Stage::Transcribe,
                Stage::Cleanup,
                Stage::Merge
            ]
        );
    }

    #[tokio::test]
    async fn native_word_timestamps_elide_align() {
        let builder = builder_with_engines(&full_fleet()).await;
        let mut p = params("parakeet-0.6b");
        p.word_timestamps = true;
        let job = Job::new("acme", "blob:a", p);
        let tasks = builder.build(&job).await.unwrap();
        assert_eq!(
            stages_of(&tasks),
            vec![Stage::Prepare, Stage::Transcribe, Stage::Merge]
        );
    }

    #[tokio::test]
    async fn dependencies_are_linear() {
        let builder = builder_with_engines(&full_fleet()).await;
        let job = Job::new("acme", "blob:a", params("fast"));
        let tasks = builder.build(&job).await.unwrap();

        assert!(tasks[0].depends_on.is_empty());
        for pair in tasks.windows(2) {
            assert_eq!(pair[1].depends_on, vec![pair[0].id]);
        }
    }

    #[tokio::test]
    async fn transcribe_task_carries_runtime_model_id() {
        let builder = builder_with_engines(&full_fleet()).await;
        let job = Job::new("acme", "blob:a", params("fast"));
        let tasks = builder.build(&job).await.unwrap();
        let transcribe = tasks.iter().find(|t| t.stage == Stage::Transcribe).unwrap();
        assert_eq!(transcribe.engine_id, "faster-whisper");
        assert_eq!(transcribe.runtime_model_id(), Some("base"));
    }

    #[tokio::test]
    async fn missing_transcribe_engine_fails_with_engine_unavailable() {
        // Prepare and merge are live; no transcribe engine anywhere.
        let builder = builder_with_engines(&[
            EngineRegistration::new("ffmpeg", Stage::Prepare),
            EngineRegistration::new("merge", Stage::Merge),
        ])
        .await;
        let job = Job::new("acme", "blob:a", params("fast"));
        let err = builder.build(&job).await.unwrap_err();
        assert_eq!(err.to_string(), "Engine 'faster-whisper' is not available.");
    }

    #[tokio::test]
    async fn unknown_model_fails_with_invalid_pipeline_config() {
        let builder = builder_with_engines(&full_fleet()).await;
        let job = Job::new("acme", "blob:a", params("made-up"));
        let err = builder.build(&job).await.unwrap_err();
        assert!(matches!(
            err,
            OrchestrateError::InvalidPipelineConfig { .. }
        ));
    }
}
