//! Model catalog: public model ids resolved to runtime engines.
//!
//! Live registrations take precedence; the built-in table covers models
//! the platform ships with, so a request can name a model whose engine
//! is deployed but momentarily silent — the caller then gets a precise
//! availability failure instead of "unknown model".

use crate::error::OrchestrateError;
use crate::model::Stage;
use crate::registry::EngineRegistry;

/// Outcome of resolving a public model id for the transcribe stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedModel {
    /// Runtime engine identity (`task.engine_id`).
    pub engine_id: String,
    /// Engine-native variant id (`task.config["runtime_model_id"]`).
    pub runtime_model_id: String,
    /// Whether the engine emits word timestamps natively, which elides
    /// the align stage.
    pub native_word_timestamps: bool,
}

struct BuiltinModel {
    model_id: &'static str,
    engine_id: &'static str,
    runtime_model_id: &'static str,
    native_word_timestamps: bool,
}

/// Models the platform ships with. Live registrations may extend this.
const BUILTIN_MODELS: &[BuiltinModel] = &[
    BuiltinModel {
        model_id: "fast",
        engine_id: "faster-whisper",
        runtime_model_id: "base",
        native_word_timestamps: false,
    },
    BuiltinModel {
        model_id: "accurate",
        engine_id: "faster-whisper",
        runtime_model_id: "large-v3",
        native_word_timestamps: false,
    },
    BuiltinModel {
        model_id: "parakeet-0.6b",
        engine_id: "parakeet",
        runtime_model_id: "nvidia/parakeet-tdt-0.6b-v2",
        native_word_timestamps: true,
    },
];

/// Runtime identity used for a stage when no engine is registered for
/// it. Keeps availability failures specific ("Engine 'ffmpeg' is not
/// available.") even before anything has come up.
pub fn default_engine_for_stage(stage: Stage) -> &'static str {
    match stage {
        Stage::Prepare => "ffmpeg",
        Stage::Transcribe => "faster-whisper",
        Stage::Align => "whisper-align",
        Stage::Diarize => "pyannote",
        Stage::Cleanup => "llm-cleanup",
        Stage::Merge => "merge",
    }
}

/// Read-through view over live registrations plus the builtin table.
#[derive(Clone)]
pub struct ModelCatalog {
    registry: EngineRegistry,
}

impl ModelCatalog {
    pub fn new(registry: EngineRegistry) -> Self {
        Self { registry }
    }

    /// Resolve a public model id for the transcribe stage.
    ///
    /// Fails with `InvalidPipelineConfig` when neither a live engine nor
    /// the builtin table knows the model. Availability is checked by the
    /// caller, not here.
    pub async fn resolve_model(&self, model_id: &str) -> Result<ResolvedModel, OrchestrateError> {
        let live = self.registry.engines_for_stage(Stage::Transcribe).await?;
        for engine in &live {
            if let Some(variant) = engine.serves_model(model_id) {
                return Ok(ResolvedModel {
                    engine_id: engine.engine_id.clone(),
                    runtime_model_id: variant.runtime_model_id.clone(),
                    native_word_timestamps: engine.native_word_timestamps,
                });
            }
        }

        if let Some(builtin) = BUILTIN_MODELS.iter().find(|m| m.model_id == model_id) {
            return Ok(ResolvedModel {
                engine_id: builtin.engine_id.to_string(),
                runtime_model_id: builtin.runtime_model_id.to_string(),
                native_word_timestamps: builtin.native_word_timestamps,
            });
        }

        Err(OrchestrateError::InvalidPipelineConfig {
            reason: format!("unknown model '{}'", model_id),
        })
    }

    /// Pick the engine that will serve a non-transcribe stage: the
    /// earliest-registered available engine, or the stage default when
    /// none is live (the scheduler's availability gate then fails fast).
    pub async fn engine_for_stage(&self, stage: Stage) -> Result<String, OrchestrateError> {
        let live = self.registry.engines_for_stage(stage).await?;
        Ok(live
            .first()
            .map(|e| e.engine_id.clone())
            .unwrap_or_else(|| default_engine_for_stage(stage).to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::bus::MemoryBus;
    use crate::model::EngineRegistration;

    fn catalog() -> (ModelCatalog, EngineRegistry) {
        let registry = EngineRegistry::new(Arc::new(MemoryBus::new()));
        (ModelCatalog::new(registry.clone()), registry)
    }

    #[tokio::test]
    async fn builtin_models_resolve_without_live_engines() {
        let (catalog, _) = catalog();
        let resolved = catalog.resolve_model("fast").await.unwrap();
        assert_eq!(resolved.engine_id, "faster-whisper");
        assert_eq!(resolved.runtime_model_id, "base");
        assert!(!resolved.native_word_timestamps);

        let resolved = catalog.resolve_model("parakeet-0.6b").await.unwrap();
        assert_eq!(resolved.engine_id, "parakeet");
        assert!(resolved.native_word_timestamps);
    }

    #[tokio::test]
    async fn unknown_model_is_invalid_pipeline_config() {
        let (catalog, _) = catalog();
        let err = catalog.resolve_model("imaginary").await.unwrap_err();
        assert!(matches!(
            err,
            OrchestrateError::InvalidPipelineConfig { .. }
        ));
    }

    #[tokio::test]
    async fn live_registration_wins_over_builtin() {
        let (catalog, registry) = catalog();
        let reg = EngineRegistration::new("faster-whisper", Stage::Transcribe)
            .with_model("fast", "distil-base");
        registry.register(&reg).await.unwrap();

        let resolved = catalog.resolve_model("fast").await.unwrap();
        assert_eq!(resolved.runtime_model_id, "distil-base");
    }

    #[tokio::test]
    async fn stage_engine_falls_back_to_default() {
        let (catalog, registry) = catalog();
        assert_eq!(
            catalog.engine_for_stage(Stage::Prepare).await.unwrap(),
            "ffmpeg"
        );

        let reg = EngineRegistration::new("ffmpeg-pool-2", Stage::Prepare);
        registry.register(&reg).await.unwrap();
        assert_eq!(
            catalog.engine_for_stage(Stage::Prepare).await.unwrap(),
            "ffmpeg-pool-2"
        );
    }
}
