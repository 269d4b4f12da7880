//! Engine registry: liveness tracking and availability queries.
//!
//! Registrations live on the bus with a 60 s TTL. Workers heartbeat
//! every 10 s, so an engine survives up to five missed sends before it
//! stops being available. Availability is a strict function of record
//! presence, heartbeat age, and reported status.

mod catalog;

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::bus::{Bus, ENGINE_TTL};
use crate::error::BusError;
use crate::model::{EngineRegistration, EngineStatus, Stage};

pub use catalog::{default_engine_for_stage, ModelCatalog, ResolvedModel};

/// Registry facade over the bus's engine hashes.
#[derive(Clone)]
pub struct EngineRegistry {
    bus: Arc<dyn Bus>,
}

impl EngineRegistry {
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        Self { bus }
    }

    /// Announce an engine. Idempotent: re-registering refreshes the
    /// record and its expiration.
    pub async fn register(&self, registration: &EngineRegistration) -> Result<(), BusError> {
        self.bus.put_engine(registration).await?;
        tracing::info!(
            engine_id = %registration.engine_id,
            stage = %registration.stage,
            models = registration.models.len(),
            "Engine registered"
        );
        Ok(())
    }

    /// Refresh a heartbeat. Returns `false` when the record already
    /// expired; the caller must re-register before the next beat.
    pub async fn heartbeat(
        &self,
        engine_id: &str,
        status: EngineStatus,
        current_task: Option<Uuid>,
    ) -> Result<bool, BusError> {
        let touched = self.bus.touch_engine(engine_id, status, current_task).await?;
        if !touched {
            tracing::warn!(
                engine_id = %engine_id,
                "Heartbeat for expired registration, engine must re-register"
            );
        }
        Ok(touched)
    }

    /// Best-effort removal.
    pub async fn unregister(&self, engine_id: &str) -> Result<(), BusError> {
        self.bus.drop_engine(engine_id).await
    }

    pub async fn get(&self, engine_id: &str) -> Result<Option<EngineRegistration>, BusError> {
        self.bus.get_engine(engine_id).await
    }

    /// An engine is available iff its record exists, its last heartbeat
    /// is younger than the TTL, and it has not reported offline.
    pub async fn is_available(&self, engine_id: &str) -> Result<bool, BusError> {
        Ok(self
            .get(engine_id)
            .await?
            .map(|reg| registration_is_available(&reg))
            .unwrap_or(false))
    }

    /// All available engines declaring the given stage, in registration
    /// order.
    pub async fn engines_for_stage(&self, stage: Stage) -> Result<Vec<EngineRegistration>, BusError> {
        let ids = self.bus.list_engine_ids().await?;
        let mut engines = Vec::new();
        for id in ids {
            if let Some(reg) = self.get(&id).await? {
                if reg.stage == stage && registration_is_available(&reg) {
                    engines.push(reg);
                }
            }
        }
        engines.sort_by_key(|reg| reg.registered_at);
        Ok(engines)
    }
}

fn registration_is_available(reg: &EngineRegistration) -> bool {
    let age = Utc::now() - reg.last_heartbeat;
    age < chrono::TimeDelta::from_std(ENGINE_TTL).unwrap_or(chrono::TimeDelta::seconds(60))
        && reg.status != EngineStatus::Offline
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;

    fn registry() -> EngineRegistry {
        EngineRegistry::new(Arc::new(MemoryBus::new()))
    }

    #[tokio::test]
    async fn register_then_available() {
        let registry = registry();
        let reg = EngineRegistration::new("faster-whisper", Stage::Transcribe)
            .with_model("fast", "base");
        registry.register(&reg).await.unwrap();
        assert!(registry.is_available("faster-whisper").await.unwrap());
        assert!(!registry.is_available("nonexistent").await.unwrap());
    }

    #[tokio::test]
    async fn offline_engine_is_not_available() {
        let registry = registry();
        let mut reg = EngineRegistration::new("faster-whisper", Stage::Transcribe);
        reg.status = EngineStatus::Offline;
        registry.register(&reg).await.unwrap();
        assert!(!registry.is_available("faster-whisper").await.unwrap());
    }

    #[tokio::test]
    async fn stale_heartbeat_is_not_available() {
        let registry = registry();
        let mut reg = EngineRegistration::new("faster-whisper", Stage::Transcribe);
        reg.last_heartbeat = Utc::now() - chrono::TimeDelta::seconds(61);
        registry.register(&reg).await.unwrap();
        assert!(!registry.is_available("faster-whisper").await.unwrap());
    }

    #[tokio::test]
    async fn heartbeat_refreshes_status_and_task() {
        let registry = registry();
        let reg = EngineRegistration::new("faster-whisper", Stage::Transcribe);
        registry.register(&reg).await.unwrap();

        let task_id = Uuid::new_v4();
        let touched = registry
            .heartbeat("faster-whisper", EngineStatus::Processing, Some(task_id))
            .await
            .unwrap();
        assert!(touched);

        let stored = registry.get("faster-whisper").await.unwrap().unwrap();
        assert_eq!(stored.status, EngineStatus::Processing);
        assert_eq!(stored.current_task, Some(task_id));
    }

    #[tokio::test]
    async fn heartbeat_after_expiry_fails_silently() {
        let registry = registry();
        let touched = registry
            .heartbeat("never-registered", EngineStatus::Idle, None)
            .await
            .unwrap();
        assert!(!touched);
    }

    #[tokio::test]
    async fn engines_for_stage_filters_and_orders() {
        let registry = registry();
        let mut first = EngineRegistration::new("faster-whisper", Stage::Transcribe);
        first.registered_at = Utc::now() - chrono::TimeDelta::seconds(30);
        let second = EngineRegistration::new("parakeet", Stage::Transcribe);
        let other_stage = EngineRegistration::new("ffmpeg", Stage::Prepare);

        registry.register(&second).await.unwrap();
        registry.register(&first).await.unwrap();
        registry.register(&other_stage).await.unwrap();

        let engines = registry.engines_for_stage(Stage::Transcribe).await.unwrap();
        let ids: Vec<&str> = engines.iter().map(|e| e.engine_id.as_str()).collect();
        assert_eq!(ids, vec!["faster-whisper", "parakeet"]);
    }
}
