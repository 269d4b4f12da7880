//! Task scheduler: ready tasks onto per-engine FIFO queues.

use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

use crate::bus::{queue_key, Bus};
use crate::db::Database;
use crate::error::OrchestrateError;
use crate::model::{AudioMetadata, Task, TaskPayload, TaskStatus};
use crate::registry::EngineRegistry;

/// Moves tasks onto engine queues, never queueing against a dead engine.
#[derive(Clone)]
pub struct TaskScheduler {
    bus: Arc<dyn Bus>,
    db: Arc<dyn Database>,
    registry: EngineRegistry,
}

impl TaskScheduler {
    pub fn new(bus: Arc<dyn Bus>, db: Arc<dyn Database>, registry: EngineRegistry) -> Self {
        Self { bus, db, registry }
    }

    /// Validate engine availability, mark the task ready, and append its
    /// payload (task + upstream outputs + audio facts) to the engine's
    /// queue.
    pub async fn queue_task(
        &self,
        task: &Task,
        inputs: HashMap<Uuid, String>,
        audio: AudioMetadata,
    ) -> Result<(), OrchestrateError> {
        if !self.registry.is_available(&task.engine_id).await? {
            return Err(OrchestrateError::EngineUnavailable {
                engine_id: task.engine_id.clone(),
                stage: task.stage.as_str().to_string(),
            });
        }

        // Ready before push: a worker may claim the instant the payload
        // lands, and its ready->running transition must find the row.
        // Losing this transition means another handler already queued
        // the task (replayed event); do not push a second payload.
        let became_ready = self
            .db
            .try_transition_task(task.id, &[TaskStatus::Pending], TaskStatus::Ready)
            .await?;
        if !became_ready {
            tracing::debug!(task_id = %task.id, "Task already queued, skipping");
            return Ok(());
        }

        let mut queued = task.clone();
        queued.status = TaskStatus::Ready;
        let payload = TaskPayload {
            task: queued,
            inputs,
            audio,
        };
        self.bus.push_task(&queue_key(&task.engine_id), &payload).await?;

        tracing::debug!(
            task_id = %task.id,
            job_id = %task.job_id,
            stage = %task.stage,
            engine_id = %task.engine_id,
            "Task queued"
        );
        Ok(())
    }

    /// Scrub a not-yet-claimed task from its engine queue. Used by
    /// cancellation; returns whether an entry was actually removed.
    pub async fn remove_task_from_queue(&self, task: &Task) -> Result<bool, OrchestrateError> {
        let removed = self
            .bus
            .remove_queued(&queue_key(&task.engine_id), task.id)
            .await?;
        if removed {
            tracing::debug!(
                task_id = %task.id,
                engine_id = %task.engine_id,
                "Task scrubbed from queue"
            );
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::db::MemoryDb;
    use crate::model::{EngineRegistration, Stage};

    async fn scheduler_with_engine() -> (TaskScheduler, Arc<MemoryBus>, Arc<MemoryDb>) {
        let bus = Arc::new(MemoryBus::new());
        let db = Arc::new(MemoryDb::new());
        let registry = EngineRegistry::new(bus.clone());
        registry
            .register(&EngineRegistration::new("faster-whisper", Stage::Transcribe))
            .await
            .unwrap();
        (
            TaskScheduler::new(bus.clone(), db.clone(), registry),
            bus,
            db,
        )
    }

    #[tokio::test]
    async fn queue_task_pushes_payload_and_marks_ready() {
        let (scheduler, bus, db) = scheduler_with_engine().await;
        let task = Task::new(Uuid::new_v4(), Stage::Transcribe, "faster-whisper");
        db.insert_tasks(std::slice::from_ref(&task)).await.unwrap();

        scheduler
            .queue_task(&task, HashMap::new(), AudioMetadata::default())
            .await
            .unwrap();

        assert_eq!(bus.queue_len("queue:faster-whisper").await.unwrap(), 1);
        let stored = db.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Ready);
    }

    #[tokio::test]
    async fn queue_task_rejects_unavailable_engine() {
        let (scheduler, _bus, db) = scheduler_with_engine().await;
        let task = Task::new(Uuid::new_v4(), Stage::Align, "whisper-align");
        db.insert_tasks(std::slice::from_ref(&task)).await.unwrap();

        let err = scheduler
            .queue_task(&task, HashMap::new(), AudioMetadata::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestrateError::EngineUnavailable { ref engine_id, ref stage }
                if engine_id == "whisper-align" && stage == "align"
        ));

        // Task must not have been marked ready.
        let stored = db.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn remove_task_from_queue_scrubs_pending_entry() {
        let (scheduler, bus, db) = scheduler_with_engine().await;
        let task = Task::new(Uuid::new_v4(), Stage::Transcribe, "faster-whisper");
        db.insert_tasks(std::slice::from_ref(&task)).await.unwrap();
        scheduler
            .queue_task(&task, HashMap::new(), AudioMetadata::default())
            .await
            .unwrap();

        assert!(scheduler.remove_task_from_queue(&task).await.unwrap());
        assert_eq!(bus.queue_len("queue:faster-whisper").await.unwrap(), 0);
        assert!(!scheduler.remove_task_from_queue(&task).await.unwrap());
    }
}
