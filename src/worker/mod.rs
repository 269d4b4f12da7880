//! Engine worker harness: the platform side of task execution.
//!
//! The harness registers with the engine registry, claims payloads off
//! its FIFO queue, dispatches them to an `EngineHandler` (the actual
//! inference lives behind that trait), and publishes terminal task
//! events. A heartbeat task runs on its own, observing the current-task
//! slot through a mutex, so liveness reporting survives long inferences.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::bus::{queue_key, Bus};
use crate::config::EngineConfig;
use crate::db::Database;
use crate::error::OrchestrateError;
use crate::model::{EngineRegistration, EngineStatus, Event, TaskPayload, TaskStatus};
use crate::registry::EngineRegistry;

/// Error surfaced by an engine implementation; the message lands on the
/// failed task row.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct EngineError(pub String);

impl EngineError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// The seam real engines implement: consume a payload, produce an
/// output blob reference.
#[async_trait]
pub trait EngineHandler: Send + Sync {
    async fn execute(&self, payload: &TaskPayload) -> Result<String, EngineError>;
}

/// Long-running worker process driving one engine.
pub struct EngineWorker {
    registration: EngineRegistration,
    bus: Arc<dyn Bus>,
    db: Arc<dyn Database>,
    registry: EngineRegistry,
    handler: Arc<dyn EngineHandler>,
    config: EngineConfig,
    /// Task currently held, observed by the heartbeat task.
    current_task: Arc<Mutex<Option<Uuid>>>,
}

impl EngineWorker {
    pub fn new(
        registration: EngineRegistration,
        handler: Arc<dyn EngineHandler>,
        bus: Arc<dyn Bus>,
        db: Arc<dyn Database>,
        config: EngineConfig,
    ) -> Self {
        let registry = EngineRegistry::new(bus.clone());
        Self {
            registration,
            bus,
            db,
            registry,
            handler,
            config,
            current_task: Arc::new(Mutex::new(None)),
        }
    }

    /// Register, start heartbeating, and consume the queue until
    /// shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), OrchestrateError> {
        self.registry.register(&self.registration).await?;
        let heartbeat = spawn_heartbeat(
            self.registry.clone(),
            self.registration.clone(),
            Arc::clone(&self.current_task),
            self.config.heartbeat_interval,
            shutdown.clone(),
        );

        let queue = queue_key(&self.registration.engine_id);
        tracing::info!(
            engine_id = %self.registration.engine_id,
            queue = %queue,
            "Engine worker consuming"
        );

        loop {
            tokio::select! {
                claimed = self.bus.claim_task(&queue, Duration::from_secs(5)) => {
                    match claimed {
                        Ok(Some(payload)) => {
                            if let Err(e) = self.process(payload).await {
                                tracing::error!(
                                    engine_id = %self.registration.engine_id,
                                    "Task processing error: {}",
                                    e
                                );
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            tracing::error!("Queue claim failed: {}", e);
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        heartbeat.abort();
        let _ = self.registry.unregister(&self.registration.engine_id).await;
        tracing::info!(engine_id = %self.registration.engine_id, "Engine worker stopped");
        Ok(())
    }

    /// Execute one claimed payload. Queue delivery is at-least-once, so
    /// the ready->running transition is the dedup gate: a redelivered
    /// payload whose task already moved on is dropped here.
    pub async fn process(&self, payload: TaskPayload) -> Result<(), OrchestrateError> {
        let task_id = payload.task.id;
        let claimed = self
            .db
            .try_transition_task(task_id, &[TaskStatus::Ready], TaskStatus::Running)
            .await?;
        if !claimed {
            tracing::debug!(task_id = %task_id, "Stale queue delivery, dropping");
            return Ok(());
        }
        self.db.increment_task_attempts(task_id).await?;

        if let Ok(mut slot) = self.current_task.lock() {
            *slot = Some(task_id);
        }
        let _ = self
            .registry
            .heartbeat(
                &self.registration.engine_id,
                EngineStatus::Processing,
                Some(task_id),
            )
            .await;

        tracing::info!(
            task_id = %task_id,
            stage = %payload.task.stage,
            "Task execution started"
        );
        let result = self.handler.execute(&payload).await;

        if let Ok(mut slot) = self.current_task.lock() {
            *slot = None;
        }
        let _ = self
            .registry
            .heartbeat(&self.registration.engine_id, EngineStatus::Idle, None)
            .await;

        match result {
            Ok(output) => {
                tracing::info!(task_id = %task_id, "Task execution finished");
                self.bus
                    .publish(&Event::TaskCompleted {
                        task_id,
                        output: Some(output),
                    })
                    .await?;
            }
            Err(e) => {
                tracing::warn!(task_id = %task_id, "Task execution failed: {}", e);
                self.bus
                    .publish(&Event::TaskFailed {
                        task_id,
                        error: e.to_string(),
                    })
                    .await?;
            }
        }
        Ok(())
    }
}

/// Spawn the heartbeat loop as a background task.
///
/// Re-registers transparently when the TTL record expired (e.g. after a
/// bus hiccup longer than the tolerance window).
fn spawn_heartbeat(
    registry: EngineRegistry,
    registration: EngineRegistration,
    current_task: Arc<Mutex<Option<Uuid>>>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let held = current_task.lock().ok().and_then(|slot| *slot);
                    let status = if held.is_some() {
                        EngineStatus::Processing
                    } else {
                        EngineStatus::Idle
                    };
                    match registry.heartbeat(&registration.engine_id, status, held).await {
                        Ok(true) => {}
                        Ok(false) => {
                            let mut refreshed = registration.clone();
                            refreshed.status = status;
                            refreshed.current_task = held;
                            if let Err(e) = registry.register(&refreshed).await {
                                tracing::error!("Re-registration failed: {}", e);
                            }
                        }
                        Err(e) => {
                            tracing::warn!("Heartbeat failed: {}", e);
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::bus::MemoryBus;
    use crate::db::MemoryDb;
    use crate::model::{AudioMetadata, Stage, Task};
    use futures::StreamExt;

    /// Handler that answers with a fixed outcome.
    struct StubEngine {
        outcome: Result<String, String>,
    }

    #[async_trait]
    impl EngineHandler for StubEngine {
        async fn execute(&self, _payload: &TaskPayload) -> Result<String, EngineError> {
            self.outcome.clone().map_err(EngineError)
        }
    }

    async fn worker_with(
        outcome: Result<String, String>,
    ) -> (EngineWorker, Arc<MemoryBus>, Arc<MemoryDb>) {
        let bus = Arc::new(MemoryBus::new());
        let db = Arc::new(MemoryDb::new());
        let registration = EngineRegistration::new("faster-whisper", Stage::Transcribe);
        let worker = EngineWorker::new(
            registration,
            Arc::new(StubEngine { outcome }),
            bus.clone(),
            db.clone(),
            EngineConfig {
                engine_id: "faster-whisper".to_string(),
                stage: "transcribe".to_string(),
                heartbeat_interval: Duration::from_secs(10),
            },
        );
        (worker, bus, db)
    }

    fn ready_payload(task: &Task) -> TaskPayload {
        TaskPayload {
            task: task.clone(),
            inputs: HashMap::new(),
            audio: AudioMetadata::default(),
        }
    }

    #[tokio::test]
    async fn successful_execution_publishes_task_completed() {
        let (worker, bus, db) = worker_with(Ok("blob:out".to_string())).await;
        let mut task = Task::new(Uuid::new_v4(), Stage::Transcribe, "faster-whisper");
        task.status = TaskStatus::Ready;
        db.insert_tasks(std::slice::from_ref(&task)).await.unwrap();

        let mut events = bus.subscribe().await.unwrap();
        worker.process(ready_payload(&task)).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), events.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            Event::TaskCompleted {
                task_id: task.id,
                output: Some("blob:out".to_string()),
            }
        );
        let stored = db.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Running);
        assert_eq!(stored.attempts, 1);
    }

    #[tokio::test]
    async fn failed_execution_publishes_task_failed() {
        let (worker, bus, db) = worker_with(Err("model load failed".to_string())).await;
        let mut task = Task::new(Uuid::new_v4(), Stage::Transcribe, "faster-whisper");
        task.status = TaskStatus::Ready;
        db.insert_tasks(std::slice::from_ref(&task)).await.unwrap();

        let mut events = bus.subscribe().await.unwrap();
        worker.process(ready_payload(&task)).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), events.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            Event::TaskFailed {
                task_id: task.id,
                error: "model load failed".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn stale_redelivery_is_dropped() {
        let (worker, bus, db) = worker_with(Ok("blob:out".to_string())).await;
        let mut task = Task::new(Uuid::new_v4(), Stage::Transcribe, "faster-whisper");
        task.status = TaskStatus::Completed;
        db.insert_tasks(std::slice::from_ref(&task)).await.unwrap();

        let mut events = bus.subscribe().await.unwrap();
        worker.process(ready_payload(&task)).await.unwrap();

        // No event published for a task that already moved on.
        let nothing =
            tokio::time::timeout(Duration::from_millis(50), events.next()).await;
        assert!(nothing.is_err());
        let stored = db.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.attempts, 0);
    }
}
