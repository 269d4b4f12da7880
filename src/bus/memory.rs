//! In-process bus used by unit and scenario tests.
//!
//! Mirrors the Redis layout semantics: FIFO queues, TTL'd engine
//! records, at-least-once broadcast pub/sub.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex, Notify};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use uuid::Uuid;

use crate::bus::{Bus, EventStream, ENGINE_TTL};
use crate::error::BusError;
use crate::model::{
    EngineRegistration, EngineStatus, Event, RealtimeSession, RealtimeWorker, TaskPayload,
};

struct EngineRecord {
    registration: EngineRegistration,
    expires_at: Instant,
}

/// Single-process bus with the same observable contract as `RedisBus`.
pub struct MemoryBus {
    events: broadcast::Sender<Event>,
    queues: Mutex<HashMap<String, VecDeque<TaskPayload>>>,
    queue_signal: Notify,
    engines: Mutex<HashMap<String, EngineRecord>>,
    workers: Mutex<HashMap<String, RealtimeWorker>>,
    sessions: Mutex<HashMap<Uuid, RealtimeSession>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            events,
            queues: Mutex::new(HashMap::new()),
            queue_signal: Notify::new(),
            engines: Mutex::new(HashMap::new()),
            workers: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn publish(&self, event: &Event) -> Result<(), BusError> {
        // No subscribers is fine; pub/sub drops into the void like Redis.
        let _ = self.events.send(event.clone());
        Ok(())
    }

    async fn subscribe(&self) -> Result<EventStream, BusError> {
        let rx = self.events.subscribe();
        let stream = BroadcastStream::new(rx).filter_map(|item| item.ok());
        Ok(Box::pin(stream))
    }

    async fn push_task(&self, queue: &str, payload: &TaskPayload) -> Result<(), BusError> {
        let mut queues = self.queues.lock().await;
        queues
            .entry(queue.to_string())
            .or_default()
            .push_back(payload.clone());
        drop(queues);
        self.queue_signal.notify_waiters();
        Ok(())
    }

    async fn claim_task(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<TaskPayload>, BusError> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut queues = self.queues.lock().await;
                if let Some(list) = queues.get_mut(queue) {
                    if let Some(payload) = list.pop_front() {
                        return Ok(Some(payload));
                    }
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let _ = tokio::time::timeout(deadline - now, self.queue_signal.notified()).await;
        }
    }

    async fn remove_queued(&self, queue: &str, task_id: Uuid) -> Result<bool, BusError> {
        let mut queues = self.queues.lock().await;
        let Some(list) = queues.get_mut(queue) else {
            return Ok(false);
        };
        let before = list.len();
        list.retain(|payload| payload.task.id != task_id);
        Ok(list.len() < before)
    }

    async fn queue_len(&self, queue: &str) -> Result<usize, BusError> {
        let queues = self.queues.lock().await;
        Ok(queues.get(queue).map(VecDeque::len).unwrap_or(0))
    }

    async fn put_engine(&self, registration: &EngineRegistration) -> Result<(), BusError> {
        let mut engines = self.engines.lock().await;
        engines.insert(
            registration.engine_id.clone(),
            EngineRecord {
                registration: registration.clone(),
                expires_at: Instant::now() + ENGINE_TTL,
            },
        );
        Ok(())
    }

    async fn touch_engine(
        &self,
        engine_id: &str,
        status: EngineStatus,
        current_task: Option<Uuid>,
    ) -> Result<bool, BusError> {
        let mut engines = self.engines.lock().await;
        let Some(record) = engines.get_mut(engine_id) else {
            return Ok(false);
        };
        if record.expires_at <= Instant::now() {
            engines.remove(engine_id);
            return Ok(false);
        }
        record.registration.status = status;
        record.registration.current_task = current_task;
        record.registration.last_heartbeat = chrono::Utc::now();
        record.expires_at = Instant::now() + ENGINE_TTL;
        Ok(true)
    }

    async fn get_engine(&self, engine_id: &str) -> Result<Option<EngineRegistration>, BusError> {
        let mut engines = self.engines.lock().await;
        match engines.get(engine_id) {
            Some(record) if record.expires_at > Instant::now() => {
                Ok(Some(record.registration.clone()))
            }
            Some(_) => {
                engines.remove(engine_id);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn drop_engine(&self, engine_id: &str) -> Result<(), BusError> {
        self.engines.lock().await.remove(engine_id);
        Ok(())
    }

    async fn list_engine_ids(&self) -> Result<Vec<String>, BusError> {
        let engines = self.engines.lock().await;
        Ok(engines.keys().cloned().collect())
    }

    async fn put_realtime_worker(&self, worker: &RealtimeWorker) -> Result<(), BusError> {
        self.workers
            .lock()
            .await
            .insert(worker.id.clone(), worker.clone());
        Ok(())
    }

    async fn get_realtime_worker(&self, id: &str) -> Result<Option<RealtimeWorker>, BusError> {
        Ok(self.workers.lock().await.get(id).cloned())
    }

    async fn list_realtime_workers(&self) -> Result<Vec<RealtimeWorker>, BusError> {
        Ok(self.workers.lock().await.values().cloned().collect())
    }

    async fn drop_realtime_worker(&self, id: &str) -> Result<(), BusError> {
        self.workers.lock().await.remove(id);
        Ok(())
    }

    async fn put_realtime_session(&self, session: &RealtimeSession) -> Result<(), BusError> {
        self.sessions
            .lock()
            .await
            .insert(session.id, session.clone());
        Ok(())
    }

    async fn get_realtime_session(
        &self,
        id: Uuid,
    ) -> Result<Option<RealtimeSession>, BusError> {
        Ok(self.sessions.lock().await.get(&id).cloned())
    }

    async fn drop_realtime_session(&self, id: Uuid) -> Result<(), BusError> {
        self.sessions.lock().await.remove(&id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AudioMetadata, Stage, Task};

    fn payload(task: Task) -> TaskPayload {
        TaskPayload {
            task,
            inputs: HashMap::new(),
            audio: AudioMetadata::default(),
        }
    }

    #[tokio::test]
    async fn queue_is_fifo() {
        let bus = MemoryBus::new();
        let job = Uuid::new_v4();
        let first = Task::new(job, Stage::Prepare, "ffmpeg");
        let second = Task::new(job, Stage::Transcribe, "ffmpeg");

        bus.push_task("queue:ffmpeg", &payload(first.clone()))
            .await
            .unwrap();
        bus.push_task("queue:ffmpeg", &payload(second.clone()))
            .await
            .unwrap();

        let claimed = bus
            .claim_task("queue:ffmpeg", Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.task.id, first.id);

        let claimed = bus
            .claim_task("queue:ffmpeg", Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.task.id, second.id);
    }

    #[tokio::test]
    async fn claim_times_out_on_empty_queue() {
        let bus = MemoryBus::new();
        let claimed = bus
            .claim_task("queue:empty", Duration::from_millis(20))
            .await
            .unwrap();
        assert!(claimed.is_none());
    }

    #[tokio::test]
    async fn remove_queued_scrubs_by_task_id() {
        let bus = MemoryBus::new();
        let task = Task::new(Uuid::new_v4(), Stage::Transcribe, "fw");
        bus.push_task("queue:fw", &payload(task.clone())).await.unwrap();

        assert!(bus.remove_queued("queue:fw", task.id).await.unwrap());
        assert_eq!(bus.queue_len("queue:fw").await.unwrap(), 0);
        assert!(!bus.remove_queued("queue:fw", task.id).await.unwrap());
    }

    #[tokio::test]
    async fn touch_fails_for_unknown_engine() {
        let bus = MemoryBus::new();
        let touched = bus
            .touch_engine("ghost", EngineStatus::Idle, None)
            .await
            .unwrap();
        assert!(!touched);
    }

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let bus = MemoryBus::new();
        let mut stream = bus.subscribe().await.unwrap();
        let event = Event::JobCreated {
            job_id: Uuid::new_v4(),
        };
        bus.publish(&event).await.unwrap();
        let received = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, event);
    }
}
