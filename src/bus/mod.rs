//! Coordination bus: pub/sub events, engine queues, liveness hashes.
//!
//! The bus is authoritative for transient coordination only; audit-grade
//! history lives in the durable store. Everything here is at-least-once
//! with best-effort FIFO, so consumers stay idempotent.

mod memory;
mod redis;

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use uuid::Uuid;

use crate::error::BusError;
use crate::model::{
    EngineRegistration, EngineStatus, Event, RealtimeSession, RealtimeWorker, TaskPayload,
};

pub use memory::MemoryBus;
pub use redis::RedisBus;

/// Pub/sub channel carrying control events.
pub const EVENTS_CHANNEL: &str = "events";

/// TTL on engine registration records. Workers heartbeat every 10 s and
/// tolerate up to five missed sends.
pub const ENGINE_TTL: Duration = Duration::from_secs(60);

/// Stream of decoded bus events.
pub type EventStream = Pin<Box<dyn Stream<Item = Event> + Send>>;

/// The coordination-bus seam.
///
/// `RedisBus` is the production implementation; `MemoryBus` backs unit
/// and scenario tests with identical semantics inside one process.
#[async_trait]
pub trait Bus: Send + Sync {
    // --- Pub/sub ---

    /// Publish a control event to every subscriber.
    async fn publish(&self, event: &Event) -> Result<(), BusError>;

    /// Subscribe to the control-event channel.
    async fn subscribe(&self) -> Result<EventStream, BusError>;

    // --- Task queues (list-shaped, FIFO) ---

    /// Append a task payload to an engine queue.
    async fn push_task(&self, queue: &str, payload: &TaskPayload) -> Result<(), BusError>;

    /// Blocking-pop the oldest payload off a queue. Returns `None` when
    /// the timeout elapses with nothing to claim.
    async fn claim_task(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<TaskPayload>, BusError>;

    /// Scrub a not-yet-claimed task from a queue. O(n) scan of the list.
    /// Returns whether an entry was removed.
    async fn remove_queued(&self, queue: &str, task_id: Uuid) -> Result<bool, BusError>;

    async fn queue_len(&self, queue: &str) -> Result<usize, BusError>;

    // --- Engine registrations ---

    /// Write a full registration record with the standard TTL and add the
    /// engine id to the registered set. Idempotent.
    async fn put_engine(&self, registration: &EngineRegistration) -> Result<(), BusError>;

    /// Refresh an engine's heartbeat, status, and held-task slot.
    /// Returns `false` (without writing) when the record has already
    /// expired; the caller must re-register.
    async fn touch_engine(
        &self,
        engine_id: &str,
        status: EngineStatus,
        current_task: Option<Uuid>,
    ) -> Result<bool, BusError>;

    async fn get_engine(&self, engine_id: &str) -> Result<Option<EngineRegistration>, BusError>;

    /// Best-effort removal of the registration record and set entry.
    async fn drop_engine(&self, engine_id: &str) -> Result<(), BusError>;

    /// Ids in the registered set. May include ids whose record has
    /// expired; callers filter through `get_engine`.
    async fn list_engine_ids(&self) -> Result<Vec<String>, BusError>;

    // --- Realtime worker pool ---

    async fn put_realtime_worker(&self, worker: &RealtimeWorker) -> Result<(), BusError>;

    async fn get_realtime_worker(&self, id: &str) -> Result<Option<RealtimeWorker>, BusError>;

    async fn list_realtime_workers(&self) -> Result<Vec<RealtimeWorker>, BusError>;

    async fn drop_realtime_worker(&self, id: &str) -> Result<(), BusError>;

    // --- Live session mirror ---
    //
    // The durable store owns session history; the bus carries a mirror
    // of the *live* ones so routers can answer coordination queries
    // without touching the store.

    async fn put_realtime_session(&self, session: &RealtimeSession) -> Result<(), BusError>;

    async fn get_realtime_session(&self, id: Uuid)
        -> Result<Option<RealtimeSession>, BusError>;

    async fn drop_realtime_session(&self, id: Uuid) -> Result<(), BusError>;
}

/// Name of the FIFO queue an engine consumes from.
pub fn queue_key(engine_id: &str) -> String {
    format!("queue:{}", engine_id)
}

/// Key of an engine's registration hash.
pub(crate) fn engine_key(engine_id: &str) -> String {
    format!("engine:{}", engine_id)
}

/// Key of a realtime worker's pool hash.
pub(crate) fn realtime_worker_key(id: &str) -> String {
    format!("realtime:worker:{}", id)
}

/// Key of a live session's mirror hash.
pub(crate) fn realtime_session_key(id: Uuid) -> String {
    format!("realtime:session:{}", id)
}
