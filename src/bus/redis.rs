//! Redis-backed bus implementation.
//!
//! Layout follows the platform convention: pub/sub on `events`, FIFO
//! lists at `queue:{engine_id}`, registration hashes at `engine:{id}`
//! with a 60 s TTL plus an `engines` set, and realtime worker hashes at
//! `realtime:worker:{id}`.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use uuid::Uuid;

use crate::bus::{
    engine_key, realtime_session_key, realtime_worker_key, Bus, EventStream, ENGINE_TTL,
    EVENTS_CHANNEL,
};
use crate::error::BusError;
use crate::model::{
    EngineRegistration, EngineStatus, Event, RealtimeSession, RealtimeWorker, Stage, TaskPayload,
};

const ENGINES_SET: &str = "engines";
const REALTIME_WORKERS_SET: &str = "realtime:workers";

/// Bus implementation over a single Redis deployment.
pub struct RedisBus {
    client: redis::Client,
    conn: ConnectionManager,
}

impl RedisBus {
    /// Connect to the bus. The connection manager transparently
    /// reconnects on drops; pub/sub subscribers get their own dedicated
    /// connection per `subscribe` call.
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let client = redis::Client::open(url).map_err(|e| BusError::Connection(e.to_string()))?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;
        Ok(Self { client, conn })
    }
}

#[async_trait]
impl Bus for RedisBus {
    async fn publish(&self, event: &Event) -> Result<(), BusError> {
        let payload = serde_json::to_string(event)?;
        let mut conn = self.conn.clone();
        let _: i64 = conn.publish(EVENTS_CHANNEL, payload).await?;
        Ok(())
    }

    async fn subscribe(&self) -> Result<EventStream, BusError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;
        pubsub.subscribe(EVENTS_CHANNEL).await?;

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let payload: String = msg.get_payload().ok()?;
            match serde_json::from_str::<Event>(&payload) {
                Ok(event) => Some(event),
                Err(e) => {
                    tracing::warn!("Dropping undecodable bus event: {}", e);
                    None
                }
            }
        });

        Ok(Box::pin(stream))
    }

    async fn push_task(&self, queue: &str, payload: &TaskPayload) -> Result<(), BusError> {
        let encoded = serde_json::to_string(payload)?;
        let mut conn = self.conn.clone();
        let _: i64 = conn.rpush(queue, encoded).await?;
        Ok(())
    }

    async fn claim_task(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<TaskPayload>, BusError> {
        let mut conn = self.conn.clone();
        let popped: Option<(String, String)> =
            conn.blpop(queue, timeout.as_secs_f64()).await?;
        match popped {
            Some((_key, encoded)) => Ok(Some(serde_json::from_str(&encoded)?)),
            None => Ok(None),
        }
    }

    async fn remove_queued(&self, queue: &str, task_id: Uuid) -> Result<bool, BusError> {
        let mut conn = self.conn.clone();
        let entries: Vec<String> = conn.lrange(queue, 0, -1).await?;
        for encoded in entries {
            let Ok(payload) = serde_json::from_str::<TaskPayload>(&encoded) else {
                continue;
            };
            if payload.task.id == task_id {
                let removed: i64 = conn.lrem(queue, 1, encoded).await?;
                return Ok(removed > 0);
            }
        }
        Ok(false)
    }

    async fn queue_len(&self, queue: &str) -> Result<usize, BusError> {
        let mut conn = self.conn.clone();
        let len: i64 = conn.llen(queue).await?;
        Ok(len as usize)
    }

    async fn put_engine(&self, registration: &EngineRegistration) -> Result<(), BusError> {
        let key = engine_key(&registration.engine_id);
        let fields = engine_fields(registration)?;
        let mut conn = self.conn.clone();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .sadd(ENGINES_SET, &registration.engine_id)
            .ignore()
            .hset_multiple(&key, &fields)
            .ignore()
            .expire(&key, ENGINE_TTL.as_secs() as i64)
            .ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn touch_engine(
        &self,
        engine_id: &str,
        status: EngineStatus,
        current_task: Option<Uuid>,
    ) -> Result<bool, BusError> {
        let key = engine_key(engine_id);
        let mut conn = self.conn.clone();

        let exists: bool = conn.exists(&key).await?;
        if !exists {
            // Record expired between heartbeats; caller re-registers.
            return Ok(false);
        }

        let fields = [
            ("status".to_string(), status.as_str().to_string()),
            (
                "current_task".to_string(),
                current_task.map(|t| t.to_string()).unwrap_or_default(),
            ),
            ("last_heartbeat".to_string(), Utc::now().to_rfc3339()),
        ];
        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset_multiple(&key, &fields)
            .ignore()
            .expire(&key, ENGINE_TTL.as_secs() as i64)
            .ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(true)
    }

    async fn get_engine(&self, engine_id: &str) -> Result<Option<EngineRegistration>, BusError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(engine_key(engine_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        parse_engine(engine_id, &fields).map(Some)
    }

    async fn drop_engine(&self, engine_id: &str) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.srem(ENGINES_SET, engine_id)
            .ignore()
            .del(engine_key(engine_id))
            .ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn list_engine_ids(&self) -> Result<Vec<String>, BusError> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.smembers(ENGINES_SET).await?;
        Ok(ids)
    }

    async fn put_realtime_worker(&self, worker: &RealtimeWorker) -> Result<(), BusError> {
        let key = realtime_worker_key(&worker.id);
        let fields = worker_fields(worker)?;
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .sadd(REALTIME_WORKERS_SET, &worker.id)
            .ignore()
            .hset_multiple(&key, &fields)
            .ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn get_realtime_worker(&self, id: &str) -> Result<Option<RealtimeWorker>, BusError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(realtime_worker_key(id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        parse_worker(id, &fields).map(Some)
    }

    async fn list_realtime_workers(&self) -> Result<Vec<RealtimeWorker>, BusError> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.smembers(REALTIME_WORKERS_SET).await?;
        let mut workers = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(worker) = self.get_realtime_worker(&id).await? {
                workers.push(worker);
            }
        }
        Ok(workers)
    }

    async fn drop_realtime_worker(&self, id: &str) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.srem(REALTIME_WORKERS_SET, id)
            .ignore()
            .del(realtime_worker_key(id))
            .ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn put_realtime_session(&self, session: &RealtimeSession) -> Result<(), BusError> {
        let key = realtime_session_key(session.id);
        let fields = [
            ("tenant_id".to_string(), session.tenant_id.clone()),
            ("status".to_string(), session.status.as_str().to_string()),
            (
                "worker_id".to_string(),
                session.worker_id.clone().unwrap_or_default(),
            ),
            ("model".to_string(), session.model.clone()),
            ("record".to_string(), serde_json::to_string(session)?),
        ];
        let mut conn = self.conn.clone();
        let _: () = conn.hset_multiple(&key, &fields).await?;
        Ok(())
    }

    async fn get_realtime_session(
        &self,
        id: Uuid,
    ) -> Result<Option<RealtimeSession>, BusError> {
        let mut conn = self.conn.clone();
        let record: Option<String> = conn.hget(realtime_session_key(id), "record").await?;
        match record {
            Some(encoded) => Ok(Some(serde_json::from_str(&encoded)?)),
            None => Ok(None),
        }
    }

    async fn drop_realtime_session(&self, id: Uuid) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.del(realtime_session_key(id)).await?;
        Ok(())
    }
}

fn engine_fields(reg: &EngineRegistration) -> Result<Vec<(String, String)>, BusError> {
    Ok(vec![
        ("stage".to_string(), reg.stage.as_str().to_string()),
        ("queue".to_string(), reg.queue.clone()),
        ("models".to_string(), serde_json::to_string(&reg.models)?),
        (
            "native_word_timestamps".to_string(),
            reg.native_word_timestamps.to_string(),
        ),
        ("streaming".to_string(), reg.streaming.to_string()),
        ("status".to_string(), reg.status.as_str().to_string()),
        (
            "current_task".to_string(),
            reg.current_task.map(|t| t.to_string()).unwrap_or_default(),
        ),
        (
            "last_heartbeat".to_string(),
            reg.last_heartbeat.to_rfc3339(),
        ),
        ("registered_at".to_string(), reg.registered_at.to_rfc3339()),
    ])
}

fn parse_engine(
    engine_id: &str,
    fields: &HashMap<String, String>,
) -> Result<EngineRegistration, BusError> {
    let decode = |name: &str| -> Result<&String, BusError> {
        fields
            .get(name)
            .ok_or_else(|| BusError::Command(format!("engine hash missing field '{}'", name)))
    };

    let stage = Stage::parse(decode("stage")?)
        .ok_or_else(|| BusError::Command(format!("unknown stage in engine hash for {}", engine_id)))?;
    let status = EngineStatus::parse(decode("status")?).unwrap_or(EngineStatus::Offline);

    Ok(EngineRegistration {
        engine_id: engine_id.to_string(),
        stage,
        queue: decode("queue")?.clone(),
        models: serde_json::from_str(decode("models")?)?,
        native_word_timestamps: decode("native_word_timestamps")? == "true",
        streaming: decode("streaming")? == "true",
        status,
        current_task: fields
            .get("current_task")
            .filter(|s| !s.is_empty())
            .and_then(|s| Uuid::parse_str(s).ok()),
        last_heartbeat: parse_ts(decode("last_heartbeat")?),
        registered_at: parse_ts(decode("registered_at")?),
    })
}

fn worker_fields(worker: &RealtimeWorker) -> Result<Vec<(String, String)>, BusError> {
    Ok(vec![
        ("endpoint".to_string(), worker.endpoint.clone()),
        ("capacity".to_string(), worker.capacity.to_string()),
        (
            "active_sessions".to_string(),
            worker.active_sessions.to_string(),
        ),
        ("healthy".to_string(), worker.healthy.to_string()),
        ("models".to_string(), serde_json::to_string(&worker.models)?),
        (
            "last_heartbeat".to_string(),
            worker.last_heartbeat.to_rfc3339(),
        ),
        (
            "registered_at".to_string(),
            worker.registered_at.to_rfc3339(),
        ),
    ])
}

fn parse_worker(id: &str, fields: &HashMap<String, String>) -> Result<RealtimeWorker, BusError> {
    let decode = |name: &str| -> Result<&String, BusError> {
        fields
            .get(name)
            .ok_or_else(|| BusError::Command(format!("worker hash missing field '{}'", name)))
    };

    Ok(RealtimeWorker {
        id: id.to_string(),
        endpoint: decode("endpoint")?.clone(),
        capacity: decode("capacity")?.parse().unwrap_or(0),
        active_sessions: decode("active_sessions")?.parse().unwrap_or(0),
        healthy: decode("healthy")? == "true",
        models: serde_json::from_str(decode("models")?)?,
        last_heartbeat: parse_ts(decode("last_heartbeat")?),
        registered_at: parse_ts(decode("registered_at")?),
    })
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
