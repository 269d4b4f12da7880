//! Session router: admit WebSocket streams to streaming ASR workers.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{watch, Mutex};
use uuid::Uuid;

use crate::bus::Bus;
use crate::config::RealtimeConfig;
use crate::db::Database;
use crate::error::RouterError;
use crate::model::{Event, Job, JobParams, RealtimeSession, RealtimeWorker, SessionStatus};

/// What the gateway needs to start relaying a stream.
#[derive(Debug, Clone)]
pub struct Allocation {
    pub session_id: Uuid,
    pub worker_id: String,
    pub worker_endpoint: String,
}

/// Parameters of an incoming stream admission.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub tenant_id: String,
    pub model: String,
    pub language: Option<String>,
    pub encoding: String,
    pub sample_rate: u32,
    pub store_audio: bool,
    pub store_transcript: bool,
    pub enhance_on_end: bool,
    pub client_ip: Option<String>,
    /// Soft resume link to a dropped predecessor session.
    pub resumed_from: Option<Uuid>,
}

/// Final facts reported when a session ends.
#[derive(Debug, Clone)]
pub struct SessionEnd {
    pub status: SessionStatus,
    pub error: Option<String>,
    pub duration_ms: i64,
    pub utterance_count: i32,
    pub word_count: i32,
    pub audio_blob: Option<String>,
    pub transcript_blob: Option<String>,
}

impl SessionEnd {
    pub fn completed() -> Self {
        Self {
            status: SessionStatus::Completed,
            error: None,
            duration_ms: 0,
            utterance_count: 0,
            word_count: 0,
            audio_blob: None,
            transcript_blob: None,
        }
    }

    pub fn interrupted(error: impl Into<String>) -> Self {
        Self {
            status: SessionStatus::Interrupted,
            error: Some(error.into()),
            duration_ms: 0,
            utterance_count: 0,
            word_count: 0,
            audio_blob: None,
            transcript_blob: None,
        }
    }
}

/// Admits sessions under capacity constraints and records their state.
///
/// Allocation is linearizable per router instance: the selection and the
/// slot increment happen under one lock, and a session's worker never
/// changes after allocation.
pub struct SessionRouter {
    bus: Arc<dyn Bus>,
    db: Arc<dyn Database>,
    config: RealtimeConfig,
    alloc_lock: Mutex<()>,
}

impl SessionRouter {
    pub fn new(bus: Arc<dyn Bus>, db: Arc<dyn Database>, config: RealtimeConfig) -> Self {
        Self {
            bus,
            db,
            config,
            alloc_lock: Mutex::new(()),
        }
    }

    /// Announce (or refresh) a streaming worker in the pool.
    pub async fn register_worker(&self, worker: &RealtimeWorker) -> Result<(), RouterError> {
        self.bus.put_realtime_worker(worker).await?;
        tracing::info!(
            worker_id = %worker.id,
            capacity = worker.capacity,
            "Realtime worker registered"
        );
        Ok(())
    }

    /// Heartbeat from a worker: refresh the timestamp and restore
    /// health. Returns `false` for an unknown worker.
    pub async fn worker_heartbeat(&self, worker_id: &str) -> Result<bool, RouterError> {
        let Some(mut worker) = self.bus.get_realtime_worker(worker_id).await? else {
            return Ok(false);
        };
        worker.last_heartbeat = Utc::now();
        worker.healthy = true;
        self.bus.put_realtime_worker(&worker).await?;
        Ok(true)
    }

    /// Pick the least-loaded healthy worker declaring the requested
    /// model, claim a slot, and persist the session row.
    pub async fn allocate(&self, request: SessionRequest) -> Result<Allocation, RouterError> {
        let _guard = self.alloc_lock.lock().await;

        let workers = self.bus.list_realtime_workers().await?;
        let mut candidates: Vec<RealtimeWorker> = workers
            .into_iter()
            .filter(|w| w.has_free_slot() && w.serves_model(&request.model))
            .collect();
        // Least-loaded first; ties resolved by registration order.
        candidates.sort_by_key(|w| (w.active_sessions, w.registered_at));

        let Some(mut worker) = candidates.into_iter().next() else {
            return Err(RouterError::CapacityExhausted {
                model: request.model,
            });
        };

        worker.active_sessions += 1;
        self.bus.put_realtime_worker(&worker).await?;

        let mut session = RealtimeSession::new(request.tenant_id, request.model);
        session.worker_id = Some(worker.id.clone());
        session.language = request.language;
        session.encoding = request.encoding;
        session.sample_rate = request.sample_rate;
        session.store_audio = request.store_audio;
        session.store_transcript = request.store_transcript;
        session.enhance_on_end = request.enhance_on_end;
        session.client_ip = request.client_ip;
        session.resumed_from = request.resumed_from;
        self.db.save_session(&session).await?;
        self.bus.put_realtime_session(&session).await?;

        self.bus
            .publish(&Event::SessionStarted {
                session_id: session.id,
            })
            .await?;

        tracing::info!(
            session_id = %session.id,
            worker_id = %worker.id,
            sessions = worker.active_sessions,
            "Session allocated"
        );
        Ok(Allocation {
            session_id: session.id,
            worker_id: worker.id,
            worker_endpoint: worker.endpoint,
        })
    }

    /// Release a session's worker slot and settle its row. Idempotent:
    /// releasing a settled session is a no-op.
    pub async fn release(&self, session_id: Uuid, end: SessionEnd) -> Result<(), RouterError> {
        let Some(mut session) = self.db.get_session(session_id).await? else {
            return Err(RouterError::SessionNotFound(session_id));
        };
        if session.status != SessionStatus::Active {
            tracing::debug!(session_id = %session_id, "Session already settled");
            return Ok(());
        }

        if let Some(worker_id) = &session.worker_id {
            if let Some(mut worker) = self.bus.get_realtime_worker(worker_id).await? {
                worker.active_sessions = worker.active_sessions.saturating_sub(1);
                self.bus.put_realtime_worker(&worker).await?;
            }
        }

        session.status = end.status;
        session.error = end.error;
        session.duration_ms = end.duration_ms;
        session.utterance_count = end.utterance_count;
        session.word_count = end.word_count;
        session.audio_blob = end.audio_blob.or(session.audio_blob);
        session.transcript_blob = end.transcript_blob.or(session.transcript_blob);
        session.ended_at = Some(Utc::now());

        // Stored audio plus the enhance flag spawns a batch job that
        // re-transcribes the stream offline; the session links to it.
        if session.enhance_on_end
            && session.status == SessionStatus::Completed
            && session.audio_blob.is_some()
        {
            let job = self.spawn_enhancement_job(&session).await?;
            session.enhancement_job_id = Some(job);
        }

        self.db.save_session(&session).await?;
        // Only live sessions are mirrored on the bus.
        self.bus.drop_realtime_session(session_id).await?;
        self.bus
            .publish(&Event::SessionEnded { session_id })
            .await?;

        tracing::info!(
            session_id = %session_id,
            status = %session.status,
            "Session released"
        );
        Ok(())
    }

    async fn spawn_enhancement_job(
        &self,
        session: &RealtimeSession,
    ) -> Result<Uuid, RouterError> {
        let audio_blob = session
            .audio_blob
            .clone()
            .unwrap_or_default();
        let job = Job::new(
            session.tenant_id.clone(),
            audio_blob,
            JobParams {
                model: session.model.clone(),
                language: session.language.clone(),
                word_timestamps: true,
                speaker_detection: false,
                llm_cleanup: false,
                webhook_url: None,
                webhook_metadata: Some(serde_json::json!({
                    "source": "realtime_enhancement",
                    "session_id": session.id,
                })),
            },
        );
        self.db.create_job(&job).await?;
        self.bus.publish(&Event::JobCreated { job_id: job.id }).await?;
        tracing::info!(
            session_id = %session.id,
            job_id = %job.id,
            "Enhancement job created"
        );
        Ok(job.id)
    }

    /// Sweep the pool: workers silent past the staleness window stop
    /// receiving sessions. Returns how many were newly marked.
    pub async fn health_probe(&self) -> Result<usize, RouterError> {
        let staleness = chrono::TimeDelta::from_std(self.config.worker_staleness)
            .unwrap_or(chrono::TimeDelta::seconds(30));
        let now = Utc::now();
        let mut marked = 0;

        for mut worker in self.bus.list_realtime_workers().await? {
            if worker.healthy && now - worker.last_heartbeat > staleness {
                worker.healthy = false;
                self.bus.put_realtime_worker(&worker).await?;
                tracing::warn!(worker_id = %worker.id, "Realtime worker marked unhealthy");
                marked += 1;
            }
        }
        Ok(marked)
    }

    /// Background sweep loop.
    pub async fn run_health_probe(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.probe_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.health_probe().await {
                        tracing::error!("Health probe failed: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}
