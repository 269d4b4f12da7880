//! PostgreSQL store for the authoritative platform rows.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Config, Pool, Runtime};
use tokio_postgres::{NoTls, Row};
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::db::Database;
use crate::error::DatabaseError;
use crate::model::{
    DeliveryStatus, Job, JobParams, JobStatus, RealtimeSession, SessionStatus, Stage, Task,
    TaskStatus, WebhookDelivery, WebhookEndpoint,
};

/// Durable store backed by a PostgreSQL pool.
pub struct PgStore {
    pool: Pool,
}

impl PgStore {
    /// Create a new store and connect to the database.
    pub async fn new(config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        let mut cfg = Config::new();
        cfg.url = Some(config.url().to_string());
        cfg.pool = Some(deadpool_postgres::PoolConfig {
            max_size: config.pool_size,
            ..Default::default()
        });

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| DatabaseError::Pool(e.to_string()))?;

        // Test connection
        let _ = pool.get().await?;

        Ok(Self { pool })
    }

    /// Run database migrations.
    ///
    /// Schema lives in `migrations/`; production runs refinery
    /// externally against the same directory.
    pub async fn run_migrations(&self) -> Result<(), DatabaseError> {
        tracing::info!("Database migrations should be run via: refinery migrate -c refinery.toml");
        Ok(())
    }

    /// Get a connection from the pool.
    pub async fn conn(&self) -> Result<deadpool_postgres::Object, DatabaseError> {
        Ok(self.pool.get().await?)
    }
}

#[async_trait]
impl Database for PgStore {
    async fn create_job(&self, job: &Job) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        let params = serde_json::to_value(&job.params)
            .map_err(|e| DatabaseError::CorruptRow { reason: e.to_string() })?;

        conn.execute(
            r#"
            INSERT INTO jobs (
                id, tenant_id, status, audio_blob, params, transcript_blob, error,
                created_at, updated_at, completed_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
            &[
                &job.id,
                &job.tenant_id,
                &job.status.as_str(),
                &job.audio_blob,
                &params,
                &job.transcript_blob,
                &job.error,
                &job.created_at,
                &job.updated_at,
                &job.completed_at,
            ],
        )
        .await?;

        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt("SELECT * FROM jobs WHERE id = $1", &[&id])
            .await?;
        row.map(job_from_row).transpose()
    }

    async fn try_transition_job(
        &self,
        id: Uuid,
        from: &[JobStatus],
        to: JobStatus,
        error: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn().await?;
        let from: Vec<String> = from.iter().map(|s| s.as_str().to_string()).collect();
        let completed_at = to.is_terminal().then(Utc::now);

        let updated = conn
            .execute(
                r#"
                UPDATE jobs
                SET status = $3,
                    error = COALESCE($4, error),
                    completed_at = COALESCE($5, completed_at),
                    updated_at = NOW()
                WHERE id = $1 AND status = ANY($2)
                "#,
                &[&id, &from, &to.as_str(), &error, &completed_at],
            )
            .await?;

        Ok(updated == 1)
    }

    async fn set_job_transcript(&self, id: Uuid, blob: &str) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.execute(
            "UPDATE jobs SET transcript_blob = $2, updated_at = NOW() WHERE id = $1",
            &[&id, &blob],
        )
        .await?;
        Ok(())
    }

    async fn insert_tasks(&self, tasks: &[Task]) -> Result<(), DatabaseError> {
        let mut conn = self.conn().await?;
        let tx = conn.transaction().await?;

        for task in tasks {
            let config = serde_json::to_value(&task.config)
                .map_err(|e| DatabaseError::CorruptRow { reason: e.to_string() })?;
            tx.execute(
                r#"
                INSERT INTO tasks (
                    id, job_id, stage, engine_id, depends_on, status, config,
                    output, error, attempts, trace, created_at, updated_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                "#,
                &[
                    &task.id,
                    &task.job_id,
                    &task.stage.as_str(),
                    &task.engine_id,
                    &task.depends_on,
                    &task.status.as_str(),
                    &config,
                    &task.output,
                    &task.error,
                    &task.attempts,
                    &task.trace,
                    &task.created_at,
                    &task.updated_at,
                ],
            )
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt("SELECT * FROM tasks WHERE id = $1", &[&id])
            .await?;
        row.map(task_from_row).transpose()
    }

    async fn tasks_for_job(&self, job_id: Uuid) -> Result<Vec<Task>, DatabaseError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT * FROM tasks WHERE job_id = $1 ORDER BY created_at, id",
                &[&job_id],
            )
            .await?;
        rows.into_iter().map(task_from_row).collect()
    }

    async fn try_transition_task(
        &self,
        id: Uuid,
        from: &[TaskStatus],
        to: TaskStatus,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn().await?;
        let from: Vec<String> = from.iter().map(|s| s.as_str().to_string()).collect();
        let updated = conn
            .execute(
                r#"
                UPDATE tasks SET status = $3, updated_at = NOW()
                WHERE id = $1 AND status = ANY($2)
                "#,
                &[&id, &from, &to.as_str()],
            )
            .await?;
        Ok(updated == 1)
    }

    async fn complete_task(&self, id: Uuid, output: Option<&str>) -> Result<bool, DatabaseError> {
        let conn = self.conn().await?;
        let updated = conn
            .execute(
                r#"
                UPDATE tasks
                SET status = 'completed', output = COALESCE($2, output), updated_at = NOW()
                WHERE id = $1 AND status IN ('pending', 'ready', 'running')
                "#,
                &[&id, &output],
            )
            .await?;
        Ok(updated == 1)
    }

    async fn fail_task(&self, id: Uuid, error: &str) -> Result<bool, DatabaseError> {
        let conn = self.conn().await?;
        let updated = conn
            .execute(
                r#"
                UPDATE tasks
                SET status = 'failed', error = $2, updated_at = NOW()
                WHERE id = $1 AND status IN ('pending', 'ready', 'running')
                "#,
                &[&id, &error],
            )
            .await?;
        Ok(updated == 1)
    }

    async fn increment_task_attempts(&self, id: Uuid) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.execute(
            "UPDATE tasks SET attempts = attempts + 1, updated_at = NOW() WHERE id = $1",
            &[&id],
        )
        .await?;
        Ok(())
    }

    async fn save_session(&self, session: &RealtimeSession) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.execute(
            r#"
            INSERT INTO realtime_sessions (
                id, tenant_id, status, worker_id, model, language, encoding, sample_rate,
                store_audio, store_transcript, enhance_on_end, audio_blob, transcript_blob,
                enhancement_job_id, resumed_from, duration_ms, utterance_count, word_count,
                client_ip, started_at, ended_at, error
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                      $16, $17, $18, $19, $20, $21, $22)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                worker_id = EXCLUDED.worker_id,
                audio_blob = EXCLUDED.audio_blob,
                transcript_blob = EXCLUDED.transcript_blob,
                enhancement_job_id = EXCLUDED.enhancement_job_id,
                duration_ms = EXCLUDED.duration_ms,
                utterance_count = EXCLUDED.utterance_count,
                word_count = EXCLUDED.word_count,
                ended_at = EXCLUDED.ended_at,
                error = EXCLUDED.error
            "#,
            &[
                &session.id,
                &session.tenant_id,
                &session.status.as_str(),
                &session.worker_id,
                &session.model,
                &session.language,
                &session.encoding,
                &(session.sample_rate as i32),
                &session.store_audio,
                &session.store_transcript,
                &session.enhance_on_end,
                &session.audio_blob,
                &session.transcript_blob,
                &session.enhancement_job_id,
                &session.resumed_from,
                &session.duration_ms,
                &session.utterance_count,
                &session.word_count,
                &session.client_ip,
                &session.started_at,
                &session.ended_at,
                &session.error,
            ],
        )
        .await?;
        Ok(())
    }

    async fn get_session(&self, id: Uuid) -> Result<Option<RealtimeSession>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt("SELECT * FROM realtime_sessions WHERE id = $1", &[&id])
            .await?;
        row.map(session_from_row).transpose()
    }

    async fn create_endpoint(&self, endpoint: &WebhookEndpoint) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.execute(
            r#"
            INSERT INTO webhook_endpoints (
                id, tenant_id, url, events, secret, active, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
            &[
                &endpoint.id,
                &endpoint.tenant_id,
                &endpoint.url,
                &endpoint.events,
                &endpoint.secret,
                &endpoint.active,
                &endpoint.created_at,
                &endpoint.updated_at,
            ],
        )
        .await?;
        Ok(())
    }

    async fn get_endpoint(&self, id: Uuid) -> Result<Option<WebhookEndpoint>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt("SELECT * FROM webhook_endpoints WHERE id = $1", &[&id])
            .await?;
        row.map(endpoint_from_row).transpose()
    }

    async fn list_endpoints(&self, tenant_id: &str) -> Result<Vec<WebhookEndpoint>, DatabaseError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT * FROM webhook_endpoints WHERE tenant_id = $1 ORDER BY created_at",
                &[&tenant_id],
            )
            .await?;
        rows.into_iter().map(endpoint_from_row).collect()
    }

    async fn update_endpoint(&self, endpoint: &WebhookEndpoint) -> Result<bool, DatabaseError> {
        let conn = self.conn().await?;
        let updated = conn
            .execute(
                r#"
                UPDATE webhook_endpoints
                SET url = $2, events = $3, secret = $4, active = $5, updated_at = NOW()
                WHERE id = $1
                "#,
                &[
                    &endpoint.id,
                    &endpoint.url,
                    &endpoint.events,
                    &endpoint.secret,
                    &endpoint.active,
                ],
            )
            .await?;
        Ok(updated == 1)
    }

    async fn delete_endpoint(&self, id: Uuid, tenant_id: &str) -> Result<bool, DatabaseError> {
        let conn = self.conn().await?;
        let deleted = conn
            .execute(
                "DELETE FROM webhook_endpoints WHERE id = $1 AND tenant_id = $2",
                &[&id, &tenant_id],
            )
            .await?;
        Ok(deleted == 1)
    }

    async fn insert_deliveries(&self, deliveries: &[WebhookDelivery]) -> Result<(), DatabaseError> {
        let mut conn = self.conn().await?;
        let tx = conn.transaction().await?;
        for delivery in deliveries {
            tx.execute(
                r#"
                INSERT INTO webhook_deliveries (
                    id, endpoint_id, job_id, event_type, payload, url_override, status,
                    attempts, next_retry_at, last_status_code, last_error, created_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                ON CONFLICT DO NOTHING
                "#,
                &[
                    &delivery.id,
                    &delivery.endpoint_id,
                    &delivery.job_id,
                    &delivery.event_type,
                    &delivery.payload,
                    &delivery.url_override,
                    &delivery.status.as_str(),
                    &delivery.attempts,
                    &delivery.next_retry_at,
                    &delivery.last_status_code,
                    &delivery.last_error,
                    &delivery.created_at,
                ],
            )
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn claim_due_deliveries(
        &self,
        limit: i64,
    ) -> Result<Vec<WebhookDelivery>, DatabaseError> {
        let conn = self.conn().await?;
        // Exactly-one-in-flight per delivery id: the subquery locks the
        // claimed rows and SKIP LOCKED lets concurrent workers pass each
        // other without blocking.
        let rows = conn
            .query(
                r#"
                UPDATE webhook_deliveries
                SET attempts = attempts + 1
                WHERE id IN (
                    SELECT id FROM webhook_deliveries
                    WHERE status = 'pending' AND next_retry_at <= NOW()
                    ORDER BY next_retry_at
                    LIMIT $1
                    FOR UPDATE SKIP LOCKED
                )
                RETURNING *
                "#,
                &[&limit],
            )
            .await?;
        rows.into_iter().map(delivery_from_row).collect()
    }

    async fn mark_delivery_delivered(
        &self,
        id: Uuid,
        status_code: i32,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.execute(
            r#"
            UPDATE webhook_deliveries
            SET status = 'delivered', last_status_code = $2, last_error = NULL
            WHERE id = $1
            "#,
            &[&id, &status_code],
        )
        .await?;
        Ok(())
    }

    async fn mark_delivery_retry(
        &self,
        id: Uuid,
        next_retry_at: DateTime<Utc>,
        status_code: Option<i32>,
        error: &str,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.execute(
            r#"
            UPDATE webhook_deliveries
            SET next_retry_at = $2, last_status_code = $3, last_error = $4
            WHERE id = $1
            "#,
            &[&id, &next_retry_at, &status_code, &error],
        )
        .await?;
        Ok(())
    }

    async fn mark_delivery_failed(
        &self,
        id: Uuid,
        status_code: Option<i32>,
        error: &str,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.execute(
            r#"
            UPDATE webhook_deliveries
            SET status = 'failed', last_status_code = $2, last_error = $3
            WHERE id = $1
            "#,
            &[&id, &status_code, &error],
        )
        .await?;
        Ok(())
    }

    async fn get_delivery(&self, id: Uuid) -> Result<Option<WebhookDelivery>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt("SELECT * FROM webhook_deliveries WHERE id = $1", &[&id])
            .await?;
        row.map(delivery_from_row).transpose()
    }

    async fn list_deliveries_for_endpoint(
        &self,
        endpoint_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<WebhookDelivery>, DatabaseError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                r#"
                SELECT * FROM webhook_deliveries
                WHERE endpoint_id = $1
                ORDER BY created_at DESC
                LIMIT $2 OFFSET $3
                "#,
                &[&endpoint_id, &limit, &offset],
            )
            .await?;
        rows.into_iter().map(delivery_from_row).collect()
    }

    async fn requeue_delivery(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let conn = self.conn().await?;
        let updated = conn
            .execute(
                r#"
                UPDATE webhook_deliveries
                SET status = 'pending', next_retry_at = NOW()
                WHERE id = $1 AND status <> 'delivered'
                "#,
                &[&id],
            )
            .await?;
        Ok(updated == 1)
    }
}

fn job_from_row(row: Row) -> Result<Job, DatabaseError> {
    let status: String = row.get("status");
    let status = JobStatus::parse(&status).ok_or_else(|| DatabaseError::CorruptRow {
        reason: format!("unknown job status '{}'", status),
    })?;
    let params: serde_json::Value = row.get("params");
    let params: JobParams =
        serde_json::from_value(params).map_err(|e| DatabaseError::CorruptRow {
            reason: format!("bad job params: {}", e),
        })?;

    Ok(Job {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        status,
        audio_blob: row.get("audio_blob"),
        params,
        transcript_blob: row.get("transcript_blob"),
        error: row.get("error"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        completed_at: row.get("completed_at"),
    })
}

fn task_from_row(row: Row) -> Result<Task, DatabaseError> {
    let status: String = row.get("status");
    let status = TaskStatus::parse(&status).ok_or_else(|| DatabaseError::CorruptRow {
        reason: format!("unknown task status '{}'", status),
    })?;
    let stage: String = row.get("stage");
    let stage = Stage::parse(&stage).ok_or_else(|| DatabaseError::CorruptRow {
        reason: format!("unknown stage '{}'", stage),
    })?;
    let config: serde_json::Value = row.get("config");
    let config = serde_json::from_value(config).map_err(|e| DatabaseError::CorruptRow {
        reason: format!("bad task config: {}", e),
    })?;

    Ok(Task {
        id: row.get("id"),
        job_id: row.get("job_id"),
        stage,
        engine_id: row.get("engine_id"),
        depends_on: row.get("depends_on"),
        status,
        config,
        output: row.get("output"),
        error: row.get("error"),
        attempts: row.get("attempts"),
        trace: row.get("trace"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn session_from_row(row: Row) -> Result<RealtimeSession, DatabaseError> {
    let status: String = row.get("status");
    let status = SessionStatus::parse(&status).ok_or_else(|| DatabaseError::CorruptRow {
        reason: format!("unknown session status '{}'", status),
    })?;
    let sample_rate: i32 = row.get("sample_rate");

    Ok(RealtimeSession {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        status,
        worker_id: row.get("worker_id"),
        model: row.get("model"),
        language: row.get("language"),
        encoding: row.get("encoding"),
        sample_rate: sample_rate as u32,
        store_audio: row.get("store_audio"),
        store_transcript: row.get("store_transcript"),
        enhance_on_end: row.get("enhance_on_end"),
        audio_blob: row.get("audio_blob"),
        transcript_blob: row.get("transcript_blob"),
        enhancement_job_id: row.get("enhancement_job_id"),
        resumed_from: row.get("resumed_from"),
        duration_ms: row.get("duration_ms"),
        utterance_count: row.get("utterance_count"),
        word_count: row.get("word_count"),
        client_ip: row.get("client_ip"),
        started_at: row.get("started_at"),
        ended_at: row.get("ended_at"),
        error: row.get("error"),
    })
}

fn endpoint_from_row(row: Row) -> Result<WebhookEndpoint, DatabaseError> {
    Ok(WebhookEndpoint {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        url: row.get("url"),
        events: row.get("events"),
        secret: row.get("secret"),
        active: row.get("active"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn delivery_from_row(row: Row) -> Result<WebhookDelivery, DatabaseError> {
    let status: String = row.get("status");
    let status = DeliveryStatus::parse(&status).ok_or_else(|| DatabaseError::CorruptRow {
        reason: format!("unknown delivery status '{}'", status),
    })?;

    Ok(WebhookDelivery {
        id: row.get("id"),
        endpoint_id: row.get("endpoint_id"),
        job_id: row.get("job_id"),
        event_type: row.get("event_type"),
        payload: row.get("payload"),
        url_override: row.get("url_override"),
        status,
        attempts: row.get("attempts"),
        next_retry_at: row.get("next_retry_at"),
        last_status_code: row.get("last_status_code"),
        last_error: row.get("last_error"),
        created_at: row.get("created_at"),
    })
}
