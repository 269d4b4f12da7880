//! In-memory store used by unit and scenario tests.
//!
//! Implements the same conditional-transition contract as `PgStore`,
//! minus row-level locking (everything serializes on one mutex, which is
//! strictly stronger).

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::db::Database;
use crate::error::DatabaseError;
use crate::model::{
    DeliveryStatus, Job, JobStatus, RealtimeSession, Task, TaskStatus, WebhookDelivery,
    WebhookEndpoint,
};

#[derive(Default)]
struct Tables {
    jobs: HashMap<Uuid, Job>,
    tasks: HashMap<Uuid, Task>,
    sessions: HashMap<Uuid, RealtimeSession>,
    endpoints: HashMap<Uuid, WebhookEndpoint>,
    deliveries: HashMap<Uuid, WebhookDelivery>,
}

/// Store with the `Database` contract held entirely in process memory.
#[derive(Default)]
pub struct MemoryDb {
    tables: Mutex<Tables>,
}

impl MemoryDb {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Database for MemoryDb {
    async fn create_job(&self, job: &Job) -> Result<(), DatabaseError> {
        let mut tables = self.tables.lock().await;
        tables.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError> {
        Ok(self.tables.lock().await.jobs.get(&id).cloned())
    }

    async fn try_transition_job(
        &self,
        id: Uuid,
        from: &[JobStatus],
        to: JobStatus,
        error: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        let mut tables = self.tables.lock().await;
        let Some(job) = tables.jobs.get_mut(&id) else {
            return Ok(false);
        };
        if !from.contains(&job.status) {
            return Ok(false);
        }
        job.status = to;
        if let Some(error) = error {
            job.error = Some(error.to_string());
        }
        if to.is_terminal() {
            job.completed_at = Some(Utc::now());
        }
        job.updated_at = Utc::now();
        Ok(true)
    }

    async fn set_job_transcript(&self, id: Uuid, blob: &str) -> Result<(), DatabaseError> {
        let mut tables = self.tables.lock().await;
        if let Some(job) = tables.jobs.get_mut(&id) {
            job.transcript_blob = Some(blob.to_string());
            job.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn insert_tasks(&self, tasks: &[Task]) -> Result<(), DatabaseError> {
        let mut tables = self.tables.lock().await;
        for task in tasks {
            tables.tasks.insert(task.id, task.clone());
        }
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError> {
        Ok(self.tables.lock().await.tasks.get(&id).cloned())
    }

    async fn tasks_for_job(&self, job_id: Uuid) -> Result<Vec<Task>, DatabaseError> {
        let tables = self.tables.lock().await;
        let mut tasks: Vec<Task> = tables
            .tasks
            .values()
            .filter(|t| t.job_id == job_id)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| (t.created_at, t.id));
        Ok(tasks)
    }

    async fn try_transition_task(
        &self,
        id: Uuid,
        from: &[TaskStatus],
        to: TaskStatus,
    ) -> Result<bool, DatabaseError> {
        let mut tables = self.tables.lock().await;
        let Some(task) = tables.tasks.get_mut(&id) else {
            return Ok(false);
        };
        if !from.contains(&task.status) {
            return Ok(false);
        }
        task.status = to;
        task.updated_at = Utc::now();
        Ok(true)
    }

    async fn complete_task(&self, id: Uuid, output: Option<&str>) -> Result<bool, DatabaseError> {
        let mut tables = self.tables.lock().await;
        let Some(task) = tables.tasks.get_mut(&id) else {
            return Ok(false);
        };
        if task.status.is_terminal() {
            return Ok(false);
        }
        task.status = TaskStatus::Completed;
        if let Some(output) = output {
            task.output = Some(output.to_string());
        }
        task.updated_at = Utc::now();
        Ok(true)
    }

    async fn fail_task(&self, id: Uuid, error: &str) -> Result<bool, DatabaseError> {
        let mut tables = self.tables.lock().await;
        let Some(task) = tables.tasks.get_mut(&id) else {
            return Ok(false);
        };
        if task.status.is_terminal() {
            return Ok(false);
        }
        task.status = TaskStatus::Failed;
        task.error = Some(error.to_string());
        task.updated_at = Utc::now();
        Ok(true)
    }

    async fn increment_task_attempts(&self, id: Uuid) -> Result<(), DatabaseError> {
        let mut tables = self.tables.lock().await;
        if let Some(task) = tables.tasks.get_mut(&id) {
            task.attempts += 1;
            task.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn save_session(&self, session: &RealtimeSession) -> Result<(), DatabaseError> {
        let mut tables = self.tables.lock().await;
        tables.sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn get_session(&self, id: Uuid) -> Result<Option<RealtimeSession>, DatabaseError> {
        Ok(self.tables.lock().await.sessions.get(&id).cloned())
    }

    async fn create_endpoint(&self, endpoint: &WebhookEndpoint) -> Result<(), DatabaseError> {
        let mut tables = self.tables.lock().await;
        tables.endpoints.insert(endpoint.id, endpoint.clone());
        Ok(())
    }

    async fn get_endpoint(&self, id: Uuid) -> Result<Option<WebhookEndpoint>, DatabaseError> {
        Ok(self.tables.lock().await.endpoints.get(&id).cloned())
    }

    async fn list_endpoints(&self, tenant_id: &str) -> Result<Vec<WebhookEndpoint>, DatabaseError> {
        let tables = self.tables.lock().await;
        let mut endpoints: Vec<WebhookEndpoint> = tables
            .endpoints
            .values()
            .filter(|e| e.tenant_id == tenant_id)
            .cloned()
            .collect();
        endpoints.sort_by_key(|e| e.created_at);
        Ok(endpoints)
    }

    async fn update_endpoint(&self, endpoint: &WebhookEndpoint) -> Result<bool, DatabaseError> {
        let mut tables = self.tables.lock().await;
        match tables.endpoints.get_mut(&endpoint.id) {
            Some(existing) => {
                existing.url = endpoint.url.clone();
                existing.events = endpoint.events.clone();
                existing.secret = endpoint.secret.clone();
                existing.active = endpoint.active;
                existing.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_endpoint(&self, id: Uuid, tenant_id: &str) -> Result<bool, DatabaseError> {
        let mut tables = self.tables.lock().await;
        match tables.endpoints.get(&id) {
            Some(endpoint) if endpoint.tenant_id == tenant_id => {
                tables.endpoints.remove(&id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn insert_deliveries(&self, deliveries: &[WebhookDelivery]) -> Result<(), DatabaseError> {
        let mut tables = self.tables.lock().await;
        for delivery in deliveries {
            // Same dedup contract as the unique partial indexes: one row
            // per (job, event, endpoint), one legacy row per (job, event).
            let duplicate = tables.deliveries.values().any(|d| {
                d.job_id == delivery.job_id
                    && d.event_type == delivery.event_type
                    && d.endpoint_id == delivery.endpoint_id
            });
            if !duplicate {
                tables.deliveries.insert(delivery.id, delivery.clone());
            }
        }
        Ok(())
    }

    async fn claim_due_deliveries(
        &self,
        limit: i64,
    ) -> Result<Vec<WebhookDelivery>, DatabaseError> {
        let mut tables = self.tables.lock().await;
        let now = Utc::now();
        let mut due: Vec<Uuid> = tables
            .deliveries
            .values()
            .filter(|d| d.status == DeliveryStatus::Pending && d.next_retry_at <= now)
            .map(|d| d.id)
            .collect();
        due.sort_by_key(|id| tables.deliveries[id].next_retry_at);
        due.truncate(limit as usize);

        let mut claimed = Vec::with_capacity(due.len());
        for id in due {
            let delivery = tables.deliveries.get_mut(&id).unwrap();
            delivery.attempts += 1;
            claimed.push(delivery.clone());
        }
        Ok(claimed)
    }

    async fn mark_delivery_delivered(
        &self,
        id: Uuid,
        status_code: i32,
    ) -> Result<(), DatabaseError> {
        let mut tables = self.tables.lock().await;
        if let Some(delivery) = tables.deliveries.get_mut(&id) {
            delivery.status = DeliveryStatus::Delivered;
            delivery.last_status_code = Some(status_code);
            delivery.last_error = None;
        }
        Ok(())
    }

    async fn mark_delivery_retry(
        &self,
        id: Uuid,
        next_retry_at: DateTime<Utc>,
        status_code: Option<i32>,
        error: &str,
    ) -> Result<(), DatabaseError> {
        let mut tables = self.tables.lock().await;
        if let Some(delivery) = tables.deliveries.get_mut(&id) {
            delivery.next_retry_at = next_retry_at;
            delivery.last_status_code = status_code;
            delivery.last_error = Some(error.to_string());
        }
        Ok(())
    }

    async fn mark_delivery_failed(
        &self,
        id: Uuid,
        status_code: Option<i32>,
        error: &str,
    ) -> Result<(), DatabaseError> {
        let mut tables = self.tables.lock().await;
        if let Some(delivery) = tables.deliveries.get_mut(&id) {
            delivery.status = DeliveryStatus::Failed;
            delivery.last_status_code = status_code;
            delivery.last_error = Some(error.to_string());
        }
        Ok(())
    }

    async fn get_delivery(&self, id: Uuid) -> Result<Option<WebhookDelivery>, DatabaseError> {
        Ok(self.tables.lock().await.deliveries.get(&id).cloned())
    }

    async fn list_deliveries_for_endpoint(
        &self,
        endpoint_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<WebhookDelivery>, DatabaseError> {
        let tables = self.tables.lock().await;
        let mut deliveries: Vec<WebhookDelivery> = tables
            .deliveries
            .values()
            .filter(|d| d.endpoint_id == Some(endpoint_id))
            .cloned()
            .collect();
        deliveries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(deliveries
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn requeue_delivery(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let mut tables = self.tables.lock().await;
        match tables.deliveries.get_mut(&id) {
            Some(delivery) if delivery.status != DeliveryStatus::Delivered => {
                delivery.status = DeliveryStatus::Pending;
                delivery.next_retry_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
