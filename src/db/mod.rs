//! Database abstraction layer.
//!
//! The relational store is authoritative for audit-grade history: jobs,
//! tasks, realtime sessions, webhook endpoints, and deliveries. The
//! race-sensitive mutations are expressed as conditional transitions
//! (`try_transition_*`) so concurrent handlers resolve to exactly one
//! winner on the row itself.

mod memory;
mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::model::{
    Job, JobStatus, RealtimeSession, Task, TaskStatus, WebhookDelivery, WebhookEndpoint,
};

pub use memory::MemoryDb;
pub use postgres::PgStore;

#[async_trait]
pub trait Database: Send + Sync {
    // --- Jobs ---

    async fn create_job(&self, job: &Job) -> Result<(), DatabaseError>;

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError>;

    /// Move a job from any of `from` to `to`, recording `error` if given.
    /// Returns `false` (no write) when the row is not in a `from` state —
    /// the loser of a transition race observes this.
    async fn try_transition_job(
        &self,
        id: Uuid,
        from: &[JobStatus],
        to: JobStatus,
        error: Option<&str>,
    ) -> Result<bool, DatabaseError>;

    async fn set_job_transcript(&self, id: Uuid, blob: &str) -> Result<(), DatabaseError>;

    // --- Tasks ---

    async fn insert_tasks(&self, tasks: &[Task]) -> Result<(), DatabaseError>;

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError>;

    async fn tasks_for_job(&self, job_id: Uuid) -> Result<Vec<Task>, DatabaseError>;

    /// Conditional task transition; same contract as the job variant.
    async fn try_transition_task(
        &self,
        id: Uuid,
        from: &[TaskStatus],
        to: TaskStatus,
    ) -> Result<bool, DatabaseError>;

    /// Mark a task completed and store its output reference. Returns
    /// `false` when the task was already terminal (replayed event).
    async fn complete_task(&self, id: Uuid, output: Option<&str>) -> Result<bool, DatabaseError>;

    /// Mark a task failed with an error. Returns `false` when already
    /// terminal.
    async fn fail_task(&self, id: Uuid, error: &str) -> Result<bool, DatabaseError>;

    async fn increment_task_attempts(&self, id: Uuid) -> Result<(), DatabaseError>;

    // --- Realtime sessions ---

    /// Insert or update the session row.
    async fn save_session(&self, session: &RealtimeSession) -> Result<(), DatabaseError>;

    async fn get_session(&self, id: Uuid) -> Result<Option<RealtimeSession>, DatabaseError>;

    // --- Webhook endpoints ---

    async fn create_endpoint(&self, endpoint: &WebhookEndpoint) -> Result<(), DatabaseError>;

    async fn get_endpoint(&self, id: Uuid) -> Result<Option<WebhookEndpoint>, DatabaseError>;

    async fn list_endpoints(&self, tenant_id: &str) -> Result<Vec<WebhookEndpoint>, DatabaseError>;

    /// Full-row update (url, events, secret, active). Returns `false`
    /// for an unknown id.
    async fn update_endpoint(&self, endpoint: &WebhookEndpoint) -> Result<bool, DatabaseError>;

    async fn delete_endpoint(&self, id: Uuid, tenant_id: &str) -> Result<bool, DatabaseError>;

    // --- Webhook deliveries ---

    async fn insert_deliveries(&self, deliveries: &[WebhookDelivery]) -> Result<(), DatabaseError>;

    /// Claim up to `limit` due pending rows for delivery. The claim
    /// increments `attempts` in the same statement, and the returned
    /// rows reflect the incremented count. Backed by
    /// `FOR UPDATE SKIP LOCKED` so concurrent workers never double-claim
    /// and one bad endpoint cannot block the queue.
    async fn claim_due_deliveries(&self, limit: i64) -> Result<Vec<WebhookDelivery>, DatabaseError>;

    async fn mark_delivery_delivered(&self, id: Uuid, status_code: i32)
        -> Result<(), DatabaseError>;

    async fn mark_delivery_retry(
        &self,
        id: Uuid,
        next_retry_at: DateTime<Utc>,
        status_code: Option<i32>,
        error: &str,
    ) -> Result<(), DatabaseError>;

    async fn mark_delivery_failed(
        &self,
        id: Uuid,
        status_code: Option<i32>,
        error: &str,
    ) -> Result<(), DatabaseError>;

    async fn get_delivery(&self, id: Uuid) -> Result<Option<WebhookDelivery>, DatabaseError>;

    async fn list_deliveries_for_endpoint(
        &self,
        endpoint_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<WebhookDelivery>, DatabaseError>;

    /// Manual admin retry: put a failed (or stuck) delivery back in the
    /// pending queue with `next_retry_at = now`.
    async fn requeue_delivery(&self, id: Uuid) -> Result<bool, DatabaseError>;
}
