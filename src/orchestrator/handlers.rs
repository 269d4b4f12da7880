//! Orchestrator event handlers: the job/task state machine.
//!
//! Every handler is idempotent on `(id, event type)` — bus delivery is
//! at-least-once — and a handler error never takes the loop down: the
//! dispatcher logs it, marks the affected job failed if state permits,
//! and keeps consuming.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::watch;
use uuid::Uuid;

use crate::bus::Bus;
use crate::db::Database;
use crate::error::OrchestrateError;
use crate::model::{AudioMetadata, Event, Job, JobStatus, Stage, Task, TaskStatus};
use crate::orchestrator::{DagBuilder, TaskScheduler};
use crate::registry::{EngineRegistry, ModelCatalog};
use crate::webhook;

/// The orchestrator service: subscribes to bus events and drives jobs
/// from `pending` to a terminal state.
pub struct Orchestrator {
    db: Arc<dyn Database>,
    bus: Arc<dyn Bus>,
    builder: DagBuilder,
    scheduler: TaskScheduler,
}

impl Orchestrator {
    pub fn new(db: Arc<dyn Database>, bus: Arc<dyn Bus>) -> Self {
        let registry = EngineRegistry::new(bus.clone());
        let catalog = ModelCatalog::new(registry.clone());
        let builder = DagBuilder::new(registry.clone(), catalog);
        let scheduler = TaskScheduler::new(bus.clone(), db.clone(), registry);
        Self {
            db,
            bus,
            builder,
            scheduler,
        }
    }

    /// Consume bus events until shutdown. Within one orchestrator
    /// instance events are processed sequentially, which keeps per-job
    /// handling ordered.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<(), OrchestrateError> {
        let events = self.bus.subscribe().await?;
        tracing::info!("Orchestrator subscribed to bus events");
        self.run_with(events, shutdown).await
    }

    /// Subscribe first, then hand the loop to a background task.
    /// Publications after this returns are guaranteed to be seen.
    pub async fn spawn(
        self,
        shutdown: watch::Receiver<bool>,
    ) -> Result<tokio::task::JoinHandle<()>, OrchestrateError> {
        let events = self.bus.subscribe().await?;
        tracing::info!("Orchestrator subscribed to bus events");
        Ok(tokio::spawn(async move {
            let _ = self.run_with(events, shutdown).await;
        }))
    }

    async fn run_with(
        &self,
        mut events: crate::bus::EventStream,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), OrchestrateError> {
        loop {
            tokio::select! {
                maybe_event = events.next() => {
                    match maybe_event {
                        Some(event) => self.dispatch(event).await,
                        None => {
                            tracing::warn!("Bus event stream closed");
                            return Ok(());
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("Orchestrator shutting down");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Handle one event, quarantining failures.
    pub async fn dispatch(&self, event: Event) {
        if let Err(e) = self.handle_event(&event).await {
            tracing::error!(event = event.type_name(), "Handler failed: {}", e);
            self.quarantine(&event, &e).await;
        }
    }

    pub async fn handle_event(&self, event: &Event) -> Result<(), OrchestrateError> {
        match event {
            Event::JobCreated { job_id } => self.handle_job_created(*job_id).await,
            Event::TaskCompleted { task_id, output } => {
                self.handle_task_completed(*task_id, output.as_deref()).await
            }
            Event::TaskFailed { task_id, error } => {
                self.handle_task_failed(*task_id, error).await
            }
            Event::JobCancelRequested { job_id } => {
                self.handle_job_cancel_requested(*job_id).await
            }
            Event::JobCompleted { job_id }
            | Event::JobFailed { job_id }
            | Event::JobCancelled { job_id } => self.handle_job_terminal(*job_id).await,
            // Session lifecycle is the router's concern.
            Event::SessionStarted { .. } | Event::SessionEnded { .. } => Ok(()),
        }
    }

    /// Build the DAG, persist tasks, and queue the roots.
    pub async fn handle_job_created(&self, job_id: Uuid) -> Result<(), OrchestrateError> {
        let Some(job) = self.db.get_job(job_id).await? else {
            tracing::warn!(job_id = %job_id, "job.created for unknown job");
            return Ok(());
        };

        match job.status {
            JobStatus::Pending => {}
            // Cancel slipped in between submit and this handler.
            JobStatus::Cancelling | JobStatus::Cancelled => {
                let _ = self
                    .db
                    .try_transition_job(job_id, &[JobStatus::Cancelling], JobStatus::Cancelled, None)
                    .await?;
                self.bus.publish(&Event::JobCancelled { job_id }).await?;
                return Ok(());
            }
            // Replayed event; the job is already on its way.
            _ => return Ok(()),
        }

        let tasks = match self.builder.build(&job).await {
            Ok(tasks) => tasks,
            Err(
                e @ (OrchestrateError::EngineUnavailable { .. }
                | OrchestrateError::InvalidPipelineConfig { .. }),
            ) => {
                self.fail_job(job_id, &e.to_string()).await?;
                return Ok(());
            }
            Err(other) => return Err(other),
        };

        self.db.insert_tasks(&tasks).await?;
        self.db
            .try_transition_job(job_id, &[JobStatus::Pending], JobStatus::Running, None)
            .await?;

        // Pre-queue guard: a cancel may have landed while we were
        // building. Nothing has been queued yet, so drain immediately.
        if let Some(job) = self.db.get_job(job_id).await? {
            if matches!(job.status, JobStatus::Cancelling | JobStatus::Cancelled) {
                for task in &tasks {
                    let _ = self
                        .db
                        .try_transition_task(task.id, &[TaskStatus::Pending], TaskStatus::Cancelled)
                        .await?;
                }
                self.finish_cancel_if_drained(job_id).await?;
                return Ok(());
            }
        }

        let audio = AudioMetadata {
            blob: job.audio_blob.clone(),
            ..Default::default()
        };
        for task in tasks.iter().filter(|t| t.depends_on.is_empty()) {
            match self.scheduler.queue_task(task, HashMap::new(), audio.clone()).await {
                Ok(()) => {}
                Err(e @ OrchestrateError::EngineUnavailable { .. }) => {
                    self.fail_job(job_id, &e.to_string()).await?;
                    return Ok(());
                }
                Err(other) => return Err(other),
            }
        }

        tracing::info!(job_id = %job_id, tasks = tasks.len(), "Job pipeline started");
        Ok(())
    }

    /// Record a task's completion and advance the pipeline.
    pub async fn handle_task_completed(
        &self,
        task_id: Uuid,
        output: Option<&str>,
    ) -> Result<(), OrchestrateError> {
        let Some(task) = self.db.get_task(task_id).await? else {
            tracing::warn!(task_id = %task_id, "task.completed for unknown task");
            return Ok(());
        };
        let Some(job) = self.db.get_job(task.job_id).await? else {
            return Err(OrchestrateError::JobNotFound(task.job_id));
        };

        // Cancel drain: the task finished its work, record that and see
        // whether the job can settle.
        if matches!(job.status, JobStatus::Cancelling | JobStatus::Cancelled) {
            let _ = self.db.complete_task(task_id, output).await?;
            self.finish_cancel_if_drained(job.id).await?;
            return Ok(());
        }
        // Job already settled (failed while this task was in flight, or
        // replayed event on a completed job): bookkeeping only.
        if job.status.is_terminal() {
            let _ = self.db.complete_task(task_id, output).await?;
            return Ok(());
        }

        let changed = self.db.complete_task(task_id, output).await?;
        if !changed {
            tracing::debug!(task_id = %task_id, "Replayed task.completed, no-op");
            return Ok(());
        }

        let tasks = self.db.tasks_for_job(job.id).await?;
        if tasks.iter().all(|t| t.status == TaskStatus::Completed) {
            self.complete_job(&job, &tasks).await?;
            return Ok(());
        }

        // Queue every downstream task whose dependencies are now all
        // satisfied.
        let completed: HashMap<Uuid, Option<String>> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .map(|t| (t.id, t.output.clone()))
            .collect();
        let audio = AudioMetadata {
            blob: job.audio_blob.clone(),
            ..Default::default()
        };
        for downstream in tasks.iter().filter(|t| {
            t.status == TaskStatus::Pending
                && t.depends_on.iter().all(|dep| completed.contains_key(dep))
        }) {
            let inputs: HashMap<Uuid, String> = downstream
                .depends_on
                .iter()
                .filter_map(|dep| {
                    completed
                        .get(dep)
                        .and_then(|output| output.clone())
                        .map(|output| (*dep, output))
                })
                .collect();
            match self
                .scheduler
                .queue_task(downstream, inputs, audio.clone())
                .await
            {
                Ok(()) => {}
                Err(e @ OrchestrateError::EngineUnavailable { .. }) => {
                    self.fail_job(job.id, &e.to_string()).await?;
                    return Ok(());
                }
                Err(other) => return Err(other),
            }
        }

        Ok(())
    }

    /// A task failed in its engine: the job fails with it.
    pub async fn handle_task_failed(
        &self,
        task_id: Uuid,
        error: &str,
    ) -> Result<(), OrchestrateError> {
        let Some(task) = self.db.get_task(task_id).await? else {
            tracing::warn!(task_id = %task_id, "task.failed for unknown task");
            return Ok(());
        };
        let _ = self.db.fail_task(task_id, error).await?;

        let Some(job) = self.db.get_job(task.job_id).await? else {
            return Err(OrchestrateError::JobNotFound(task.job_id));
        };
        if matches!(job.status, JobStatus::Cancelling) {
            // Failure during drain still counts as terminal.
            self.finish_cancel_if_drained(job.id).await?;
            return Ok(());
        }
        if job.status.is_terminal() {
            return Ok(());
        }

        self.fail_job(job.id, &format!("Task '{}' failed: {}", task.stage, error))
            .await
    }

    /// Soft cancel: stop future queueing, scrub anything not yet
    /// claimed, let running work drain.
    pub async fn handle_job_cancel_requested(&self, job_id: Uuid) -> Result<(), OrchestrateError> {
        let Some(job) = self.db.get_job(job_id).await? else {
            tracing::warn!(job_id = %job_id, "job.cancel_requested for unknown job");
            return Ok(());
        };
        if job.status.is_terminal() {
            tracing::debug!(job_id = %job_id, status = %job.status, "Cancel of settled job, no-op");
            return Ok(());
        }

        let _ = self
            .db
            .try_transition_job(
                job_id,
                &[JobStatus::Pending, JobStatus::Running],
                JobStatus::Cancelling,
                None,
            )
            .await?;

        for task in self.db.tasks_for_job(job_id).await? {
            match task.status {
                TaskStatus::Ready => {
                    let _ = self.scheduler.remove_task_from_queue(&task).await?;
                    let _ = self
                        .db
                        .try_transition_task(task.id, &[TaskStatus::Ready], TaskStatus::Cancelled)
                        .await?;
                }
                TaskStatus::Pending => {
                    let _ = self
                        .db
                        .try_transition_task(task.id, &[TaskStatus::Pending], TaskStatus::Cancelled)
                        .await?;
                }
                // Running tasks finish naturally; terminal ones stay.
                _ => {}
            }
        }

        self.finish_cancel_if_drained(job_id).await?;
        Ok(())
    }

    /// Terminal transition observed: fan out webhooks.
    pub async fn handle_job_terminal(&self, job_id: Uuid) -> Result<(), OrchestrateError> {
        let Some(job) = self.db.get_job(job_id).await? else {
            tracing::warn!(job_id = %job_id, "terminal event for unknown job");
            return Ok(());
        };
        let Some(event_type) = job.status.webhook_event() else {
            tracing::debug!(job_id = %job_id, status = %job.status, "Terminal event for non-terminal job, skipping");
            return Ok(());
        };
        webhook::enqueue_job_event(self.db.as_ref(), &job, event_type).await?;
        Ok(())
    }

    // --- Internals ---

    /// Settle a fully-completed pipeline: adopt the merge output as the
    /// job transcript and publish completion.
    async fn complete_job(&self, job: &Job, tasks: &[Task]) -> Result<(), OrchestrateError> {
        let transcript = tasks
            .iter()
            .find(|t| t.stage == Stage::Merge)
            .and_then(|t| t.output.clone())
            .or_else(|| tasks.last().and_then(|t| t.output.clone()));
        if let Some(transcript) = &transcript {
            self.db.set_job_transcript(job.id, transcript).await?;
        }

        let won = self
            .db
            .try_transition_job(job.id, &[JobStatus::Running], JobStatus::Completed, None)
            .await?;
        if won {
            tracing::info!(job_id = %job.id, "Job completed");
            self.bus.publish(&Event::JobCompleted { job_id: job.id }).await?;
        }
        Ok(())
    }

    /// Fail the job (if state permits), skip everything that has not
    /// started, and publish the failure.
    async fn fail_job(&self, job_id: Uuid, error: &str) -> Result<(), OrchestrateError> {
        let won = self
            .db
            .try_transition_job(
                job_id,
                &[JobStatus::Pending, JobStatus::Running, JobStatus::Cancelling],
                JobStatus::Failed,
                Some(error),
            )
            .await?;
        if !won {
            return Ok(());
        }

        for task in self.db.tasks_for_job(job_id).await? {
            match task.status {
                TaskStatus::Ready => {
                    let _ = self.scheduler.remove_task_from_queue(&task).await?;
                    let _ = self
                        .db
                        .try_transition_task(task.id, &[TaskStatus::Ready], TaskStatus::Skipped)
                        .await?;
                }
                TaskStatus::Pending => {
                    let _ = self
                        .db
                        .try_transition_task(task.id, &[TaskStatus::Pending], TaskStatus::Skipped)
                        .await?;
                }
                _ => {}
            }
        }

        tracing::warn!(job_id = %job_id, error = %error, "Job failed");
        self.bus.publish(&Event::JobFailed { job_id }).await?;
        Ok(())
    }

    /// If nothing non-terminal remains, settle a cancelling job.
    async fn finish_cancel_if_drained(&self, job_id: Uuid) -> Result<(), OrchestrateError> {
        let tasks = self.db.tasks_for_job(job_id).await?;
        if tasks.iter().any(|t| !t.status.is_terminal()) {
            return Ok(());
        }
        let won = self
            .db
            .try_transition_job(job_id, &[JobStatus::Cancelling], JobStatus::Cancelled, None)
            .await?;
        if won {
            tracing::info!(job_id = %job_id, "Job cancelled");
            self.bus.publish(&Event::JobCancelled { job_id }).await?;
        }
        Ok(())
    }

    /// Last-resort containment for a handler error.
    async fn quarantine(&self, event: &Event, error: &OrchestrateError) {
        let job_id = match event {
            Event::JobCreated { job_id } | Event::JobCancelRequested { job_id } => Some(*job_id),
            Event::TaskCompleted { task_id, .. } | Event::TaskFailed { task_id, .. } => self
                .db
                .get_task(*task_id)
                .await
                .ok()
                .flatten()
                .map(|t| t.job_id),
            _ => None,
        };
        let Some(job_id) = job_id else { return };
        if let Err(e) = self
            .fail_job(job_id, &format!("orchestrator error: {}", error))
            .await
        {
            tracing::error!(job_id = %job_id, "Failed to quarantine job: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::db::MemoryDb;
    use crate::model::{EngineRegistration, JobParams, WebhookEndpoint};

    struct Harness {
        orchestrator: Orchestrator,
        db: Arc<MemoryDb>,
        bus: Arc<MemoryBus>,
        registry: EngineRegistry,
    }

    async fn harness() -> Harness {
        let db = Arc::new(MemoryDb::new());
        let bus = Arc::new(MemoryBus::new());
        let registry = EngineRegistry::new(bus.clone());
        for reg in [
            EngineRegistration::new("ffmpeg", Stage::Prepare),
            EngineRegistration::new("faster-whisper", Stage::Transcribe).with_model("fast", "base"),
            EngineRegistration::new("whisper-align", Stage::Align),
            EngineRegistration::new("merge", Stage::Merge),
        ] {
            registry.register(&reg).await.unwrap();
        }
        Harness {
            orchestrator: Orchestrator::new(db.clone(), bus.clone()),
            db,
            bus,
            registry,
        }
    }

    fn params() -> JobParams {
        JobParams {
            model: "fast".to_string(),
            language: None,
            word_timestamps: false,
            speaker_detection: false,
            llm_cleanup: false,
            webhook_url: None,
            webhook_metadata: None,
        }
    }

    async fn submit(h: &Harness) -> Job {
        let job = Job::new("acme", "blob:audio", params());
        h.db.create_job(&job).await.unwrap();
        h.orchestrator.handle_job_created(job.id).await.unwrap();
        h.db.get_job(job.id).await.unwrap().unwrap()
    }

    fn task_by_stage(tasks: &[Task], stage: Stage) -> &Task {
        tasks.iter().find(|t| t.stage == stage).unwrap()
    }

    /// Drive one task through claim + completion the way a worker would.
    async fn worker_completes(h: &Harness, task: &Task, output: &str) {
        assert!(
            h.db.try_transition_task(task.id, &[TaskStatus::Ready], TaskStatus::Running)
                .await
                .unwrap(),
            "task should be claimable"
        );
        h.orchestrator
            .handle_task_completed(task.id, Some(output))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn job_created_builds_dag_and_queues_root() {
        let h = harness().await;
        let job = submit(&h).await;

        assert_eq!(job.status, JobStatus::Running);
        let tasks = h.db.tasks_for_job(job.id).await.unwrap();
        assert_eq!(tasks.len(), 3);
        assert_eq!(task_by_stage(&tasks, Stage::Prepare).status, TaskStatus::Ready);
        assert_eq!(task_by_stage(&tasks, Stage::Transcribe).status, TaskStatus::Pending);
        assert_eq!(h.bus.queue_len("queue:ffmpeg").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn job_created_without_engine_fails_fast() {
        let h = harness().await;
        h.registry.unregister("faster-whisper").await.unwrap();

        let job = Job::new("acme", "blob:audio", params());
        h.db.create_job(&job).await.unwrap();
        h.orchestrator.handle_job_created(job.id).await.unwrap();

        let stored = h.db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(
            stored.error.as_deref(),
            Some("Engine 'faster-whisper' is not available.")
        );
    }

    #[tokio::test]
    async fn pipeline_runs_to_completion() {
        let h = harness().await;
        let job = submit(&h).await;
        let tasks = h.db.tasks_for_job(job.id).await.unwrap();

        worker_completes(&h, task_by_stage(&tasks, Stage::Prepare), "blob:prepared").await;

        // Transcribe became ready with the prepare output as input.
        let claimed = h
            .bus
            .claim_task("queue:faster-whisper", std::time::Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            claimed.inputs.get(&task_by_stage(&tasks, Stage::Prepare).id),
            Some(&"blob:prepared".to_string())
        );

        worker_completes(&h, task_by_stage(&tasks, Stage::Transcribe), "blob:raw").await;
        worker_completes(&h, task_by_stage(&tasks, Stage::Merge), "blob:transcript").await;

        let stored = h.db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.transcript_blob.as_deref(), Some("blob:transcript"));
        assert!(stored.completed_at.is_some());
    }

    #[tokio::test]
    async fn replayed_task_completed_does_not_requeue_downstream() {
        let h = harness().await;
        let job = submit(&h).await;
        let tasks = h.db.tasks_for_job(job.id).await.unwrap();
        let prepare = task_by_stage(&tasks, Stage::Prepare);

        worker_completes(&h, prepare, "blob:prepared").await;
        assert_eq!(h.bus.queue_len("queue:faster-whisper").await.unwrap(), 1);

        // Second delivery of the same event.
        h.orchestrator
            .handle_task_completed(prepare.id, Some("blob:prepared"))
            .await
            .unwrap();
        assert_eq!(h.bus.queue_len("queue:faster-whisper").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn task_failure_fails_job_and_skips_rest() {
        let h = harness().await;
        let job = submit(&h).await;
        let tasks = h.db.tasks_for_job(job.id).await.unwrap();
        let prepare = task_by_stage(&tasks, Stage::Prepare);

        h.db.try_transition_task(prepare.id, &[TaskStatus::Ready], TaskStatus::Running)
            .await
            .unwrap();
        h.orchestrator
            .handle_task_failed(prepare.id, "ffmpeg exited 1")
            .await
            .unwrap();

        let stored = h.db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert!(stored.error.unwrap().contains("ffmpeg exited 1"));

        let tasks = h.db.tasks_for_job(job.id).await.unwrap();
        assert_eq!(task_by_stage(&tasks, Stage::Prepare).status, TaskStatus::Failed);
        assert_eq!(task_by_stage(&tasks, Stage::Transcribe).status, TaskStatus::Skipped);
        assert_eq!(task_by_stage(&tasks, Stage::Merge).status, TaskStatus::Skipped);
    }

    #[tokio::test]
    async fn cancel_scrubs_queue_and_drains_running_work() {
        let h = harness().await;
        let job = submit(&h).await;
        let tasks = h.db.tasks_for_job(job.id).await.unwrap();
        let prepare = task_by_stage(&tasks, Stage::Prepare);

        // Worker claims prepare before the cancel lands.
        h.db.try_transition_task(prepare.id, &[TaskStatus::Ready], TaskStatus::Running)
            .await
            .unwrap();
        let _ = h
            .bus
            .claim_task("queue:ffmpeg", std::time::Duration::from_millis(10))
            .await
            .unwrap();

        h.orchestrator
            .handle_job_cancel_requested(job.id)
            .await
            .unwrap();

        let stored = h.db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Cancelling);
        let tasks = h.db.tasks_for_job(job.id).await.unwrap();
        assert_eq!(task_by_stage(&tasks, Stage::Transcribe).status, TaskStatus::Cancelled);
        assert_eq!(task_by_stage(&tasks, Stage::Merge).status, TaskStatus::Cancelled);

        // The running task drains; the job settles as cancelled.
        h.orchestrator
            .handle_task_completed(prepare.id, Some("blob:prepared"))
            .await
            .unwrap();
        let stored = h.db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn cancel_with_nothing_started_settles_immediately() {
        let h = harness().await;
        let job = Job::new("acme", "blob:audio", params());
        h.db.create_job(&job).await.unwrap();

        h.orchestrator
            .handle_job_cancel_requested(job.id)
            .await
            .unwrap();
        let stored = h.db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Cancelled);

        // The late-arriving job.created sees the cancel and does not
        // start the pipeline.
        h.orchestrator.handle_job_created(job.id).await.unwrap();
        assert!(h.db.tasks_for_job(job.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancel_of_terminal_job_changes_nothing() {
        let h = harness().await;
        let job = submit(&h).await;
        let tasks = h.db.tasks_for_job(job.id).await.unwrap();
        for stage in [Stage::Prepare, Stage::Transcribe, Stage::Merge] {
            worker_completes(&h, task_by_stage(&tasks, stage), "blob:x").await;
        }
        let before = h.db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(before.status, JobStatus::Completed);

        h.orchestrator
            .handle_job_cancel_requested(job.id)
            .await
            .unwrap();
        let after = h.db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(after.status, JobStatus::Completed);
        assert_eq!(after.updated_at, before.updated_at);
    }

    #[tokio::test]
    async fn terminal_event_enqueues_webhook_rows() {
        let h = harness().await;
        let endpoint = WebhookEndpoint::new("acme", "https://example.com/hook", vec!["*".into()]);
        h.db.create_endpoint(&endpoint).await.unwrap();

        let job = submit(&h).await;
        let tasks = h.db.tasks_for_job(job.id).await.unwrap();
        for stage in [Stage::Prepare, Stage::Transcribe, Stage::Merge] {
            worker_completes(&h, task_by_stage(&tasks, stage), "blob:x").await;
        }

        h.orchestrator.handle_job_terminal(job.id).await.unwrap();
        let deliveries = h
            .db
            .list_deliveries_for_endpoint(endpoint.id, 10, 0)
            .await
            .unwrap();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].event_type, "transcription.completed");

        // Replayed terminal event does not fan out twice.
        h.orchestrator.handle_job_terminal(job.id).await.unwrap();
        let deliveries = h
            .db
            .list_deliveries_for_endpoint(endpoint.id, 10, 0)
            .await
            .unwrap();
        assert_eq!(deliveries.len(), 1);
    }
}
