//! Webhook delivery subsystem.
//!
//! Terminal job transitions enqueue one persisted delivery row per
//! matching endpoint (plus one for a legacy per-job URL override); the
//! delivery worker claims due rows under `FOR UPDATE SKIP LOCKED` and
//! POSTs signed payloads with a fixed backoff ladder.

pub mod signer;
mod worker;

use crate::db::Database;
use crate::error::DatabaseError;
use crate::model::{Job, WebhookDelivery};

pub use worker::{DeliveryWorker, MAX_ATTEMPTS};

/// Build the payload body sent for a job event.
pub fn job_event_payload(job: &Job, event_type: &str) -> serde_json::Value {
    serde_json::json!({
        "event": event_type,
        "job": {
            "id": job.id,
            "status": job.status,
            "error": job.error,
            "transcript": job.transcript_blob,
            "created_at": job.created_at,
            "completed_at": job.completed_at,
        },
        "metadata": job.params.webhook_metadata,
    })
}

/// Queue deliveries for a job's terminal event: one row per subscribed
/// active endpoint of the tenant, plus a legacy row when the job carries
/// a per-job URL override. Returns the number of rows inserted.
///
/// Duplicate-safe: the store ignores rows that already exist for
/// `(job, event, endpoint)`, so replayed bus events do not fan out twice.
pub async fn enqueue_job_event(
    db: &dyn Database,
    job: &Job,
    event_type: &str,
) -> Result<usize, DatabaseError> {
    let payload = job_event_payload(job, event_type);

    let mut deliveries = Vec::new();
    for endpoint in db.list_endpoints(&job.tenant_id).await? {
        if endpoint.active && endpoint.subscribes_to(event_type) {
            deliveries.push(WebhookDelivery::for_endpoint(
                endpoint.id,
                job.id,
                event_type,
                payload.clone(),
            ));
        }
    }
    if let Some(url) = &job.params.webhook_url {
        deliveries.push(WebhookDelivery::for_url(
            url.clone(),
            job.id,
            event_type,
            payload.clone(),
        ));
    }

    if !deliveries.is_empty() {
        db.insert_deliveries(&deliveries).await?;
        tracing::info!(
            job_id = %job.id,
            event_type = %event_type,
            count = deliveries.len(),
            "Webhook deliveries enqueued"
        );
    }
    Ok(deliveries.len())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use uuid::Uuid;

    use super::*;
    use crate::db::MemoryDb;
    use crate::model::{JobParams, WebhookEndpoint};

    fn job_with_webhook(url: Option<&str>) -> Job {
        Job::new(
            "acme",
            "blob:a",
            JobParams {
                model: "fast".to_string(),
                language: None,
                word_timestamps: false,
                speaker_detection: false,
                llm_cleanup: false,
                webhook_url: url.map(String::from),
                webhook_metadata: Some(serde_json::json!({"order": 42})),
            },
        )
    }

    #[tokio::test]
    async fn enqueues_for_matching_endpoints_and_legacy_url() {
        let db = Arc::new(MemoryDb::new());
        let subscribed = WebhookEndpoint::new(
            "acme",
            "https://example.com/completed",
            vec!["transcription.completed".to_string()],
        );
        let wildcard =
            WebhookEndpoint::new("acme", "https://example.com/all", vec!["*".to_string()]);
        let other_event = WebhookEndpoint::new(
            "acme",
            "https://example.com/failed-only",
            vec!["transcription.failed".to_string()],
        );
        let other_tenant =
            WebhookEndpoint::new("globex", "https://example.com/x", vec!["*".to_string()]);
        for endpoint in [&subscribed, &wildcard, &other_event, &other_tenant] {
            db.create_endpoint(endpoint).await.unwrap();
        }

        let job = job_with_webhook(Some("https://legacy.example.com/hook"));
        let count = enqueue_job_event(db.as_ref(), &job, "transcription.completed")
            .await
            .unwrap();
        // Two matching endpoints + legacy URL.
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn inactive_endpoints_are_skipped() {
        let db = Arc::new(MemoryDb::new());
        let mut endpoint =
            WebhookEndpoint::new("acme", "https://example.com/all", vec!["*".to_string()]);
        endpoint.active = false;
        db.create_endpoint(&endpoint).await.unwrap();

        let job = job_with_webhook(None);
        let count = enqueue_job_event(db.as_ref(), &job, "transcription.completed")
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn payload_echoes_client_metadata() {
        let job = job_with_webhook(None);
        let payload = job_event_payload(&job, "transcription.completed");
        assert_eq!(payload["event"], "transcription.completed");
        assert_eq!(payload["metadata"]["order"], 42);
        assert_eq!(payload["job"]["id"], job.id.to_string());
        let _ = Uuid::parse_str(payload["job"]["id"].as_str().unwrap()).unwrap();
    }
}
