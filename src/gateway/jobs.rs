//! Batch transcription endpoints.

use axum::extract::{Multipart, Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::ApiError;
use crate::gateway::auth::Tenant;
use crate::gateway::export::{self, ExportFormat};
use crate::gateway::AppState;
use crate::model::{Event, Job, JobParams, JobStatus, Segment, Transcript};

#[derive(Debug, Serialize)]
pub struct JobCreatedResponse {
    pub id: Uuid,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct JobView {
    pub id: Uuid,
    pub status: JobStatus,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segments: Option<Vec<Segment>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// POST /v1/audio/transcriptions — create a job from a multipart upload.
pub async fn create(
    State(state): State<AppState>,
    Extension(Tenant(tenant)): Extension<Tenant>,
    mut multipart: Multipart,
) -> Result<Json<JobCreatedResponse>, ApiError> {
    let mut file: Option<Vec<u8>> = None;
    let mut params = JobParams {
        model: "fast".to_string(),
        language: None,
        word_timestamps: false,
        speaker_detection: false,
        llm_cleanup: false,
        webhook_url: None,
        webhook_metadata: None,
    };

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::InvalidRequest(format!("malformed multipart body: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::InvalidRequest(format!("failed to read file: {}", e)))?;
                file = Some(bytes.to_vec());
            }
            "model" => params.model = text_field(field).await?,
            "language" => params.language = Some(text_field(field).await?),
            "word_timestamps" => params.word_timestamps = parse_bool(&text_field(field).await?),
            "speaker_detection" => {
                params.speaker_detection = parse_bool(&text_field(field).await?)
            }
            "llm_cleanup" => params.llm_cleanup = parse_bool(&text_field(field).await?),
            "webhook_url" => {
                let url = text_field(field).await?;
                if !url.starts_with("http://") && !url.starts_with("https://") {
                    return Err(ApiError::InvalidRequest(
                        "webhook_url must be an http(s) URL".to_string(),
                    ));
                }
                params.webhook_url = Some(url);
            }
            "webhook_metadata" => {
                let raw = text_field(field).await?;
                if raw.len() > state.config.webhook_metadata_max_size {
                    return Err(ApiError::InvalidRequest(format!(
                        "webhook_metadata exceeds {} bytes",
                        state.config.webhook_metadata_max_size
                    )));
                }
                params.webhook_metadata = Some(serde_json::from_str(&raw).map_err(|e| {
                    ApiError::InvalidRequest(format!("webhook_metadata is not valid JSON: {}", e))
                })?);
            }
            other => {
                tracing::debug!(field = %other, "Ignoring unknown form field");
            }
        }
    }

    let Some(file) = file else {
        return Err(ApiError::InvalidRequest("missing 'file' field".to_string()));
    };
    if file.is_empty() {
        return Err(ApiError::InvalidRequest("uploaded file is empty".to_string()));
    }

    let audio_blob = state.blobs.put(&file).await?;
    let job = Job::new(tenant, audio_blob, params);
    state.db.create_job(&job).await?;
    state.bus.publish(&Event::JobCreated { job_id: job.id }).await?;

    tracing::info!(job_id = %job.id, model = %job.params.model, "Job submitted");
    Ok(Json(JobCreatedResponse {
        id: job.id,
        status: job.status,
        created_at: job.created_at,
    }))
}

/// GET /v1/audio/transcriptions/{job_id}
pub async fn get(
    State(state): State<AppState>,
    Extension(Tenant(tenant)): Extension<Tenant>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobView>, ApiError> {
    let job = load_tenant_job(&state, &tenant, job_id).await?;

    let mut view = JobView {
        id: job.id,
        status: job.status,
        model: job.params.model.clone(),
        language: job.params.language.clone(),
        error: job.error.clone(),
        text: None,
        segments: None,
        duration: None,
        created_at: job.created_at,
        completed_at: job.completed_at,
    };

    if job.status == JobStatus::Completed {
        if let Some(reference) = &job.transcript_blob {
            let transcript = load_transcript(&state, reference).await?;
            view.language = transcript.language.clone().or(view.language);
            view.text = Some(transcript.text);
            view.segments = Some(transcript.segments);
            view.duration = Some(transcript.duration);
        }
    }

    Ok(Json(view))
}

/// POST /v1/audio/transcriptions/{job_id}/cancel — request soft cancel.
pub async fn cancel(
    State(state): State<AppState>,
    Extension(Tenant(tenant)): Extension<Tenant>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let job = load_tenant_job(&state, &tenant, job_id).await?;

    if job.status.is_terminal() {
        return Err(ApiError::Conflict(format!(
            "job is already {}",
            job.status
        )));
    }

    state
        .bus
        .publish(&Event::JobCancelRequested { job_id })
        .await?;

    // The orchestrator owns the transition; the client observes
    // `cancelling` until the drain settles.
    Ok(Json(
        serde_json::json!({ "id": job_id, "status": JobStatus::Cancelling }),
    ))
}

/// GET /v1/audio/transcriptions/{job_id}/export/{format}
pub async fn export(
    State(state): State<AppState>,
    Extension(Tenant(tenant)): Extension<Tenant>,
    Path((job_id, format)): Path<(Uuid, String)>,
) -> Result<Response, ApiError> {
    let format = ExportFormat::parse(&format)
        .ok_or_else(|| ApiError::InvalidRequest(format!("unsupported format '{}'", format)))?;

    let job = load_tenant_job(&state, &tenant, job_id).await?;
    if job.status != JobStatus::Completed {
        return Err(ApiError::InvalidRequest(format!(
            "job is {}, transcript not available",
            job.status
        )));
    }
    let Some(reference) = &job.transcript_blob else {
        return Err(ApiError::Internal(format!(
            "completed job {} has no transcript blob",
            job_id
        )));
    };

    let transcript = load_transcript(&state, reference).await?;
    let body = export::render(&transcript, format)
        .map_err(|e| ApiError::Internal(format!("export render failed: {}", e)))?;

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, format.content_type())],
        body,
    )
        .into_response())
}

async fn load_tenant_job(state: &AppState, tenant: &str, job_id: Uuid) -> Result<Job, ApiError> {
    let job = state
        .db
        .get_job(job_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Job {} not found", job_id)))?;
    if job.tenant_id != tenant {
        // Do not leak other tenants' job ids.
        return Err(ApiError::NotFound(format!("Job {} not found", job_id)));
    }
    Ok(job)
}

async fn load_transcript(state: &AppState, reference: &str) -> Result<Transcript, ApiError> {
    let bytes = state.blobs.get(reference).await?;
    serde_json::from_slice(&bytes)
        .map_err(|e| ApiError::Internal(format!("corrupt transcript blob {}: {}", reference, e)))
}

async fn text_field(field: axum::extract::multipart::Field<'_>) -> Result<String, ApiError> {
    field
        .text()
        .await
        .map_err(|e| ApiError::InvalidRequest(format!("malformed form field: {}", e)))
}

fn parse_bool(raw: &str) -> bool {
    matches!(raw.trim(), "true" | "1" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_fields_accept_common_truthy_values() {
        for raw in ["true", "1", "yes", "on", " true "] {
            assert!(parse_bool(raw), "{raw}");
        }
        for raw in ["false", "0", "", "no"] {
            assert!(!parse_bool(raw), "{raw}");
        }
    }
}
