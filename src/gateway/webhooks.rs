//! Admin webhook-endpoint management.

use axum::extract::{Path, Query, State};
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ApiError;
use crate::gateway::auth::Tenant;
use crate::gateway::AppState;
use crate::model::{generate_secret, DeliveryStatus, WebhookDelivery, WebhookEndpoint};

const KNOWN_EVENTS: &[&str] = &[
    "*",
    "transcription.completed",
    "transcription.failed",
    "transcription.cancelled",
];

#[derive(Debug, Deserialize)]
pub struct CreateEndpointRequest {
    pub url: String,
    pub events: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateEndpointRequest {
    pub url: Option<String>,
    pub events: Option<Vec<String>>,
    pub active: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct EndpointView {
    pub id: Uuid,
    pub url: String,
    pub events: Vec<String>,
    /// Masked except on create and rotate.
    pub secret: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EndpointView {
    fn masked(endpoint: &WebhookEndpoint) -> Self {
        let tail = endpoint
            .secret
            .get(endpoint.secret.len().saturating_sub(4)..)
            .unwrap_or("");
        Self {
            id: endpoint.id,
            url: endpoint.url.clone(),
            events: endpoint.events.clone(),
            secret: format!("whsec_****{}", tail),
            active: endpoint.active,
            created_at: endpoint.created_at,
            updated_at: endpoint.updated_at,
        }
    }

    fn with_secret(endpoint: &WebhookEndpoint) -> Self {
        Self {
            secret: endpoint.secret.clone(),
            ..Self::masked(endpoint)
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DeliveryView {
    pub id: Uuid,
    pub job_id: Uuid,
    pub event_type: String,
    pub status: DeliveryStatus,
    pub attempts: i32,
    pub next_retry_at: DateTime<Utc>,
    pub last_status_code: Option<i32>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<WebhookDelivery> for DeliveryView {
    fn from(d: WebhookDelivery) -> Self {
        Self {
            id: d.id,
            job_id: d.job_id,
            event_type: d.event_type,
            status: d.status,
            attempts: d.attempts,
            next_retry_at: d.next_retry_at,
            last_status_code: d.last_status_code,
            last_error: d.last_error,
            created_at: d.created_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DeliveryPage {
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    50
}

fn validate_subscriptions(events: &[String]) -> Result<(), ApiError> {
    if events.is_empty() {
        return Err(ApiError::InvalidRequest(
            "at least one event subscription is required".to_string(),
        ));
    }
    for event in events {
        if !KNOWN_EVENTS.contains(&event.as_str()) {
            return Err(ApiError::InvalidRequest(format!(
                "unknown event type '{}'",
                event
            )));
        }
    }
    Ok(())
}

fn validate_url(url: &str) -> Result<(), ApiError> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(ApiError::InvalidRequest(
            "url must be an http(s) URL".to_string(),
        ))
    }
}

/// POST /v1/webhooks — register an endpoint. The full secret is only
/// returned here and on rotation.
pub async fn create(
    State(state): State<AppState>,
    Extension(Tenant(tenant)): Extension<Tenant>,
    Json(req): Json<CreateEndpointRequest>,
) -> Result<Json<EndpointView>, ApiError> {
    validate_url(&req.url)?;
    validate_subscriptions(&req.events)?;

    let endpoint = WebhookEndpoint::new(tenant, req.url, req.events);
    state.db.create_endpoint(&endpoint).await?;
    tracing::info!(endpoint_id = %endpoint.id, "Webhook endpoint registered");
    Ok(Json(EndpointView::with_secret(&endpoint)))
}

/// GET /v1/webhooks
pub async fn list(
    State(state): State<AppState>,
    Extension(Tenant(tenant)): Extension<Tenant>,
) -> Result<Json<Vec<EndpointView>>, ApiError> {
    let endpoints = state.db.list_endpoints(&tenant).await?;
    Ok(Json(endpoints.iter().map(EndpointView::masked).collect()))
}

/// GET /v1/webhooks/{id}
pub async fn get(
    State(state): State<AppState>,
    Extension(Tenant(tenant)): Extension<Tenant>,
    Path(id): Path<Uuid>,
) -> Result<Json<EndpointView>, ApiError> {
    let endpoint = load_tenant_endpoint(&state, &tenant, id).await?;
    Ok(Json(EndpointView::masked(&endpoint)))
}

/// PATCH /v1/webhooks/{id}
pub async fn update(
    State(state): State<AppState>,
    Extension(Tenant(tenant)): Extension<Tenant>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateEndpointRequest>,
) -> Result<Json<EndpointView>, ApiError> {
    let mut endpoint = load_tenant_endpoint(&state, &tenant, id).await?;

    if let Some(url) = req.url {
        validate_url(&url)?;
        endpoint.url = url;
    }
    if let Some(events) = req.events {
        validate_subscriptions(&events)?;
        endpoint.events = events;
    }
    if let Some(active) = req.active {
        endpoint.active = active;
    }

    state.db.update_endpoint(&endpoint).await?;
    Ok(Json(EndpointView::masked(&endpoint)))
}

/// DELETE /v1/webhooks/{id}
pub async fn delete(
    State(state): State<AppState>,
    Extension(Tenant(tenant)): Extension<Tenant>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let deleted = state.db.delete_endpoint(id, &tenant).await?;
    if !deleted {
        return Err(ApiError::NotFound(format!("Endpoint {} not found", id)));
    }
    Ok(Json(serde_json::json!({ "deleted": true })))
}

/// POST /v1/webhooks/{id}/rotate — mint a new signing secret. The old
/// secret stops verifying immediately.
pub async fn rotate_secret(
    State(state): State<AppState>,
    Extension(Tenant(tenant)): Extension<Tenant>,
    Path(id): Path<Uuid>,
) -> Result<Json<EndpointView>, ApiError> {
    let mut endpoint = load_tenant_endpoint(&state, &tenant, id).await?;
    endpoint.secret = generate_secret();
    state.db.update_endpoint(&endpoint).await?;
    tracing::info!(endpoint_id = %id, "Webhook secret rotated");
    Ok(Json(EndpointView::with_secret(&endpoint)))
}

/// GET /v1/webhooks/{id}/deliveries — paginated delivery log.
pub async fn deliveries(
    State(state): State<AppState>,
    Extension(Tenant(tenant)): Extension<Tenant>,
    Path(id): Path<Uuid>,
    Query(page): Query<DeliveryPage>,
) -> Result<Json<Vec<DeliveryView>>, ApiError> {
    let _ = load_tenant_endpoint(&state, &tenant, id).await?;
    let limit = page.limit.clamp(1, 200);
    let rows = state
        .db
        .list_deliveries_for_endpoint(id, limit, page.offset.max(0))
        .await?;
    Ok(Json(rows.into_iter().map(DeliveryView::from).collect()))
}

/// POST /v1/webhooks/{id}/deliveries/{delivery_id}/retry — manual
/// retry: put the row back in the pending queue, due now.
pub async fn retry_delivery(
    State(state): State<AppState>,
    Extension(Tenant(tenant)): Extension<Tenant>,
    Path((id, delivery_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let _ = load_tenant_endpoint(&state, &tenant, id).await?;
    let delivery = state
        .db
        .get_delivery(delivery_id)
        .await?
        .filter(|d| d.endpoint_id == Some(id))
        .ok_or_else(|| ApiError::NotFound(format!("Delivery {} not found", delivery_id)))?;

    if delivery.status == DeliveryStatus::Delivered {
        return Err(ApiError::Conflict("delivery already succeeded".to_string()));
    }

    state.db.requeue_delivery(delivery_id).await?;
    Ok(Json(serde_json::json!({ "id": delivery_id, "status": "pending" })))
}

async fn load_tenant_endpoint(
    state: &AppState,
    tenant: &str,
    id: Uuid,
) -> Result<WebhookEndpoint, ApiError> {
    state
        .db
        .get_endpoint(id)
        .await?
        .filter(|e| e.tenant_id == tenant)
        .ok_or_else(|| ApiError::NotFound(format!("Endpoint {} not found", id)))
}
