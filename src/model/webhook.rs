//! Webhook endpoints and persisted deliveries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Prefix carried by every signing secret.
pub const SECRET_PREFIX: &str = "whsec_";

/// A tenant-scoped, admin-registered webhook sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEndpoint {
    pub id: Uuid,
    pub tenant_id: String,
    pub url: String,
    /// Subscribed event types; `"*"` subscribes to everything.
    pub events: Vec<String>,
    /// HMAC signing secret, `whsec_`-prefixed. Rotatable; the endpoint
    /// identity is stable across rotations.
    pub secret: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WebhookEndpoint {
    pub fn new(tenant_id: impl Into<String>, url: impl Into<String>, events: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.into(),
            url: url.into(),
            events,
            secret: generate_secret(),
            active: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn subscribes_to(&self, event_type: &str) -> bool {
        self.events.iter().any(|e| e == "*" || e == event_type)
    }
}

/// Mint a fresh `whsec_` signing secret.
pub fn generate_secret() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("{}{}", SECRET_PREFIX, hex::encode(bytes))
}

/// Delivery outcome state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(DeliveryStatus::Pending),
            "delivered" => Some(DeliveryStatus::Delivered),
            "failed" => Some(DeliveryStatus::Failed),
            _ => None,
        }
    }
}

/// One queued webhook POST, persisted so a worker restart loses nothing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookDelivery {
    pub id: Uuid,
    /// None for legacy per-job URL overrides, which have no endpoint row.
    pub endpoint_id: Option<Uuid>,
    pub job_id: Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
    /// Set instead of `endpoint_id` for legacy per-job URLs.
    #[serde(default)]
    pub url_override: Option<String>,
    pub status: DeliveryStatus,
    pub attempts: i32,
    pub next_retry_at: DateTime<Utc>,
    #[serde(default)]
    pub last_status_code: Option<i32>,
    #[serde(default)]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl WebhookDelivery {
    pub fn for_endpoint(
        endpoint_id: Uuid,
        job_id: Uuid,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            endpoint_id: Some(endpoint_id),
            job_id,
            event_type: event_type.into(),
            payload,
            url_override: None,
            status: DeliveryStatus::Pending,
            attempts: 0,
            next_retry_at: Utc::now(),
            last_status_code: None,
            last_error: None,
            created_at: Utc::now(),
        }
    }

    pub fn for_url(
        url: impl Into<String>,
        job_id: Uuid,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            endpoint_id: None,
            job_id,
            event_type: event_type.into(),
            payload,
            url_override: Some(url.into()),
            status: DeliveryStatus::Pending,
            attempts: 0,
            next_retry_at: Utc::now(),
            last_status_code: None,
            last_error: None,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_secrets_are_prefixed_and_distinct() {
        let a = generate_secret();
        let b = generate_secret();
        assert!(a.starts_with(SECRET_PREFIX));
        assert!(b.starts_with(SECRET_PREFIX));
        assert_ne!(a, b);
    }

    #[test]
    fn wildcard_subscription_matches_everything() {
        let endpoint =
            WebhookEndpoint::new("acme", "https://example.com/hook", vec!["*".to_string()]);
        assert!(endpoint.subscribes_to("transcription.completed"));
        assert!(endpoint.subscribes_to("transcription.failed"));
    }

    #[test]
    fn explicit_subscription_filters() {
        let endpoint = WebhookEndpoint::new(
            "acme",
            "https://example.com/hook",
            vec!["transcription.completed".to_string()],
        );
        assert!(endpoint.subscribes_to("transcription.completed"));
        assert!(!endpoint.subscribes_to("transcription.failed"));
    }
}
