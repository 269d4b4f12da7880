//! Claim-and-deliver loop for persisted webhook rows.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, USER_AGENT};
use tokio::sync::watch;

use crate::config::WebhookConfig;
use crate::db::Database;
use crate::error::DeliveryError;
use crate::model::WebhookDelivery;
use crate::webhook::signer;

/// Attempts after which a delivery is marked `failed`.
pub const MAX_ATTEMPTS: i32 = 5;

/// Delay before the given attempt number (counted from 1). Attempt 1 is
/// immediate; the ladder climbs 30 s, 2 min, 10 min, 1 h.
fn retry_delay(attempt: i32) -> Option<Duration> {
    match attempt {
        1 => Some(Duration::ZERO),
        2 => Some(Duration::from_secs(30)),
        3 => Some(Duration::from_secs(2 * 60)),
        4 => Some(Duration::from_secs(10 * 60)),
        5 => Some(Duration::from_secs(60 * 60)),
        _ => None,
    }
}

/// Background worker that drains due deliveries.
pub struct DeliveryWorker {
    db: Arc<dyn Database>,
    config: WebhookConfig,
    http: reqwest::Client,
}

impl DeliveryWorker {
    pub fn new(db: Arc<dyn Database>, config: WebhookConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_default();
        Self { db, config, http }
    }

    /// Run until the shutdown signal flips. Polls every
    /// `config.poll_interval`; per-delivery failures are isolated so one
    /// bad endpoint cannot block the queue.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Webhook delivery worker started"
        );
        let mut interval = tokio::time::interval(self.config.poll_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.drain_once().await {
                        tracing::error!("Delivery poll failed: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("Webhook delivery worker shutting down");
                        return;
                    }
                }
            }
        }
    }

    /// Claim one batch of due rows and attempt each.
    pub async fn drain_once(&self) -> Result<usize, DeliveryError> {
        let claimed = self.db.claim_due_deliveries(self.config.claim_batch).await?;
        let count = claimed.len();
        for delivery in claimed {
            // A rejected POST is recorded state, not an error; only
            // store/bookkeeping failures land here.
            if let Err(e) = self.attempt(&delivery).await {
                tracing::error!(
                    delivery_id = %delivery.id,
                    attempt = delivery.attempts,
                    "Delivery bookkeeping failed: {}",
                    e
                );
            }
        }
        Ok(count)
    }

    /// One POST attempt for a claimed row (`attempts` already counts it).
    async fn attempt(&self, delivery: &WebhookDelivery) -> Result<(), DeliveryError> {
        let (url, secret) = match self.resolve_target(delivery).await {
            Ok(target) => target,
            Err(e) => {
                // Unresolvable target: no amount of retrying helps.
                self.db
                    .mark_delivery_failed(delivery.id, None, &e.to_string())
                    .await?;
                return Err(e);
            }
        };

        let canonical = signer::canonical_json(&delivery.payload)?;
        let unix_ts = Utc::now().timestamp();

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Ok(ua) = HeaderValue::from_str(&self.config.user_agent) {
            headers.insert(USER_AGENT, ua);
        }
        if let Ok(ts) = HeaderValue::from_str(&unix_ts.to_string()) {
            headers.insert("X-Dalston-Timestamp", ts);
        }
        if let Ok(id) = HeaderValue::from_str(&delivery.id.to_string()) {
            headers.insert("X-Dalston-Webhook-Id", id);
        }
        if let Some(secret) = &secret {
            let signature = signer::sign(secret, unix_ts, &canonical);
            if let Ok(value) = HeaderValue::from_str(&signature) {
                headers.insert("X-Dalston-Signature", value);
            }
        }

        let outcome = self
            .http
            .post(&url)
            .headers(headers)
            .body(canonical)
            .send()
            .await;

        match outcome {
            Ok(response) if response.status().as_u16() < 400 => {
                let code = response.status().as_u16() as i32;
                self.db.mark_delivery_delivered(delivery.id, code).await?;
                tracing::info!(
                    delivery_id = %delivery.id,
                    status = code,
                    attempts = delivery.attempts,
                    "Webhook delivered"
                );
                Ok(())
            }
            Ok(response) => {
                let code = response.status().as_u16() as i32;
                self.record_failure(delivery, Some(code), format!("HTTP {}", code))
                    .await
            }
            Err(e) => self.record_failure(delivery, None, e.to_string()).await,
        }
    }

    async fn resolve_target(
        &self,
        delivery: &WebhookDelivery,
    ) -> Result<(String, Option<String>), DeliveryError> {
        if let Some(endpoint_id) = delivery.endpoint_id {
            let endpoint = self
                .db
                .get_endpoint(endpoint_id)
                .await?
                .ok_or(DeliveryError::EndpointNotFound(endpoint_id))?;
            // Signed with the secret as it is *now*; a rotation applies
            // to every delivery from that moment on.
            Ok((endpoint.url, Some(endpoint.secret)))
        } else if let Some(url) = &delivery.url_override {
            // Legacy per-job URLs have no registered secret.
            Ok((url.clone(), None))
        } else {
            Err(DeliveryError::EndpointNotFound(delivery.id))
        }
    }

    async fn record_failure(
        &self,
        delivery: &WebhookDelivery,
        status_code: Option<i32>,
        error: String,
    ) -> Result<(), DeliveryError> {
        match retry_delay(delivery.attempts + 1) {
            Some(delay) => {
                let next = Utc::now()
                    + chrono::TimeDelta::from_std(delay).unwrap_or(chrono::TimeDelta::zero());
                self.db
                    .mark_delivery_retry(delivery.id, next, status_code, &error)
                    .await?;
                tracing::warn!(
                    delivery_id = %delivery.id,
                    attempt = delivery.attempts,
                    retry_in_secs = delay.as_secs(),
                    "Webhook attempt failed, will retry: {}",
                    error
                );
            }
            None => {
                self.db
                    .mark_delivery_failed(delivery.id, status_code, &error)
                    .await?;
                tracing::error!(
                    delivery_id = %delivery.id,
                    attempts = delivery.attempts,
                    "Webhook retries exhausted: {}",
                    error
                );
            }
        }
        Ok(())
    }
}
