//! Client-facing gateway: batch HTTP API, realtime WS, admin webhooks.

mod auth;
mod export;
mod jobs;
mod ratelimit;
mod stream;
mod webhooks;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::bus::Bus;
use crate::config::GatewayConfig;
use crate::db::Database;
use crate::error::ApiError;
use crate::objectstore::ObjectStore;
use crate::realtime::SessionRouter;

pub use auth::Tenant;
pub use ratelimit::RateLimiter;
pub use stream::{CLOSE_INVALID_KEY, CLOSE_MISSING_SCOPE, CLOSE_RATE_LIMIT};

/// Uploads beyond this are rejected outright (2 GiB of audio is not a
/// transcription request, it's a mistake).
const MAX_UPLOAD_BYTES: usize = 512 * 1024 * 1024;

/// Shared state for every gateway handler.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<dyn Database>,
    pub bus: Arc<dyn Bus>,
    pub blobs: Arc<dyn ObjectStore>,
    pub router: Arc<SessionRouter>,
    pub config: Arc<GatewayConfig>,
    pub rate_limiter: Arc<RateLimiter>,
}

/// Build the gateway router.
///
/// Everything except `/health` and the WS endpoint sits behind the auth
/// middleware; the WS endpoint authenticates after the upgrade so it
/// can answer with the documented close codes.
pub fn router(state: AppState) -> Router {
    let authed = Router::new()
        .route("/v1/audio/transcriptions", post(jobs::create))
        .route("/v1/audio/transcriptions/{job_id}", get(jobs::get))
        .route(
            "/v1/audio/transcriptions/{job_id}/cancel",
            post(jobs::cancel),
        )
        .route(
            "/v1/audio/transcriptions/{job_id}/export/{format}",
            get(jobs::export),
        )
        .route("/v1/webhooks", post(webhooks::create).get(webhooks::list))
        .route(
            "/v1/webhooks/{id}",
            get(webhooks::get)
                .patch(webhooks::update)
                .delete(webhooks::delete),
        )
        .route("/v1/webhooks/{id}/rotate", post(webhooks::rotate_secret))
        .route("/v1/webhooks/{id}/deliveries", get(webhooks::deliveries))
        .route(
            "/v1/webhooks/{id}/deliveries/{delivery_id}/retry",
            post(webhooks::retry_delivery),
        )
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            auth::auth_middleware,
        ))
        // Outermost on the authed routes, so it runs before auth.
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            ratelimit::rate_limit_middleware,
        ));

    Router::new()
        .merge(authed)
        .route("/v1/audio/transcriptions/stream", get(stream::stream))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

/// Bind and serve until the shutdown signal flips.
pub async fn serve(
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ApiError> {
    let addr = state.config.bind;
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ApiError::Internal(format!("failed to bind {}: {}", addr, e)))?;
    tracing::info!("Gateway listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            loop {
                if shutdown.changed().await.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            tracing::info!("Gateway shutting down");
        })
        .await
        .map_err(|e| ApiError::Internal(format!("gateway server error: {}", e)))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::*;
    use crate::bus::MemoryBus;
    use crate::config::{BlobConfig, RealtimeConfig};
    use crate::db::MemoryDb;
    use crate::model::{Job, JobParams, JobStatus};
    use crate::objectstore::FsObjectStore;

    fn test_state(dir: &tempfile::TempDir) -> AppState {
        state_with_rate_limit(dir, 10_000)
    }

    fn state_with_rate_limit(dir: &tempfile::TempDir, rate_limit_per_minute: u32) -> AppState {
        let db: Arc<dyn Database> = Arc::new(MemoryDb::new());
        let bus: Arc<dyn Bus> = Arc::new(MemoryBus::new());
        let router = Arc::new(SessionRouter::new(
            bus.clone(),
            db.clone(),
            RealtimeConfig::default(),
        ));
        let mut api_keys = HashMap::new();
        api_keys.insert("sk_test".to_string(), "acme".to_string());
        AppState {
            db,
            bus,
            blobs: Arc::new(FsObjectStore::new(&BlobConfig {
                root: dir.path().to_path_buf(),
            })),
            router,
            config: Arc::new(GatewayConfig {
                bind: ([127, 0, 0, 1], 0).into(),
                api_keys,
                streaming_keys: None,
                webhook_metadata_max_size: 1024,
                rate_limit_per_minute,
            }),
            rate_limiter: Arc::new(RateLimiter::new(rate_limit_per_minute)),
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

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_requires_no_auth() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(&dir));
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn job_routes_reject_missing_key() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(&dir));
        let resp = app
            .oneshot(
                Request::builder()
                    .uri(format!("/v1/audio/transcriptions/{}", uuid::Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn unknown_job_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(&dir));
        let resp = app
            .oneshot(
                Request::builder()
                    .uri(format!("/v1/audio/transcriptions/{}", uuid::Uuid::new_v4()))
                    .header("authorization", "Bearer sk_test")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn other_tenants_jobs_are_invisible() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        let job = Job::new("globex", "blob:a", params());
        state.db.create_job(&job).await.unwrap();

        let app = router(state);
        let resp = app
            .oneshot(
                Request::builder()
                    .uri(format!("/v1/audio/transcriptions/{}", job.id))
                    .header("authorization", "Bearer sk_test")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn cancel_of_terminal_job_is_409() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        let mut job = Job::new("acme", "blob:a", params());
        job.status = JobStatus::Completed;
        state.db.create_job(&job).await.unwrap();

        let app = router(state);
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/v1/audio/transcriptions/{}/cancel", job.id))
                    .header("authorization", "Bearer sk_test")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn cancel_of_running_job_reports_cancelling() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        let mut job = Job::new("acme", "blob:a", params());
        job.status = JobStatus::Running;
        state.db.create_job(&job).await.unwrap();

        let app = router(state);
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/v1/audio/transcriptions/{}/cancel", job.id))
                    .header("authorization", "Bearer sk_test")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["status"], "cancelling");
    }

    #[tokio::test]
    async fn export_of_incomplete_job_is_400() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        let job = Job::new("acme", "blob:a", params());
        state.db.create_job(&job).await.unwrap();

        let app = router(state);
        let resp = app
            .oneshot(
                Request::builder()
                    .uri(format!("/v1/audio/transcriptions/{}/export/srt", job.id))
                    .header("authorization", "Bearer sk_test")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn webhook_crud_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        let app = router(state);

        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/webhooks")
                    .header("authorization", "Bearer sk_test")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"url":"https://example.com/hook","events":["*"]}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let created = body_json(resp).await;
        let id = created["id"].as_str().unwrap().to_string();
        assert!(created["secret"].as_str().unwrap().starts_with("whsec_"));
        assert!(!created["secret"].as_str().unwrap().contains("****"));

        // List masks the secret.
        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/v1/webhooks")
                    .header("authorization", "Bearer sk_test")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let listed = body_json(resp).await;
        assert!(listed[0]["secret"].as_str().unwrap().contains("****"));

        // Rotation returns a different, full secret.
        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/v1/webhooks/{}/rotate", id))
                    .header("authorization", "Bearer sk_test")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let rotated = body_json(resp).await;
        assert_ne!(rotated["secret"], created["secret"]);
        assert!(rotated["secret"].as_str().unwrap().starts_with("whsec_"));
    }

    #[tokio::test]
    async fn flooded_gateway_answers_429() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(state_with_rate_limit(&dir, 2));

        let request = |_: usize| {
            Request::builder()
                .uri(format!("/v1/audio/transcriptions/{}", uuid::Uuid::new_v4()))
                .header("authorization", "Bearer sk_test")
                .body(Body::empty())
                .unwrap()
        };
        for i in 0..2 {
            let resp = app.clone().oneshot(request(i)).await.unwrap();
            assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        }
        let resp = app.clone().oneshot(request(2)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);

        // The unauthed surface is not throttled.
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn webhook_rejects_unknown_event_type() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(&dir));
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/webhooks")
                    .header("authorization", "Bearer sk_test")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"url":"https://example.com","events":["job.done"]}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
