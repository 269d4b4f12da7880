//! Windowed request-rate guard for the authed HTTP routes.

use std::time::{Duration, Instant};

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tokio::sync::Mutex;

use crate::gateway::AppState;

#[derive(Debug)]
struct RateLimitState {
    window_start: Instant,
    request_count: u32,
}

/// Fixed-window request counter, one per gateway instance. The window
/// resets 60 s after its first request; overflow answers 429 until the
/// next window.
pub struct RateLimiter {
    max_per_minute: u32,
    window: Mutex<RateLimitState>,
}

impl RateLimiter {
    pub fn new(max_per_minute: u32) -> Self {
        Self {
            max_per_minute,
            window: Mutex::new(RateLimitState {
                window_start: Instant::now(),
                request_count: 0,
            }),
        }
    }

    /// Count one request; `false` means the window is exhausted.
    pub async fn try_acquire(&self) -> bool {
        let mut limiter = self.window.lock().await;
        if limiter.window_start.elapsed() >= Duration::from_secs(60) {
            limiter.window_start = Instant::now();
            limiter.request_count = 0;
        }
        limiter.request_count += 1;
        limiter.request_count <= self.max_per_minute
    }
}

/// Middleware applied ahead of auth: a flooding client is refused
/// before its key is even looked at.
pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if !state.rate_limiter.try_acquire().await {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(serde_json::json!({ "error": "Rate limit exceeded" })),
        )
            .into_response();
    }
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn refuses_beyond_the_window_cap() {
        let limiter = RateLimiter::new(2);
        assert!(limiter.try_acquire().await);
        assert!(limiter.try_acquire().await);
        assert!(!limiter.try_acquire().await);
        assert!(!limiter.try_acquire().await);
    }

    #[tokio::test]
    async fn window_expiry_resets_the_count() {
        let limiter = RateLimiter::new(1);
        assert!(limiter.try_acquire().await);
        assert!(!limiter.try_acquire().await);

        // Backdate the window instead of sleeping a minute.
        {
            let mut window = limiter.window.lock().await;
            window.window_start = Instant::now() - Duration::from_secs(61);
        }
        assert!(limiter.try_acquire().await);
    }
}
