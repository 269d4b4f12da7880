//! API-key authentication middleware for the gateway.

use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::error::ApiError;
use crate::gateway::AppState;

/// Tenant resolved from the presented API key, injected as a request
/// extension for handlers.
#[derive(Debug, Clone)]
pub struct Tenant(pub String);

/// Extract the API key from `Authorization: Bearer` or, as a fallback
/// for clients that cannot set headers, the `api_key` query parameter.
pub fn api_key_from_request(headers: &HeaderMap, query: Option<&str>) -> Option<String> {
    if let Some(value) = headers.get("authorization") {
        if let Ok(value) = value.to_str() {
            if let Some(key) = value.strip_prefix("Bearer ") {
                return Some(key.to_string());
            }
        }
    }
    let query = query?;
    query.split('&').find_map(|pair| {
        pair.strip_prefix("api_key=").map(|k| k.to_string())
    })
}

/// Middleware validating the key and resolving the tenant.
pub async fn auth_middleware(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut request: Request,
    next: Next,
) -> Response {
    let key = api_key_from_request(&headers, request.uri().query());
    let tenant = key
        .as_deref()
        .and_then(|k| state.config.tenant_for_key(k))
        .map(String::from);

    match tenant {
        Some(tenant) => {
            request.extensions_mut().insert(Tenant(tenant));
            next.run(request).await
        }
        None => ApiError::Unauthorized.into_response(),
    }
}
