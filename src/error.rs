//! Error types shared across the platform.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use uuid::Uuid;

/// Errors from the durable store.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    /// Failed to build the connection pool.
    #[error("Pool error: {0}")]
    Pool(String),

    /// Failed to check out a connection.
    #[error("Connection error: {0}")]
    Connection(#[from] deadpool_postgres::PoolError),

    /// Query execution failed.
    #[error("Query error: {0}")]
    Query(#[from] tokio_postgres::Error),

    /// A row contained a value that does not map back to a domain type.
    #[error("Corrupt row: {reason}")]
    CorruptRow { reason: String },
}

/// Errors from the coordination bus.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// Connection to the bus failed or dropped.
    #[error("Bus connection error: {0}")]
    Connection(String),

    /// A bus command failed.
    #[error("Bus command failed: {0}")]
    Command(String),

    /// Payload on the bus could not be decoded.
    #[error("Bus payload decode failed: {0}")]
    Decode(#[from] serde_json::Error),
}

impl From<redis::RedisError> for BusError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout() {
            BusError::Connection(e.to_string())
        } else {
            BusError::Command(e.to_string())
        }
    }
}

/// Errors raised while building or driving a pipeline.
#[derive(Debug, thiserror::Error)]
pub enum OrchestrateError {
    /// Job parameters reference a model or feature combination the
    /// catalog does not know.
    #[error("Invalid pipeline config: {reason}")]
    InvalidPipelineConfig { reason: String },

    /// A required stage has no live engine.
    #[error("Engine '{engine_id}' is not available.")]
    EngineUnavailable { engine_id: String, stage: String },

    /// Referenced job does not exist.
    #[error("Job {0} not found")]
    JobNotFound(Uuid),

    /// Referenced task does not exist.
    #[error("Task {0} not found")]
    TaskNotFound(Uuid),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Errors from the realtime session router.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// Every worker that could serve the request is at capacity.
    #[error("No realtime capacity for model '{model}'")]
    CapacityExhausted { model: String },

    /// Referenced session does not exist.
    #[error("Session {0} not found")]
    SessionNotFound(Uuid),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Errors from the webhook delivery worker.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// The endpoint row disappeared between enqueue and claim.
    #[error("Endpoint {0} not found")]
    EndpointNotFound(Uuid),

    /// The outbound POST failed at the transport level.
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The receiver answered with a non-success status.
    #[error("Endpoint returned HTTP {status}")]
    Rejected { status: u16 },

    /// Payload could not be canonicalised for signing.
    #[error("Payload serialization failed: {0}")]
    Payload(#[from] serde_json::Error),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Errors from the blob store seam.
#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("Blob {0} not found")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Gateway-facing error with a stable HTTP mapping.
///
/// Handlers convert every caught error into one of these kinds; the
/// `IntoResponse` impl renders the machine-readable body clients see.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Client-provided parameters violate the contract (400).
    #[error("{0}")]
    InvalidRequest(String),

    /// Unknown job/session/endpoint (404).
    #[error("{0}")]
    NotFound(String),

    /// Terminal-state mutation or similar (409).
    #[error("{0}")]
    Conflict(String),

    /// Missing or invalid credentials (401).
    #[error("Unauthorized")]
    Unauthorized,

    /// Authenticated but not allowed (403).
    #[error("Forbidden")]
    Forbidden,

    /// No realtime worker available (503).
    #[error("{0}")]
    CapacityExhausted(String),

    /// Anything else (500). The reason is logged, not echoed.
    #[error("Internal error")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::CapacityExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            ApiError::Internal(reason) => {
                tracing::error!("Internal gateway error: {}", reason);
                "Internal error".to_string()
            }
            other => other.to_string(),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<DatabaseError> for ApiError {
    fn from(e: DatabaseError) -> Self {
        ApiError::Internal(e.to_string())
    }
}

impl From<BusError> for ApiError {
    fn from(e: BusError) -> Self {
        ApiError::Internal(e.to_string())
    }
}

impl From<BlobError> for ApiError {
    fn from(e: BlobError) -> Self {
        match e {
            BlobError::NotFound(r) => ApiError::NotFound(format!("Blob {} not found", r)),
            BlobError::Io(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<RouterError> for ApiError {
    fn from(e: RouterError) -> Self {
        match e {
            RouterError::CapacityExhausted { .. } => ApiError::CapacityExhausted(e.to_string()),
            RouterError::SessionNotFound(id) => {
                ApiError::NotFound(format!("Session {} not found", id))
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}
