use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

// Errors raised by the cache storage layer
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("Cache store unavailable: {0}")]
    Unavailable(String),

    #[error("Cache query failed: {0}")]
    Query(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

// Errors surfaced by provider adapters (hotel, activity, flight and event clients)
#[derive(Error, Debug, Clone)]
pub enum ProviderError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    #[error("Provider rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("API error: {status_code} - {message}")]
    Upstream {
        status_code: u16,
        message: String,
        is_retryable: bool,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Other error: {0}")]
    Other(String),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Network(_) | ProviderError::Timeout(_) | ProviderError::RateLimited(_) => {
                true
            }
            ProviderError::Upstream { is_retryable, .. } => *is_retryable,
            ProviderError::NotFound(_) | ProviderError::Other(_) => false,
        }
    }
}

// Outcome of a call that went through a circuit breaker
#[derive(Error, Debug, Clone)]
pub enum BreakerError<E> {
    #[error("Circuit breaker open for {name}")]
    Open { name: String },

    #[error("Circuit breaker {name} timed out after {}ms", .after.as_millis())]
    Timeout { name: String, after: Duration },

    #[error("{0}")]
    Inner(E),
}

impl<E> BreakerError<E> {
    // Rejections never reached the provider, so retrying them is pointless
    pub fn is_rejection(&self) -> bool {
        matches!(self, BreakerError::Open { .. })
    }
}

// Why a single cache key could not be refreshed
#[derive(Error, Debug)]
pub enum RefreshError {
    #[error(transparent)]
    Provider(#[from] BreakerError<ProviderError>),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type ServerResult<T> = Result<T, ServerError>;

// Errors returned by the operator HTTP surface
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ServerError {
    fn status_code(&self) -> StatusCode {
        match self {
            ServerError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServerError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
            ServerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            ServerError::BadRequest(_) => "BAD_REQUEST",
            ServerError::Store(_) => "STORE_UNAVAILABLE",
            ServerError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({
            "error": {
                "code": self.error_code(),
                "message": self.to_string(),
            }
        }));

        (status, body).into_response()
    }
}
