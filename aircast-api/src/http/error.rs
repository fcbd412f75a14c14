// HTTP error handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Result type for HTTP handlers
pub type AppResult<T> = Result<T, AppError>;

/// Application error with HTTP status code
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }

    pub fn internal_server_error(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.status, self.message)
    }
}

impl std::error::Error for AppError {}

/// Error response JSON structure
#[derive(Debug, Serialize, Deserialize)]
struct ErrorResponse {
    error: String,
    status: u16,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status;
        let body = Json(ErrorResponse {
            error: self.message,
            status: status.as_u16(),
        });
        (status, body).into_response()
    }
}

/// Convert core errors to HTTP errors
impl From<aircast_core::Error> for AppError {
    fn from(err: aircast_core::Error) -> Self {
        use aircast_core::Error;

        match err {
            Error::InvalidInput(msg) => Self::bad_request(msg),
            Error::Unauthorized(msg) => Self::unauthorized(msg),
            Error::Forbidden(msg) => Self::forbidden(msg),
            Error::NotFound(msg) => Self::not_found(msg),
            Error::AlreadyExists(msg) | Error::Conflict(msg) => Self::conflict(msg),
            Error::OwnedElsewhere(msg) => Self::conflict(msg),
            Error::NoneAvailable(kind) => {
                Self::service_unavailable(format!("No {kind} available"))
            }
            Error::Unavailable(msg) | Error::Timeout(msg) => {
                tracing::error!("Infrastructure error: {}", msg);
                Self::service_unavailable("Service temporarily unavailable")
            }
            Error::Serialization(e) => {
                tracing::error!("Serialization error: {}", e);
                Self::internal_server_error("Data processing error")
            }
            Error::Store(msg) => {
                tracing::error!("Store error: {}", msg);
                Self::service_unavailable("Service temporarily unavailable")
            }
            Error::Cancelled => Self::service_unavailable("Shutting down"),
            Error::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                Self::internal_server_error("Internal server error")
            }
        }
    }
}

/// Convert bus errors (RPC proxying) to HTTP errors
impl From<aircast_bus::Error> for AppError {
    fn from(err: aircast_bus::Error) -> Self {
        match err {
            aircast_bus::Error::Rpc { code, message } => {
                if code == aircast_bus::RpcError::INVALID_REQUEST
                    || code == aircast_bus::RpcError::INVALID_PARAMS
                {
                    Self::bad_request(message)
                } else {
                    tracing::error!("RPC error {}: {}", code, message);
                    Self::internal_server_error("Internal server error")
                }
            }
            aircast_bus::Error::CallTimeout(method) => {
                tracing::error!("RPC call timed out: {}", method);
                Self::service_unavailable("Service temporarily unavailable")
            }
            other => {
                tracing::error!("Bus error: {}", other);
                Self::service_unavailable("Service temporarily unavailable")
            }
        }
    }
}
