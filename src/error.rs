// src/error.rs

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::{error, warn};

use crate::models::{ErrorDetail, ErrorResponse};

/// Main application error type.
///
/// Error responses follow the OpenAI error envelope:
/// `{"error": {"message", "type", "code", "param"}}`.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("authentication failed: {message}")]
    Unauthorized { message: String, code: &'static str },

    #[error("all API keys are currently unavailable or cooling down")]
    NoKeysAvailable,

    #[error("API key not found")]
    KeyNotFound,

    #[error("API key already exists")]
    KeyAlreadyExists,

    #[error("storage error: {message}")]
    Storage { message: String },

    #[error("upstream error (status {status}): {message}")]
    Upstream { status: u16, message: String },

    #[error("configuration error: {message}")]
    Config { message: String },

    #[error("internal server error: {message}")]
    Internal { message: String },
}

impl AppError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// HTTP status code this error maps to.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            Self::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            Self::NoKeysAvailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::KeyNotFound => StatusCode::NOT_FOUND,
            Self::KeyAlreadyExists => StatusCode::CONFLICT,
            Self::Storage { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Self::Config { .. } => StatusCode::FORBIDDEN,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The machine-readable error `type` tag in the response envelope.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::InvalidRequest { .. } => "invalid_request_error",
            Self::Unauthorized { .. } => "authentication_error",
            Self::NoKeysAvailable => "no_available_keys_error",
            Self::KeyNotFound => "key_not_found",
            Self::KeyAlreadyExists => "key_already_exists",
            Self::Storage { .. } => "internal_server_error",
            Self::Upstream { .. } => "upstream_api_error",
            Self::Config { .. } => "config_error",
            Self::Internal { .. } => "internal_server_error",
        }
    }

    fn code(&self) -> String {
        match self {
            Self::Unauthorized { code, .. } => (*code).to_string(),
            other => other.status_code().as_u16().to_string(),
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::Storage {
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        Self::Upstream {
            status: err.status().map_or(502, |s| s.as_u16()),
            message: err.to_string(),
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal {
            message: err.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(error = %self, error_type = self.error_type(), "Request failed");
        } else {
            warn!(error = %self, error_type = self.error_type(), "Request rejected");
        }

        let body = ErrorResponse {
            error: ErrorDetail {
                message: self.to_string(),
                error_type: self.error_type().to_string(),
                code: Some(self.code()),
                param: None,
            },
        };
        (status, Json(body)).into_response()
    }
}

/// Builds an OpenAI-style error envelope without going through `AppError`,
/// for call sites that carry a dynamic error type tag (the dispatcher
/// surfaces whatever kind the last failed attempt produced).
pub fn error_body(status: StatusCode, message: impl Into<String>, error_type: &str) -> ErrorResponse {
    ErrorResponse {
        error: ErrorDetail {
            message: message.into(),
            error_type: error_type.to_string(),
            code: Some(status.as_u16().to_string()),
            param: None,
        },
    }
}

/// Result type alias for the application.
pub type Result<T, E = AppError> = std::result::Result<T, E>;
