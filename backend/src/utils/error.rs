use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

/// API Error with rich context and automatic error trait implementations
///
/// Design: Uses thiserror for ergonomic error handling with context.
/// Each variant carries meaningful context to help with debugging.
#[derive(Error, Debug)]
pub enum ApiError {
    // Authentication errors 1xxx
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    // Ingest errors 2xxx
    #[error("Invalid ingest entry: {0}")]
    InvalidEntry(String),

    #[error("Batch too large: {size} entries (max {max})")]
    BatchTooLarge { size: usize, max: usize },

    // Resource errors 3xxx
    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("System {system_id} not found")]
    SystemNotFound { system_id: i64 },

    #[error("Window {window_id} not found")]
    WindowNotFound { window_id: i64 },

    #[error("Finding {finding_id} not found")]
    FindingNotFound { finding_id: i64 },

    // Validation errors 4xxx
    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    // System errors 5xxx
    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("AI is not configured - set an API key in Settings.")]
    AiNotConfigured,

    // Database errors - auto-convert from sqlx::Error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    // Generic wrapper for other errors - auto-convert from anyhow::Error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ApiError {
    /// Helper to create unauthorized error
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(message.into())
    }

    /// Helper to create forbidden error (uses Unauthorized for compatibility)
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Unauthorized(message.into())
    }

    /// Helper to create validation error
    pub fn validation_error(message: impl Into<String>) -> Self {
        Self::ValidationError(message.into())
    }

    /// Helper to create invalid input error
    pub fn invalid_data(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Helper to create invalid pattern error
    pub fn invalid_pattern(message: impl Into<String>) -> Self {
        Self::InvalidPattern(message.into())
    }

    /// Helper to create not found error
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::ResourceNotFound(message.into())
    }

    /// Helper to create internal error
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::InternalError(message.into())
    }

    /// Helper to create database error (for non-sqlx errors)
    pub fn database_error(err: impl std::fmt::Display) -> Self {
        Self::InternalError(format!("Database error: {}", err))
    }

    /// Get legacy error code for backward compatibility
    pub fn error_code(&self) -> i32 {
        match self {
            // Authentication errors 1xxx
            Self::Unauthorized(_) => 1001,

            // Ingest errors 2xxx
            Self::InvalidEntry(_) => 2001,
            Self::BatchTooLarge { .. } => 2002,

            // Resource errors 3xxx
            Self::ResourceNotFound(_) => 3000,
            Self::SystemNotFound { .. } => 3001,
            Self::WindowNotFound { .. } => 3002,
            Self::FindingNotFound { .. } => 3003,

            // Validation errors 4xxx
            Self::ValidationError(_) => 4001,
            Self::InvalidInput(_) => 4002,
            Self::InvalidPattern(_) => 4003,

            // System errors 5xxx
            Self::InternalError(_) => 5001,
            Self::Database(_) => 5002,
            Self::AiNotConfigured => 5003,
            Self::Other(_) => 5001,
        }
    }
}

/// Legacy error response for backward compatibility
#[derive(Debug, Serialize)]
pub struct ApiErrorResponse {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.error_code();
        // Concise user-facing message; the full chain stays in the server log.
        let message = self.to_string();
        if code >= 5000 {
            tracing::error!("Request failed: {}", message);
        }

        let status = match code {
            1001..=1999 => StatusCode::UNAUTHORIZED,
            2001..=2999 => StatusCode::BAD_REQUEST,
            3000..=3999 => StatusCode::NOT_FOUND,
            4001..=4999 => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let response = ApiErrorResponse { code, message, details: None };

        (status, Json(response)).into_response()
    }
}

/// Implement From for serde_json::Error
impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::internal_error(format!("JSON serialization error: {}", err))
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
