//! Error types for grillmaster
//!
//! One enum covers the behavioral error kinds the rest of the system cares
//! about. Pipeline failures carry the step name and a `retryable` flag that
//! drives the in-step backoff; everything else maps onto an HTTP status at
//! the API boundary.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Common result type for grillmaster operations
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Bad input from the caller (400)
    #[error("Invalid input: {0}")]
    Validation(String),

    /// Duplicate project (409)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Missing row or file (404)
    #[error("Not found: {0}")]
    NotFound(String),

    /// DB/FS/credentials/misconfiguration (500)
    #[error("Infrastructure error: {0}")]
    Infrastructure(String),

    /// A step failure inside the pipeline runner. Never reaches the API
    /// directly; it is persisted into task state and observed by polling.
    #[error("Pipeline error in step '{step}': {message}")]
    Pipeline {
        step: String,
        message: String,
        retryable: bool,
    },

    /// Terminal cancellation. Not an error from the user's perspective.
    #[error("Canceled: {0}")]
    Canceled(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Construct a retryable pipeline error for `step`.
    pub fn pipeline_retryable(step: &str, message: impl Into<String>) -> Self {
        Error::Pipeline {
            step: step.to_string(),
            message: message.into(),
            retryable: true,
        }
    }

    /// Construct a non-retryable pipeline error for `step`.
    pub fn pipeline_fatal(step: &str, message: impl Into<String>) -> Self {
        Error::Pipeline {
            step: step.to_string(),
            message: message.into(),
            retryable: false,
        }
    }

    /// Whether the retry helper may re-invoke the failed operation.
    ///
    /// Only pipeline errors explicitly flagged retryable qualify; structural
    /// errors (validation, conflict, missing rows, bad config) never do.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Pipeline { retryable: true, .. })
    }

    /// Re-tag any error as a pipeline error for `step`, preserving the
    /// retryable flag when it already is one.
    pub fn into_step_error(self, step: &str) -> Self {
        match self {
            Error::Pipeline {
                message, retryable, ..
            } => Error::Pipeline {
                step: step.to_string(),
                message,
                retryable,
            },
            other => Error::Pipeline {
                step: step.to_string(),
                message: other.to_string(),
                retryable: false,
            },
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            Error::Validation(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            Error::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),
            Error::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            other => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                other.to_string(),
            ),
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}
