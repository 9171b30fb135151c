use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use liftlog_core::error::{self, ApiError};
use liftlog_core::records::ValidationIssue;

use crate::agent::AgentError;
use crate::pipeline::PipelineError;
use crate::store::StoreError;

/// Internal error type that converts to structured API responses
#[derive(Debug)]
pub enum AppError {
    /// Validation error (400)
    Validation {
        message: String,
        field: Option<String>,
        received: Option<serde_json::Value>,
        docs_hint: Option<String>,
    },
    /// Missing session or other owned row (404)
    NotFound { message: String },
    /// Session already closed (409)
    InvalidState { message: String },
    /// Agent unreachable or retries exhausted (502)
    AgentUnavailable(AgentError),
    /// Agent replied with nothing usable (502)
    AgentInvalidResponse(String),
    /// Database error (500)
    Database(sqlx::Error),
}

impl AppError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            Self::Validation { .. } => (StatusCode::BAD_REQUEST, error::codes::VALIDATION_FAILED),
            Self::NotFound { .. } => (StatusCode::NOT_FOUND, error::codes::NOT_FOUND),
            Self::InvalidState { .. } => (StatusCode::CONFLICT, error::codes::INVALID_STATE),
            Self::AgentUnavailable(_) => (StatusCode::BAD_GATEWAY, error::codes::AGENT_UNAVAILABLE),
            Self::AgentInvalidResponse(_) => {
                (StatusCode::BAD_GATEWAY, error::codes::AGENT_INVALID_RESPONSE)
            }
            Self::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, error::codes::INTERNAL_ERROR),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let request_id = uuid::Uuid::now_v7().to_string();
        let (status, code) = self.status_and_code();

        let (message, field, received, docs_hint) = match self {
            AppError::Validation {
                message,
                field,
                received,
                docs_hint,
            } => (message, field, received, docs_hint),
            AppError::NotFound { message } => (message, None, None, None),
            AppError::InvalidState { message } => (
                message,
                None,
                None,
                Some("Start a new session with POST /v1/sessions.".to_string()),
            ),
            AppError::AgentUnavailable(err) => {
                tracing::error!(error = %err, source = ?std::error::Error::source(&err), "agent unavailable");
                (
                    err.to_string(),
                    None,
                    None,
                    Some("The workout was not stored. Retry later.".to_string()),
                )
            }
            AppError::AgentInvalidResponse(reason) => {
                tracing::error!(%reason, "agent returned no usable content");
                ("The agent returned no usable content".to_string(), None, None, None)
            }
            AppError::Database(err) => {
                tracing::error!("Database error: {:?}", err);
                ("An internal error occurred".to_string(), None, None, None)
            }
        };

        let api_error = ApiError {
            error: code.to_string(),
            message,
            field,
            received,
            request_id,
            docs_hint,
        };
        (status, Json(api_error)).into_response()
    }
}

impl From<ValidationIssue> for AppError {
    fn from(issue: ValidationIssue) -> Self {
        AppError::Validation {
            message: issue.message,
            field: Some(issue.field),
            received: issue.received,
            docs_hint: None,
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { .. } => AppError::NotFound {
                message: err.to_string(),
            },
            StoreError::InvalidState { .. } => AppError::InvalidState {
                message: err.to_string(),
            },
            StoreError::Validation(issue) => issue.into(),
            StoreError::Database(err) => AppError::Database(err),
        }
    }
}

impl From<AgentError> for AppError {
    fn from(err: AgentError) -> Self {
        match err {
            AgentError::InvalidResponse(reason) => AppError::AgentInvalidResponse(reason),
            other => AppError::AgentUnavailable(other),
        }
    }
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Agent(err) => err.into(),
            PipelineError::Store(err) => err.into(),
        }
    }
}
