use axum::Router;
use axum::http::HeaderMap;
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

pub mod analytics;
pub mod health;
pub mod sessions;
pub mod workouts;

/// Every versioned route plus `/health`.
pub fn router() -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .merge(workouts::router())
        .merge(sessions::router())
        .merge(analytics::router())
}

/// The calling user, from the `x-user-id` header.
pub(crate) fn extract_user_id(headers: &HeaderMap) -> Result<Uuid, AppError> {
    let header_val = headers
        .get("x-user-id")
        .ok_or_else(|| AppError::Validation {
            message: "x-user-id header is required".to_string(),
            field: Some("headers.x-user-id".to_string()),
            received: None,
            docs_hint: Some("Pass the user's UUID as the x-user-id header.".to_string()),
        })?;

    let user_id_str = header_val.to_str().map_err(|_| AppError::Validation {
        message: "x-user-id must be a valid UTF-8 string".to_string(),
        field: Some("headers.x-user-id".to_string()),
        received: None,
        docs_hint: None,
    })?;

    Uuid::parse_str(user_id_str.trim()).map_err(|_| AppError::Validation {
        message: "x-user-id must be a valid UUID".to_string(),
        field: Some("headers.x-user-id".to_string()),
        received: Some(serde_json::Value::String(user_id_str.to_string())),
        docs_hint: Some(
            "Use a UUID such as 'a1b2c3d4-e5f6-7890-abcd-ef1234567890'".to_string(),
        ),
    })
}
