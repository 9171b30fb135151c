use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use uuid::Uuid;

use liftlog_core::error::ApiError;
use liftlog_core::records::ExerciseRecord;
use liftlog_core::workouts::{ExerciseWithActivations, SessionSummary, WorkoutSession};

use crate::error::AppError;
use crate::extract::AppJson;
use crate::routes::extract_user_id;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/sessions", post(create_session))
        .route("/v1/sessions/{session_id}", get(get_session))
        .route("/v1/sessions/{session_id}/exercises", post(add_exercise))
        .route("/v1/sessions/{session_id}/end", post(end_session))
}

/// Open a new workout session starting now
#[utoipa::path(
    post,
    path = "/v1/sessions",
    responses(
        (status = 201, description = "Session opened", body = WorkoutSession),
        (status = 400, description = "Validation error", body = ApiError)
    ),
    params(
        ("x-user-id" = Uuid, Header, description = "User ID")
    ),
    tag = "sessions"
)]
pub async fn create_session(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    let user_id = extract_user_id(&headers)?;
    let session = state.store.create_session(user_id).await?;
    Ok((StatusCode::CREATED, Json(session)))
}

/// Store one exercise and its muscle activations atomically
///
/// The record is validated first: parallel reps/weight arrays, non-negative
/// values, and `total_volume` equal to the per-set sum when both arrays are given.
#[utoipa::path(
    post,
    path = "/v1/sessions/{session_id}/exercises",
    request_body = ExerciseRecord,
    responses(
        (status = 201, description = "Exercise stored", body = ExerciseWithActivations),
        (status = 400, description = "Validation error", body = ApiError),
        (status = 404, description = "Session not found", body = ApiError),
        (status = 409, description = "Session already ended", body = ApiError)
    ),
    params(
        ("session_id" = Uuid, Path, description = "Session ID"),
        ("x-user-id" = Uuid, Header, description = "User ID")
    ),
    tag = "sessions"
)]
pub async fn add_exercise(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<Uuid>,
    AppJson(record): AppJson<ExerciseRecord>,
) -> Result<impl IntoResponse, AppError> {
    let user_id = extract_user_id(&headers)?;
    let stored = state
        .store
        .store_exercise(user_id, session_id, &record)
        .await?;
    Ok((StatusCode::CREATED, Json(stored)))
}

/// Close a session and finalize its total volume
#[utoipa::path(
    post,
    path = "/v1/sessions/{session_id}/end",
    responses(
        (status = 200, description = "Session closed", body = WorkoutSession),
        (status = 404, description = "Session not found", body = ApiError),
        (status = 409, description = "Session already ended", body = ApiError)
    ),
    params(
        ("session_id" = Uuid, Path, description = "Session ID"),
        ("x-user-id" = Uuid, Header, description = "User ID")
    ),
    tag = "sessions"
)]
pub async fn end_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<Uuid>,
) -> Result<Json<WorkoutSession>, AppError> {
    let user_id = extract_user_id(&headers)?;
    let session = state.store.end_session(user_id, session_id).await?;
    state.aggregator.invalidate(user_id).await;
    Ok(Json(session))
}

/// Session with its exercises and their activations
#[utoipa::path(
    get,
    path = "/v1/sessions/{session_id}",
    responses(
        (status = 200, description = "Session summary", body = SessionSummary),
        (status = 404, description = "Session not found", body = ApiError)
    ),
    params(
        ("session_id" = Uuid, Path, description = "Session ID"),
        ("x-user-id" = Uuid, Header, description = "User ID")
    ),
    tag = "sessions"
)]
pub async fn get_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<Uuid>,
) -> Result<Json<SessionSummary>, AppError> {
    let user_id = extract_user_id(&headers)?;
    let summary = state.store.session_summary(user_id, session_id).await?;
    Ok(Json(summary))
}
