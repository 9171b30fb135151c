use std::convert::Infallible;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::post;
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use uuid::Uuid;

use liftlog_core::error::ApiError;
use liftlog_core::workouts::LogWorkoutRequest;

use crate::error::AppError;
use crate::extract::AppJson;
use crate::pipeline::{PipelineEvent, WorkoutLogResult};
use crate::routes::extract_user_id;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/workouts/log", post(log_workout))
        .route("/v1/workouts/log/stream", post(log_workout_stream))
}

fn validate_log_request(req: &LogWorkoutRequest) -> Result<(), AppError> {
    if req.text.trim().is_empty() {
        return Err(AppError::Validation {
            message: "text must not be empty".to_string(),
            field: Some("text".to_string()),
            received: Some(serde_json::Value::String(req.text.clone())),
            docs_hint: Some(
                "Describe the workout in plain words, e.g. '3 sets of 10 reps at 135 lbs bench press'"
                    .to_string(),
            ),
        });
    }
    Ok(())
}

/// Run a workout description through the agent and store what it contained.
///
/// Returns 201 when exercises were stored. When the agent reply holds no
/// structured data the message is returned with 200 and nothing is written.
#[utoipa::path(
    post,
    path = "/v1/workouts/log",
    request_body = LogWorkoutRequest,
    responses(
        (status = 201, description = "Workout extracted and stored", body = WorkoutLogResult),
        (status = 200, description = "Agent replied without workout data; nothing stored", body = WorkoutLogResult),
        (status = 400, description = "Validation error", body = ApiError),
        (status = 404, description = "Target session not found", body = ApiError),
        (status = 409, description = "Target session already ended", body = ApiError),
        (status = 502, description = "Agent unavailable or returned nothing usable", body = ApiError)
    ),
    params(
        ("x-user-id" = Uuid, Header, description = "User ID")
    ),
    tag = "workouts"
)]
pub async fn log_workout(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppJson(req): AppJson<LogWorkoutRequest>,
) -> Result<impl IntoResponse, AppError> {
    let user_id = extract_user_id(&headers)?;
    validate_log_request(&req)?;

    let result = state
        .pipeline
        .process(user_id, &req.text, req.session_id, req.agent_session_id)
        .await?;

    let status = if result.exercises.is_empty() {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(result)))
}

/// Streamed variant of `/v1/workouts/log` as server-sent events.
///
/// Event names: `message` (agent text), `muscle_data` (first structured
/// records, not yet stored), then one of `stored` or `error`.
#[utoipa::path(
    post,
    path = "/v1/workouts/log/stream",
    request_body = LogWorkoutRequest,
    responses(
        (status = 200, description = "text/event-stream of PipelineEvent", body = PipelineEvent),
        (status = 400, description = "Validation error", body = ApiError)
    ),
    params(
        ("x-user-id" = Uuid, Header, description = "User ID")
    ),
    tag = "workouts"
)]
pub async fn log_workout_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppJson(req): AppJson<LogWorkoutRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let user_id = extract_user_id(&headers)?;
    validate_log_request(&req)?;

    let events = state
        .pipeline
        .process_streaming(user_id, req.text, req.session_id, req.agent_session_id)
        .map(|event| Ok(sse_event(&event)));

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

fn sse_event(event: &PipelineEvent) -> Event {
    Event::default()
        .event(event.name())
        .json_data(event)
        .unwrap_or_else(|err| {
            tracing::error!(error = %err, "failed to encode pipeline event");
            Event::default().event("error").data("event encoding failed")
        })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::to_bytes;
    use serde_json::json;
    use tower::ServiceExt;

    use super::*;
    use crate::pipeline::tests::{BENCH_JSON, CannedTransport};
    use crate::routes::test_support::{app, request, send};
    use crate::store::memory::MemoryStore;

    #[tokio::test]
    async fn log_stores_extracted_workout() {
        let store = Arc::new(MemoryStore::new());
        let app = app(CannedTransport::reply(BENCH_JSON), store.clone());
        let user = Uuid::now_v7();

        let (status, body) = send(
            &app,
            request(
                "POST",
                "/v1/workouts/log",
                Some(user),
                Some(json!({"text": "3 sets of 10 reps at 135 lbs bench press"})),
            ),
        )
        .await;

        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["extraction"], "structured_json");
        assert_eq!(body["session"]["total_volume"], 4050.0);
        assert_eq!(body["exercises"][0]["name"], "bench press");
        assert_eq!(body["tracking"][0]["muscle_name"], "chest");
        assert_eq!(store.exercise_count().await, 1);
    }

    #[tokio::test]
    async fn log_without_structured_data_returns_message() {
        let store = Arc::new(MemoryStore::new());
        let app = app(CannedTransport::reply("Nice, rest up."), store.clone());

        let (status, body) = send(
            &app,
            request(
                "POST",
                "/v1/workouts/log",
                Some(Uuid::now_v7()),
                Some(json!({"text": "felt tired"})),
            ),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "Nice, rest up.");
        assert!(body.get("session").is_none());
        assert_eq!(store.exercise_count().await, 0);
    }

    #[tokio::test]
    async fn log_rejects_blank_text_and_missing_user() {
        let app = app(CannedTransport::reply(BENCH_JSON), Arc::new(MemoryStore::new()));

        let (status, body) = send(
            &app,
            request("POST", "/v1/workouts/log", Some(Uuid::now_v7()), Some(json!({"text": "  "}))),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "validation_failed");
        assert_eq!(body["field"], "text");

        let (status, body) = send(
            &app,
            request("POST", "/v1/workouts/log", None, Some(json!({"text": "bench"}))),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["field"], "headers.x-user-id");
    }

    #[tokio::test]
    async fn log_into_unknown_session_is_not_found() {
        let app = app(CannedTransport::reply(BENCH_JSON), Arc::new(MemoryStore::new()));
        let (status, body) = send(
            &app,
            request(
                "POST",
                "/v1/workouts/log",
                Some(Uuid::now_v7()),
                Some(json!({"text": "bench", "session_id": Uuid::now_v7()})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");
    }

    #[tokio::test]
    async fn stream_emits_named_sse_events() {
        let store = Arc::new(MemoryStore::new());
        let app = app(CannedTransport::reply(""), store);

        // CannedTransport::reply streams nothing, so the only event is the error.
        let response = app
            .oneshot(request(
                "POST",
                "/v1/workouts/log/stream",
                Some(Uuid::now_v7()),
                Some(json!({"text": "bench"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "text/event-stream");
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("event: error"));
        assert!(text.contains("agent_invalid_response"));
    }
}
