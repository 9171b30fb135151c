use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use liftlog_core::aggregates::{
    MAX_WINDOW_DAYS, MuscleTracking, MuscleVolumeBucket, SessionFrequency, VolumeProgression,
    VolumeWindow,
};
use liftlog_core::error::ApiError;

use crate::error::AppError;
use crate::routes::extract_user_id;
use crate::state::AppState;

const DEFAULT_DAYS: u32 = 30;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/analytics/muscle-volume", get(muscle_volume))
        .route("/v1/analytics/muscle-tracking", get(muscle_tracking))
        .route("/v1/analytics/volume-progression", get(volume_progression))
        .route("/v1/analytics/frequency", get(frequency))
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct WindowParams {
    /// `weekly` (7 days, default), `monthly` (30 days) or a day count
    pub window: Option<String>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct DaysParams {
    /// Lookback in days (default 30)
    pub days: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct MuscleVolumeResponse {
    pub window_days: u32,
    pub volumes: Vec<MuscleVolumeBucket>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct MuscleTrackingResponse {
    pub days: u32,
    /// Volume below which a recently trained muscle counts as maintenance
    pub volume_threshold: f64,
    pub undertrained_after_days: i64,
    pub muscles: Vec<MuscleTracking>,
}

fn parse_window(raw: Option<&str>) -> Result<VolumeWindow, AppError> {
    match raw {
        None => Ok(VolumeWindow::default()),
        Some(raw) => VolumeWindow::parse(raw).ok_or_else(|| AppError::Validation {
            message: format!("window must be weekly, monthly or a day count from 1 to {MAX_WINDOW_DAYS}"),
            field: Some("window".to_string()),
            received: Some(serde_json::Value::String(raw.to_string())),
            docs_hint: None,
        }),
    }
}

fn parse_days(raw: Option<&str>) -> Result<u32, AppError> {
    let Some(raw) = raw else {
        return Ok(DEFAULT_DAYS);
    };
    raw.trim()
        .parse::<u32>()
        .ok()
        .filter(|days| (1..=MAX_WINDOW_DAYS).contains(days))
        .ok_or_else(|| AppError::Validation {
            message: format!("days must be a whole number from 1 to {MAX_WINDOW_DAYS}"),
            field: Some("days".to_string()),
            received: Some(serde_json::Value::String(raw.to_string())),
            docs_hint: None,
        })
}

/// Volume per muscle per calendar day, from completed sessions in the window
#[utoipa::path(
    get,
    path = "/v1/analytics/muscle-volume",
    params(
        WindowParams,
        ("x-user-id" = Uuid, Header, description = "User ID")
    ),
    responses(
        (status = 200, description = "Daily volume per muscle", body = MuscleVolumeResponse),
        (status = 400, description = "Validation error", body = ApiError)
    ),
    tag = "analytics"
)]
pub async fn muscle_volume(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<WindowParams>,
) -> Result<Json<MuscleVolumeResponse>, AppError> {
    let user_id = extract_user_id(&headers)?;
    let window = parse_window(params.window.as_deref())?;
    let volumes = state.aggregator.get_volume(user_id, window).await?;
    Ok(Json(MuscleVolumeResponse {
        window_days: window.days(),
        volumes,
    }))
}

/// Per-muscle totals with training status
///
/// Status: more than `undertrained_after_days` since last trained is
/// `Undertrained`; otherwise volume below `volume_threshold` is
/// `Maintenance`; otherwise `Optimal`.
#[utoipa::path(
    get,
    path = "/v1/analytics/muscle-tracking",
    params(
        DaysParams,
        ("x-user-id" = Uuid, Header, description = "User ID")
    ),
    responses(
        (status = 200, description = "Tracking per muscle, highest volume first", body = MuscleTrackingResponse),
        (status = 400, description = "Validation error", body = ApiError)
    ),
    tag = "analytics"
)]
pub async fn muscle_tracking(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<DaysParams>,
) -> Result<Json<MuscleTrackingResponse>, AppError> {
    let user_id = extract_user_id(&headers)?;
    let days = parse_days(params.days.as_deref())?;
    let muscles = state.aggregator.get_tracking(user_id, days).await?;
    let policy = state.aggregator.policy();
    Ok(Json(MuscleTrackingResponse {
        days,
        volume_threshold: policy.volume_threshold,
        undertrained_after_days: policy.undertrained_after_days,
        muscles,
    }))
}

#[utoipa::path(
    get,
    path = "/v1/analytics/volume-progression",
    params(
        WindowParams,
        ("x-user-id" = Uuid, Header, description = "User ID")
    ),
    responses(
        (status = 200, description = "Daily series per muscle, oldest first", body = VolumeProgression),
        (status = 400, description = "Validation error", body = ApiError)
    ),
    tag = "analytics"
)]
pub async fn volume_progression(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<WindowParams>,
) -> Result<Json<VolumeProgression>, AppError> {
    let user_id = extract_user_id(&headers)?;
    let window = parse_window(params.window.as_deref())?;
    let progression = state
        .aggregator
        .get_volume_progression(user_id, window)
        .await?;
    Ok(Json(progression))
}

#[utoipa::path(
    get,
    path = "/v1/analytics/frequency",
    params(
        DaysParams,
        ("x-user-id" = Uuid, Header, description = "User ID")
    ),
    responses(
        (status = 200, description = "Completed session frequency", body = SessionFrequency),
        (status = 400, description = "Validation error", body = ApiError)
    ),
    tag = "analytics"
)]
pub async fn frequency(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<DaysParams>,
) -> Result<Json<SessionFrequency>, AppError> {
    let user_id = extract_user_id(&headers)?;
    let days = parse_days(params.days.as_deref())?;
    Ok(Json(state.aggregator.get_frequency(user_id, days).await?))
}
