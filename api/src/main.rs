use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use tower::ServiceBuilder;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

mod agent;
mod aggregator;
mod config;
mod error;
mod extract;
mod middleware;
mod pipeline;
mod routes;
mod state;
mod store;

use crate::agent::{AgentClient, HttpAgentTransport};
use crate::aggregator::MuscleVolumeAggregator;
use crate::config::AppConfig;
use crate::pipeline::WorkoutPipeline;
use crate::store::{PgWorkoutStore, WorkoutStore};

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Liftlog API",
        version = "0.1.0",
        description = "Log workouts in plain language. An external agent turns the text into exercises and muscle activations; the API stores them and reports per-muscle volume and training status."
    ),
    paths(
        routes::health::health_check,
        routes::workouts::log_workout,
        routes::workouts::log_workout_stream,
        routes::sessions::create_session,
        routes::sessions::add_exercise,
        routes::sessions::end_session,
        routes::sessions::get_session,
        routes::analytics::muscle_volume,
        routes::analytics::muscle_tracking,
        routes::analytics::volume_progression,
        routes::analytics::frequency,
    ),
    components(schemas(
        HealthResponse,
        liftlog_core::error::ApiError,
        liftlog_core::records::ActivationLevel,
        liftlog_core::records::ExerciseMetadata,
        liftlog_core::records::MuscleActivationRecord,
        liftlog_core::records::ExerciseRecord,
        liftlog_core::workouts::WorkoutSession,
        liftlog_core::workouts::Exercise,
        liftlog_core::workouts::MuscleActivation,
        liftlog_core::workouts::ExerciseWithActivations,
        liftlog_core::workouts::SessionSummary,
        liftlog_core::workouts::LogWorkoutRequest,
        liftlog_core::extraction::ExtractionMethod,
        liftlog_core::aggregates::TrainingStatus,
        liftlog_core::aggregates::MuscleVolumeBucket,
        liftlog_core::aggregates::MuscleTracking,
        liftlog_core::aggregates::VolumePoint,
        liftlog_core::aggregates::VolumeProgression,
        liftlog_core::aggregates::SessionFrequency,
        pipeline::WorkoutLogResult,
        pipeline::PipelineEvent,
        routes::analytics::MuscleVolumeResponse,
        routes::analytics::MuscleTrackingResponse,
    ))
)]
struct ApiDoc;

#[derive(Serialize, utoipa::ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[tokio::main]
async fn main() {
    // Load .env if present (dev only)
    let _ = dotenvy::dotenv();

    // Structured JSON logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "liftlog_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %err, "invalid configuration");
            std::process::exit(1);
        }
    };

    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await
        .expect("Failed to connect to database");

    sqlx::migrate!("../migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    let transport = HttpAgentTransport::new(config.agent.url.clone(), config.agent.api_key.clone())
        .expect("Failed to build agent HTTP client");
    let agent = AgentClient::new(Arc::new(transport), config.agent.retry.clone());

    let store: Arc<dyn WorkoutStore> = Arc::new(PgWorkoutStore::new(pool));
    let aggregator = MuscleVolumeAggregator::new(
        store.clone(),
        config.status_policy,
        config.tracking_cache_ttl,
    );
    let pipeline = WorkoutPipeline::new(
        agent,
        store.clone(),
        aggregator.clone(),
        config.band_weights,
    );

    let app_state = state::AppState {
        store,
        pipeline,
        aggregator,
    };

    let cors_layer = middleware::cors::build_cors_layer(&config.cors_origins);

    let app = Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .merge(routes::router())
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(cors_layer),
        )
        .with_state(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!(
        %addr,
        agent_url = %config.agent.url,
        max_retries = config.agent.retry.max_retries,
        "Liftlog API listening"
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind listener");
    axum::serve(listener, app)
        .await
        .expect("Server error");
}
