//! Persistence of the session -> exercise -> muscle activation graph.

#[cfg(test)]
pub mod memory;
mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use liftlog_core::aggregates::ActivationFact;
use liftlog_core::records::{ExerciseRecord, ValidationIssue};
use liftlog_core::workouts::{ExerciseWithActivations, SessionSummary, WorkoutSession};

pub use postgres::PgWorkoutStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    /// The session exists but cannot accept the operation (already closed).
    #[error("session {session_id} is closed")]
    InvalidState { session_id: Uuid },

    #[error(transparent)]
    Validation(#[from] ValidationIssue),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    pub fn session_not_found(id: Uuid) -> Self {
        Self::NotFound {
            entity: "session",
            id,
        }
    }
}

/// Every method is scoped to `user_id`: another user's session reads as not found.
#[async_trait]
pub trait WorkoutStore: Send + Sync {
    async fn create_session(&self, user_id: Uuid) -> Result<WorkoutSession, StoreError>;

    /// Normalize muscle names and validate, then write the exercise and all its activations in one
    /// transaction. The session must be open. Marks the session volume stale.
    async fn store_exercise(
        &self,
        user_id: Uuid,
        session_id: Uuid,
        record: &ExerciseRecord,
    ) -> Result<ExerciseWithActivations, StoreError>;

    /// Close the session and recompute its volume from committed exercises.
    async fn end_session(&self, user_id: Uuid, session_id: Uuid) -> Result<WorkoutSession, StoreError>;

    /// Delete an open session with all its exercises and activations. Used to
    /// roll back a multi-exercise write that failed part way. Closed sessions
    /// are rejected with `InvalidState`.
    async fn discard_session(&self, user_id: Uuid, session_id: Uuid) -> Result<(), StoreError>;

    async fn session_summary(&self, user_id: Uuid, session_id: Uuid) -> Result<SessionSummary, StoreError>;

    /// Activations from the user's completed sessions started at or after `since`.
    async fn activation_facts(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<ActivationFact>, StoreError>;

    /// Start times of the user's completed sessions started at or after `since`, oldest first.
    async fn completed_session_starts(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}
