use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use liftlog_core::aggregates::ActivationFact;
use liftlog_core::records::{ActivationLevel, ExerciseMetadata, ExerciseRecord};
use liftlog_core::workouts::{
    Exercise, ExerciseWithActivations, MuscleActivation, SessionSummary, WorkoutSession,
};

use super::{StoreError, WorkoutStore};

const SESSION_COLUMNS: &str = "id, user_id, started_at, ended_at, total_volume, volume_stale";
const EXERCISE_COLUMNS: &str = "id, session_id, name, movement_pattern, sets, reps, weight, rpe, \
                                tempo, notes, metadata, total_volume, created_at";
const ACTIVATION_COLUMNS: &str = "id, exercise_id, muscle_name, activation_level, estimated_volume";

/// Postgres-backed store. One transaction per write; the session row lock
/// serializes writers within a session.
#[derive(Clone)]
pub struct PgWorkoutStore {
    pool: PgPool,
}

impl PgWorkoutStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WorkoutStore for PgWorkoutStore {
    async fn create_session(&self, user_id: Uuid) -> Result<WorkoutSession, StoreError> {
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "INSERT INTO workout_sessions (id, user_id, started_at) \
             VALUES ($1, $2, now()) \
             RETURNING {SESSION_COLUMNS}"
        ))
        .bind(Uuid::now_v7())
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(user_id = %user_id, session_id = %row.id, "workout session created");
        Ok(row.into_session())
    }

    async fn store_exercise(
        &self,
        user_id: Uuid,
        session_id: Uuid,
        record: &ExerciseRecord,
    ) -> Result<ExerciseWithActivations, StoreError> {
        let normalized = record.normalized()?;
        let record = &normalized;
        if let Some(issue) = record.band_order_violation() {
            tracing::warn!(session_id = %session_id, exercise = %record.name, %issue, "activation bands out of order");
        }

        let mut tx = self.pool.begin().await?;

        // NO KEY UPDATE conflicts with end_session's FOR UPDATE but not with
        // the KEY SHARE lock taken by the exercises foreign key.
        let session = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {SESSION_COLUMNS} FROM workout_sessions \
             WHERE id = $1 AND user_id = $2 \
             FOR NO KEY UPDATE"
        ))
        .bind(session_id)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::session_not_found(session_id))?;

        if session.ended_at.is_some() {
            return Err(StoreError::InvalidState { session_id });
        }

        let metadata = serde_json::to_value(&record.metadata)
            .unwrap_or_else(|_| serde_json::Value::Object(Default::default()));

        let exercise = sqlx::query_as::<_, ExerciseRow>(&format!(
            "INSERT INTO exercises \
             (id, session_id, name, movement_pattern, sets, reps, weight, rpe, tempo, notes, metadata, total_volume) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
             RETURNING {EXERCISE_COLUMNS}"
        ))
        .bind(Uuid::now_v7())
        .bind(session_id)
        .bind(record.name.trim())
        .bind(record.movement_pattern.clone())
        .bind(record.sets.and_then(|sets| i32::try_from(sets).ok()))
        .bind(record.reps.clone())
        .bind(record.weight.clone())
        .bind(record.rpe)
        .bind(record.tempo.clone())
        .bind(record.notes.clone())
        .bind(metadata)
        .bind(record.total_volume)
        .fetch_one(&mut *tx)
        .await?
        .into_exercise();

        let mut muscle_activations = Vec::with_capacity(record.muscle_activations.len());
        for activation in &record.muscle_activations {
            let row = sqlx::query_as::<_, ActivationRow>(&format!(
                "INSERT INTO muscle_activations \
                 (id, exercise_id, muscle_name, activation_level, estimated_volume) \
                 VALUES ($1, $2, $3, $4, $5) \
                 RETURNING {ACTIVATION_COLUMNS}"
            ))
            .bind(Uuid::now_v7())
            .bind(exercise.id)
            .bind(&activation.muscle_name)
            .bind(activation.activation_level.as_str())
            .bind(activation.estimated_volume)
            .fetch_one(&mut *tx)
            .await?;
            if let Some(activation) = row.into_activation() {
                muscle_activations.push(activation);
            }
        }

        sqlx::query("UPDATE workout_sessions SET volume_stale = TRUE WHERE id = $1")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        tracing::debug!(
            session_id = %session_id,
            exercise_id = %exercise.id,
            activations = muscle_activations.len(),
            total_volume = exercise.total_volume,
            "exercise stored"
        );

        Ok(ExerciseWithActivations {
            exercise,
            muscle_activations,
        })
    }

    async fn end_session(&self, user_id: Uuid, session_id: Uuid) -> Result<WorkoutSession, StoreError> {
        let mut tx = self.pool.begin().await?;

        let session = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {SESSION_COLUMNS} FROM workout_sessions \
             WHERE id = $1 AND user_id = $2 \
             FOR UPDATE"
        ))
        .bind(session_id)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::session_not_found(session_id))?;

        if session.ended_at.is_some() {
            return Err(StoreError::InvalidState { session_id });
        }

        let total_volume = sqlx::query_scalar::<_, f64>(
            "SELECT COALESCE(SUM(total_volume), 0)::DOUBLE PRECISION \
             FROM exercises WHERE session_id = $1",
        )
        .bind(session_id)
        .fetch_one(&mut *tx)
        .await?;

        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "UPDATE workout_sessions \
             SET ended_at = GREATEST(now(), started_at), total_volume = $2, volume_stale = FALSE \
             WHERE id = $1 \
             RETURNING {SESSION_COLUMNS}"
        ))
        .bind(session_id)
        .bind(total_volume)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(user_id = %user_id, session_id = %session_id, total_volume, "workout session ended");
        Ok(row.into_session())
    }

    async fn discard_session(&self, user_id: Uuid, session_id: Uuid) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let ended_at = sqlx::query_scalar::<_, Option<DateTime<Utc>>>(
            "SELECT ended_at FROM workout_sessions \
             WHERE id = $1 AND user_id = $2 \
             FOR UPDATE",
        )
        .bind(session_id)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::session_not_found(session_id))?;

        if ended_at.is_some() {
            return Err(StoreError::InvalidState { session_id });
        }

        // exercises and activations go with it (ON DELETE CASCADE)
        sqlx::query("DELETE FROM workout_sessions WHERE id = $1")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        tracing::info!(user_id = %user_id, session_id = %session_id, "workout session discarded");
        Ok(())
    }

    async fn session_summary(&self, user_id: Uuid, session_id: Uuid) -> Result<SessionSummary, StoreError> {
        let session = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {SESSION_COLUMNS} FROM workout_sessions WHERE id = $1 AND user_id = $2"
        ))
        .bind(session_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::session_not_found(session_id))?;

        let exercises: Vec<Exercise> = sqlx::query_as::<_, ExerciseRow>(&format!(
            "SELECT {EXERCISE_COLUMNS} FROM exercises \
             WHERE session_id = $1 \
             ORDER BY created_at, id"
        ))
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(ExerciseRow::into_exercise)
        .collect();

        let exercise_ids: Vec<Uuid> = exercises.iter().map(|e| e.id).collect();
        let rows = sqlx::query_as::<_, ActivationRow>(&format!(
            "SELECT {ACTIVATION_COLUMNS} FROM muscle_activations \
             WHERE exercise_id = ANY($1) \
             ORDER BY id"
        ))
        .bind(&exercise_ids)
        .fetch_all(&self.pool)
        .await?;

        let mut by_exercise: HashMap<Uuid, Vec<MuscleActivation>> = HashMap::new();
        for activation in rows.into_iter().filter_map(ActivationRow::into_activation) {
            by_exercise
                .entry(activation.exercise_id)
                .or_default()
                .push(activation);
        }

        let exercises = exercises
            .into_iter()
            .map(|exercise| ExerciseWithActivations {
                muscle_activations: by_exercise.remove(&exercise.id).unwrap_or_default(),
                exercise,
            })
            .collect();

        Ok(SessionSummary {
            session: session.into_session(),
            exercises,
        })
    }

    async fn activation_facts(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<ActivationFact>, StoreError> {
        let rows = sqlx::query_as::<_, FactRow>(
            "SELECT s.id AS session_id, e.id AS exercise_id, s.started_at AS session_started_at, \
                    m.muscle_name, m.activation_level, m.estimated_volume \
             FROM muscle_activations m \
             JOIN exercises e ON e.id = m.exercise_id \
             JOIN workout_sessions s ON s.id = e.session_id \
             WHERE s.user_id = $1 AND s.ended_at IS NOT NULL AND s.started_at >= $2 \
             ORDER BY s.started_at, m.id",
        )
        .bind(user_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().filter_map(FactRow::into_fact).collect())
    }

    async fn completed_session_starts(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>, StoreError> {
        let starts = sqlx::query_scalar::<_, DateTime<Utc>>(
            "SELECT started_at FROM workout_sessions \
             WHERE user_id = $1 AND ended_at IS NOT NULL AND started_at >= $2 \
             ORDER BY started_at",
        )
        .bind(user_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(starts)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }
}

// --- Row types for sqlx mapping ---

#[derive(sqlx::FromRow)]
struct SessionRow {
    id: Uuid,
    user_id: Uuid,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    total_volume: f64,
    volume_stale: bool,
}

impl SessionRow {
    fn into_session(self) -> WorkoutSession {
        WorkoutSession {
            id: self.id,
            user_id: self.user_id,
            started_at: self.started_at,
            ended_at: self.ended_at,
            total_volume: self.total_volume,
            volume_stale: self.volume_stale,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ExerciseRow {
    id: Uuid,
    session_id: Uuid,
    name: String,
    movement_pattern: Option<String>,
    sets: Option<i32>,
    reps: Option<Vec<f64>>,
    weight: Option<Vec<f64>>,
    rpe: Option<f64>,
    tempo: Option<String>,
    notes: Option<String>,
    metadata: serde_json::Value,
    total_volume: f64,
    created_at: DateTime<Utc>,
}

impl ExerciseRow {
    fn into_exercise(self) -> Exercise {
        let metadata: ExerciseMetadata = serde_json::from_value(self.metadata).unwrap_or_default();
        Exercise {
            id: self.id,
            session_id: self.session_id,
            name: self.name,
            movement_pattern: self.movement_pattern,
            sets: self.sets.and_then(|sets| u32::try_from(sets).ok()),
            reps: self.reps,
            weight: self.weight,
            rpe: self.rpe,
            tempo: self.tempo,
            notes: self.notes,
            metadata,
            total_volume: self.total_volume,
            created_at: self.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ActivationRow {
    id: Uuid,
    exercise_id: Uuid,
    muscle_name: String,
    activation_level: String,
    estimated_volume: f64,
}

impl ActivationRow {
    fn into_activation(self) -> Option<MuscleActivation> {
        let Some(activation_level) = ActivationLevel::from_db_value(&self.activation_level) else {
            tracing::warn!(activation_id = %self.id, level = %self.activation_level, "unknown activation level");
            return None;
        };
        Some(MuscleActivation {
            id: self.id,
            exercise_id: self.exercise_id,
            muscle_name: self.muscle_name,
            activation_level,
            estimated_volume: self.estimated_volume,
        })
    }
}

#[derive(sqlx::FromRow)]
struct FactRow {
    session_id: Uuid,
    exercise_id: Uuid,
    session_started_at: DateTime<Utc>,
    muscle_name: String,
    activation_level: String,
    estimated_volume: f64,
}

impl FactRow {
    fn into_fact(self) -> Option<ActivationFact> {
        Some(ActivationFact {
            session_id: self.session_id,
            exercise_id: self.exercise_id,
            session_started_at: self.session_started_at,
            muscle_name: self.muscle_name,
            activation_level: ActivationLevel::from_db_value(&self.activation_level)?,
            estimated_volume: self.estimated_volume,
        })
    }
}
