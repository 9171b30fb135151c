use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::records::{ActivationLevel, ExerciseMetadata};

/// A logging session. Owns its exercises; closed once `ended_at` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct WorkoutSession {
    /// Session ID (UUIDv7, time-sortable)
    pub id: Uuid,
    pub user_id: Uuid,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Sum of owned exercise volumes. Authoritative only once the session is closed.
    pub total_volume: f64,
    /// True when exercises were added after `total_volume` was last computed
    pub volume_stale: bool,
}

impl WorkoutSession {
    pub fn is_closed(&self) -> bool {
        self.ended_at.is_some()
    }
}

/// A persisted exercise row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Exercise {
    pub id: Uuid,
    pub session_id: Uuid,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub movement_pattern: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sets: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reps: Option<Vec<f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight: Option<Vec<f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rpe: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tempo: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub metadata: ExerciseMetadata,
    pub total_volume: f64,
    pub created_at: DateTime<Utc>,
}

/// A persisted muscle activation row, owned by one exercise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct MuscleActivation {
    pub id: Uuid,
    pub exercise_id: Uuid,
    pub muscle_name: String,
    pub activation_level: ActivationLevel,
    pub estimated_volume: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ExerciseWithActivations {
    #[serde(flatten)]
    pub exercise: Exercise,
    pub muscle_activations: Vec<MuscleActivation>,
}

/// Read-only composition of a session and everything it owns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SessionSummary {
    pub session: WorkoutSession,
    pub exercises: Vec<ExerciseWithActivations>,
}

/// Request to run free text through the agent and persist the result.
#[derive(Debug, Deserialize, ToSchema)]
pub struct LogWorkoutRequest {
    /// Free-form workout description, e.g. "3 sets of 10 reps at 135 lbs bench press"
    pub text: String,
    /// Append to this open session instead of opening (and closing) a new one
    #[serde(default)]
    pub session_id: Option<Uuid>,
    /// Continue an existing agent conversation
    #[serde(default)]
    pub agent_session_id: Option<String>,
}
