//! In-process store used by handler and pipeline tests.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use liftlog_core::aggregates::ActivationFact;
use liftlog_core::records::{
    ActivationLevel, ExerciseMetadata, ExerciseRecord, MuscleActivationRecord,
};
use liftlog_core::workouts::{
    Exercise, ExerciseWithActivations, MuscleActivation, SessionSummary, WorkoutSession,
};

use super::{StoreError, WorkoutStore};

#[derive(Default)]
struct Tables {
    sessions: Vec<WorkoutSession>,
    exercises: Vec<Exercise>,
    activations: Vec<MuscleActivation>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    /// Counts down per `store_exercise` call; the call that takes it from 1 to 0
    /// fails its activation insert after staging. 0 means disarmed.
    failing_write_countdown: AtomicUsize,
    pub fact_queries: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_activation_write(&self) {
        self.fail_activation_write_after(0);
    }

    /// Let `successful_writes` exercises through, then fail the next one.
    pub fn fail_activation_write_after(&self, successful_writes: usize) {
        self.failing_write_countdown
            .store(successful_writes + 1, Ordering::SeqCst);
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_write_countdown
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok_and(|previous| previous == 1)
    }

    /// Insert a closed session with a fixed start time.
    pub async fn seed_completed_session(
        &self,
        user_id: Uuid,
        started_at: DateTime<Utc>,
        records: &[ExerciseRecord],
    ) -> Uuid {
        let session = self.create_session(user_id).await.expect("create session");
        {
            let mut tables = self.tables.lock().await;
            if let Some(row) = tables.sessions.iter_mut().find(|s| s.id == session.id) {
                row.started_at = started_at;
            }
        }
        for record in records {
            self.store_exercise(user_id, session.id, record)
                .await
                .expect("store exercise");
        }
        self.end_session(user_id, session.id)
            .await
            .expect("end session");
        session.id
    }

    pub async fn exercise_count(&self) -> usize {
        self.tables.lock().await.exercises.len()
    }

    pub async fn activation_count(&self) -> usize {
        self.tables.lock().await.activations.len()
    }

    pub async fn session_count(&self) -> usize {
        self.tables.lock().await.sessions.len()
    }
}

/// 3x10 @ 135 bench press split 60/40 over chest and triceps.
pub fn bench_record() -> ExerciseRecord {
    ExerciseRecord {
        name: "bench press".to_string(),
        movement_pattern: None,
        sets: Some(3),
        reps: Some(vec![10.0; 3]),
        weight: Some(vec![135.0; 3]),
        rpe: None,
        tempo: None,
        notes: None,
        metadata: ExerciseMetadata::default(),
        total_volume: 4050.0,
        muscle_activations: vec![
            MuscleActivationRecord {
                muscle_name: "chest".to_string(),
                activation_level: ActivationLevel::Primary,
                estimated_volume: 2430.0,
            },
            MuscleActivationRecord {
                muscle_name: "triceps".to_string(),
                activation_level: ActivationLevel::Secondary,
                estimated_volume: 1620.0,
            },
        ],
    }
}

fn owned_session(tables: &Tables, user_id: Uuid, session_id: Uuid) -> Result<usize, StoreError> {
    tables
        .sessions
        .iter()
        .position(|s| s.id == session_id && s.user_id == user_id)
        .ok_or_else(|| StoreError::session_not_found(session_id))
}

#[async_trait]
impl WorkoutStore for MemoryStore {
    async fn create_session(&self, user_id: Uuid) -> Result<WorkoutSession, StoreError> {
        let session = WorkoutSession {
            id: Uuid::now_v7(),
            user_id,
            started_at: Utc::now(),
            ended_at: None,
            total_volume: 0.0,
            volume_stale: false,
        };
        self.tables.lock().await.sessions.push(session.clone());
        Ok(session)
    }

    async fn store_exercise(
        &self,
        user_id: Uuid,
        session_id: Uuid,
        record: &ExerciseRecord,
    ) -> Result<ExerciseWithActivations, StoreError> {
        let normalized = record.normalized()?;
        let record = &normalized;
        let mut tables = self.tables.lock().await;
        let idx = owned_session(&tables, user_id, session_id)?;
        if tables.sessions[idx].is_closed() {
            return Err(StoreError::InvalidState { session_id });
        }

        // Stage everything, publish only when every row succeeded.
        let exercise = Exercise {
            id: Uuid::now_v7(),
            session_id,
            name: record.name.trim().to_string(),
            movement_pattern: record.movement_pattern.clone(),
            sets: record.sets,
            reps: record.reps.clone(),
            weight: record.weight.clone(),
            rpe: record.rpe,
            tempo: record.tempo.clone(),
            notes: record.notes.clone(),
            metadata: record.metadata.clone(),
            total_volume: record.total_volume,
            created_at: Utc::now(),
        };
        if self.take_injected_failure() {
            return Err(StoreError::Database(sqlx::Error::Protocol(
                "injected activation write failure".to_string(),
            )));
        }
        let mut staged = Vec::with_capacity(record.muscle_activations.len());
        for activation in &record.muscle_activations {
            staged.push(MuscleActivation {
                id: Uuid::now_v7(),
                exercise_id: exercise.id,
                muscle_name: activation.muscle_name.clone(),
                activation_level: activation.activation_level,
                estimated_volume: activation.estimated_volume,
            });
        }

        tables.exercises.push(exercise.clone());
        tables.activations.extend(staged.iter().cloned());
        tables.sessions[idx].volume_stale = true;

        Ok(ExerciseWithActivations {
            exercise,
            muscle_activations: staged,
        })
    }

    async fn end_session(&self, user_id: Uuid, session_id: Uuid) -> Result<WorkoutSession, StoreError> {
        let mut tables = self.tables.lock().await;
        let idx = owned_session(&tables, user_id, session_id)?;
        if tables.sessions[idx].is_closed() {
            return Err(StoreError::InvalidState { session_id });
        }
        let total: f64 = tables
            .exercises
            .iter()
            .filter(|e| e.session_id == session_id)
            .map(|e| e.total_volume)
            .sum();
        let session = &mut tables.sessions[idx];
        session.ended_at = Some(Utc::now().max(session.started_at));
        session.total_volume = total;
        session.volume_stale = false;
        Ok(session.clone())
    }

    async fn discard_session(&self, user_id: Uuid, session_id: Uuid) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        let idx = owned_session(&tables, user_id, session_id)?;
        if tables.sessions[idx].is_closed() {
            return Err(StoreError::InvalidState { session_id });
        }
        tables.sessions.remove(idx);
        let dropped: Vec<Uuid> = tables
            .exercises
            .iter()
            .filter(|e| e.session_id == session_id)
            .map(|e| e.id)
            .collect();
        tables.exercises.retain(|e| e.session_id != session_id);
        tables.activations.retain(|a| !dropped.contains(&a.exercise_id));
        Ok(())
    }

    async fn session_summary(&self, user_id: Uuid, session_id: Uuid) -> Result<SessionSummary, StoreError> {
        let tables = self.tables.lock().await;
        let idx = owned_session(&tables, user_id, session_id)?;
        let exercises = tables
            .exercises
            .iter()
            .filter(|e| e.session_id == session_id)
            .map(|exercise| ExerciseWithActivations {
                exercise: exercise.clone(),
                muscle_activations: tables
                    .activations
                    .iter()
                    .filter(|a| a.exercise_id == exercise.id)
                    .cloned()
                    .collect(),
            })
            .collect();
        Ok(SessionSummary {
            session: tables.sessions[idx].clone(),
            exercises,
        })
    }

    async fn activation_facts(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<ActivationFact>, StoreError> {
        self.fact_queries.fetch_add(1, Ordering::SeqCst);
        let tables = self.tables.lock().await;
        let mut facts = Vec::new();
        for session in tables
            .sessions
            .iter()
            .filter(|s| s.user_id == user_id && s.is_closed() && s.started_at >= since)
        {
            for exercise in tables.exercises.iter().filter(|e| e.session_id == session.id) {
                for activation in tables.activations.iter().filter(|a| a.exercise_id == exercise.id) {
                    facts.push(ActivationFact {
                        session_id: session.id,
                        exercise_id: exercise.id,
                        session_started_at: session.started_at,
                        muscle_name: activation.muscle_name.clone(),
                        activation_level: activation.activation_level,
                        estimated_volume: activation.estimated_volume,
                    });
                }
            }
        }
        Ok(facts)
    }

    async fn completed_session_starts(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>, StoreError> {
        let tables = self.tables.lock().await;
        let mut starts: Vec<DateTime<Utc>> = tables
            .sessions
            .iter()
            .filter(|s| s.user_id == user_id && s.is_closed() && s.started_at >= since)
            .map(|s| s.started_at)
            .collect();
        starts.sort();
        Ok(starts)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn failed_activation_write_leaves_no_rows() {
        let store = MemoryStore::new();
        let user = Uuid::now_v7();
        let session = store.create_session(user).await.unwrap();

        store.fail_next_activation_write();
        let err = store
            .store_exercise(user, session.id, &bench_record())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Database(_)));
        assert_eq!(store.exercise_count().await, 0);
        assert_eq!(store.activation_count().await, 0);

        store
            .store_exercise(user, session.id, &bench_record())
            .await
            .unwrap();
        assert_eq!(store.exercise_count().await, 1);
        assert_eq!(store.activation_count().await, 2);
    }

    #[tokio::test]
    async fn closed_sessions_reject_writes_and_report_total() {
        let store = MemoryStore::new();
        let user = Uuid::now_v7();
        let session = store.create_session(user).await.unwrap();
        store
            .store_exercise(user, session.id, &bench_record())
            .await
            .unwrap();

        let closed = store.end_session(user, session.id).await.unwrap();
        assert_eq!(closed.total_volume, 4050.0);
        assert!(!closed.volume_stale);

        let err = store
            .store_exercise(user, session.id, &bench_record())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidState { .. }));
        assert!(matches!(
            store.end_session(user, session.id).await,
            Err(StoreError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn other_users_sessions_are_not_found() {
        let store = MemoryStore::new();
        let owner = Uuid::now_v7();
        let session = store.create_session(owner).await.unwrap();
        let err = store
            .session_summary(Uuid::now_v7(), session.id)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { entity: "session", .. }));
    }

    #[tokio::test]
    async fn invalid_records_write_nothing() {
        let store = MemoryStore::new();
        let user = Uuid::now_v7();
        let session = store.create_session(user).await.unwrap();
        let mut record = bench_record();
        record.weight = Some(vec![135.0, 135.0]);
        let err = store
            .store_exercise(user, session.id, &record)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
        assert_eq!(store.exercise_count().await, 0);
    }

    #[tokio::test]
    async fn muscle_names_are_stored_canonical() {
        let store = MemoryStore::new();
        let user = Uuid::now_v7();
        let session = store.create_session(user).await.unwrap();
        let mut record = bench_record();
        record.muscle_activations[0].muscle_name = "Chest ".to_string();
        record.muscle_activations[1].muscle_name = "TRICEPS".to_string();

        let stored = store
            .store_exercise(user, session.id, &record)
            .await
            .unwrap();
        let names: Vec<&str> = stored
            .muscle_activations
            .iter()
            .map(|a| a.muscle_name.as_str())
            .collect();
        assert_eq!(names, vec!["chest", "triceps"]);

        store.end_session(user, session.id).await.unwrap();
        let facts = store
            .activation_facts(user, Utc::now() - chrono::Duration::days(1))
            .await
            .unwrap();
        assert!(facts.iter().any(|f| f.muscle_name == "chest"));
    }

    #[tokio::test]
    async fn discard_removes_session_graph() {
        let store = MemoryStore::new();
        let user = Uuid::now_v7();
        let keep = store.create_session(user).await.unwrap();
        let discarded = store.create_session(user).await.unwrap();
        store.store_exercise(user, keep.id, &bench_record()).await.unwrap();
        store.store_exercise(user, discarded.id, &bench_record()).await.unwrap();
        store.store_exercise(user, discarded.id, &bench_record()).await.unwrap();

        store.discard_session(user, discarded.id).await.unwrap();
        assert_eq!(store.session_count().await, 1);
        assert_eq!(store.exercise_count().await, 1);
        assert_eq!(store.activation_count().await, 2);
        assert!(matches!(
            store.session_summary(user, discarded.id).await,
            Err(StoreError::NotFound { .. })
        ));

        store.end_session(user, keep.id).await.unwrap();
        assert!(matches!(
            store.discard_session(user, keep.id).await,
            Err(StoreError::InvalidState { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writes_stay_in_their_own_session() {
        let store = Arc::new(MemoryStore::new());
        let user = Uuid::now_v7();
        let first = store.create_session(user).await.unwrap().id;
        let second = store.create_session(user).await.unwrap().id;
        store.fail_activation_write_after(7);

        let handles: Vec<_> = (0..20)
            .map(|n| {
                let store = store.clone();
                let session_id = if n % 2 == 0 { first } else { second };
                tokio::spawn(async move {
                    store
                        .store_exercise(user, session_id, &bench_record())
                        .await
                        .map(|stored| stored.exercise.session_id)
                })
            })
            .collect();

        let mut committed: HashMap<Uuid, usize> = HashMap::new();
        let mut failures = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(session_id) => *committed.entry(session_id).or_default() += 1,
                Err(StoreError::Database(_)) => failures += 1,
                Err(other) => panic!("unexpected error {other:?}"),
            }
        }
        assert_eq!(failures, 1);
        assert_eq!(committed.values().sum::<usize>(), 19);

        for session_id in [first, second] {
            let count = committed.get(&session_id).copied().unwrap_or(0);
            let summary = store.session_summary(user, session_id).await.unwrap();
            assert_eq!(summary.exercises.len(), count);
            assert!(
                summary
                    .exercises
                    .iter()
                    .all(|e| e.exercise.session_id == session_id && e.muscle_activations.len() == 2)
            );
            let ended = store.end_session(user, session_id).await.unwrap();
            assert_eq!(ended.total_volume, 4050.0 * count as f64);
        }
        assert_eq!(store.activation_count().await, 38);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn end_session_racing_writes_sums_only_committed_rows() {
        let store = Arc::new(MemoryStore::new());
        let user = Uuid::now_v7();
        let session_id = store.create_session(user).await.unwrap().id;

        let writers: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    store.store_exercise(user, session_id, &bench_record()).await
                })
            })
            .collect();
        let closer = {
            let store = store.clone();
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                store.end_session(user, session_id).await
            })
        };

        let mut stored = 0;
        for writer in writers {
            match writer.await.unwrap() {
                Ok(_) => stored += 1,
                Err(StoreError::InvalidState { .. }) => {}
                Err(other) => panic!("unexpected error {other:?}"),
            }
        }
        let ended = closer.await.unwrap().unwrap();

        assert_eq!(ended.total_volume, 4050.0 * stored as f64);
        assert_eq!(store.exercise_count().await, stored);
    }
}
