//! Free text in, persisted workout and refreshed tracking out.

use std::sync::Arc;

use futures::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use utoipa::ToSchema;
use uuid::Uuid;

use liftlog_core::aggregates::MuscleTracking;
use liftlog_core::error::codes;
use liftlog_core::extraction::{
    AgentResponse, BandWeights, ExtractedWorkout, ExtractionBuffer, ExtractionMethod,
};
use liftlog_core::records::{ExerciseRecord, ValidationIssue};
use liftlog_core::workouts::{ExerciseWithActivations, WorkoutSession};

use crate::agent::{AgentClient, AgentError, TextFragment};
use crate::aggregator::MuscleVolumeAggregator;
use crate::store::{StoreError, WorkoutStore};

/// Window for the tracking snapshot returned with each logged workout.
pub const RESULT_TRACKING_DAYS: u32 = 30;

const EVENT_BUFFER: usize = 32;

/// Returned in place of an empty agent message when nothing was extracted.
pub const NO_WORKOUT_MESSAGE: &str = "No workout detected in the agent reply.";

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Agent(#[from] AgentError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PipelineError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Agent(AgentError::InvalidResponse(_)) => codes::AGENT_INVALID_RESPONSE,
            Self::Agent(_) => codes::AGENT_UNAVAILABLE,
            Self::Store(StoreError::NotFound { .. }) => codes::NOT_FOUND,
            Self::Store(StoreError::InvalidState { .. }) => codes::INVALID_STATE,
            Self::Store(StoreError::Validation(_)) => codes::VALIDATION_FAILED,
            Self::Store(StoreError::Database(_)) => codes::INTERNAL_ERROR,
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct WorkoutLogResult {
    /// Agent message, returned even when nothing could be extracted
    pub message: String,
    /// Pass back as `agent_session_id` to continue the conversation
    pub agent_session_id: String,
    /// Strategy that produced the stored exercises; absent when nothing was extracted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extraction: Option<ExtractionMethod>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<WorkoutSession>,
    pub exercises: Vec<ExerciseWithActivations>,
    pub tracking: Vec<MuscleTracking>,
}

impl WorkoutLogResult {
    fn message_only(message: String, agent_session_id: String) -> Self {
        Self {
            message,
            agent_session_id,
            extraction: None,
            session: None,
            exercises: Vec::new(),
            tracking: Vec::new(),
        }
    }
}

/// Progress of a streamed workout log, in emission order.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    /// A text fragment as the agent produced it
    Message { text: String },
    /// First structured records seen in the stream, before anything is stored
    MuscleData {
        method: ExtractionMethod,
        exercises: Vec<ExerciseRecord>,
    },
    Stored { result: WorkoutLogResult },
    Error { error: String, message: String },
}

impl PipelineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Message { .. } => "message",
            Self::MuscleData { .. } => "muscle_data",
            Self::Stored { .. } => "stored",
            Self::Error { .. } => "error",
        }
    }

    fn from_error(err: &PipelineError) -> Self {
        Self::Error {
            error: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

#[derive(Clone)]
pub struct WorkoutPipeline {
    agent: AgentClient,
    store: Arc<dyn WorkoutStore>,
    aggregator: MuscleVolumeAggregator,
    band_weights: BandWeights,
}

impl WorkoutPipeline {
    pub fn new(
        agent: AgentClient,
        store: Arc<dyn WorkoutStore>,
        aggregator: MuscleVolumeAggregator,
        band_weights: BandWeights,
    ) -> Self {
        Self {
            agent,
            store,
            aggregator,
            band_weights,
        }
    }

    /// Invoke the agent, extract, and persist. Without `target_session` a new
    /// session is opened for the workout and closed once its exercises are stored.
    pub async fn process(
        &self,
        user_id: Uuid,
        text: &str,
        target_session: Option<Uuid>,
        agent_session: Option<String>,
    ) -> Result<WorkoutLogResult, PipelineError> {
        let reply = self.agent.invoke(text, agent_session).await?;
        let response =
            AgentResponse::from_output(&reply.text, reply.payload.as_ref(), &self.band_weights);
        self.persist(user_id, target_session, reply.session_id, response)
            .await
    }

    /// Streamed variant of [`process`](Self::process). Dropping the returned
    /// stream stops the producer and closes the agent stream; nothing is
    /// persisted unless the agent stream completed.
    pub fn process_streaming(
        &self,
        user_id: Uuid,
        text: String,
        target_session: Option<Uuid>,
        agent_session: Option<String>,
    ) -> ReceiverStream<PipelineEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let pipeline = self.clone();
        tokio::spawn(async move {
            pipeline
                .run_stream(user_id, text, target_session, agent_session, tx)
                .await;
        });
        ReceiverStream::new(rx)
    }

    async fn run_stream(
        self,
        user_id: Uuid,
        text: String,
        target_session: Option<Uuid>,
        agent_session: Option<String>,
        tx: mpsc::Sender<PipelineEvent>,
    ) {
        let mut invocation = self.agent.invoke_streaming(&text, agent_session);
        let agent_session_id = invocation.session_id.clone();
        let mut buffer = ExtractionBuffer::new(self.band_weights);
        let mut saw_payload = false;

        loop {
            let fragment = tokio::select! {
                _ = tx.closed() => {
                    tracing::debug!(user_id = %user_id, agent_session_id = %agent_session_id, "stream consumer gone, cancelling");
                    return;
                }
                fragment = invocation.fragments.next() => fragment,
            };
            let Some(fragment) = fragment else {
                break;
            };

            let mut events = Vec::with_capacity(2);
            match fragment {
                TextFragment::Text(chunk) => {
                    let preview = buffer.push_text(&chunk);
                    events.push(PipelineEvent::Message { text: chunk });
                    events.extend(preview.map(muscle_data));
                }
                TextFragment::Payload(value) => {
                    saw_payload = true;
                    events.extend(buffer.push_payload(value).map(muscle_data));
                }
                TextFragment::Error(err) => {
                    let err = PipelineError::Agent(err);
                    tracing::error!(user_id = %user_id, error = %err, "agent stream failed");
                    let _ = tx.send(PipelineEvent::from_error(&err)).await;
                    return;
                }
            }
            for event in events {
                if tx.send(event).await.is_err() {
                    return;
                }
            }
        }

        tracing::debug!(
            user_id = %user_id,
            agent_session_id = %agent_session_id,
            attempts = invocation.attempts(),
            "agent stream finished"
        );

        let message = buffer.text().trim().to_string();
        let response = if message.is_empty() && !saw_payload {
            AgentResponse::Error("stream closed without content".to_string())
        } else {
            match buffer.finish() {
                Ok(workout) => AgentResponse::StructuredPayload(workout),
                Err(_) => AgentResponse::Message(message),
            }
        };

        let event = match self
            .persist(user_id, target_session, agent_session_id, response)
            .await
        {
            Ok(result) => PipelineEvent::Stored { result },
            Err(err) => PipelineEvent::from_error(&err),
        };
        let _ = tx.send(event).await;
    }

    async fn persist(
        &self,
        user_id: Uuid,
        target_session: Option<Uuid>,
        agent_session_id: String,
        response: AgentResponse,
    ) -> Result<WorkoutLogResult, PipelineError> {
        let workout = match response {
            AgentResponse::StructuredPayload(workout) if !workout.exercises.is_empty() => workout,
            AgentResponse::StructuredPayload(ExtractedWorkout { message, .. })
            | AgentResponse::Message(message) => {
                tracing::info!(
                    user_id = %user_id,
                    agent_session_id = %agent_session_id,
                    "no structured workout data, returning message only"
                );
                let message = if message.trim().is_empty() {
                    NO_WORKOUT_MESSAGE.to_string()
                } else {
                    message
                };
                return Ok(WorkoutLogResult::message_only(message, agent_session_id));
            }
            AgentResponse::Error(reason) => {
                return Err(AgentError::InvalidResponse(reason).into());
            }
        };

        let records = workout
            .exercises
            .iter()
            .enumerate()
            .map(|(idx, record)| {
                record.normalized().map_err(|issue| {
                    StoreError::Validation(ValidationIssue {
                        field: format!("exercises[{idx}].{}", issue.field),
                        ..issue
                    })
                })
            })
            .collect::<Result<Vec<ExerciseRecord>, StoreError>>()?;

        let (session_id, created) = match target_session {
            Some(session_id) => {
                let summary = self.store.session_summary(user_id, session_id).await?;
                if summary.session.is_closed() {
                    return Err(StoreError::InvalidState { session_id }.into());
                }
                (session_id, false)
            }
            None => (self.store.create_session(user_id).await?.id, true),
        };

        let mut exercises = Vec::with_capacity(records.len());
        for record in &records {
            match self.store.store_exercise(user_id, session_id, record).await {
                Ok(stored) => exercises.push(stored),
                Err(err) => {
                    tracing::error!(
                        user_id = %user_id,
                        session_id = %session_id,
                        exercise = %record.name,
                        stored = exercises.len(),
                        error = %err,
                        "exercise write failed"
                    );
                    // A session opened for this workout must not outlive it half-written.
                    if created {
                        if let Err(discard_err) = self.store.discard_session(user_id, session_id).await {
                            tracing::warn!(
                                user_id = %user_id,
                                session_id = %session_id,
                                error = %discard_err,
                                "failed to discard partially written session"
                            );
                        }
                    }
                    return Err(err.into());
                }
            }
        }

        let session = if created {
            self.store.end_session(user_id, session_id).await?
        } else {
            self.store.session_summary(user_id, session_id).await?.session
        };

        self.aggregator.invalidate(user_id).await;
        let tracking = self
            .aggregator
            .get_tracking(user_id, RESULT_TRACKING_DAYS)
            .await?;

        tracing::info!(
            user_id = %user_id,
            session_id = %session_id,
            exercises = exercises.len(),
            method = ?workout.method,
            "workout logged"
        );

        Ok(WorkoutLogResult {
            message: workout.message,
            agent_session_id,
            extraction: Some(workout.method),
            session: Some(session),
            exercises,
            tracking,
        })
    }
}

fn muscle_data(workout: ExtractedWorkout) -> PipelineEvent {
    PipelineEvent::MuscleData {
        method: workout.method,
        exercises: workout.exercises,
    }
}
