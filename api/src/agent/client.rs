use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use futures::{StreamExt, stream};
use rand::Rng;
use uuid::Uuid;

use super::stream::{FragmentStream, fragments_from_bytes};
use super::transport::{AgentRequest, AgentTransport};
use super::{AgentError, AgentResult, TextFragment, TransientKind};

/// Retry/backoff settings for agent calls.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts per call, including the first (minimum 1)
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
    /// Bound on each individual attempt
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            jitter: true,
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Wait after the `retry`-th failure (0-based):
    /// `min(base * 2^retry, max)` plus up to 10% jitter.
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        let base_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);
        let factor = 1_u64.checked_shl(retry).unwrap_or(u64::MAX);
        let capped = base_ms.saturating_mul(factor).min(max_ms);
        let jitter = if self.jitter && capped >= 10 {
            rand::thread_rng().gen_range(0..=capped / 10)
        } else {
            0
        };
        Duration::from_millis(capped.saturating_add(jitter))
    }

    fn total_attempts(&self) -> u32 {
        self.max_retries.max(1)
    }
}

/// A streamed invocation. Nothing is sent until `fragments` is first polled;
/// dropping it closes the underlying connection.
pub struct StreamingInvocation {
    pub session_id: String,
    pub fragments: FragmentStream,
    pub(super) attempts: Arc<AtomicU32>,
}

impl StreamingInvocation {
    fn failed(session_id: String, err: AgentError) -> Self {
        Self {
            session_id,
            fragments: Box::pin(stream::once(async move { TextFragment::Error(err) })),
            attempts: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Attempts it took to open the stream; 0 until it opened.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Acquire)
    }
}

#[derive(Clone)]
pub struct AgentClient {
    transport: Arc<dyn AgentTransport>,
    policy: RetryPolicy,
}

impl AgentClient {
    pub fn new(transport: Arc<dyn AgentTransport>, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }

    /// Single-shot call. A missing `session_id` starts a new conversation.
    pub async fn invoke(
        &self,
        text: &str,
        session_id: Option<String>,
    ) -> Result<AgentResult, AgentError> {
        let request = build_request(text, session_id)?;
        let (reply, attempts) = self
            .with_retry(&request.session_id, || self.transport.send(&request))
            .await?;

        tracing::info!(
            session_id = %request.session_id,
            attempts,
            has_payload = reply.payload.is_some(),
            "agent invocation succeeded"
        );

        Ok(AgentResult {
            session_id: request.session_id,
            text: reply.text,
            payload: reply.payload,
            attempts,
        })
    }

    /// Streaming call. Retries cover opening the stream only; a failure after
    /// fragments started flowing ends the sequence with an error sentinel.
    pub fn invoke_streaming(&self, text: &str, session_id: Option<String>) -> StreamingInvocation {
        let request = match build_request(text, session_id.clone()) {
            Ok(request) => request,
            Err(err) => return StreamingInvocation::failed(session_id.unwrap_or_default(), err),
        };

        let session_id = request.session_id.clone();
        let attempts = Arc::new(AtomicU32::new(0));
        let opened_attempts = attempts.clone();
        let client = self.clone();
        let opened = async move {
            let opened = client
                .with_retry(&request.session_id, || client.transport.open_stream(&request))
                .await;
            match opened {
                Ok((bytes, attempts)) => {
                    opened_attempts.store(attempts, Ordering::Release);
                    tracing::debug!(session_id = %request.session_id, attempts, "agent stream opened");
                    fragments_from_bytes(bytes, client.policy.attempt_timeout)
                }
                Err(err) => {
                    Box::pin(stream::once(async move { TextFragment::Error(err) })) as FragmentStream
                }
            }
        };

        StreamingInvocation {
            session_id,
            fragments: Box::pin(stream::once(opened).flatten()),
            attempts,
        }
    }

    async fn with_retry<T, F, Fut>(&self, session_id: &str, mut attempt_call: F) -> Result<(T, u32), AgentError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AgentError>>,
    {
        let total_attempts = self.policy.total_attempts();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let outcome = match tokio::time::timeout(self.policy.attempt_timeout, attempt_call()).await {
                Ok(outcome) => outcome,
                Err(_) => Err(AgentError::transient(
                    TransientKind::Timeout,
                    format!("no reply within {}ms", self.policy.attempt_timeout.as_millis()),
                )),
            };

            let err = match outcome {
                Ok(value) => return Ok((value, attempt)),
                Err(err) => err,
            };

            if !err.is_retryable() {
                tracing::error!(session_id, attempt, error = %err, "agent call failed");
                return Err(err);
            }

            if attempt >= total_attempts {
                tracing::error!(session_id, attempts = attempt, error = %err, "agent retries exhausted");
                return Err(AgentError::Exhausted {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            let delay = self.policy.delay_for_attempt(attempt - 1);
            tracing::warn!(
                session_id,
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %err,
                "agent call failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

fn build_request(text: &str, session_id: Option<String>) -> Result<AgentRequest, AgentError> {
    if text.trim().is_empty() {
        return Err(AgentError::Rejected {
            status: None,
            message: "input text must not be empty".to_string(),
        });
    }
    let session_id = session_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    Ok(AgentRequest::for_workout(session_id, text))
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use bytes::Bytes;

    use super::*;
    use crate::agent::stream::collect_stream;
    use crate::agent::transport::{AgentReply, ByteStream};

    enum Step {
        Fail(AgentError),
        Reply(&'static str),
        Hang(Duration),
        Stream(Vec<Result<&'static str, AgentError>>),
        /// One chunk, then silence
        Stall(&'static str),
    }

    /// In-process agent that plays back a fixed script, one step per attempt.
    struct ScriptedTransport {
        steps: Mutex<VecDeque<Step>>,
        calls: AtomicU32,
        sessions: Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        fn new(steps: Vec<Step>) -> Arc<Self> {
            Arc::new(Self {
                steps: Mutex::new(steps.into()),
                calls: AtomicU32::new(0),
                sessions: Mutex::new(Vec::new()),
            })
        }

        fn next_step(&self, request: &AgentRequest) -> Step {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.sessions.lock().unwrap().push(request.session_id.clone());
            self.steps
                .lock()
                .unwrap()
                .pop_front()
                .expect("script ran out of steps")
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AgentTransport for ScriptedTransport {
        async fn send(&self, request: &AgentRequest) -> Result<AgentReply, AgentError> {
            match self.next_step(request) {
                Step::Fail(err) => Err(err),
                Step::Reply(text) => Ok(AgentReply {
                    text: text.to_string(),
                    payload: None,
                }),
                Step::Hang(duration) => {
                    tokio::time::sleep(duration).await;
                    Ok(AgentReply {
                        text: "too late".to_string(),
                        payload: None,
                    })
                }
                Step::Stream(_) | Step::Stall(_) => panic!("unexpected stream step"),
            }
        }

        async fn open_stream(&self, request: &AgentRequest) -> Result<ByteStream, AgentError> {
            match self.next_step(request) {
                Step::Fail(err) => Err(err),
                Step::Stream(chunks) => Ok(Box::pin(stream::iter(
                    chunks
                        .into_iter()
                        .map(|chunk| chunk.map(|s| Bytes::from_static(s.as_bytes()))),
                ))),
                Step::Stall(chunk) => Ok(Box::pin(
                    stream::iter(vec![Ok::<_, AgentError>(Bytes::from_static(chunk.as_bytes()))])
                        .chain(stream::pending()),
                )),
                _ => panic!("unexpected single-shot step"),
            }
        }
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter: false,
            attempt_timeout: Duration::from_millis(200),
        }
    }

    fn throttled() -> AgentError {
        AgentError::transient(TransientKind::Throttled, "HTTP 429")
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            jitter: false,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(4000));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_millis(30_000));
        assert_eq!(policy.delay_for_attempt(80), Duration::from_millis(30_000));
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        let policy = RetryPolicy::default();
        for _ in 0..50 {
            let delay = policy.delay_for_attempt(1);
            assert!(delay >= Duration::from_millis(2000));
            assert!(delay <= Duration::from_millis(2200));
        }
    }

    #[tokio::test]
    async fn throttled_twice_then_succeeds_within_three_attempts() {
        let transport = ScriptedTransport::new(vec![
            Step::Fail(throttled()),
            Step::Fail(throttled()),
            Step::Reply("3 sets of 10 reps at 135 lbs bench press"),
        ]);
        let client = AgentClient::new(transport.clone(), fast_policy(3));

        let result = client
            .invoke("bench day", Some("conv-1".to_string()))
            .await
            .expect("third attempt succeeds");

        assert_eq!(result.attempts, 3, "two backoff waits precede the third attempt");
        assert_eq!(transport.calls(), 3);
        assert_eq!(result.session_id, "conv-1");
        assert!(
            transport
                .sessions
                .lock()
                .unwrap()
                .iter()
                .all(|id| id == "conv-1"),
            "every attempt reuses the same agent session"
        );
    }

    #[tokio::test]
    async fn throttled_twice_with_two_attempts_is_exhausted() {
        let transport = ScriptedTransport::new(vec![
            Step::Fail(throttled()),
            Step::Fail(throttled()),
            Step::Reply("never reached"),
        ]);
        let client = AgentClient::new(transport.clone(), fast_policy(2));

        let err = client.invoke("bench day", None).await.unwrap_err();
        match err {
            AgentError::Exhausted { attempts, last } => {
                assert_eq!(attempts, 2);
                assert!(matches!(
                    *last,
                    AgentError::Transient {
                        kind: TransientKind::Throttled,
                        ..
                    }
                ));
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn rejected_requests_are_not_retried() {
        let transport = ScriptedTransport::new(vec![Step::Fail(AgentError::Rejected {
            status: Some(403),
            message: "forbidden".to_string(),
        })]);
        let client = AgentClient::new(transport.clone(), fast_policy(3));

        let err = client.invoke("bench day", None).await.unwrap_err();
        assert!(matches!(err, AgentError::Rejected { status: Some(403), .. }));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn slow_attempts_time_out_and_count_as_transient() {
        let transport = ScriptedTransport::new(vec![
            Step::Hang(Duration::from_secs(5)),
            Step::Reply("fast enough"),
        ]);
        let mut policy = fast_policy(2);
        policy.attempt_timeout = Duration::from_millis(20);
        let client = AgentClient::new(transport.clone(), policy);

        let result = client.invoke("bench day", None).await.unwrap();
        assert_eq!(result.text, "fast enough");
        assert_eq!(result.attempts, 2);
    }

    #[tokio::test]
    async fn empty_text_is_rejected_without_network() {
        let transport = ScriptedTransport::new(vec![]);
        let client = AgentClient::new(transport.clone(), fast_policy(3));
        assert!(matches!(
            client.invoke("   ", None).await,
            Err(AgentError::Rejected { status: None, .. })
        ));
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn missing_session_id_starts_new_conversation() {
        let transport = ScriptedTransport::new(vec![Step::Reply("a"), Step::Reply("b")]);
        let client = AgentClient::new(transport.clone(), fast_policy(1));
        let first = client.invoke("x", None).await.unwrap();
        let second = client.invoke("x", None).await.unwrap();
        assert_ne!(first.session_id, second.session_id);
        assert!(Uuid::parse_str(&first.session_id).is_ok());
    }

    #[tokio::test]
    async fn streaming_is_lazy_and_retries_opening() {
        let transport = ScriptedTransport::new(vec![
            Step::Fail(AgentError::transient(TransientKind::Unavailable, "HTTP 503")),
            Step::Stream(vec![
                Ok("data: {\"content\": \"3 sets of 10 reps \"}\n"),
                Ok("data: {\"content\": \"at 135 lbs bench press\"}\n"),
                Ok("data: [DONE]\n"),
            ]),
        ]);
        let client = AgentClient::new(transport.clone(), fast_policy(3));

        let invocation = client.invoke_streaming("bench day", Some("conv-9".to_string()));
        assert_eq!(transport.calls(), 0, "nothing is sent before the stream is polled");

        assert_eq!(invocation.attempts(), 0);

        let result = collect_stream(invocation).await.unwrap();
        assert_eq!(result.text, "3 sets of 10 reps at 135 lbs bench press");
        assert_eq!(result.session_id, "conv-9");
        assert_eq!(result.attempts, 2);
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn streaming_open_failure_ends_with_sentinel() {
        let transport = ScriptedTransport::new(vec![
            Step::Fail(throttled()),
            Step::Fail(throttled()),
        ]);
        let client = AgentClient::new(transport.clone(), fast_policy(2));

        let fragments: Vec<TextFragment> =
            client.invoke_streaming("bench day", None).fragments.collect().await;
        assert_eq!(fragments.len(), 1);
        assert!(matches!(
            fragments[0],
            TextFragment::Error(AgentError::Exhausted { attempts: 2, .. })
        ));
    }

    #[tokio::test]
    async fn streaming_read_failure_after_data_is_not_retried() {
        let transport = ScriptedTransport::new(vec![Step::Stream(vec![
            Ok("partial line\n"),
            Err(AgentError::transient(TransientKind::Network, "reset")),
        ])]);
        let client = AgentClient::new(transport.clone(), fast_policy(3));

        let fragments: Vec<TextFragment> =
            client.invoke_streaming("bench day", None).fragments.collect().await;
        assert!(matches!(fragments.first(), Some(TextFragment::Text(t)) if t == "partial line\n"));
        assert!(matches!(fragments.last(), Some(TextFragment::Error(_))));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn stalled_stream_times_out_without_retry() {
        let transport = ScriptedTransport::new(vec![Step::Stall("data: {\"content\": \"3 sets\"}\n")]);
        let mut policy = fast_policy(3);
        policy.attempt_timeout = Duration::from_millis(20);
        let client = AgentClient::new(transport.clone(), policy);

        let invocation = client.invoke_streaming("bench day", None);
        let err = collect_stream(invocation).await.unwrap_err();
        assert!(matches!(
            err,
            AgentError::Transient {
                kind: TransientKind::Timeout,
                ..
            }
        ));
        assert_eq!(transport.calls(), 1);
    }
}
