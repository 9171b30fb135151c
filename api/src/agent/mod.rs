//! Gateway to the external workout-analysis agent.
//!
//! [`AgentClient`] owns retry/backoff and per-attempt timeouts; the wire format
//! lives behind [`AgentTransport`] so tests can script the agent in-process.

mod client;
mod stream;
mod transport;

use std::fmt;

use serde_json::Value;

pub use client::{AgentClient, RetryPolicy, StreamingInvocation};
pub use stream::collect_stream;
pub use transport::{AgentReply, AgentRequest, AgentTransport, ByteStream, HttpAgentTransport};

/// Why a retryable call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientKind {
    Timeout,
    Throttled,
    Unavailable,
    Network,
}

impl fmt::Display for TransientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Timeout => "timeout",
            Self::Throttled => "throttled",
            Self::Unavailable => "unavailable",
            Self::Network => "network",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// Timeout, throttling or a network blip. Retried by [`AgentClient`].
    #[error("agent call failed ({kind}): {message}")]
    Transient { kind: TransientKind, message: String },

    /// Retries ran out; `last` is the final underlying failure.
    #[error("agent unavailable after {attempts} attempt(s)")]
    Exhausted {
        attempts: u32,
        #[source]
        last: Box<AgentError>,
    },

    /// The agent replied but nothing usable could be read from the reply.
    #[error("agent returned no usable content: {0}")]
    InvalidResponse(String),

    /// Malformed request or auth failure. Never retried.
    #[error("agent rejected the request: {message}")]
    Rejected { status: Option<u16>, message: String },
}

impl AgentError {
    pub fn transient(kind: TransientKind, message: impl Into<String>) -> Self {
        Self::Transient {
            kind,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Normalized single-shot result.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentResult {
    /// Agent conversation id, reused across retries
    pub session_id: String,
    pub text: String,
    /// Structured payload embedded in the reply, left unparsed
    pub payload: Option<Value>,
    /// Attempts made, including the successful one
    pub attempts: u32,
}

/// One item of a streamed reply. `Error` is a terminal sentinel.
#[derive(Debug)]
pub enum TextFragment {
    Text(String),
    Payload(Value),
    Error(AgentError),
}
