use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::Serialize;
use serde_json::{Map, Value};

use super::{AgentError, TransientKind};

const TEXT_KEYS: [&str; 5] = ["completion", "content", "message", "text", "output"];
const WORKOUT_KEYS: [&str; 3] = ["exercise", "exercises", "muscle_activations"];
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_NESTING: u8 = 4;

const ANALYSIS_PROMPT: &str = r#"You are a workout analysis assistant. For each workout description, analyze the exercises and return JSON in this exact format:
{
  "display_message": "human-readable breakdown of the workout with muscle activation and volume",
  "structured_data": {
    "exercises": [{
      "name": "e.g. Bench Press",
      "movement_pattern": "Push | Pull | Squat | Hinge | Carry | Core",
      "num_sets": 3,
      "reps": [10, 10, 10],
      "weight": [135, 135, 135],
      "rpe": 8,
      "tempo": "3-1-1",
      "total_volume": 4050,
      "notes": "optional form notes",
      "equipment": "Barbell",
      "difficulty": "Intermediate",
      "estimated_duration": 10,
      "rest_period": 120,
      "muscle_activations": [
        {"muscle_name": "chest", "activation_level": "PRIMARY", "estimated_volume": 2430}
      ]
    }]
  }
}
Weights are in lbs per set. estimated_volume is the muscle's share of total_volume."#;

/// Body sent to the agent.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRequest {
    pub session_id: String,
    pub input_text: String,
}

impl AgentRequest {
    /// Wrap user text in the analysis prompt.
    pub fn for_workout(session_id: String, text: &str) -> Self {
        Self {
            session_id,
            input_text: format!("{ANALYSIS_PROMPT}\n\nUser workout: {}\n\nResponse:", text.trim()),
        }
    }
}

/// Single-shot reply split into display text and an optional structured payload.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentReply {
    pub text: String,
    pub payload: Option<Value>,
}

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, AgentError>> + Send>>;

/// Wire seam to the agent. Implementations perform exactly one network attempt
/// per call; retries and timeouts belong to the client.
#[async_trait]
pub trait AgentTransport: Send + Sync {
    async fn send(&self, request: &AgentRequest) -> Result<AgentReply, AgentError>;

    /// Open a streamed reply. Succeeds once the remote side accepted the call.
    async fn open_stream(&self, request: &AgentRequest) -> Result<ByteStream, AgentError>;
}

/// JSON-over-HTTP agent endpoint.
#[derive(Clone)]
pub struct HttpAgentTransport {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpAgentTransport {
    pub fn new(endpoint: String, api_key: Option<String>) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(concat!("liftlog-api/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            endpoint,
            api_key,
        })
    }

    fn post(&self, request: &AgentRequest) -> reqwest::RequestBuilder {
        let builder = self.http.post(&self.endpoint).json(request);
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }
}

#[async_trait]
impl AgentTransport for HttpAgentTransport {
    async fn send(&self, request: &AgentRequest) -> Result<AgentReply, AgentError> {
        let response = self
            .post(request)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(map_request_error)?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let body = response.text().await.map_err(map_request_error)?;
        tracing::debug!(
            session_id = %request.session_id,
            bytes = body.len(),
            "agent reply received"
        );
        parse_reply(&body)
    }

    async fn open_stream(&self, request: &AgentRequest) -> Result<ByteStream, AgentError> {
        let response = self
            .post(request)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(map_request_error)?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let bytes = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(map_request_error));
        Ok(Box::pin(bytes))
    }
}

/// Map a non-success HTTP status onto the error taxonomy.
pub(crate) fn classify_status(status: u16, body: &str) -> AgentError {
    let detail = body.trim().chars().take(200).collect::<String>();
    let message = if detail.is_empty() {
        format!("HTTP {status}")
    } else {
        format!("HTTP {status}: {detail}")
    };
    match status {
        408 => AgentError::transient(TransientKind::Timeout, message),
        429 => AgentError::transient(TransientKind::Throttled, message),
        500 | 502 | 503 | 504 => AgentError::transient(TransientKind::Unavailable, message),
        _ => AgentError::Rejected {
            status: Some(status),
            message,
        },
    }
}

fn map_request_error(err: reqwest::Error) -> AgentError {
    if err.is_timeout() {
        AgentError::transient(TransientKind::Timeout, err.to_string())
    } else if err.is_decode() || err.is_body() {
        AgentError::InvalidResponse(err.to_string())
    } else if err.is_builder() {
        AgentError::Rejected {
            status: None,
            message: err.to_string(),
        }
    } else {
        AgentError::transient(TransientKind::Network, err.to_string())
    }
}

/// Decode a complete reply body. Non-JSON bodies are taken as plain text.
pub(crate) fn parse_reply(body: &str) -> Result<AgentReply, AgentError> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return Err(AgentError::InvalidResponse("empty reply body".to_string()));
    }

    let reply = match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => reply_from_value(&value, 0).ok_or_else(|| {
            AgentError::InvalidResponse("reply has no completion, content or workout data".to_string())
        })?,
        Err(_) => AgentReply {
            text: trimmed.to_string(),
            payload: None,
        },
    };

    if reply.text.trim().is_empty() && reply.payload.is_none() {
        return Err(AgentError::InvalidResponse("reply text is empty".to_string()));
    }
    Ok(reply)
}

/// Accepts `{"completion": ..}`, `{"content": ..}` (possibly JSON-in-string),
/// `{"message": ..}`, the `display_message` + `structured_data` envelope,
/// a bare workout object, or a bare JSON string.
pub(crate) fn reply_from_value(value: &Value, depth: u8) -> Option<AgentReply> {
    if depth > MAX_NESTING {
        return None;
    }
    match value {
        Value::String(text) => Some(reply_from_text(text, depth)),
        Value::Object(map) => reply_from_object(map, depth),
        _ => None,
    }
}

fn reply_from_object(map: &Map<String, Value>, depth: u8) -> Option<AgentReply> {
    if map.contains_key("structured_data") {
        let text = map
            .get("display_message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        return Some(AgentReply {
            text,
            payload: Some(Value::Object(map.clone())),
        });
    }

    for key in TEXT_KEYS {
        if let Some(inner) = map.get(key) {
            if let Some(reply) = reply_from_value(inner, depth + 1) {
                return Some(reply);
            }
        }
    }

    if WORKOUT_KEYS.iter().any(|key| map.contains_key(*key)) {
        return Some(AgentReply {
            text: String::new(),
            payload: Some(Value::Object(map.clone())),
        });
    }

    None
}

fn reply_from_text(text: &str, depth: u8) -> AgentReply {
    let trimmed = text.trim_start();
    if trimmed.starts_with('{') {
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(trimmed) {
            if let Some(reply) = reply_from_object(&map, depth + 1) {
                return reply;
            }
        }
    }
    AgentReply {
        text: text.to_string(),
        payload: None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn request_serializes_camel_case_with_prompt() {
        let request = AgentRequest::for_workout("abc".to_string(), " 3x8 @ 135lbs ");
        let body = serde_json::to_value(&request).unwrap();
        assert_eq!(body["sessionId"], "abc");
        let input = body["inputText"].as_str().unwrap();
        assert!(input.contains("User workout: 3x8 @ 135lbs\n"));
        assert!(input.starts_with("You are a workout analysis assistant"));
    }

    #[test]
    fn status_codes_map_to_taxonomy() {
        assert!(matches!(
            classify_status(429, "slow down"),
            AgentError::Transient {
                kind: TransientKind::Throttled,
                ..
            }
        ));
        assert!(matches!(
            classify_status(408, ""),
            AgentError::Transient {
                kind: TransientKind::Timeout,
                ..
            }
        ));
        assert!(classify_status(503, "").is_retryable());
        assert!(classify_status(504, "").is_retryable());
        assert!(matches!(
            classify_status(401, "bad key"),
            AgentError::Rejected {
                status: Some(401),
                ..
            }
        ));
        assert!(!classify_status(400, "").is_retryable());
    }

    #[test]
    fn completion_and_message_shapes_yield_text() {
        let reply = parse_reply(r#"{"completion": "Nice work"}"#).unwrap();
        assert_eq!(reply.text, "Nice work");
        assert!(reply.payload.is_none());

        let reply = parse_reply(r#"{"message": "Logged"}"#).unwrap();
        assert_eq!(reply.text, "Logged");
    }

    #[test]
    fn content_holding_json_envelope_is_unwrapped() {
        let envelope = json!({
            "display_message": "Bench press: 4050 lbs",
            "structured_data": {"exercises": []}
        });
        let body = json!({ "content": envelope.to_string() }).to_string();
        let reply = parse_reply(&body).unwrap();
        assert_eq!(reply.text, "Bench press: 4050 lbs");
        assert_eq!(reply.payload, Some(envelope));
    }

    #[test]
    fn bare_string_and_plain_text_bodies_are_accepted() {
        assert_eq!(parse_reply(r#""just text""#).unwrap().text, "just text");
        assert_eq!(parse_reply("plain words\n").unwrap().text, "plain words");
    }

    #[test]
    fn bare_workout_object_becomes_payload() {
        let body = json!({"exercise": {"name": "Squat"}}).to_string();
        let reply = parse_reply(&body).unwrap();
        assert!(reply.text.is_empty());
        assert!(reply.payload.is_some());
    }

    #[test]
    fn empty_or_unrecognised_replies_are_invalid() {
        assert!(matches!(parse_reply("   "), Err(AgentError::InvalidResponse(_))));
        assert!(matches!(
            parse_reply(r#"{"status": "ok"}"#),
            Err(AgentError::InvalidResponse(_))
        ));
        assert!(matches!(
            parse_reply(r#"{"completion": ""}"#),
            Err(AgentError::InvalidResponse(_))
        ));
        assert!(matches!(parse_reply("[1, 2]"), Err(AgentError::InvalidResponse(_))));
    }
}
