use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Structured error body returned by every failing endpoint.
/// Carries enough context for a client to correct the request without
/// reading server logs.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ApiError {
    /// Machine-readable error code (see [`codes`])
    pub error: String,
    /// Human-readable description of what went wrong
    pub message: String,
    /// Which field caused the error (if applicable)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// The value that was received (if applicable)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub received: Option<serde_json::Value>,
    /// Request ID for tracing and debugging
    pub request_id: String,
    /// Hint about what the correct usage looks like
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docs_hint: Option<String>,
}

/// Error codes used across the API
pub mod codes {
    pub const VALIDATION_FAILED: &str = "validation_failed";
    pub const NOT_FOUND: &str = "not_found";
    pub const INVALID_STATE: &str = "invalid_state";
    pub const AGENT_UNAVAILABLE: &str = "agent_unavailable";
    pub const AGENT_INVALID_RESPONSE: &str = "agent_invalid_response";
    pub const INTERNAL_ERROR: &str = "internal_error";
}
