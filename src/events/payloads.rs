//! Typed payloads for the event log.
//!
//! Payloads are stored as JSON and parsed on demand via
//! `Event::parse_payload`. Unknown extra fields are tolerated so older rows
//! keep parsing after a payload gains a field.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Payload for `EventType::UserMessage`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserMessagePayload {
    pub content: String,
    /// Synthetic messages (injected by operators or internal flows) do not
    /// count as a genuine user turn: they never reset the autonomy streak.
    #[serde(default)]
    pub synthetic: bool,
}

/// Payload for `EventType::Timer` — written by the timer worker at
/// promotion, carrying through whatever the agent attached when scheduling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimerFiredPayload {
    pub timer_id: String,
    #[serde(default)]
    pub payload: JsonValue,
}

/// Payload for `EventType::ToolResult`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResultPayload {
    pub tool_name: String,
    pub output: JsonValue,
}
