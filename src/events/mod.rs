//! Event-sourced backbone for session processing.
//!
//! Every inbound occurrence — a user message, a fired timer, a tool
//! completion — becomes an immutable Event in a durable, append-only log.
//! Events are ordered per session by a monotonic sequence number and are
//! never updated or deleted; the log doubles as session history.

mod payloads;
mod store;

pub use payloads::{TimerFiredPayload, ToolResultPayload, UserMessagePayload};
pub use store::EventStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::session::SessionKey;

/// A single immutable event in the event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub session_key: SessionKey,
    /// Strictly increasing per session, assigned by the store at append.
    pub seq: i64,
    pub event_type: EventType,
    pub payload: JsonValue,
    pub created_at: DateTime<Utc>,
}

impl Event {
    /// Parse the event payload into a typed struct.
    pub fn parse_payload<T: for<'de> Deserialize<'de>>(&self) -> anyhow::Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// Kinds of occurrences the pipeline processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A message sent by the user (or injected synthetically).
    UserMessage,
    /// A promoted timer firing. Never retried on processing failure:
    /// duplicate autonomous output is worse than a missed one.
    Timer,
    /// An external tool finished and reported its output.
    ToolResult,
}

impl EventType {
    /// String form used for database storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::UserMessage => "user_message",
            EventType::Timer => "timer",
            EventType::ToolResult => "tool_result",
        }
    }

    /// Parse from database storage.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "user_message" => Some(EventType::UserMessage),
            "timer" => Some(EventType::Timer),
            "tool_result" => Some(EventType::ToolResult),
            _ => None,
        }
    }

    /// Whether a failed processing attempt may be retried.
    pub fn retryable(&self) -> bool {
        !matches!(self, EventType::Timer)
    }
}
