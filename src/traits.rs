//! Trait seams for external collaborators.
//!
//! The daemon treats the agent itself (prompting, summarization, memory
//! retrieval) as an external collaborator behind one async trait. The
//! transport-side seam lives in `connections::ClientSocket`.

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::events::Event;
use crate::session::SessionKey;

/// Context handed to the agent alongside the event being processed.
pub struct SessionContext {
    pub session_key: SessionKey,
    /// Chronological tail of the session's event log.
    pub recent_events: Vec<Event>,
}

/// What the agent decided to do in response to one event.
#[derive(Debug, Clone, Default)]
pub struct AgentReply {
    pub intents: Vec<EffectIntent>,
}

impl AgentReply {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn say(content: impl Into<String>) -> Self {
        Self {
            intents: vec![EffectIntent::SendMessage {
                content: content.into(),
            }],
        }
    }
}

/// An intended action, persisted to the outbox before any delivery attempt.
#[derive(Debug, Clone)]
pub enum EffectIntent {
    SendMessage {
        content: String,
    },
    ScheduleTimer {
        timer_id: String,
        delay_seconds: u64,
        payload: JsonValue,
    },
}

/// The external agent. Invocation is the only suspending operation in the
/// pipeline; it blocks its own session's lane and nothing else.
#[async_trait]
pub trait Agent: Send + Sync {
    async fn handle_event(&self, event: &Event, ctx: &SessionContext)
        -> anyhow::Result<AgentReply>;
}
