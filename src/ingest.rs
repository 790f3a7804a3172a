//! Inbound event ingestion.
//!
//! The single entry point for turning an occurrence into a durable Event
//! and getting it onto its session's lane. A genuine user message also
//! asserts turn-taking priority: any in-flight autonomous stream for the
//! thread is aborted and pending autonomous follow-ups are cleared before
//! the event is enqueued.

use std::sync::Arc;

use serde_json::Value as JsonValue;
use tracing::info;

use crate::connections::ConnectionManager;
use crate::events::{EventStore, EventType};
use crate::outbox::OutboxStore;
use crate::queue::{EnqueueHandle, EventQueue};
use crate::session::SessionKey;

pub struct EventIngest {
    events: Arc<EventStore>,
    queue: Arc<EventQueue>,
    outbox: Arc<OutboxStore>,
    connections: Arc<ConnectionManager>,
}

impl EventIngest {
    pub fn new(
        events: Arc<EventStore>,
        queue: Arc<EventQueue>,
        outbox: Arc<OutboxStore>,
        connections: Arc<ConnectionManager>,
    ) -> Self {
        Self {
            events,
            queue,
            outbox,
            connections,
        }
    }

    /// Persist and enqueue one inbound occurrence. The returned handle
    /// resolves when processing finishes (after retries for non-timer
    /// types); callers may drop it for fire-and-forget semantics.
    pub async fn submit(
        &self,
        session_key: &SessionKey,
        event_type: EventType,
        payload: JsonValue,
    ) -> anyhow::Result<EnqueueHandle> {
        let genuine_user_turn = event_type == EventType::UserMessage
            && !payload
                .get("synthetic")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);

        if genuine_user_turn {
            let aborted = self.connections.abort_thread(session_key.thread_id());
            let cleared = self.outbox.cancel_pending_autonomous(session_key).await?;
            if aborted > 0 || cleared > 0 {
                info!(
                    session_key = %session_key,
                    aborted,
                    cleared,
                    "User turn superseded autonomous output"
                );
            }
        }

        let event = self.events.append(session_key, event_type, payload).await?;
        Ok(self.queue.enqueue(event))
    }
}
