//! Built-in development agent.
//!
//! The real agent (prompting, summarization, memory) is an external
//! collaborator behind the `Agent` trait. `EchoAgent` is the default the
//! binary wires up so the pipeline can run end to end without a provider:
//! it acknowledges user messages and timer fires with a plain reply.

use async_trait::async_trait;

use crate::events::{Event, EventType, TimerFiredPayload, ToolResultPayload, UserMessagePayload};
use crate::traits::{Agent, AgentReply, SessionContext};

pub struct EchoAgent;

#[async_trait]
impl Agent for EchoAgent {
    async fn handle_event(
        &self,
        event: &Event,
        _ctx: &SessionContext,
    ) -> anyhow::Result<AgentReply> {
        match event.event_type {
            EventType::UserMessage => {
                let payload: UserMessagePayload = event.parse_payload()?;
                Ok(AgentReply::say(format!("echo: {}", payload.content)))
            }
            EventType::Timer => {
                let payload: TimerFiredPayload = event.parse_payload()?;
                Ok(AgentReply::say(format!("timer fired: {}", payload.timer_id)))
            }
            EventType::ToolResult => {
                let payload: ToolResultPayload = event.parse_payload()?;
                Ok(AgentReply::say(format!(
                    "tool {} finished",
                    payload.tool_name
                )))
            }
        }
    }
}
