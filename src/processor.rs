//! Session processor: one event in, zero or more durable effects out.
//!
//! The processor is the only place the external agent is invoked. Every
//! intended action the agent returns is written to the outbox before any
//! delivery is attempted, tagged with a dedupe key derived from the event
//! that produced it, so a retried invocation collapses into the effects the
//! first attempt already recorded.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};

use crate::events::{Event, EventStore, EventType, UserMessagePayload};
use crate::outbox::{
    CreateOutcome, EffectType, NewEffect, OutboxStore, ScheduleTimerPayload, SendMessagePayload,
};
use crate::policy::{check_can_send_autonomous, AutonomyPolicy, AutonomyStore};
use crate::queue::EventHandler;
use crate::traits::{Agent, EffectIntent, SessionContext};

/// How many trailing events are compiled into the agent's context.
const CONTEXT_EVENT_LIMIT: usize = 50;

pub struct SessionProcessor {
    agent: Arc<dyn Agent>,
    events: Arc<EventStore>,
    outbox: Arc<OutboxStore>,
    autonomy: Arc<AutonomyStore>,
    policy: AutonomyPolicy,
    agent_timeout: Duration,
}

impl SessionProcessor {
    pub fn new(
        agent: Arc<dyn Agent>,
        events: Arc<EventStore>,
        outbox: Arc<OutboxStore>,
        autonomy: Arc<AutonomyStore>,
        policy: AutonomyPolicy,
        agent_timeout: Duration,
    ) -> Self {
        Self {
            agent,
            events,
            outbox,
            autonomy,
            policy,
            agent_timeout,
        }
    }

    pub async fn process_event(&self, event: &Event) -> anyhow::Result<()> {
        // A genuine user turn zeroes the autonomy streak before the agent
        // runs, so a reply produced by this very event is never throttled
        // by a stale streak.
        if event.event_type == EventType::UserMessage {
            let payload: UserMessagePayload = event.parse_payload()?;
            if !payload.synthetic {
                self.autonomy
                    .reset_on_user_message(&event.session_key)
                    .await?;
            }
        }

        let ctx = SessionContext {
            session_key: event.session_key.clone(),
            recent_events: self
                .events
                .recent_events(&event.session_key, CONTEXT_EVENT_LIMIT)
                .await?,
        };

        let reply = tokio::time::timeout(self.agent_timeout, self.agent.handle_event(event, &ctx))
            .await
            .map_err(|_| {
                anyhow::anyhow!(
                    "agent invocation timed out after {:?} (session {})",
                    self.agent_timeout,
                    event.session_key
                )
            })??;

        // Sends produced while processing a timer event are autonomous:
        // nobody asked for them just now.
        let autonomous = event.event_type == EventType::Timer;

        for (index, intent) in reply.intents.iter().enumerate() {
            self.record_intent(event, index, intent, autonomous).await?;
        }

        Ok(())
    }

    async fn record_intent(
        &self,
        event: &Event,
        index: usize,
        intent: &EffectIntent,
        autonomous: bool,
    ) -> anyhow::Result<()> {
        let (effect_type, payload) = match intent {
            EffectIntent::SendMessage { content } => (
                EffectType::SendMessage,
                serde_json::to_value(SendMessagePayload {
                    content: content.clone(),
                })?,
            ),
            EffectIntent::ScheduleTimer {
                timer_id,
                delay_seconds,
                payload,
            } => (
                EffectType::ScheduleTimer,
                serde_json::to_value(ScheduleTimerPayload {
                    timer_id: timer_id.clone(),
                    delay_seconds: *delay_seconds,
                    payload: payload.clone(),
                })?,
            ),
        };

        let gated = autonomous && effect_type == EffectType::SendMessage;
        if gated {
            let metadata = self.autonomy.load(&event.session_key).await?;
            let decision = check_can_send_autonomous(&self.policy, &metadata, Utc::now());
            if !decision.allowed {
                // Policy blocks are silent toward the user: log and drop.
                info!(
                    session_key = %event.session_key,
                    blocked_by = ?decision.blocked_by,
                    reason = decision.reason.as_deref().unwrap_or(""),
                    "Autonomous send blocked by policy"
                );
                return Ok(());
            }
        }

        let dedupe_key = format!(
            "{}:{}:{}:{}",
            event.session_key,
            event.id,
            effect_type.as_str(),
            index
        );

        let mut effect = NewEffect::pending(
            event.session_key.clone(),
            event.id,
            effect_type,
            payload,
            dedupe_key.clone(),
        );
        if autonomous {
            effect = effect.autonomous();
        }

        match self.outbox.create(effect).await? {
            CreateOutcome::Created(effect_id) => {
                debug!(
                    session_key = %event.session_key,
                    effect_id,
                    effect_type = effect_type.as_str(),
                    "Effect recorded"
                );
                if gated {
                    self.autonomy
                        .record_send(&event.session_key, Utc::now())
                        .await?;
                }
            }
            CreateOutcome::Duplicate => {
                // Already scheduled by an earlier attempt; nothing to do.
                debug!(dedupe_key = %dedupe_key, "Effect already scheduled");
            }
        }

        Ok(())
    }
}

#[async_trait]
impl EventHandler for SessionProcessor {
    async fn handle(&self, event: &Event, _attempt: u32) -> anyhow::Result<()> {
        self.process_event(event).await
    }
}
