//! Transactional outbox for intended actions.
//!
//! The processor writes an Effect row in the same logical step as the
//! decision that produced it; delivery happens asynchronously via the
//! effect runner. A crash after "decide" but before "deliver" leaves a
//! durable pending row to retry, and the unique dedupe key makes a retried
//! decision collapse into the already-stored row.

mod runner;
mod store;

pub use runner::EffectRunner;
pub use store::{CreateOutcome, NewEffect, OutboxStore};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::session::SessionKey;

/// A durable, deduplicated record of an intended action.
#[derive(Debug, Clone)]
pub struct Effect {
    pub id: i64,
    pub session_key: SessionKey,
    /// The event that produced this effect.
    pub checkpoint_id: i64,
    pub effect_type: EffectType,
    pub payload: JsonValue,
    pub dedupe_key: String,
    /// Whether the effect was initiated autonomously (timer-driven) rather
    /// than in reply to a user turn. Autonomous sends are gate-checked and
    /// cleared when a user message supersedes them.
    pub autonomous: bool,
    pub status: EffectStatus,
    pub attempt_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectType {
    SendMessage,
    ScheduleTimer,
}

impl EffectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EffectType::SendMessage => "send_message",
            EffectType::ScheduleTimer => "schedule_timer",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "send_message" => Some(EffectType::SendMessage),
            "schedule_timer" => Some(EffectType::ScheduleTimer),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectStatus {
    Pending,
    Executing,
    Completed,
    Failed,
}

impl EffectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EffectStatus::Pending => "pending",
            EffectStatus::Executing => "executing",
            EffectStatus::Completed => "completed",
            EffectStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(EffectStatus::Pending),
            "executing" => Some(EffectStatus::Executing),
            "completed" => Some(EffectStatus::Completed),
            "failed" => Some(EffectStatus::Failed),
            _ => None,
        }
    }
}

/// Payload of a `send_message` effect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessagePayload {
    pub content: String,
}

/// Payload of a `schedule_timer` effect, as produced by the agent. The
/// runner converts `delay_seconds` into an absolute `fire_at_ms` when it
/// materializes the timer row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleTimerPayload {
    pub timer_id: String,
    pub delay_seconds: u64,
    #[serde(default)]
    pub payload: JsonValue,
}
