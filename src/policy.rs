//! Rate-limiting gates for autonomously-initiated sends.
//!
//! Two rules, checked in order: a hard cap on consecutive autonomous
//! messages (no user reply in between), then a cooldown since the last
//! autonomous send. Blocks are silent from the user's perspective; the
//! processor logs and drops the intent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

use crate::config::AutonomyConfig;
use crate::session::SessionKey;

/// Operator-set policy. No runtime mutation API.
#[derive(Debug, Clone, Copy)]
pub struct AutonomyPolicy {
    pub max_consecutive: u32,
    pub cooldown_ms: i64,
}

impl From<&AutonomyConfig> for AutonomyPolicy {
    fn from(config: &AutonomyConfig) -> Self {
        Self {
            max_consecutive: config.max_consecutive,
            cooldown_ms: config.cooldown_ms,
        }
    }
}

/// Per-session autonomy counters. Zeroed by any genuine user message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AutonomyMetadata {
    pub consecutive_autonomous: u32,
    pub last_autonomous_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    HardCap,
    Cooldown,
}

/// Result of evaluating the gates for one intended autonomous send.
#[derive(Debug, Clone)]
pub struct GateDecision {
    pub allowed: bool,
    pub reason: Option<String>,
    pub blocked_by: Option<BlockReason>,
}

impl GateDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            blocked_by: None,
        }
    }

    fn block(blocked_by: BlockReason, reason: String) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            blocked_by: Some(blocked_by),
        }
    }
}

/// Evaluate whether an autonomous send may go out right now.
///
/// The hard cap is checked before the cooldown: when both would block, the
/// cap is reported.
pub fn check_can_send_autonomous(
    policy: &AutonomyPolicy,
    metadata: &AutonomyMetadata,
    now: DateTime<Utc>,
) -> GateDecision {
    if metadata.consecutive_autonomous >= policy.max_consecutive {
        return GateDecision::block(
            BlockReason::HardCap,
            format!(
                "{} consecutive autonomous messages reached the cap of {}",
                metadata.consecutive_autonomous, policy.max_consecutive
            ),
        );
    }

    if let Some(last) = metadata.last_autonomous_at {
        let elapsed_ms = now.signed_duration_since(last).num_milliseconds();
        if elapsed_ms < policy.cooldown_ms {
            let remaining_ms = policy.cooldown_ms - elapsed_ms;
            return GateDecision::block(
                BlockReason::Cooldown,
                format!(
                    "cooldown active, {}s remaining",
                    (remaining_ms + 999) / 1000
                ),
            );
        }
    }

    GateDecision::allow()
}

/// Durable per-session autonomy counters.
pub struct AutonomyStore {
    pool: SqlitePool,
}

impl AutonomyStore {
    pub async fn new(pool: SqlitePool) -> anyhow::Result<Self> {
        crate::db::migrations::migrate_autonomy(&pool).await?;
        Ok(Self { pool })
    }

    /// Load counters for a session; absent rows read as zeroed metadata.
    pub async fn load(&self, session_key: &SessionKey) -> anyhow::Result<AutonomyMetadata> {
        let row = sqlx::query(
            "SELECT consecutive_autonomous, last_autonomous_at
             FROM autonomy WHERE session_key = ?",
        )
        .bind(session_key.to_string())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(AutonomyMetadata::default());
        };

        let consecutive: i64 = row.get("consecutive_autonomous");
        let last_str: Option<String> = row.get("last_autonomous_at");
        let last_autonomous_at = match last_str {
            Some(s) => Some(
                DateTime::parse_from_rfc3339(&s)
                    .map_err(|e| anyhow::anyhow!("bad last_autonomous_at {:?}: {}", s, e))?
                    .with_timezone(&Utc),
            ),
            None => None,
        };

        Ok(AutonomyMetadata {
            consecutive_autonomous: consecutive as u32,
            last_autonomous_at,
        })
    }

    /// Increment the streak and stamp the send time. Called after every
    /// honored autonomous send.
    pub async fn record_send(
        &self,
        session_key: &SessionKey,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let now_str = now.to_rfc3339();
        sqlx::query(
            "INSERT INTO autonomy (session_key, consecutive_autonomous, last_autonomous_at, updated_at)
             VALUES (?, 1, ?, ?)
             ON CONFLICT(session_key) DO UPDATE SET
               consecutive_autonomous = consecutive_autonomous + 1,
               last_autonomous_at = excluded.last_autonomous_at,
               updated_at = excluded.updated_at",
        )
        .bind(session_key.to_string())
        .bind(&now_str)
        .bind(&now_str)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Zero the streak on a genuine user message. The last send timestamp
    /// is kept so the cooldown still applies to the next autonomous send.
    pub async fn reset_on_user_message(&self, session_key: &SessionKey) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE autonomy SET consecutive_autonomous = 0, updated_at = ?
             WHERE session_key = ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(session_key.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
