//! Outbox store implementation using SQLite.

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{Row, SqlitePool};
use tracing::warn;

use super::{Effect, EffectStatus, EffectType};
use crate::session::SessionKey;

/// A not-yet-persisted effect.
#[derive(Debug, Clone)]
pub struct NewEffect {
    pub session_key: SessionKey,
    pub checkpoint_id: i64,
    pub effect_type: EffectType,
    pub payload: JsonValue,
    pub dedupe_key: String,
    pub autonomous: bool,
    /// Almost always `Pending`; non-pending creation exists for imports and
    /// tests and is excluded from the pending poll from the start.
    pub status: EffectStatus,
}

impl NewEffect {
    pub fn pending(
        session_key: SessionKey,
        checkpoint_id: i64,
        effect_type: EffectType,
        payload: JsonValue,
        dedupe_key: String,
    ) -> Self {
        Self {
            session_key,
            checkpoint_id,
            effect_type,
            payload,
            dedupe_key,
            autonomous: false,
            status: EffectStatus::Pending,
        }
    }

    pub fn autonomous(mut self) -> Self {
        self.autonomous = true;
        self
    }
}

/// Outcome of an effect create: the dedupe key is the idempotency boundary,
/// so a second create with the same key is not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created(i64),
    Duplicate,
}

/// The durable effect store backing the outbox pattern.
pub struct OutboxStore {
    pool: SqlitePool,
}

impl OutboxStore {
    pub async fn new(pool: SqlitePool) -> anyhow::Result<Self> {
        crate::db::migrations::migrate_effects(&pool).await?;
        let store = Self { pool };
        store.recover_executing().await?;
        Ok(store)
    }

    /// Reclaim rows a previous run left in `executing`. The claim is an
    /// in-memory lease held by the effect runner, so after a restart any
    /// claimed-but-unfinished delivery goes back to pending (at-least-once;
    /// the client may see the stream twice).
    async fn recover_executing(&self) -> anyhow::Result<()> {
        let result = sqlx::query(
            "UPDATE effects SET status = 'pending', updated_at = ?
             WHERE status = 'executing'",
        )
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() > 0 {
            warn!(
                reclaimed = result.rows_affected(),
                "Reclaimed effects left executing by a previous run"
            );
        }
        Ok(())
    }

    /// Persist an effect. A dedupe-key collision reports `Duplicate` and
    /// leaves the stored row untouched.
    pub async fn create(&self, effect: NewEffect) -> anyhow::Result<CreateOutcome> {
        let payload_json = serde_json::to_string(&effect.payload)?;
        let now = Utc::now().to_rfc3339();

        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO effects
                (session_key, checkpoint_id, effect_type, payload, dedupe_key,
                 autonomous, status, attempt_count, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, ?)
            "#,
        )
        .bind(effect.session_key.to_string())
        .bind(effect.checkpoint_id)
        .bind(effect.effect_type.as_str())
        .bind(&payload_json)
        .bind(&effect.dedupe_key)
        .bind(effect.autonomous as i32)
        .bind(effect.status.as_str())
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(CreateOutcome::Duplicate);
        }
        Ok(CreateOutcome::Created(result.last_insert_rowid()))
    }

    /// Pending effects in creation order (id ASC), which preserves
    /// per-thread creation-order delivery within a poll tick.
    pub async fn fetch_pending(&self, limit: usize) -> anyhow::Result<Vec<Effect>> {
        let rows = sqlx::query(
            r#"
            SELECT id, session_key, checkpoint_id, effect_type, payload, dedupe_key,
                   autonomous, status, attempt_count, created_at, updated_at
            FROM effects
            WHERE status = 'pending'
            ORDER BY id ASC
            LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_effect).collect()
    }

    pub async fn get(&self, id: i64) -> anyhow::Result<Option<Effect>> {
        let row = sqlx::query(
            r#"
            SELECT id, session_key, checkpoint_id, effect_type, payload, dedupe_key,
                   autonomous, status, attempt_count, created_at, updated_at
            FROM effects
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_effect).transpose()
    }

    /// Claim a pending effect for delivery. Returns false when the row was
    /// no longer pending (already claimed, completed, or cleared).
    pub async fn mark_executing(&self, id: i64) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "UPDATE effects SET status = 'executing', updated_at = ?
             WHERE id = ? AND status = 'pending'",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn mark_completed(&self, id: i64) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE effects SET status = 'completed', updated_at = ? WHERE id = ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Delivery attempt failed: count it and put the row back where the
    /// next poll will pick it up. The store itself applies no retry bound.
    pub async fn release_to_pending(&self, id: i64) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE effects SET status = 'pending', attempt_count = attempt_count + 1,
                 updated_at = ?
             WHERE id = ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_failed(&self, id: i64) -> anyhow::Result<()> {
        sqlx::query("UPDATE effects SET status = 'failed', updated_at = ? WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Clear pending autonomous sends for a session: a new user turn
    /// supersedes scheduled follow-ups. Returns the number cleared.
    pub async fn cancel_pending_autonomous(&self, session_key: &SessionKey) -> anyhow::Result<u64> {
        let result = sqlx::query(
            "UPDATE effects SET status = 'failed', updated_at = ?
             WHERE session_key = ? AND status = 'pending'
               AND autonomous = 1 AND effect_type = 'send_message'",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(session_key.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

fn row_to_effect(row: sqlx::sqlite::SqliteRow) -> anyhow::Result<Effect> {
    let key_str: String = row.get("session_key");
    let type_str: String = row.get("effect_type");
    let status_str: String = row.get("status");
    let payload_str: String = row.get("payload");
    let created_at_str: String = row.get("created_at");
    let updated_at_str: String = row.get("updated_at");

    Ok(Effect {
        id: row.get("id"),
        session_key: SessionKey::parse(&key_str)?,
        checkpoint_id: row.get("checkpoint_id"),
        effect_type: EffectType::from_str(&type_str)
            .ok_or_else(|| anyhow::anyhow!("unknown effect type in store: {}", type_str))?,
        payload: serde_json::from_str(&payload_str)?,
        dedupe_key: row.get("dedupe_key"),
        autonomous: row.get::<i32, _>("autonomous") != 0,
        status: EffectStatus::from_str(&status_str)
            .ok_or_else(|| anyhow::anyhow!("unknown effect status in store: {}", status_str))?,
        attempt_count: row.get::<i64, _>("attempt_count") as u32,
        created_at: DateTime::parse_from_rfc3339(&created_at_str)?.with_timezone(&Utc),
        updated_at: DateTime::parse_from_rfc3339(&updated_at_str)?.with_timezone(&Utc),
    })
}
