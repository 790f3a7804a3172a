//! Durable timers and their promotion into the event log.
//!
//! A timer is a scheduled future event: an agent decision writes a pending
//! row, and the worker promotes due rows into `timer` events on a fixed
//! poll. The status machine is one-way (pending -> promoted | cancelled),
//! so re-running a poll over the same snapshot can never promote twice.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{Row, SqlitePool};
use tracing::{error, info, warn};

use crate::events::{EventStore, EventType, TimerFiredPayload};
use crate::queue::EventQueue;
use crate::session::SessionKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerStatus {
    Pending,
    Promoted,
    Cancelled,
}

impl TimerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimerStatus::Pending => "pending",
            TimerStatus::Promoted => "promoted",
            TimerStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TimerStatus::Pending),
            "promoted" => Some(TimerStatus::Promoted),
            "cancelled" => Some(TimerStatus::Cancelled),
            _ => None,
        }
    }
}

/// A durable scheduled future event.
///
/// `session_key` is stored as raw text and validated only at promotion:
/// corrupt rows must be cancellable, not unparseable.
#[derive(Debug, Clone)]
pub struct Timer {
    pub id: i64,
    pub session_key: String,
    pub timer_id: String,
    pub fire_at_ms: i64,
    pub payload: JsonValue,
    pub status: TimerStatus,
}

/// SQLite-backed timer schedule.
pub struct TimerStore {
    pool: SqlitePool,
}

impl TimerStore {
    pub async fn new(pool: SqlitePool) -> anyhow::Result<Self> {
        crate::db::migrations::migrate_timers(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn create(
        &self,
        session_key: &SessionKey,
        timer_id: &str,
        fire_at_ms: i64,
        payload: JsonValue,
    ) -> anyhow::Result<i64> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            r#"
            INSERT INTO timers (session_key, timer_id, fire_at_ms, payload, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, 'pending', ?, ?)
            "#,
        )
        .bind(session_key.to_string())
        .bind(timer_id)
        .bind(fire_at_ms)
        .bind(serde_json::to_string(&payload)?)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Pending timers due at or before `now_ms`, oldest deadline first.
    pub async fn fetch_due(&self, now_ms: i64, batch: usize) -> anyhow::Result<Vec<Timer>> {
        let rows = sqlx::query(
            r#"
            SELECT id, session_key, timer_id, fire_at_ms, payload, status
            FROM timers
            WHERE status = 'pending' AND fire_at_ms <= ?
            ORDER BY fire_at_ms ASC
            LIMIT ?
            "#,
        )
        .bind(now_ms)
        .bind(batch as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let payload_str: String = row.get("payload");
                let status_str: String = row.get("status");
                Ok(Timer {
                    id: row.get("id"),
                    session_key: row.get("session_key"),
                    timer_id: row.get("timer_id"),
                    fire_at_ms: row.get("fire_at_ms"),
                    payload: serde_json::from_str(&payload_str)?,
                    status: TimerStatus::from_str(&status_str)
                        .ok_or_else(|| anyhow::anyhow!("unknown timer status: {}", status_str))?,
                })
            })
            .collect()
    }

    /// pending -> promoted. The status guard makes the transition one-way.
    pub async fn mark_promoted(&self, id: i64) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "UPDATE timers SET status = 'promoted', updated_at = ?
             WHERE id = ? AND status = 'pending'",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// pending -> cancelled. Also terminal.
    pub async fn mark_cancelled(&self, id: i64) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "UPDATE timers SET status = 'cancelled', updated_at = ?
             WHERE id = ? AND status = 'pending'",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn status(&self, id: i64) -> anyhow::Result<Option<TimerStatus>> {
        let row = sqlx::query("SELECT status FROM timers WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.and_then(|r| TimerStatus::from_str(&r.get::<String, _>("status"))))
    }
}

pub fn now_ms(now: DateTime<Utc>) -> i64 {
    now.timestamp_millis()
}

/// Background worker promoting due timers into the event pipeline.
pub struct TimerWorker {
    store: Arc<TimerStore>,
    events: Arc<EventStore>,
    queue: Arc<EventQueue>,
    poll_interval: Duration,
    batch_size: usize,
}

impl TimerWorker {
    pub fn new(
        store: Arc<TimerStore>,
        events: Arc<EventStore>,
        queue: Arc<EventQueue>,
        poll_interval: Duration,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            events,
            queue,
            poll_interval,
            batch_size,
        }
    }

    /// Spawn the promotion loop as a background task.
    pub fn spawn(self: Arc<Self>) {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(self.poll_interval).await;
                if let Err(e) = self.tick().await {
                    error!("Timer worker tick error: {}", e);
                }
            }
        });
        info!("Timer worker spawned");
    }

    /// One promotion pass. Each due timer is handled independently: one
    /// bad row is cancelled or logged without aborting the batch.
    pub async fn tick(&self) -> anyhow::Result<()> {
        let due = self
            .store
            .fetch_due(now_ms(Utc::now()), self.batch_size)
            .await?;

        for timer in due {
            if let Err(e) = self.promote(&timer).await {
                error!(
                    timer_id = %timer.timer_id,
                    "Failed to promote timer: {}", e
                );
            }
        }
        Ok(())
    }

    async fn promote(&self, timer: &Timer) -> anyhow::Result<()> {
        // Fail-safe on malformed scheduling data: cancel instead of looping
        // over an unroutable row forever.
        let session_key = match SessionKey::parse(&timer.session_key) {
            Ok(key) => key,
            Err(e) => {
                warn!(
                    timer_id = %timer.timer_id,
                    session_key = %timer.session_key,
                    "Cancelling timer with invalid session key: {}", e
                );
                self.store.mark_cancelled(timer.id).await?;
                return Ok(());
            }
        };

        let payload = serde_json::to_value(TimerFiredPayload {
            timer_id: timer.timer_id.clone(),
            payload: timer.payload.clone(),
        })?;

        let event = self
            .events
            .append(&session_key, EventType::Timer, payload)
            .await?;
        // Fire-and-forget: timer events are never retried, nobody awaits
        // their completion.
        let _ = self.queue.enqueue(event);
        self.store.mark_promoted(timer.id).await?;

        info!(timer_id = %timer.timer_id, session_key = %session_key, "Timer promoted");
        Ok(())
    }
}
