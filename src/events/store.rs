//! Event store implementation using SQLite.
//!
//! Append-only: rows are inserted with a per-session monotonic sequence
//! number and never updated or deleted. The log is both the processing
//! input and the durable session history.

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{Row, SqlitePool};

use super::{Event, EventType};
use crate::session::SessionKey;

/// The durable event log backed by SQLite.
pub struct EventStore {
    pool: SqlitePool,
}

impl EventStore {
    /// Create a new EventStore with the given database pool.
    /// This also runs migrations to create/update the events table.
    pub async fn new(pool: SqlitePool) -> anyhow::Result<Self> {
        crate::db::migrations::migrate_events(&pool).await?;
        Ok(Self { pool })
    }

    /// Get the underlying database pool (for sharing with other stores).
    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    /// Append a new event, assigning the next sequence number for the
    /// session. The seq assignment and insert are a single statement, so
    /// concurrent appends to one session can never produce duplicate or
    /// out-of-order sequence numbers.
    pub async fn append(
        &self,
        session_key: &SessionKey,
        event_type: EventType,
        payload: JsonValue,
    ) -> anyhow::Result<Event> {
        let key_str = session_key.to_string();
        let payload_json = serde_json::to_string(&payload)?;
        let created_at = Utc::now();
        let created_at_str = created_at.to_rfc3339();

        let result = sqlx::query(
            r#"
            INSERT INTO events (session_key, seq, event_type, payload, created_at)
            VALUES (
                ?1,
                (SELECT COALESCE(MAX(seq), 0) + 1 FROM events WHERE session_key = ?1),
                ?2, ?3, ?4
            )
            "#,
        )
        .bind(&key_str)
        .bind(event_type.as_str())
        .bind(&payload_json)
        .bind(&created_at_str)
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        let seq: i64 = sqlx::query("SELECT seq FROM events WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await?
            .get("seq");

        Ok(Event {
            id,
            session_key: session_key.clone(),
            seq,
            event_type,
            payload,
            created_at,
        })
    }

    /// The most recent `limit` events for a session, in chronological order.
    /// Used to compile agent context.
    pub async fn recent_events(
        &self,
        session_key: &SessionKey,
        limit: usize,
    ) -> anyhow::Result<Vec<Event>> {
        let rows = sqlx::query(
            r#"
            SELECT id, session_key, seq, event_type, payload, created_at
            FROM events
            WHERE session_key = ?
            ORDER BY seq DESC
            LIMIT ?
            "#,
        )
        .bind(session_key.to_string())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut events = rows_to_events(rows)?;
        events.reverse();
        Ok(events)
    }

    /// Full ordered history for a session.
    pub async fn events_for_session(&self, session_key: &SessionKey) -> anyhow::Result<Vec<Event>> {
        let rows = sqlx::query(
            r#"
            SELECT id, session_key, seq, event_type, payload, created_at
            FROM events
            WHERE session_key = ?
            ORDER BY seq ASC
            "#,
        )
        .bind(session_key.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows_to_events(rows)
    }
}

fn rows_to_events(rows: Vec<sqlx::sqlite::SqliteRow>) -> anyhow::Result<Vec<Event>> {
    rows.into_iter()
        .map(|row| {
            let key_str: String = row.get("session_key");
            let type_str: String = row.get("event_type");
            let payload_str: String = row.get("payload");
            let created_at_str: String = row.get("created_at");

            let event_type = EventType::from_str(&type_str)
                .ok_or_else(|| anyhow::anyhow!("unknown event type in store: {}", type_str))?;

            Ok(Event {
                id: row.get("id"),
                session_key: SessionKey::parse(&key_str)?,
                seq: row.get("seq"),
                event_type,
                payload: serde_json::from_str(&payload_str)?,
                created_at: DateTime::parse_from_rfc3339(&created_at_str)?.with_timezone(&Utc),
            })
        })
        .collect()
}
