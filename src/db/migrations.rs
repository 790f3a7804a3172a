use sqlx::SqlitePool;
use tracing::info;

/// Centralized database migrations for all SQLite-backed stores.
///
/// Each migration is safe to call multiple times (idempotent) by using
/// `IF NOT EXISTS` throughout.
pub(crate) async fn migrate_events(pool: &SqlitePool) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_key TEXT NOT NULL,
            seq INTEGER NOT NULL,
            event_type TEXT NOT NULL,
            payload TEXT NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE(session_key, seq)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_events_session_seq
         ON events(session_key, seq)",
    )
    .execute(pool)
    .await?;

    info!("Events table migration complete");
    Ok(())
}

pub(crate) async fn migrate_effects(pool: &SqlitePool) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS effects (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_key TEXT NOT NULL,
            checkpoint_id INTEGER NOT NULL,
            effect_type TEXT NOT NULL,
            payload TEXT NOT NULL,
            dedupe_key TEXT NOT NULL UNIQUE,
            autonomous INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'pending',
            attempt_count INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Partial index keeps the pending poll cheap: most rows end up terminal.
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_effects_pending
         ON effects(id) WHERE status = 'pending'",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_effects_session_status
         ON effects(session_key, status)",
    )
    .execute(pool)
    .await?;

    info!("Effects table migration complete");
    Ok(())
}

pub(crate) async fn migrate_timers(pool: &SqlitePool) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS timers (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_key TEXT NOT NULL,
            timer_id TEXT NOT NULL,
            fire_at_ms INTEGER NOT NULL,
            payload TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_timers_due
         ON timers(fire_at_ms) WHERE status = 'pending'",
    )
    .execute(pool)
    .await?;

    info!("Timers table migration complete");
    Ok(())
}

pub(crate) async fn migrate_autonomy(pool: &SqlitePool) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS autonomy (
            session_key TEXT PRIMARY KEY,
            consecutive_autonomous INTEGER NOT NULL DEFAULT 0,
            last_autonomous_at TEXT,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    info!("Autonomy table migration complete");
    Ok(())
}
