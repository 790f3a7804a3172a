//! Daemon assembly: builds the stores and workers and runs until shutdown.

use std::sync::Arc;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use tracing::info;

use crate::config::AppConfig;
use crate::connections::ConnectionManager;
use crate::daemon;
use crate::events::EventStore;
use crate::ingest::EventIngest;
use crate::outbox::{EffectRunner, OutboxStore};
use crate::policy::{AutonomyPolicy, AutonomyStore};
use crate::processor::SessionProcessor;
use crate::queue::{EventQueue, RetryPolicy};
use crate::timers::{TimerStore, TimerWorker};
use crate::traits::Agent;

/// Handles to the running pipeline. The transport layer (or tests) talks to
/// the daemon through these.
pub struct Sessiond {
    pub ingest: Arc<EventIngest>,
    pub connections: Arc<ConnectionManager>,
    pub events: Arc<EventStore>,
    pub outbox: Arc<OutboxStore>,
    pub timers: Arc<TimerStore>,
}

/// Wire up every store and background worker against one SQLite database.
pub async fn build(config: &AppConfig, agent: Arc<dyn Agent>) -> anyhow::Result<Sessiond> {
    // 1. Database
    let options = SqliteConnectOptions::new()
        .filename(&config.state.db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;
    info!("State database opened ({})", config.state.db_path);

    // 2. Stores
    let events = Arc::new(EventStore::new(pool.clone()).await?);
    let outbox = Arc::new(OutboxStore::new(pool.clone()).await?);
    let autonomy = Arc::new(AutonomyStore::new(pool.clone()).await?);
    let timers = Arc::new(TimerStore::new(pool).await?);

    // 3. Queue and processor
    let queue = Arc::new(EventQueue::new(
        Duration::from_millis(config.queue.poll_interval_ms),
        RetryPolicy {
            max_attempts: config.queue.max_attempts,
            base_delay: Duration::from_millis(config.queue.retry_base_delay_ms),
        },
    ));
    let processor = Arc::new(SessionProcessor::new(
        agent,
        events.clone(),
        outbox.clone(),
        autonomy,
        AutonomyPolicy::from(&config.autonomy),
        Duration::from_secs(config.agent.timeout_secs),
    ));
    queue.clone().spawn(processor);

    // 4. Connections and effect delivery
    let connections = Arc::new(ConnectionManager::new());
    let runner = Arc::new(EffectRunner::new(
        outbox.clone(),
        timers.clone(),
        connections.clone(),
        Duration::from_millis(config.outbox.poll_interval_ms),
        config.outbox.batch_size,
        config.outbox.chunk_chars,
    ));
    runner.spawn();

    // 5. Timer promotion
    let worker = Arc::new(TimerWorker::new(
        timers.clone(),
        events.clone(),
        queue.clone(),
        Duration::from_millis(config.timers.poll_interval_ms),
        config.timers.batch_size,
    ));
    worker.spawn();

    // 6. Ingestion front door
    let ingest = Arc::new(EventIngest::new(
        events.clone(),
        queue,
        outbox.clone(),
        connections.clone(),
    ));

    Ok(Sessiond {
        ingest,
        connections,
        events,
        outbox,
        timers,
    })
}

/// Build the pipeline and run until interrupted.
pub async fn run(config: AppConfig, agent: Arc<dyn Agent>) -> anyhow::Result<()> {
    let handles = build(&config, agent).await?;

    let health_port = config.daemon.health_port;
    let connections = handles.connections.clone();
    tokio::spawn(async move {
        if let Err(e) = daemon::start_health_server(health_port, connections).await {
            tracing::error!("Health server error: {}", e);
        }
    });

    info!("sessiond running, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");
    Ok(())
}
