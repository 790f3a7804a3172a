//! End-to-end pipeline tests over a real (file-backed) database: ingestion
//! through processing to delivery, timer promotion included.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;

use crate::agent;
use crate::config::AppConfig;
use crate::connections::StreamMessage;
use crate::core::{build, Sessiond};
use crate::events::{Event, EventType};
use crate::session::SessionKey;
use crate::testing::{MockAgent, TestSocket};
use crate::timers::{now_ms, TimerStatus};
use crate::traits::{Agent, AgentReply, EffectIntent, SessionContext};

fn fast_config() -> (AppConfig, PathBuf) {
    let db_path = std::env::temp_dir().join(format!("sessiond-it-{}.db", uuid::Uuid::new_v4()));
    let mut config = AppConfig::default();
    config.state.db_path = db_path.to_string_lossy().into_owned();
    config.queue.poll_interval_ms = 5;
    config.queue.retry_base_delay_ms = 10;
    config.outbox.poll_interval_ms = 10;
    config.outbox.chunk_chars = 4;
    config.timers.poll_interval_ms = 20;
    (config, db_path)
}

async fn daemon_with(agent: Arc<dyn Agent>) -> (Sessiond, PathBuf) {
    let (config, db_path) = fast_config();
    let daemon = build(&config, agent).await.unwrap();
    (daemon, db_path)
}

fn key() -> SessionKey {
    SessionKey::new("u1", "a1", "t1").unwrap()
}

/// Poll `check` until it holds or the timeout expires.
async fn eventually<F, Fut>(timeout: Duration, what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check().await {
            return;
        }
        if Instant::now() > deadline {
            panic!("condition not met within {:?}: {}", timeout, what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn final_messages(sent: &[StreamMessage]) -> Vec<String> {
    sent.iter()
        .filter_map(|m| match m {
            StreamMessage::Final { message, .. } => Some(message.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn user_message_roundtrips_to_a_streamed_reply() {
    let (daemon, db_path) =
        daemon_with(Arc::new(MockAgent::replying(AgentReply::say("hi there")))).await;
    let socket = Arc::new(TestSocket::new());
    daemon.connections.register("c1", "t1", socket.clone());

    daemon
        .ingest
        .submit(&key(), EventType::UserMessage, serde_json::json!({"content": "hello"}))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    eventually(Duration::from_secs(5), "reply delivered", || {
        let socket = socket.clone();
        async move { final_messages(&socket.sent()) == vec!["hi there".to_string()] }
    })
    .await;

    // Tokens arrive before the final and concatenate to it.
    let sent = socket.sent();
    let tokens: String = sent
        .iter()
        .filter_map(|m| match m {
            StreamMessage::Token { value, .. } => Some(value.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(tokens, "hi there");
    assert!(daemon.outbox.fetch_pending(10).await.unwrap().is_empty());

    let _ = std::fs::remove_file(&db_path);
}

#[tokio::test]
async fn interleaved_ingestion_keeps_per_session_sequences() {
    let (daemon, db_path) = daemon_with(Arc::new(MockAgent::replying(AgentReply::none()))).await;
    let key_a = SessionKey::new("u1", "a1", "t1").unwrap();
    let key_b = SessionKey::new("u2", "a1", "t2").unwrap();

    let mut handles = Vec::new();
    for (k, content) in [
        (&key_a, "a1"),
        (&key_b, "b1"),
        (&key_a, "a2"),
        (&key_b, "b2"),
        (&key_a, "a3"),
    ] {
        handles.push(
            daemon
                .ingest
                .submit(k, EventType::UserMessage, serde_json::json!({"content": content}))
                .await
                .unwrap(),
        );
    }
    for handle in handles {
        handle.wait().await.unwrap();
    }

    let log_a = daemon.events.events_for_session(&key_a).await.unwrap();
    let log_b = daemon.events.events_for_session(&key_b).await.unwrap();
    assert_eq!(log_a.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![1, 2, 3]);
    assert_eq!(log_b.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![1, 2]);

    let _ = std::fs::remove_file(&db_path);
}

/// Schedules a follow-up on the user's message, then answers the timer fire
/// with an autonomous check-in.
struct FollowupAgent;

#[async_trait]
impl Agent for FollowupAgent {
    async fn handle_event(
        &self,
        event: &Event,
        _ctx: &SessionContext,
    ) -> anyhow::Result<AgentReply> {
        match event.event_type {
            EventType::UserMessage => Ok(AgentReply {
                intents: vec![EffectIntent::ScheduleTimer {
                    timer_id: "checkin".to_string(),
                    delay_seconds: 0,
                    payload: serde_json::json!({}),
                }],
            }),
            EventType::Timer => Ok(AgentReply::say("checking in")),
            EventType::ToolResult => Ok(AgentReply::none()),
        }
    }
}

#[tokio::test]
async fn scheduled_timer_promotes_and_delivers_an_autonomous_send() {
    let (daemon, db_path) = daemon_with(Arc::new(FollowupAgent)).await;
    let socket = Arc::new(TestSocket::new());
    daemon.connections.register("c1", "t1", socket.clone());

    daemon
        .ingest
        .submit(&key(), EventType::UserMessage, serde_json::json!({"content": "remind me"}))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    eventually(Duration::from_secs(5), "autonomous check-in delivered", || {
        let socket = socket.clone();
        async move { final_messages(&socket.sent()) == vec!["checking in".to_string()] }
    })
    .await;

    // The timer event made it into the durable log after the user message.
    let log = daemon.events.events_for_session(&key()).await.unwrap();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].event_type, EventType::UserMessage);
    assert_eq!(log[1].event_type, EventType::Timer);

    let _ = std::fs::remove_file(&db_path);
}

#[tokio::test]
async fn timer_with_invalid_session_key_is_cancelled_not_promoted() {
    let (daemon, db_path) = daemon_with(Arc::new(agent::EchoAgent)).await;

    // Legacy row with a four-segment key: unroutable by construction.
    let pool = daemon.events.pool();
    let now = Utc::now().to_rfc3339();
    let result = sqlx::query(
        "INSERT INTO timers (session_key, timer_id, fire_at_ms, payload, status, created_at, updated_at)
         VALUES (?, ?, ?, '{}', 'pending', ?, ?)",
    )
    .bind("u1:a1:t1:extra")
    .bind("legacy")
    .bind(now_ms(Utc::now()) - 1_000)
    .bind(&now)
    .bind(&now)
    .execute(&pool)
    .await
    .unwrap();
    let timer_row = result.last_insert_rowid();

    eventually(Duration::from_secs(5), "invalid timer cancelled", || {
        let timers = daemon.timers.clone();
        async move {
            timers.status(timer_row).await.unwrap() == Some(TimerStatus::Cancelled)
        }
    })
    .await;

    // Nothing was appended for the valid prefix of that key either.
    let log = daemon.events.events_for_session(&key()).await.unwrap();
    assert!(log.is_empty());

    let _ = std::fs::remove_file(&db_path);
}
