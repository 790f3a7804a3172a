//! Background delivery of pending effects.
//!
//! The runner polls the outbox on a fixed interval and attempts delivery
//! per effect. Failure handling is per item: one effect's error is logged
//! and the rest of the batch proceeds. The runner enforces no retry bound
//! of its own; a released effect simply comes back on a later poll.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Effect, EffectType, OutboxStore, ScheduleTimerPayload, SendMessagePayload};
use crate::connections::{ConnectionManager, ResolvedConnection, StreamMessage};
use crate::timers::{now_ms, TimerStore};

enum DeliveryError {
    /// The in-flight request was aborted (superseded by a user turn or a
    /// newer request). Terminal for this effect.
    Aborted,
    /// The transport failed mid-stream. The effect goes back to pending.
    Transport(anyhow::Error),
}

pub struct EffectRunner {
    outbox: Arc<OutboxStore>,
    timers: Arc<TimerStore>,
    connections: Arc<ConnectionManager>,
    poll_interval: Duration,
    batch_size: usize,
    /// Streamed `token` chunk size in characters.
    chunk_chars: usize,
}

impl EffectRunner {
    pub fn new(
        outbox: Arc<OutboxStore>,
        timers: Arc<TimerStore>,
        connections: Arc<ConnectionManager>,
        poll_interval: Duration,
        batch_size: usize,
        chunk_chars: usize,
    ) -> Self {
        Self {
            outbox,
            timers,
            connections,
            poll_interval,
            batch_size,
            chunk_chars: chunk_chars.max(1),
        }
    }

    /// Spawn the polling loop as a background task.
    pub fn spawn(self: Arc<Self>) {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(self.poll_interval).await;
                if let Err(e) = self.tick().await {
                    error!("Effect runner tick error: {}", e);
                }
            }
        });
        info!("Effect runner spawned");
    }

    /// One delivery pass over pending effects, in creation order.
    pub async fn tick(&self) -> anyhow::Result<()> {
        let pending = self.outbox.fetch_pending(self.batch_size).await?;

        for effect in pending {
            let result = match effect.effect_type {
                EffectType::SendMessage => self.deliver_send(&effect).await,
                EffectType::ScheduleTimer => self.materialize_timer(&effect).await,
            };
            if let Err(e) = result {
                error!(effect_id = effect.id, "Effect delivery error: {}", e);
            }
        }
        Ok(())
    }

    async fn deliver_send(&self, effect: &Effect) -> anyhow::Result<()> {
        let payload: SendMessagePayload = serde_json::from_value(effect.payload.clone())?;
        let thread_id = effect.session_key.thread_id();

        // No live connection is not an error: the effect stays pending and
        // delivers on reconnect.
        let Some(conn) = self.connections.resolve(thread_id) else {
            debug!(
                effect_id = effect.id,
                thread_id, "No live connection, delivery deferred"
            );
            return Ok(());
        };

        // Claim the row; the user-turn path may have cleared it meanwhile.
        if !self.outbox.mark_executing(effect.id).await? {
            return Ok(());
        }

        let request_id = uuid::Uuid::new_v4().to_string();
        let Some(cancel) = self
            .connections
            .set_active_request(&conn.connection_id, &request_id)
        else {
            // Connection vanished between resolve and claim.
            self.outbox.release_to_pending(effect.id).await?;
            return Ok(());
        };

        match self
            .stream_content(&conn, &request_id, &payload.content, &cancel)
            .await
        {
            Ok(()) => {
                self.connections
                    .clear_active_request(&conn.connection_id, &request_id);
                self.connections.record_delivery(&conn.connection_id);
                self.outbox.mark_completed(effect.id).await?;
                debug!(effect_id = effect.id, thread_id, "Effect delivered");
            }
            Err(DeliveryError::Aborted) => {
                // Superseded: terminal, never partially completed.
                self.outbox.mark_failed(effect.id).await?;
                info!(effect_id = effect.id, thread_id, "Delivery aborted, effect superseded");
            }
            Err(DeliveryError::Transport(e)) => {
                self.connections
                    .clear_active_request(&conn.connection_id, &request_id);
                self.outbox.release_to_pending(effect.id).await?;
                warn!(effect_id = effect.id, thread_id, "Delivery transport failure: {}", e);
                // Best effort: tell the client the stream died and a retry
                // is coming. The socket may already be gone.
                let _ = conn
                    .socket
                    .send(&StreamMessage::Error {
                        request_id: request_id.clone(),
                        message: "delivery interrupted".to_string(),
                        retryable: true,
                    })
                    .await;
            }
        }
        Ok(())
    }

    /// Stream the content as token chunks followed by exactly one final
    /// message. Never reports success on a partial stream.
    async fn stream_content(
        &self,
        conn: &ResolvedConnection,
        request_id: &str,
        content: &str,
        cancel: &CancellationToken,
    ) -> Result<(), DeliveryError> {
        let started = Instant::now();

        for chunk in chunk_by_chars(content, self.chunk_chars) {
            if cancel.is_cancelled() {
                return Err(DeliveryError::Aborted);
            }
            let message = StreamMessage::Token {
                request_id: request_id.to_string(),
                value: chunk,
            };
            tokio::select! {
                _ = cancel.cancelled() => return Err(DeliveryError::Aborted),
                sent = conn.socket.send(&message) => {
                    sent.map_err(DeliveryError::Transport)?;
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(DeliveryError::Aborted);
        }
        let final_message = StreamMessage::Final {
            request_id: request_id.to_string(),
            message: content.to_string(),
            latency_ms: started.elapsed().as_millis() as u64,
            token_usage: None,
        };
        tokio::select! {
            _ = cancel.cancelled() => Err(DeliveryError::Aborted),
            sent = conn.socket.send(&final_message) => {
                sent.map_err(DeliveryError::Transport)
            }
        }
    }

    /// Convert a schedule_timer effect into a durable timer row.
    async fn materialize_timer(&self, effect: &Effect) -> anyhow::Result<()> {
        let payload: ScheduleTimerPayload = serde_json::from_value(effect.payload.clone())?;

        if !self.outbox.mark_executing(effect.id).await? {
            return Ok(());
        }

        let fire_at_ms = now_ms(Utc::now()) + (payload.delay_seconds as i64) * 1000;
        match self
            .timers
            .create(&effect.session_key, &payload.timer_id, fire_at_ms, payload.payload)
            .await
        {
            Ok(timer_row) => {
                self.outbox.mark_completed(effect.id).await?;
                info!(
                    effect_id = effect.id,
                    timer_id = %payload.timer_id,
                    timer_row,
                    fire_at_ms,
                    "Timer scheduled"
                );
            }
            Err(e) => {
                self.outbox.release_to_pending(effect.id).await?;
                return Err(e);
            }
        }
        Ok(())
    }
}

/// Split on char boundaries into chunks of at most `size` characters.
fn chunk_by_chars(content: &str, size: usize) -> Vec<String> {
    let chars: Vec<char> = content.chars().collect();
    chars
        .chunks(size)
        .map(|chunk| chunk.iter().collect())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::{EffectStatus, NewEffect};
    use crate::session::SessionKey;
    use crate::testing::{memory_pool, TestSocket};
    use crate::timers::TimerStatus;

    struct Fixture {
        outbox: Arc<OutboxStore>,
        timers: Arc<TimerStore>,
        connections: Arc<ConnectionManager>,
        runner: EffectRunner,
    }

    async fn fixture(chunk_chars: usize) -> Fixture {
        let pool = memory_pool().await;
        let outbox = Arc::new(OutboxStore::new(pool.clone()).await.unwrap());
        let timers = Arc::new(TimerStore::new(pool).await.unwrap());
        let connections = Arc::new(ConnectionManager::new());
        let runner = EffectRunner::new(
            outbox.clone(),
            timers.clone(),
            connections.clone(),
            Duration::from_millis(10),
            16,
            chunk_chars,
        );
        Fixture {
            outbox,
            timers,
            connections,
            runner,
        }
    }

    fn key() -> SessionKey {
        SessionKey::new("u1", "a1", "t1").unwrap()
    }

    async fn pending_send(outbox: &OutboxStore, content: &str, dedupe: &str) -> i64 {
        match outbox
            .create(NewEffect::pending(
                key(),
                1,
                EffectType::SendMessage,
                serde_json::json!({"content": content}),
                dedupe.to_string(),
            ))
            .await
            .unwrap()
        {
            crate::outbox::CreateOutcome::Created(id) => id,
            crate::outbox::CreateOutcome::Duplicate => panic!("unexpected duplicate"),
        }
    }

    #[tokio::test]
    async fn streams_tokens_then_final_and_completes() {
        let fx = fixture(4).await;
        let socket = Arc::new(TestSocket::new());
        fx.connections.register("c1", "t1", socket.clone());
        let id = pending_send(&fx.outbox, "hello world", "k1").await;

        fx.runner.tick().await.unwrap();

        let sent = socket.sent();
        // ceil(11 / 4) = 3 token chunks + 1 final.
        assert_eq!(sent.len(), 4);
        let tokens: String = sent[..3]
            .iter()
            .map(|m| match m {
                StreamMessage::Token { value, .. } => value.clone(),
                other => panic!("expected token, got {:?}", other),
            })
            .collect();
        assert_eq!(tokens, "hello world");
        match &sent[3] {
            StreamMessage::Final { message, .. } => assert_eq!(message, "hello world"),
            other => panic!("expected final, got {:?}", other),
        }

        let effect = fx.outbox.get(id).await.unwrap().unwrap();
        assert_eq!(effect.status, EffectStatus::Completed);
        assert_eq!(fx.connections.message_count("c1"), 1);
    }

    #[tokio::test]
    async fn no_connection_leaves_effect_pending() {
        let fx = fixture(8).await;
        let id = pending_send(&fx.outbox, "hello", "k1").await;

        fx.runner.tick().await.unwrap();

        let effect = fx.outbox.get(id).await.unwrap().unwrap();
        assert_eq!(effect.status, EffectStatus::Pending);
        assert_eq!(effect.attempt_count, 0);

        // Client reconnects: next poll delivers.
        let socket = Arc::new(TestSocket::new());
        fx.connections.register("c1", "t1", socket.clone());
        fx.runner.tick().await.unwrap();
        let effect = fx.outbox.get(id).await.unwrap().unwrap();
        assert_eq!(effect.status, EffectStatus::Completed);
        assert!(!socket.sent().is_empty());
    }

    #[tokio::test]
    async fn transport_failure_releases_to_pending_with_error_message() {
        let fx = fixture(2).await;
        // Fails on the second send, then works.
        let socket = Arc::new(TestSocket::failing_at(1));
        fx.connections.register("c1", "t1", socket.clone());
        let id = pending_send(&fx.outbox, "abcdef", "k1").await;

        fx.runner.tick().await.unwrap();

        let effect = fx.outbox.get(id).await.unwrap().unwrap();
        assert_eq!(effect.status, EffectStatus::Pending);
        assert_eq!(effect.attempt_count, 1);
        // Last message on the socket is the retryable stream error.
        let sent = socket.sent();
        match sent.last().unwrap() {
            StreamMessage::Error { retryable, .. } => assert!(retryable),
            other => panic!("expected error message, got {:?}", other),
        }

        // Next poll retries and completes.
        fx.runner.tick().await.unwrap();
        let effect = fx.outbox.get(id).await.unwrap().unwrap();
        assert_eq!(effect.status, EffectStatus::Completed);
    }

    #[tokio::test]
    async fn aborted_stream_is_terminal_failed() {
        let fx = fixture(1).await;
        let socket = Arc::new(TestSocket::new());
        fx.connections.register("c1", "t1", socket.clone());
        let id = pending_send(&fx.outbox, "hello", "k1").await;

        // Abort every request as soon as it starts, as a user turn would.
        let connections = fx.connections.clone();
        socket.on_first_send(move || {
            connections.abort_thread("t1");
        });

        fx.runner.tick().await.unwrap();

        let effect = fx.outbox.get(id).await.unwrap().unwrap();
        assert_eq!(effect.status, EffectStatus::Failed);
        // Never a final message after an abort.
        assert!(socket
            .sent()
            .iter()
            .all(|m| !matches!(m, StreamMessage::Final { .. })));
    }

    #[tokio::test]
    async fn effect_claimed_before_a_crash_is_delivered_after_restart() {
        let pool = memory_pool().await;
        let outbox = Arc::new(OutboxStore::new(pool.clone()).await.unwrap());
        let id = pending_send(&outbox, "hello", "k1").await;
        // Claimed mid-delivery, then the process dies.
        assert!(outbox.mark_executing(id).await.unwrap());
        drop(outbox);

        // Restart: rebuild the stores and runner over the same database.
        let outbox = Arc::new(OutboxStore::new(pool.clone()).await.unwrap());
        let timers = Arc::new(TimerStore::new(pool).await.unwrap());
        let connections = Arc::new(ConnectionManager::new());
        let runner = EffectRunner::new(
            outbox.clone(),
            timers,
            connections.clone(),
            Duration::from_millis(10),
            16,
            8,
        );
        let socket = Arc::new(TestSocket::new());
        connections.register("c1", "t1", socket.clone());

        runner.tick().await.unwrap();

        let effect = outbox.get(id).await.unwrap().unwrap();
        assert_eq!(effect.status, EffectStatus::Completed);
        assert!(!socket.sent().is_empty());
    }

    #[tokio::test]
    async fn schedule_timer_effect_creates_pending_timer_row() {
        let fx = fixture(8).await;
        fx.outbox
            .create(NewEffect::pending(
                key(),
                1,
                EffectType::ScheduleTimer,
                serde_json::json!({"timer_id": "followup", "delay_seconds": 60, "payload": {"k": 1}}),
                "timer-k".to_string(),
            ))
            .await
            .unwrap();

        fx.runner.tick().await.unwrap();

        assert!(fx.outbox.fetch_pending(10).await.unwrap().is_empty());
        // Not due yet: 60s out.
        assert!(fx
            .timers
            .fetch_due(now_ms(Utc::now()), 10)
            .await
            .unwrap()
            .is_empty());
        let due = fx
            .timers
            .fetch_due(now_ms(Utc::now()) + 61_000, 10)
            .await
            .unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].timer_id, "followup");
        assert_eq!(due[0].status, TimerStatus::Pending);
    }

    #[test]
    fn chunking_respects_char_boundaries() {
        assert_eq!(chunk_by_chars("hello", 2), vec!["he", "ll", "o"]);
        assert_eq!(chunk_by_chars("héllo", 2), vec!["hé", "ll", "o"]);
        assert!(chunk_by_chars("", 4).is_empty());
    }
}
