//! Test infrastructure: MockAgent, TestSocket, and pool helpers.
//!
//! Provides scripted collaborators for exercising the real pipeline
//! (queue, processor, outbox, runner) without an LLM or a transport.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

use crate::connections::{ClientSocket, StreamMessage};
use crate::events::Event;
use crate::traits::{Agent, AgentReply, SessionContext};

/// Fresh in-memory SQLite pool. One connection so every test sees one DB.
pub async fn memory_pool() -> SqlitePool {
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite pool")
}

// ---------------------------------------------------------------------------
// MockAgent
// ---------------------------------------------------------------------------

/// Scripted agent returning a fixed reply and counting invocations.
/// `hanging()` never returns (for timeout tests).
pub struct MockAgent {
    reply: AgentReply,
    hang: bool,
    pub calls: AtomicU32,
}

impl MockAgent {
    pub fn replying(reply: AgentReply) -> Self {
        Self {
            reply,
            hang: false,
            calls: AtomicU32::new(0),
        }
    }

    pub fn hanging() -> Self {
        Self {
            reply: AgentReply::none(),
            hang: true,
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl Agent for MockAgent {
    async fn handle_event(
        &self,
        _event: &Event,
        _ctx: &SessionContext,
    ) -> anyhow::Result<AgentReply> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.hang {
            std::future::pending::<()>().await;
        }
        Ok(self.reply.clone())
    }
}

// ---------------------------------------------------------------------------
// TestSocket
// ---------------------------------------------------------------------------

type SendHook = Box<dyn Fn() + Send + Sync>;

/// Recording client socket with an optional injected failure and a hook
/// fired on the first send (to simulate a user turn arriving mid-stream).
pub struct TestSocket {
    sent: Mutex<Vec<StreamMessage>>,
    fail_at: Option<usize>,
    counter: AtomicUsize,
    first_send_hook: Mutex<Option<SendHook>>,
}

impl TestSocket {
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail_at: None,
            counter: AtomicUsize::new(0),
            first_send_hook: Mutex::new(None),
        }
    }

    /// Fail exactly the `index`-th send (0-based); all others succeed.
    pub fn failing_at(index: usize) -> Self {
        Self {
            fail_at: Some(index),
            ..Self::new()
        }
    }

    pub fn on_first_send(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.first_send_hook.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn sent(&self) -> Vec<StreamMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClientSocket for TestSocket {
    async fn send(&self, message: &StreamMessage) -> anyhow::Result<()> {
        let index = self.counter.fetch_add(1, Ordering::SeqCst);
        if index == 0 {
            if let Some(hook) = self.first_send_hook.lock().unwrap().take() {
                hook();
            }
        }
        if self.fail_at == Some(index) {
            anyhow::bail!("socket write failed");
        }
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }
}

impl Default for TestSocket {
    fn default() -> Self {
        Self::new()
    }
}
