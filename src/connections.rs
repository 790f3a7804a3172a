//! Live client connection tracking and in-flight delivery control.
//!
//! Connections are ephemeral and in-memory only: losing them affects
//! delivery completeness, never the durable record. Multiple connections
//! may map to one thread; the most recently registered wins for delivery.
//! Each connection allows a single in-flight request; registering a new one
//! aborts the previous.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Outbound wire messages for one delivery stream. Clients treat `token`
/// values as append-only and `final` as authoritative (after a retry the
/// final message may not equal the token concatenation).
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamMessage {
    Token {
        #[serde(rename = "requestId")]
        request_id: String,
        value: String,
    },
    Final {
        #[serde(rename = "requestId")]
        request_id: String,
        message: String,
        #[serde(rename = "latencyMs")]
        latency_ms: u64,
        #[serde(rename = "tokenUsage", skip_serializing_if = "Option::is_none")]
        token_usage: Option<u64>,
    },
    Error {
        #[serde(rename = "requestId")]
        request_id: String,
        message: String,
        retryable: bool,
    },
}

/// Transport seam implemented by the connection layer (WebSocket, test
/// harness, ...). Only message shape is specified here; the handshake
/// lives with the transport.
#[async_trait]
pub trait ClientSocket: Send + Sync {
    async fn send(&self, message: &StreamMessage) -> anyhow::Result<()>;
}

struct ActiveRequest {
    request_id: String,
    cancel: CancellationToken,
}

struct ConnectionEntry {
    thread_id: String,
    socket: Arc<dyn ClientSocket>,
    active: Option<ActiveRequest>,
    /// Completed deliveries on this connection.
    message_count: u64,
    connected_at: DateTime<Utc>,
}

/// Snapshot handed to the effect runner for one delivery.
#[derive(Clone)]
pub struct ResolvedConnection {
    pub connection_id: String,
    pub socket: Arc<dyn ClientSocket>,
}

/// Owns the connection table. All mutation goes through methods; the lock
/// is never held across an await.
pub struct ConnectionManager {
    inner: Mutex<HashMap<String, ConnectionEntry>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Track a new connection. A reconnect with the same id replaces the
    /// old entry (and aborts its in-flight request).
    pub fn register(
        &self,
        connection_id: impl Into<String>,
        thread_id: impl Into<String>,
        socket: Arc<dyn ClientSocket>,
    ) {
        let connection_id = connection_id.into();
        let entry = ConnectionEntry {
            thread_id: thread_id.into(),
            socket,
            active: None,
            message_count: 0,
            connected_at: Utc::now(),
        };
        let mut inner = self.inner.lock().expect("connection table poisoned");
        if let Some(old) = inner.insert(connection_id.clone(), entry) {
            if let Some(active) = old.active {
                active.cancel.cancel();
            }
        }
        debug!(connection_id = %connection_id, "Connection registered");
    }

    /// Drop a connection on client disconnect: abort any active request and
    /// purge state. Lock-only work, returns immediately.
    pub fn unregister(&self, connection_id: &str) {
        let removed = {
            let mut inner = self.inner.lock().expect("connection table poisoned");
            inner.remove(connection_id)
        };
        if let Some(entry) = removed {
            if let Some(active) = entry.active {
                active.cancel.cancel();
            }
            debug!(connection_id = %connection_id, "Connection unregistered");
        }
    }

    /// Most recently connected live connection for a thread, if any.
    pub fn resolve(&self, thread_id: &str) -> Option<ResolvedConnection> {
        let inner = self.inner.lock().expect("connection table poisoned");
        inner
            .iter()
            .filter(|(_, entry)| entry.thread_id == thread_id)
            .max_by_key(|(_, entry)| entry.connected_at)
            .map(|(id, entry)| ResolvedConnection {
                connection_id: id.clone(),
                socket: entry.socket.clone(),
            })
    }

    /// Record a new in-flight request on a connection, aborting any prior
    /// one (single flight per connection). Returns the cancellation token
    /// the delivery loop must watch, or None if the connection is gone.
    pub fn set_active_request(
        &self,
        connection_id: &str,
        request_id: &str,
    ) -> Option<CancellationToken> {
        let mut inner = self.inner.lock().expect("connection table poisoned");
        let entry = inner.get_mut(connection_id)?;
        if let Some(prior) = entry.active.take() {
            prior.cancel.cancel();
        }
        let cancel = CancellationToken::new();
        entry.active = Some(ActiveRequest {
            request_id: request_id.to_string(),
            cancel: cancel.clone(),
        });
        Some(cancel)
    }

    /// Clear the active request if `request_id` still matches.
    pub fn clear_active_request(&self, connection_id: &str, request_id: &str) {
        let mut inner = self.inner.lock().expect("connection table poisoned");
        if let Some(entry) = inner.get_mut(connection_id) {
            if entry
                .active
                .as_ref()
                .is_some_and(|a| a.request_id == request_id)
            {
                entry.active = None;
            }
        }
    }

    /// Abort a specific in-flight request. A request-id mismatch means the
    /// request already finished: benign race, reported as false.
    pub fn abort(&self, connection_id: &str, request_id: &str) -> bool {
        let mut inner = self.inner.lock().expect("connection table poisoned");
        let Some(entry) = inner.get_mut(connection_id) else {
            return false;
        };
        if entry
            .active
            .as_ref()
            .is_some_and(|a| a.request_id == request_id)
        {
            if let Some(active) = entry.active.take() {
                active.cancel.cancel();
            }
            true
        } else {
            false
        }
    }

    /// Abort every in-flight request for a thread. Used when a new user
    /// message supersedes autonomous output mid-stream.
    pub fn abort_thread(&self, thread_id: &str) -> usize {
        let mut inner = self.inner.lock().expect("connection table poisoned");
        let mut aborted = 0;
        for entry in inner.values_mut() {
            if entry.thread_id == thread_id {
                if let Some(active) = entry.active.take() {
                    active.cancel.cancel();
                    aborted += 1;
                }
            }
        }
        aborted
    }

    /// Count one completed delivery on a connection. Unknown ids (the
    /// connection dropped mid-delivery) are ignored.
    pub fn record_delivery(&self, connection_id: &str) {
        let mut inner = self.inner.lock().expect("connection table poisoned");
        if let Some(entry) = inner.get_mut(connection_id) {
            entry.message_count += 1;
        }
    }

    pub fn message_count(&self, connection_id: &str) -> u64 {
        let inner = self.inner.lock().expect("connection table poisoned");
        inner
            .get(connection_id)
            .map(|entry| entry.message_count)
            .unwrap_or(0)
    }

    pub fn connection_count(&self) -> usize {
        self.inner.lock().expect("connection table poisoned").len()
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}
