//! In-process per-session event dispatcher.
//!
//! All mutable dispatch state lives behind one coordinating type: a FIFO
//! lane per session plus a time-ordered retry heap for delayed re-enqueues.
//! A fixed-interval loop pops at most one event per idle lane per tick, so
//! intra-session processing is strictly sequential while cross-session
//! concurrency is unbounded. Durability lives in the event log; this layer
//! is a disposable router that can be rebuilt after a restart.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use crate::events::Event;
use crate::session::SessionKey;

/// Consumer of dispatched events (the session processor in production).
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event, attempt: u32) -> anyhow::Result<()>;
}

/// Deferred completion handle returned by `enqueue`. Resolves once the
/// event either processed successfully or failed terminally (after
/// exhausting retries, or immediately for timer events).
pub struct EnqueueHandle {
    rx: oneshot::Receiver<anyhow::Result<()>>,
}

impl EnqueueHandle {
    pub async fn wait(self) -> anyhow::Result<()> {
        self.rx
            .await
            .map_err(|_| anyhow::anyhow!("event queue dropped before completion"))?
    }
}

struct QueuedEvent {
    event: Event,
    /// 1-based invocation counter.
    attempt: u32,
    done: oneshot::Sender<anyhow::Result<()>>,
}

struct Lane {
    queue: VecDeque<QueuedEvent>,
    processing: bool,
}

impl Lane {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            processing: false,
        }
    }
}

struct DelayedRetry {
    due_at: Instant,
    item: QueuedEvent,
}

impl PartialEq for DelayedRetry {
    fn eq(&self, other: &Self) -> bool {
        self.due_at == other.due_at
    }
}
impl Eq for DelayedRetry {}
impl PartialOrd for DelayedRetry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for DelayedRetry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.due_at.cmp(&other.due_at)
    }
}

struct QueueState {
    lanes: HashMap<SessionKey, Lane>,
    // Min-heap by due time via Reverse.
    delayed: BinaryHeap<Reverse<DelayedRetry>>,
}

/// Retry tuning for non-timer events.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

pub struct EventQueue {
    state: Mutex<QueueState>,
    poll_interval: Duration,
    retry: RetryPolicy,
}

impl EventQueue {
    pub fn new(poll_interval: Duration, retry: RetryPolicy) -> Self {
        Self {
            state: Mutex::new(QueueState {
                lanes: HashMap::new(),
                delayed: BinaryHeap::new(),
            }),
            poll_interval,
            retry,
        }
    }

    /// Append an event to its session's lane. The returned handle resolves
    /// on terminal success or failure; dropping it is fire-and-forget.
    pub fn enqueue(&self, event: Event) -> EnqueueHandle {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock().expect("queue state poisoned");
        state
            .lanes
            .entry(event.session_key.clone())
            .or_insert_with(Lane::new)
            .queue
            .push_back(QueuedEvent {
                event,
                attempt: 1,
                done: tx,
            });
        EnqueueHandle { rx }
    }

    /// Spawn the dispatch loop.
    pub fn spawn(self: Arc<Self>, handler: Arc<dyn EventHandler>) {
        let queue = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(queue.poll_interval).await;
                queue.clone().dispatch_tick(&handler);
            }
        });
        info!("Event queue dispatch loop spawned");
    }

    /// One dispatch pass: move due retries back onto their lanes (appended,
    /// not prioritized), then pop exactly one event from every idle
    /// non-empty lane.
    pub(crate) fn dispatch_tick(self: Arc<Self>, handler: &Arc<dyn EventHandler>) {
        let mut to_run = Vec::new();
        {
            let mut state = self.state.lock().expect("queue state poisoned");
            let now = Instant::now();

            while state
                .delayed
                .peek()
                .is_some_and(|Reverse(d)| d.due_at <= now)
            {
                let Reverse(retry) = state.delayed.pop().expect("peeked");
                let key = retry.item.event.session_key.clone();
                state
                    .lanes
                    .entry(key)
                    .or_insert_with(Lane::new)
                    .queue
                    .push_back(retry.item);
            }

            for lane in state.lanes.values_mut() {
                if !lane.processing {
                    if let Some(item) = lane.queue.pop_front() {
                        lane.processing = true;
                        to_run.push(item);
                    }
                }
            }

            // Keep the lane map bounded over long runtimes.
            state
                .lanes
                .retain(|_, lane| lane.processing || !lane.queue.is_empty());
        }

        for item in to_run {
            self.clone().run_one(handler.clone(), item);
        }
    }

    fn run_one(self: Arc<Self>, handler: Arc<dyn EventHandler>, item: QueuedEvent) {
        tokio::spawn(async move {
            let QueuedEvent {
                event,
                attempt,
                done,
            } = item;
            let result = handler.handle(&event, attempt).await;

            let mut state = self.state.lock().expect("queue state poisoned");
            if let Some(lane) = state.lanes.get_mut(&event.session_key) {
                lane.processing = false;
            }

            match result {
                Ok(()) => {
                    drop(state);
                    let _ = done.send(Ok(()));
                }
                Err(e) if !event.event_type.retryable() => {
                    drop(state);
                    warn!(
                        session_key = %event.session_key,
                        seq = event.seq,
                        "Timer event failed, not retried: {}", e
                    );
                    let _ = done.send(Err(e.context("timer event failed (never retried)")));
                }
                Err(e) if attempt >= self.retry.max_attempts => {
                    drop(state);
                    error!(
                        session_key = %event.session_key,
                        seq = event.seq,
                        attempts = attempt,
                        "Event failed terminally: {}", e
                    );
                    let _ = done.send(Err(e.context(format!(
                        "event processing failed after {} attempts",
                        attempt
                    ))));
                }
                Err(e) => {
                    // Exponential backoff: base * 2^(attempt-1).
                    let delay = self.retry.base_delay * 2u32.pow(attempt - 1);
                    warn!(
                        session_key = %event.session_key,
                        seq = event.seq,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Event failed, scheduling retry: {}", e
                    );
                    state.delayed.push(Reverse(DelayedRetry {
                        due_at: Instant::now() + delay,
                        item: QueuedEvent {
                            event,
                            attempt: attempt + 1,
                            done,
                        },
                    }));
                }
            }
        });
    }

    #[cfg(test)]
    pub(crate) fn depth(&self, session_key: &SessionKey) -> usize {
        let state = self.state.lock().expect("queue state poisoned");
        state
            .lanes
            .get(session_key)
            .map(|lane| lane.queue.len())
            .unwrap_or(0)
    }
}
