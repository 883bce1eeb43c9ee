//! The completed/failed/stalled event stream (spec.md §4.C), adapted from
//! the teacher's broadcast-backed event hub.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;

/// One of the three signals the Queue Service emits per job transition.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    /// A job ran to completion. Informational only — no policy action.
    Completed { session_id: String, job_id: String },
    /// A job attempt failed. `exhausted` is set once `attempts_made` has
    /// reached `max_attempts`; that is the single rule that escalates a
    /// transient failure into the poison-pill path (spec.md §4.C).
    Failed {
        session_id: String,
        job_id: String,
        reason: String,
        attempts_made: u32,
        max_attempts: u32,
        exhausted: bool,
    },
    /// A job's worker task disappeared without acking it. Logged; no
    /// policy action (spec.md §4.C).
    Stalled { session_id: String, job_id: String },
}

/// Snapshot of hub health for monitoring and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueEventHubMetrics {
    pub capacity: usize,
    pub dropped: usize,
}

/// Broadcasts [`QueueEvent`]s to every subscriber (the Worker Manager is
/// the only consumer in this core, but the hub doesn't assume that).
#[derive(Debug)]
pub struct QueueEventHub {
    sender: RwLock<Option<broadcast::Sender<QueueEvent>>>,
    dropped: AtomicUsize,
    capacity: usize,
}

impl QueueEventHub {
    pub fn new(capacity: usize) -> Arc<Self> {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Arc::new(Self {
            sender: RwLock::new(Some(sender)),
            dropped: AtomicUsize::new(0),
            capacity,
        })
    }

    /// Publish an event. A closed hub silently drops it — nothing in this
    /// core treats a missed in-process event as fatal; the durable record
    /// of a job's outcome lives in the KV store, not the broadcast.
    pub fn publish(&self, event: QueueEvent) {
        if let Some(sender) = self.sender.read().clone() {
            let _ = sender.send(event);
        }
    }

    pub fn subscribe(self: &Arc<Self>) -> QueueEventStream {
        let receiver = self
            .sender
            .read()
            .clone()
            .map(|sender| sender.subscribe())
            .unwrap_or_else(|| {
                let (sender, receiver) = broadcast::channel(self.capacity);
                drop(sender);
                receiver
            });
        QueueEventStream {
            receiver,
            hub: Arc::clone(self),
        }
    }

    pub fn metrics(&self) -> QueueEventHubMetrics {
        QueueEventHubMetrics {
            capacity: self.capacity,
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    fn record_lag(&self, missed: u64) {
        let increment = usize::try_from(missed).unwrap_or(usize::MAX);
        let total = self.dropped.fetch_add(increment, Ordering::Relaxed) + increment;
        tracing::warn!(
            target: "session_core::queue",
            missed,
            total_dropped = total,
            "queue event stream lagged; dropped events"
        );
    }
}

pub struct QueueEventStream {
    receiver: broadcast::Receiver<QueueEvent>,
    hub: Arc<QueueEventHub>,
}

impl QueueEventStream {
    pub async fn recv(&mut self) -> Option<QueueEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    self.hub.record_lag(missed);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
