// Event broker - fans capture mutations out to any number of subscribers
//
// Every subscriber owns a small bounded queue. publish() does a try_send
// per subscriber: a full queue drops the message for that subscriber only,
// so a stalled SSE reader can never block the proxy path. Dropping the
// sender on unsubscribe closes the queue and the reader sees end-of-stream.

use crate::capture::Capture;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Per-subscriber queue depth. Deep enough to ride out JSON-encode hiccups,
/// shallow enough that an abandoned reader wastes little memory.
const SUBSCRIBER_QUEUE_DEPTH: usize = 16;

/// Fan-out hub for capture events
pub struct EventBroker {
    subscribers: Mutex<HashMap<u64, mpsc::Sender<Capture>>>,
    next_id: std::sync::atomic::AtomicU64,
}

/// Handle returned by subscribe(); dropping it (or calling unsubscribe)
/// detaches the queue.
pub struct Subscription {
    pub id: u64,
    pub rx: mpsc::Receiver<Capture>,
}

impl EventBroker {
    pub fn new() -> Self {
        EventBroker {
            subscribers: Mutex::new(HashMap::new()),
            next_id: std::sync::atomic::AtomicU64::new(1),
        }
    }

    /// Register a new subscriber and hand back its queue.
    pub fn subscribe(&self) -> Subscription {
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_DEPTH);
        self.subscribers
            .lock()
            .expect("broker lock poisoned")
            .insert(id, tx);
        tracing::debug!("SSE subscriber {} attached", id);
        Subscription { id, rx }
    }

    /// Detach a subscriber. Dropping its sender closes the queue so the
    /// reader task completes.
    pub fn unsubscribe(&self, id: u64) {
        if self
            .subscribers
            .lock()
            .expect("broker lock poisoned")
            .remove(&id)
            .is_some()
        {
            tracing::debug!("SSE subscriber {} detached", id);
        }
    }

    /// Deliver to every subscriber without blocking. Single-producer
    /// ordering is preserved per subscriber except where a full queue
    /// forces a drop.
    pub fn publish(&self, capture: &Capture) {
        let subscribers = self.subscribers.lock().expect("broker lock poisoned");
        for (id, tx) in subscribers.iter() {
            match tx.try_send(capture.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::debug!("subscriber {} queue full, dropping event", id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    // Reader went away; unsubscribe will reap it
                }
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().expect("broker lock poisoned").len()
    }
}

impl Default for EventBroker {
    fn default() -> Self {
        Self::new()
    }
}
