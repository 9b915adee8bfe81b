//! Push-channel fan-out
//!
//! Every subscriber gets its own bounded queue. Broadcasting never waits on a
//! subscriber: a full queue loses that one message, a closed queue loses the
//! subscriber.

use agenticqa_common::{BridgeEvent, SubprocessState};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, trace};
use uuid::Uuid;

/// Serialized event, shared by all subscriber queues
pub type EventFrame = Arc<str>;

/// Fan-out of [`BridgeEvent`]s to connected subscribers
#[derive(Clone)]
pub struct Notifier {
    inner: Arc<NotifierInner>,
}

struct NotifierInner {
    subscribers: RwLock<HashMap<Uuid, mpsc::Sender<EventFrame>>>,
    state: watch::Receiver<SubprocessState>,
    queue_depth: usize,
}

/// A registered subscriber
pub struct Subscription {
    pub id: Uuid,
    pub rx: mpsc::Receiver<EventFrame>,
}

impl Notifier {
    pub fn new(state: watch::Receiver<SubprocessState>, queue_depth: usize) -> Self {
        Self {
            inner: Arc::new(NotifierInner {
                subscribers: RwLock::new(HashMap::new()),
                state,
                queue_depth: queue_depth.max(1),
            }),
        }
    }

    /// Register a subscriber; its queue starts with the current bridge status.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.inner.queue_depth);
        let id = Uuid::new_v4();

        if let Some(frame) = encode(&self.current_status()) {
            // Fresh queue with capacity >= 1, cannot be full.
            let _ = tx.try_send(frame);
        }

        self.inner.subscribers.write().insert(id, tx);
        debug!(subscriber = %id, "subscriber registered");
        Subscription { id, rx }
    }

    pub fn unsubscribe(&self, id: &Uuid) {
        if self.inner.subscribers.write().remove(id).is_some() {
            debug!(subscriber = %id, "subscriber removed");
        }
    }

    /// Deliver an event to every subscriber without waiting on any of them.
    pub fn broadcast(&self, event: &BridgeEvent) {
        let Some(frame) = encode(event) else {
            return;
        };

        let mut closed = Vec::new();
        {
            let subscribers = self.inner.subscribers.read();
            for (id, tx) in subscribers.iter() {
                match tx.try_send(frame.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        debug!(subscriber = %id, "queue full, dropping event");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*id),
                }
            }
            trace!("broadcast to {} subscribers: {}", subscribers.len(), frame);
        }

        if !closed.is_empty() {
            let mut subscribers = self.inner.subscribers.write();
            for id in closed {
                subscribers.remove(&id);
                debug!(subscriber = %id, "subscriber gone");
            }
        }
    }

    /// Current subprocess state, read straight from the supervisor.
    pub fn current_state(&self) -> SubprocessState {
        *self.inner.state.borrow()
    }

    /// `bridge_status` event for the current state.
    pub fn current_status(&self) -> BridgeEvent {
        BridgeEvent::status(self.current_state())
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }
}

fn encode(event: &BridgeEvent) -> Option<EventFrame> {
    match serde_json::to_string(event) {
        Ok(json) => Some(Arc::from(json)),
        Err(e) => {
            error!("Failed to serialize event: {}", e);
            None
        }
    }
}
