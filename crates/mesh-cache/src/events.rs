//! Instance change events.
//!
//! The instance cache returns the events of a refresh as a list; the
//! [`EventHub`] fans them out to subscribers once the refresh has
//! committed. Per-service revision hooks go through
//! [`ServiceChangeListener`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use mesh_core::model::Instance;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// What happened to an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstanceEventKind {
    /// First seen.
    Created,
    /// Changed in place.
    Updated,
    /// Soft-deleted or moved to another service.
    Deleted,
}

/// One instance change.
#[derive(Debug, Clone)]
pub struct InstanceEvent {
    /// Kind of change.
    pub kind: InstanceEventKind,
    /// Instance as of the change; for deletions, the last cached state.
    pub instance: Arc<Instance>,
}

impl InstanceEvent {
    pub(crate) fn new(kind: InstanceEventKind, instance: Arc<Instance>) -> Self {
        Self { kind, instance }
    }
}

/// Notified once per affected service after each instance refresh.
pub trait ServiceChangeListener: Send + Sync {
    /// Instances of `service_id` changed; its revision must be recomputed.
    fn service_changed(&self, service_id: &str);
}

/// Unique identifier for an event subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Receiving end of a subscription.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    receiver: mpsc::Receiver<Arc<InstanceEvent>>,
}

impl Subscription {
    /// Subscription id, for [`EventHub::unsubscribe`].
    #[inline]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Next event, or `None` once unsubscribed.
    pub async fn recv(&mut self) -> Option<Arc<InstanceEvent>> {
        self.receiver.recv().await
    }

    /// Next event without waiting.
    pub fn try_recv(&mut self) -> Result<Arc<InstanceEvent>, mpsc::error::TryRecvError> {
        self.receiver.try_recv()
    }
}

#[derive(Debug, Clone)]
struct Subscriber {
    id: SubscriptionId,
    sender: mpsc::Sender<Arc<InstanceEvent>>,
}

/// Fan-out of instance events to bounded subscriber channels.
///
/// Publishing never blocks: a full channel drops the event for that
/// subscriber, and closed subscribers are pruned on the next publish.
#[derive(Debug)]
pub struct EventHub {
    subscribers: Mutex<Vec<Subscriber>>,
    buffer: usize,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventHub {
    /// Create a hub whose subscriptions buffer `buffer` events each.
    pub fn new(buffer: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            buffer: buffer.max(1),
        }
    }

    /// Open a subscription.
    pub fn subscribe(&self) -> Subscription {
        let id = SubscriptionId::next();
        let (sender, receiver) = mpsc::channel(self.buffer);
        self.subscribers.lock().push(Subscriber { id, sender });
        debug!(subscription = %id, "subscribed to instance events");
        Subscription { id, receiver }
    }

    /// Close a subscription.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.lock().retain(|s| s.id != id);
    }

    /// Number of open subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Deliver `events` to every subscriber.
    pub fn publish(&self, events: Vec<InstanceEvent>) {
        if events.is_empty() {
            return;
        }
        let subscribers: Vec<Subscriber> = self.subscribers.lock().clone();
        if subscribers.is_empty() {
            return;
        }

        let mut closed = Vec::new();
        for event in events.into_iter().map(Arc::new) {
            for sub in &subscribers {
                if closed.contains(&sub.id) {
                    continue;
                }
                match sub.sender.try_send(Arc::clone(&event)) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        trace!(subscription = %sub.id, "subscriber full, dropping event");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => closed.push(sub.id),
                }
            }
        }

        if !closed.is_empty() {
            self.subscribers.lock().retain(|s| !closed.contains(&s.id));
            debug!(count = closed.len(), "removed closed subscriptions");
        }
    }
}
