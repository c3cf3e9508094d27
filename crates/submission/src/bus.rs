//! Fan-out of job events from engine threads to subscribers.
//!
//! Publishing only pushes onto an unbounded queue, so it never blocks the
//! engine callback thread. One dispatcher task drains the queue and hands
//! every event to every subscriber in publish order.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::mpsc;
use tracing::{debug, error, warn};
use uplink_protocol::JobEvent;

/// Receives every event published on a [`ProgressBus`].
pub trait ProgressSubscriber: Send + Sync {
    fn on_event(&self, event: &JobEvent);
}

impl<F> ProgressSubscriber for F
where
    F: Fn(&JobEvent) + Send + Sync,
{
    fn on_event(&self, event: &JobEvent) {
        self(event)
    }
}

/// Handle for [`ProgressBus::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

enum Subscriber {
    Callback(Arc<dyn ProgressSubscriber>),
    Channel(mpsc::UnboundedSender<JobEvent>),
}

type Registry = Arc<RwLock<Vec<(SubscriptionId, Subscriber)>>>;

/// Thread-safe job event bus. Clones share the same queue and subscribers.
#[derive(Clone)]
pub struct ProgressBus {
    tx: mpsc::UnboundedSender<JobEvent>,
    subscribers: Registry,
    next_id: Arc<AtomicU64>,
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressBus {
    /// Creates the bus and spawns its dispatcher.
    ///
    /// Must be called from within a Tokio runtime. The dispatcher exits when
    /// the last clone of the bus is dropped.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscribers: Registry = Arc::default();
        tokio::spawn(dispatch_loop(rx, Arc::clone(&subscribers)));
        Self {
            tx,
            subscribers,
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    fn register(&self, subscriber: Subscriber) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, subscriber));
        id
    }

    /// Registers a callback. It runs on the dispatcher task, so it should
    /// return quickly.
    pub fn subscribe(&self, subscriber: impl ProgressSubscriber + 'static) -> SubscriptionId {
        self.register(Subscriber::Callback(Arc::new(subscriber)))
    }

    /// Registers a channel that receives a copy of every event.
    pub fn subscribe_channel(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<JobEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (self.register(Subscriber::Channel(tx)), rx)
    }

    /// Returns `false` if `id` was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = subs.len();
        subs.retain(|(sid, _)| *sid != id);
        subs.len() != before
    }

    /// Queues `event` for delivery. Callable from any thread.
    pub fn publish(&self, event: JobEvent) {
        if self.tx.send(event).is_err() {
            warn!("progress bus dispatcher is gone, event dropped");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

async fn dispatch_loop(mut rx: mpsc::UnboundedReceiver<JobEvent>, subscribers: Registry) {
    while let Some(event) = rx.recv().await {
        deliver(&subscribers, &event);
    }
    debug!("progress bus dispatcher stopped");
}

fn deliver(subscribers: &Registry, event: &JobEvent) {
    let mut closed = Vec::new();
    {
        let subs = subscribers.read().unwrap_or_else(PoisonError::into_inner);
        for (id, sub) in subs.iter() {
            match sub {
                Subscriber::Callback(cb) => {
                    let cb = Arc::clone(cb);
                    if catch_unwind(AssertUnwindSafe(|| cb.on_event(event))).is_err() {
                        error!(
                            subscription = id.0,
                            job = %event.job_id,
                            "progress subscriber panicked"
                        );
                    }
                }
                Subscriber::Channel(tx) => {
                    if tx.send(event.clone()).is_err() {
                        closed.push(*id);
                    }
                }
            }
        }
    }
    if !closed.is_empty() {
        subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(id, _)| !closed.contains(id));
        debug!(count = closed.len(), "pruned closed subscriber channels");
    }
}
