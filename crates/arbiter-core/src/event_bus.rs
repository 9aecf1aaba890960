use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use arbiter_types::{RunEvent, Topic};

type Handler = Arc<dyn Fn(&RunEvent) + Send + Sync>;

/// Synchronous typed publish/subscribe dispatcher over the closed topic set.
/// Delivery is in-process and in emit order; subscribers of one topic are
/// invoked in subscription order. Handlers may re-enter `emit`: the subscriber
/// list is snapshotted before delivery, so nested emissions never deadlock.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
}

#[derive(Default)]
struct BusInner {
    next_id: u64,
    subscribers: HashMap<Topic, Vec<(u64, Handler)>>,
}

fn lock(inner: &Mutex<BusInner>) -> MutexGuard<'_, BusInner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an infallible handler. The returned subscription detaches the
    /// handler when `unsubscribe` is called; dropping it keeps the handler
    /// alive for the bus's lifetime.
    pub fn subscribe<F>(&self, topic: Topic, handler: F) -> Subscription
    where
        F: Fn(&RunEvent) + Send + Sync + 'static,
    {
        let mut inner = lock(&self.inner);
        let id = inner.next_id;
        inner.next_id += 1;
        inner
            .subscribers
            .entry(topic)
            .or_default()
            .push((id, Arc::new(handler)));
        Subscription {
            bus: Arc::downgrade(&self.inner),
            topic,
            id,
        }
    }

    /// Register a fallible handler. A handler error is routed to `on_error`
    /// and never reaches the publisher.
    pub fn subscribe_safe<F, E>(&self, topic: Topic, handler: F, on_error: E) -> Subscription
    where
        F: Fn(&RunEvent) -> anyhow::Result<()> + Send + Sync + 'static,
        E: Fn(anyhow::Error) + Send + Sync + 'static,
    {
        self.subscribe(topic, move |event| {
            if let Err(err) = handler(event) {
                on_error(err);
            }
        })
    }

    /// Deliver an event to every subscriber of its topic, in subscription
    /// order, before returning.
    pub fn emit(&self, event: RunEvent) {
        let handlers: Vec<Handler> = {
            let inner = lock(&self.inner);
            inner
                .subscribers
                .get(&event.topic())
                .map(|subs| subs.iter().map(|(_, h)| h.clone()).collect())
                .unwrap_or_default()
        };
        for handler in handlers {
            handler(&event);
        }
    }

    /// No-op in the synchronous model: emit returns only after delivery.
    pub fn flush(&self) {}
}

/// Handle for one subscription. `unsubscribe` is idempotent.
pub struct Subscription {
    bus: Weak<Mutex<BusInner>>,
    topic: Topic,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(&self) {
        if let Some(inner) = self.bus.upgrade() {
            let mut inner = lock(&inner);
            if let Some(subs) = inner.subscribers.get_mut(&self.topic) {
                subs.retain(|(id, _)| *id != self.id);
            }
        }
    }
}
