//! In-process event bus with typed events and asynchronous delivery.
//!
//! [`EventBus::publish`] is fire-and-forget: the event is enqueued on every
//! matching subscription's bounded queue and the call returns. Each
//! subscription owns a drain task, which gives per-subscriber FIFO ordering
//! for events published from a single source. A slow subscriber never
//! blocks publishers: when its queue is full the event is dropped and a
//! `bus.drop` event is emitted with the running drop count.

mod event;

pub use event::{types, Event};

use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use futures_util::FutureExt;
use tokio::sync::mpsc;

/// Default per-subscriber queue bound.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

type Handler =
    Arc<dyn Fn(Event) -> Pin<Box<dyn std::future::Future<Output = ()> + Send>> + Send + Sync>;

/// Identifies a subscription for [`EventBus::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Subscription pattern: an exact dotted type, or a `prefix.*` glob.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Pattern {
    Exact(String),
    Prefix(String),
}

impl Pattern {
    fn parse(pattern: &str) -> Self {
        match pattern.strip_suffix(".*") {
            Some(prefix) => Pattern::Prefix(format!("{prefix}.")),
            None if pattern == "*" => Pattern::Prefix(String::new()),
            None => Pattern::Exact(pattern.to_string()),
        }
    }

    fn matches(&self, event_type: &str) -> bool {
        match self {
            Pattern::Exact(t) => t == event_type,
            Pattern::Prefix(p) => event_type.starts_with(p.as_str()),
        }
    }
}

struct Subscription {
    id: u64,
    pattern: Pattern,
    tx: mpsc::Sender<Event>,
}

struct BusInner {
    subscriptions: RwLock<Vec<Subscription>>,
    next_id: AtomicU64,
    dropped: AtomicU64,
    capacity: usize,
}

/// Clonable handle to the in-process event bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    /// Create a bus whose per-subscriber queues hold `capacity` events.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscriptions: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(1),
                dropped: AtomicU64::new(0),
                capacity: capacity.max(1),
            }),
        }
    }

    /// Publish an event to every matching subscriber. Never blocks; full
    /// queues drop the event and surface a `bus.drop` event instead.
    pub fn publish(&self, event: Event) {
        let mut report_drop: Option<u64> = None;
        {
            let subs = self
                .inner
                .subscriptions
                .read()
                .expect("event bus lock poisoned");
            for sub in subs.iter() {
                if !sub.pattern.matches(&event.event_type) {
                    continue;
                }
                if sub.tx.try_send(event.clone()).is_err() {
                    let total = self.inner.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    tracing::warn!(
                        event_type = %event.event_type,
                        dropped_total = total,
                        "subscriber queue full, dropping event"
                    );
                    // Drops of bus-internal events are counted but not
                    // re-published, which bounds the recursion.
                    if !event.event_type.starts_with("bus.") {
                        report_drop = Some(total);
                    }
                }
            }
        }
        if let Some(total) = report_drop {
            self.publish(
                Event::new(types::BUS_DROP, "system").with_payload(serde_json::json!({
                    "event_type": event.event_type,
                    "dropped_total": total,
                })),
            );
        }
    }

    /// Register `handler` for events matching `pattern` (exact type or
    /// `prefix.*`). The handler runs on the subscription's own drain task;
    /// panics are caught and converted to `bus.handler.error` events.
    pub fn subscribe<F, Fut>(&self, pattern: &str, handler: F) -> SubscriptionId
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |event| Box::pin(handler(event)));
        let (tx, mut rx) = mpsc::channel::<Event>(self.inner.capacity);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let pattern = Pattern::parse(pattern);

        {
            let mut subs = self
                .inner
                .subscriptions
                .write()
                .expect("event bus lock poisoned");
            subs.push(Subscription { id, pattern, tx });
        }

        // Weak handle so drain tasks never keep a closed bus alive.
        let weak: Weak<BusInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let event_type = event.event_type.clone();
                let outcome = AssertUnwindSafe(handler(event)).catch_unwind().await;
                if outcome.is_err() {
                    tracing::error!(event_type = %event_type, "event handler panicked");
                    if let Some(inner) = weak.upgrade() {
                        let bus = EventBus { inner };
                        bus.publish(
                            Event::new(types::BUS_HANDLER_ERROR, "system").with_payload(
                                serde_json::json!({ "event_type": event_type }),
                            ),
                        );
                    }
                }
            }
        });

        SubscriptionId(id)
    }

    /// Remove a subscription; its drain task finishes the queued events and
    /// exits.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut subs = self
            .inner
            .subscriptions
            .write()
            .expect("event bus lock poisoned");
        subs.retain(|s| s.id != id.0);
    }

    /// Total events dropped to full queues since startup.
    pub fn dropped_count(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Drop every subscription. Queued events still drain before the tasks
    /// exit.
    pub fn close(&self) {
        let mut subs = self
            .inner
            .subscriptions
            .write()
            .expect("event bus lock poisoned");
        subs.clear();
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
