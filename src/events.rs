//! Event/notification fabric.
//!
//! Three independent channels carry state changes, errors and poll events from the
//! controller to any number of consumers (display, logger, tests). Each channel offers
//! two ways to listen:
//!
//! - [`EventChannel::subscribe`]: a callback invoked synchronously on the publishing
//!   task. A slow callback delays the next poll tick; there is no backpressure.
//! - [`EventChannel::stream`]: a `tokio::sync::broadcast` receiver for async consumers.
//!   Lagging receivers lose old events rather than stalling the publisher.
//!
//! Subscriptions are explicit: the returned [`SubscriptionId`] is handed back to
//! [`EventChannel::unsubscribe`]; subscriber lifetime is independent of the controller.

use crate::core::{ConnectionState, ErrorEvent, PollEvent};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::{error, trace};

/// Default capacity of each broadcast stream.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Handle identifying one callback subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subscriber_{}", self.0)
    }
}

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Fan-out channel for one event kind.
pub struct EventChannel<T> {
    name: &'static str,
    subscribers: Mutex<Vec<(SubscriptionId, Handler<T>)>>,
    subscriber_counter: AtomicU64,
    stream: broadcast::Sender<T>,
}

impl<T: Clone + Send + 'static> EventChannel<T> {
    /// Channel named `name` for logs, buffering `capacity` events per stream.
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let (stream, _) = broadcast::channel(capacity.max(1));
        Self {
            name,
            subscribers: Mutex::new(Vec::new()),
            subscriber_counter: AtomicU64::new(0),
            stream,
        }
    }

    /// Register a callback; it receives every event published after this call.
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.subscriber_counter.fetch_add(1, Ordering::SeqCst));
        self.lock().push((id, Arc::new(handler)));
        trace!(channel = self.name, %id, "subscriber registered");
        id
    }

    /// Remove a callback. Returns false if the id was unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.lock();
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        let removed = subscribers.len() != before;
        if removed {
            trace!(channel = self.name, %id, "subscriber unregistered");
        }
        removed
    }

    /// Async receiver of every event published after this call.
    pub fn stream(&self) -> broadcast::Receiver<T> {
        self.stream.subscribe()
    }

    /// Number of callback subscribers plus live stream receivers.
    pub fn subscriber_count(&self) -> usize {
        self.lock().len() + self.stream.receiver_count()
    }

    /// Deliver `event` to every current subscriber, then to the stream.
    ///
    /// Callbacks run outside the registry lock so they may subscribe or unsubscribe.
    /// A panicking callback is logged and skipped. Returns the number of callbacks run.
    pub fn publish(&self, event: T) -> usize {
        let handlers: Vec<(SubscriptionId, Handler<T>)> = self.lock().clone();
        for (id, handler) in &handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                error!(channel = self.name, %id, "subscriber panicked while handling event");
            }
        }
        // No receivers is not an error.
        let _ = self.stream.send(event);
        handlers.len()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(SubscriptionId, Handler<T>)>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<T> fmt::Debug for EventChannel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventChannel")
            .field("name", &self.name)
            .field("receivers", &self.stream.receiver_count())
            .finish()
    }
}

/// The three channels published by the acquisition controller.
#[derive(Debug)]
pub struct EventBus {
    /// New connection state after every transition that changed it.
    pub state_changed: EventChannel<ConnectionState>,
    /// Every fault, timestamped.
    pub error_occurred: EventChannel<ErrorEvent>,
    /// One event per successful poll tick.
    pub sample_read: EventChannel<Arc<PollEvent>>,
}

impl EventBus {
    /// All three channels with the given stream capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            state_changed: EventChannel::new("state_changed", capacity),
            error_occurred: EventChannel::new("error_occurred", capacity),
            sample_read: EventChannel::new("sample_read", capacity),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}
