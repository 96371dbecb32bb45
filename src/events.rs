//! Typed event buses with explicit subscription handles.
//!
//! Handlers run synchronously on the emitting thread, in subscription order.
//! The handler list is snapshotted before delivery, so a handler may
//! unsubscribe itself. Handlers must not call back into the component that is
//! emitting (the StatEngine emits while holding its writer lock); anything
//! heavier than a queue push belongs on another task.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::codec::log::LogRecord;
use crate::core::StatEvent;
use crate::driver::DriverEvent;

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Handle returned by [`EventBus::subscribe`]; pass it to `unsubscribe` on teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub struct EventBus<E> {
    next_id: AtomicU64,
    handlers: Mutex<Vec<(SubscriptionId, Handler<E>)>>,
}

impl<E> EventBus<E> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            handlers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self, handler: impl Fn(&E) + Send + Sync + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(handler)));
        id
    }

    /// Returns false if `id` was not (or no longer) subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
        let before = handlers.len();
        handlers.retain(|(sid, _)| *sid != id);
        handlers.len() != before
    }

    pub fn emit(&self, event: &E) {
        let snapshot: Vec<Handler<E>> = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect();
        for handler in snapshot {
            handler(event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// The observable event buses of one process. On the master the local
/// components emit on them; on a client the broadcast dispatcher does.
#[derive(Clone, Default)]
pub struct Events {
    pub stats: Arc<EventBus<StatEvent>>,
    pub logs: Arc<EventBus<LogRecord>>,
    pub driver: Arc<EventBus<DriverEvent>>,
}
