//! Per-provider event fan-out.
//!
//! Listeners register for one provider or for all providers. Delivery is
//! synchronous and best-effort: a listener that panics is logged and
//! skipped, and never affects the emitter or the other listeners.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use sync_types::ProviderId;

/// Events that belong to a single provider.
pub trait ScopedEvent {
    /// Provider the event concerns.
    fn provider_id(&self) -> &ProviderId;
}

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Registration<E> {
    id: ListenerId,
    scope: Option<ProviderId>,
    listener: Listener<E>,
}

/// Callback registry with per-provider scoping.
pub struct EventBus<E> {
    next_id: AtomicU64,
    listeners: RwLock<Vec<Registration<E>>>,
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            listeners: RwLock::new(Vec::new()),
        }
    }
}

impl<E> EventBus<E> {
    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl<E> fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

impl<E: ScopedEvent> EventBus<E> {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive events for `provider` only.
    pub fn subscribe<F>(&self, provider: ProviderId, listener: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.register(Some(provider), Arc::new(listener))
    }

    /// Receive events for every provider.
    pub fn subscribe_all<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.register(None, Arc::new(listener))
    }

    fn register(&self, scope: Option<ProviderId>, listener: Listener<E>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Registration {
                id,
                scope,
                listener,
            });
        id
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|r| r.id != id);
        listeners.len() != before
    }

    /// Deliver `event` to every matching listener.
    pub fn emit(&self, event: &E) {
        // Snapshot so listeners may (un)subscribe without deadlocking.
        let matching: Vec<(ListenerId, Listener<E>)> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| {
                r.scope
                    .as_ref()
                    .map_or(true, |scope| scope == event.provider_id())
            })
            .map(|r| (r.id, Arc::clone(&r.listener)))
            .collect();

        for (id, listener) in matching {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                tracing::warn!(
                    "Event listener {:?} for provider {} panicked",
                    id,
                    event.provider_id()
                );
            }
        }
    }
}
