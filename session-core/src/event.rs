//! The listener event bus (spec.md §6, §9).
//!
//! The teacher has no analogue (its `Session` has no listener system); this
//! is grounded on the general async-trait observer pattern used throughout
//! the example pack (e.g. the `SessionListener`-shaped traits other
//! session-adjacent crates define) and on catching listener panics so a
//! broken third-party listener can't abort the hosting operation (spec.md
//! §7).

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;

use crate::context::SessionKey;
use crate::data::AttributeEntry;

/// Events dispatched to registered listeners. Dispatch itself — wiring
/// these into a specific web framework's listener API — is the caller's
/// concern; this crate only defines the event shapes and fires them.
#[derive(Debug, Clone)]
pub enum ListenerEvent {
    SessionCreated { key: SessionKey },
    SessionDestroyed { key: SessionKey },
    IdChanged { old_id: String, new_key: SessionKey },
    AttributeAdded { key: SessionKey, name: String, value: AttributeEntry },
    AttributeReplaced { key: SessionKey, name: String, old: AttributeEntry, new: AttributeEntry },
    AttributeRemoved { key: SessionKey, name: String, value: AttributeEntry },
}

/// Implemented by listener callbacks. `async_trait` rather than a plain
/// closure so listeners can hold `async` state (e.g. a metrics sink).
#[async_trait]
pub trait SessionListener: Send + Sync {
    async fn on_event(&self, event: &ListenerEvent);
}

/// A registration handle returned by [`ListenerHandle::register`]; currently
/// opaque, reserved for a future `unregister` without breaking callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerToken(usize);

/// Per-manager event bus. Cheaply cloneable; clones share the same
/// underlying listener list.
#[derive(Clone, Default)]
pub struct ListenerHandle {
    listeners: Arc<tokio::sync::RwLock<Vec<Arc<dyn SessionListener>>>>,
}

impl std::fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerHandle").finish_non_exhaustive()
    }
}

impl ListenerHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, listener: Arc<dyn SessionListener>) -> ListenerToken {
        let mut guard = self.listeners.write().await;
        guard.push(listener);
        ListenerToken(guard.len() - 1)
    }

    /// Fan the event out to every registered listener, sequentially and in
    /// registration order (spec.md §6: "the manager dispatches"). A
    /// listener that panics is caught, logged, and does not stop the
    /// remaining listeners from running (spec.md §7).
    pub async fn dispatch(&self, event: ListenerEvent) {
        let listeners = self.listeners.read().await.clone();
        for listener in listeners {
            let event_ref = &event;
            let outcome = AssertUnwindSafe(listener.on_event(event_ref))
                .catch_unwind()
                .await;

            if let Err(panic) = outcome {
                tracing::error!(?panic, "session listener panicked; continuing with next listener");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingListener(Arc<AtomicUsize>);

    #[async_trait]
    impl SessionListener for CountingListener {
        async fn on_event(&self, _event: &ListenerEvent) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct PanickingListener;

    #[async_trait]
    impl SessionListener for PanickingListener {
        async fn on_event(&self, _event: &ListenerEvent) {
            panic!("boom");
        }
    }

    #[tokio::test]
    async fn dispatch_continues_past_a_panicking_listener() {
        let bus = ListenerHandle::new();
        let count = Arc::new(AtomicUsize::new(0));

        bus.register(Arc::new(PanickingListener)).await;
        bus.register(Arc::new(CountingListener(count.clone()))).await;

        let key = SessionKey { id: "s1".into(), context_path: String::new(), vhost: String::new() };
        bus.dispatch(ListenerEvent::SessionCreated { key }).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
