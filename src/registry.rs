//! Listener Registry Module
//!
//! In-process fan-out of decoded inbound messages to independently
//! registered callbacks.

use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

use crate::protocol::InboundMessage;

type Callback = dyn Fn(&InboundMessage) -> anyhow::Result<()> + Send + Sync;

struct Entry {
    id: u64,
    active: AtomicBool,
    callback: Box<Callback>,
}

#[derive(Default)]
struct RegistryInner {
    next_id: AtomicU64,
    entries: Mutex<Vec<Arc<Entry>>>,
}

/// Shared publish/subscribe dispatcher for inbound channel messages
#[derive(Clone, Default)]
pub struct ListenerRegistry {
    inner: Arc<RegistryInner>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback. The returned handle removes exactly this callback.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&InboundMessage) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let entry = Arc::new(Entry {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            active: AtomicBool::new(true),
            callback: Box::new(callback),
        });
        self.inner.entries.lock().push(Arc::clone(&entry));
        debug!(listener = entry.id, "Listener subscribed");

        Subscription {
            registry: Arc::downgrade(&self.inner),
            entry,
        }
    }

    /// Deliver a message to every listener registered when dispatch starts.
    ///
    /// Returns the number of listeners that handled the message without fault.
    pub fn dispatch(&self, message: &InboundMessage) -> usize {
        // Snapshot so callbacks may subscribe/unsubscribe while we iterate.
        let snapshot: Vec<Arc<Entry>> = self.inner.entries.lock().clone();
        let mut delivered = 0;

        for entry in snapshot {
            if !entry.active.load(Ordering::Acquire) {
                continue;
            }

            match catch_unwind(AssertUnwindSafe(|| (entry.callback)(message))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    warn!(listener = entry.id, kind = message.kind(), error = %e, "Listener failed");
                }
                Err(_) => {
                    warn!(listener = entry.id, kind = message.kind(), "Listener panicked");
                }
            }
        }

        delivered
    }

    /// Deactivate and drop every listener.
    pub fn clear(&self) {
        let drained: Vec<Arc<Entry>> = self.inner.entries.lock().drain(..).collect();
        for entry in &drained {
            entry.active.store(false, Ordering::Release);
        }
        if !drained.is_empty() {
            debug!(count = drained.len(), "Listener registry cleared");
        }
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listeners", &self.len())
            .finish()
    }
}

/// Capability to remove one registered listener
pub struct Subscription {
    registry: Weak<RegistryInner>,
    entry: Arc<Entry>,
}

impl Subscription {
    /// Remove the listener. Later calls are no-ops.
    pub fn unsubscribe(&self) {
        if !self.entry.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(inner) = self.registry.upgrade() {
            let id = self.entry.id;
            inner.entries.lock().retain(|e| e.id != id);
            debug!(listener = id, "Listener unsubscribed");
        }
    }

    pub fn is_active(&self) -> bool {
        self.entry.active.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.entry.id)
            .field("active", &self.is_active())
            .finish()
    }
}
