//! In-process change subscriptions for one SafeBox engine.
//!
//! Scope:
//! - Engine publishes a ChangeEvent for every key whose value actually changed
//!   in a batch (value-equality against the prior decrypted value).
//! - Drop of ChangeSubscription unsubscribes.
//!
//! Notes:
//! - Callbacks are executed synchronously on the mutating thread, after the
//!   in-memory update and outside the update lock, before the disk write lands.
//!   Keep callbacks fast and non-blocking.
//! - Order within a batch: clear-triggered removals in reverse accumulation
//!   order, then the remaining changes in forward order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

/// A single change event: the plaintext key whose value changed or vanished.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeEvent {
    pub key: String,
}

type Callback = Arc<dyn Fn(&ChangeEvent) + Send + Sync + 'static>;

#[derive(Default)]
struct SubInner {
    next_id: u64,
    subs: HashMap<u64, Callback>,
}

/// Subscription registry (held inside the engine).
pub struct ChangeRegistry {
    inner: Mutex<SubInner>,
}

impl ChangeRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(SubInner::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SubInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Returns a handle; dropping it unsubscribes.
    pub fn subscribe<F>(self: &Arc<Self>, f: F) -> ChangeSubscription
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        let mut g = self.lock();
        let id = g.next_id;
        g.next_id = g.next_id.wrapping_add(1);
        g.subs.insert(id, Arc::new(f));
        drop(g);
        ChangeSubscription {
            id,
            reg: Arc::downgrade(self),
        }
    }

    pub fn has_subscribers(&self) -> bool {
        !self.lock().subs.is_empty()
    }

    /// Deliver events in order to every subscriber.
    pub fn publish_all(&self, events: &[ChangeEvent]) {
        if events.is_empty() {
            return;
        }
        let mut ids_cbs: Vec<(u64, Callback)> = {
            let g = self.lock();
            g.subs.iter().map(|(id, cb)| (*id, cb.clone())).collect()
        };
        // Стабильный порядок подписчиков: по времени подписки.
        ids_cbs.sort_by_key(|(id, _)| *id);
        // Execute outside the lock
        for ev in events {
            for (_, cb) in ids_cbs.iter() {
                cb(ev);
            }
        }
    }

    fn unsubscribe(&self, id: u64) {
        self.lock().subs.remove(&id);
    }
}

/// RAII handle: unsubscribes on drop.
pub struct ChangeSubscription {
    id: u64,
    reg: Weak<ChangeRegistry>,
}

impl Drop for ChangeSubscription {
    fn drop(&mut self) {
        if let Some(reg) = self.reg.upgrade() {
            reg.unsubscribe(self.id);
        }
    }
}
