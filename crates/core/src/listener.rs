//! Copy-on-iterate listener lists with idempotent unsubscription.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Handle returned by every subscribe-style call.
///
/// `unsubscribe` may be called any number of times, from any thread, and
/// from inside the very callback it removes. Dropping the handle does NOT
/// unsubscribe.
pub struct Subscription {
    cancel: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Mutex::new(Some(Box::new(cancel))),
        }
    }

    /// A handle with nothing to undo.
    pub fn noop() -> Self {
        Self {
            cancel: Mutex::new(None),
        }
    }

    pub fn unsubscribe(&self) {
        let cancel = self.cancel.lock().take();
        if let Some(cancel) = cancel {
            cancel();
        }
    }

    pub fn is_active(&self) -> bool {
        self.cancel.lock().is_some()
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

pub type Listener<A> = Arc<dyn Fn(&A) + Send + Sync>;

struct Entry<A> {
    id: u64,
    active: AtomicBool,
    callback: Listener<A>,
}

struct Inner<A> {
    entries: Mutex<Vec<Arc<Entry<A>>>>,
    next_id: AtomicU64,
}

/// Ordered list of callbacks. Emission works on a snapshot, so callbacks may
/// add or remove listeners while being invoked.
pub struct ListenerSet<A> {
    inner: Arc<Inner<A>>,
}

impl<A> Clone for ListenerSet<A> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<A: 'static> Default for ListenerSet<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: 'static> ListenerSet<A> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn add(&self, callback: impl Fn(&A) + Send + Sync + 'static) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(Entry {
            id,
            active: AtomicBool::new(true),
            callback: Arc::new(callback),
        });
        self.inner.entries.lock().push(entry.clone());

        let weak: Weak<Inner<A>> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            entry.active.store(false, Ordering::SeqCst);
            if let Some(inner) = weak.upgrade() {
                inner.entries.lock().retain(|e| e.id != id);
            }
        })
    }

    pub fn emit(&self, arg: &A) {
        let snapshot: Vec<Arc<Entry<A>>> = self.inner.entries.lock().clone();
        for entry in snapshot {
            if entry.active.load(Ordering::SeqCst) {
                (entry.callback)(arg);
            }
        }
    }

    pub fn clear(&self) {
        let removed: Vec<Arc<Entry<A>>> = std::mem::take(&mut *self.inner.entries.lock());
        for entry in removed {
            entry.active.store(false, Ordering::SeqCst);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
