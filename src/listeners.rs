//! Listener registries shared by the event router and the terminal mux.
//!
//! A [`ListenerSet`] hands out a [`Subscription`] per registration. The
//! subscription is the only way to remove the listener: dropping it leaves
//! the listener in place, and the set never expires entries on its own.
//!
//! Dispatchers take a [`ListenerSet::snapshot`] under the lock and invoke the
//! listeners after releasing it, so a listener may subscribe or unsubscribe
//! without deadlocking. An unsubscribe therefore takes effect from the next
//! dispatch cycle.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

struct Slots<T: ?Sized> {
    next_id: u64,
    entries: Vec<(u64, Arc<T>)>,
}

/// An ordered set of listeners of type `T`.
pub struct ListenerSet<T: ?Sized> {
    inner: Arc<Mutex<Slots<T>>>,
}

impl<T: ?Sized> Clone for ListenerSet<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: ?Sized> Default for ListenerSet<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Slots {
                next_id: 0,
                entries: Vec::new(),
            })),
        }
    }
}

impl<T: ?Sized> std::fmt::Debug for ListenerSet<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerSet")
            .field("listeners", &self.len())
            .finish()
    }
}

impl<T: ?Sized + Send + Sync + 'static> ListenerSet<T> {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener`.
    pub fn add(&self, listener: Arc<T>) -> Subscription {
        let id = {
            let mut slots = self.inner.lock();
            slots.next_id += 1;
            let id = slots.next_id;
            slots.entries.push((id, listener));
            id
        };

        let weak: Weak<Mutex<Slots<T>>> = Arc::downgrade(&self.inner);
        Subscription {
            id,
            remove: Some(Box::new(move |id| {
                weak.upgrade().is_some_and(|inner| {
                    let mut slots = inner.lock();
                    let before = slots.entries.len();
                    slots.entries.retain(|(entry_id, _)| *entry_id != id);
                    slots.entries.len() != before
                })
            })),
        }
    }

    /// Listeners registered right now, in registration order.
    pub fn snapshot(&self) -> Vec<Arc<T>> {
        self.inner
            .lock()
            .entries
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect()
    }
}

impl<T: ?Sized> ListenerSet<T> {
    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

type Remover = Box<dyn FnOnce(u64) -> bool + Send + Sync>;

/// Handle that removes one listener from its set.
#[must_use = "dropping a Subscription keeps the listener registered; call unsubscribe() to remove it"]
pub struct Subscription {
    id: u64,
    remove: Option<Remover>,
}

impl Subscription {
    /// Remove the listener. Returns `false` if it was already gone.
    pub fn unsubscribe(mut self) -> bool {
        self.remove.take().is_some_and(|remove| remove(self.id))
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

/// Run one listener invocation, containing a panic so the remaining
/// listeners for the same event still run.
pub(crate) fn invoke_isolated(component: &str, f: impl FnOnce()) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(f)) {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        log::error!("[{}] Listener panicked: {}", component, message);
    }
}
