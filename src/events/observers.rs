use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

/// Set of distinct observer handles
///
/// Identity is pointer identity of the `Arc`. Notification works on a
/// snapshot, so observers may add or remove themselves from inside a
/// callback.
pub struct ObserverList<O: ?Sized> {
    observers: Mutex<Vec<Arc<O>>>,
}

impl<O: ?Sized> ObserverList<O> {
    pub fn new() -> Self {
        Self {
            observers: Mutex::new(Vec::new()),
        }
    }

    /// Register an observer. Registering the same handle twice is a no-op.
    pub fn add(&self, observer: Arc<O>) {
        let mut observers = self.observers.lock();
        if observers.iter().any(|o| Arc::ptr_eq(o, &observer)) {
            warn!("Adding duplicated observer");
            return;
        }
        observers.push(observer);
    }

    /// Unregister an observer. Unknown handles are ignored.
    pub fn remove(&self, observer: &Arc<O>) {
        self.observers.lock().retain(|o| !Arc::ptr_eq(o, observer));
    }

    pub fn snapshot(&self) -> Vec<Arc<O>> {
        self.observers.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.observers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.lock().is_empty()
    }
}

impl<O: ?Sized> Default for ObserverList<O> {
    fn default() -> Self {
        Self::new()
    }
}
