use std::sync::{Arc, Mutex};

use crate::lock;

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Keyed observer registry.
///
/// Listeners fire in registration order. Every registration carries a caller
/// supplied key; `remove_listener` drops every registration under that key,
/// so one subscriber can tear down all of its subscriptions atomically.
pub struct Signal<T> {
    listeners: Mutex<Vec<(String, Listener<T>)>>,
}

impl<T> Signal<T> {
    pub fn new() -> Self {
        Signal {
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Registers a listener under `key`. The same key may be used for
    /// several registrations.
    pub fn listen(&self, key: impl Into<String>, listener: impl Fn(&T) + Send + Sync + 'static) {
        lock(&self.listeners).push((key.into(), Arc::new(listener)));
    }

    /// Removes every listener registered under `key`.
    pub fn remove_listener(&self, key: &str) {
        lock(&self.listeners).retain(|(k, _)| k != key);
    }

    /// Fires the signal. The listener list is snapshotted first, so a
    /// listener may register or remove listeners without deadlocking.
    pub fn fire(&self, event: &T) {
        let snapshot: Vec<Listener<T>> = lock(&self.listeners)
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in snapshot {
            listener(event);
        }
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.listeners).len()
    }
}

impl<T> Default for Signal<T> {
    fn default() -> Self {
        Signal::new()
    }
}

impl<T> std::fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("listeners", &self.listener_count())
            .finish()
    }
}
