pub mod client;
pub mod error;
pub mod memory;
pub mod message;
pub mod session;
pub mod transport;
pub mod websocket;

use std::sync::{Mutex, MutexGuard};

/// Locks a mutex, recovering the inner state if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
