pub mod error;
pub mod fragment;
pub mod model;
pub mod schema;
pub mod scope;
pub mod signal;
pub mod value;

use std::sync::{Mutex, MutexGuard};

// Re-exported for the `model_class!` macro expansion; not public API.
#[doc(hidden)]
pub use paste::paste as __paste;
#[doc(hidden)]
pub use uuid;

/// Locks a mutex, recovering the inner state if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
