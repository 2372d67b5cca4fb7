use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex guarding plain bookkeeping.
///
/// The data behind these locks is never left half-updated by a panic, so poisoning is ignored.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
