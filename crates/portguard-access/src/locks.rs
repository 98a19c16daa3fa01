//! Per-key serialization for grant/revoke critical sections.
//!
//! Operations on the same MAC (and, during grants, the same IP) must
//! observe a total order while operations on unrelated keys run in
//! parallel. Guards are held across enforcement calls, which is why
//! these are async mutexes and not store transactions.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// A registry of async mutexes, one per key.
///
/// The map only grows with the set of keys ever locked, which is bounded
/// by the gateway's client population.
#[derive(Debug, Default)]
pub struct KeyedLocks<K> {
    locks: Mutex<HashMap<K, Arc<AsyncMutex<()>>>>,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Acquires the mutex for `key`, waiting if another task holds it.
    pub async fn acquire(&self, key: K) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().expect("lock registry poisoned");
            Arc::clone(locks.entry(key).or_default())
        };
        lock.lock_owned().await
    }
}
