//! Lazily populated table of named locks.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A map from key to lock that creates entries on first use and removes
/// them once nobody holds or waits on them.
///
/// Callers take a [`Lease`] on a key, then lock the leased value. The entry
/// stays in the table while any lease is alive, so every task contending
/// for a key sees the same lock.
#[derive(Debug)]
pub struct LockTable<L> {
    entries: Mutex<HashMap<String, Arc<L>>>,
}

impl<L> Default for LockTable<L> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<L: Default> LockTable<L> {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Arc<L>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns a lease on the lock for `key`, creating it if needed.
    pub fn lease(&self, key: &str) -> Lease<'_, L> {
        let lock = self
            .entries()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(L::default()))
            .clone();
        Lease {
            table: self,
            key: key.to_string(),
            lock,
        }
    }

    /// Number of keys currently leased.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys currently leased, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.entries().keys().cloned().collect();
        keys.sort();
        keys
    }
}

/// Shared handle on one lock in a [`LockTable`].
#[derive(Debug)]
pub struct Lease<'a, L: Default> {
    table: &'a LockTable<L>,
    key: String,
    lock: Arc<L>,
}

impl<L: Default> Lease<'_, L> {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl<L: Default> Deref for Lease<'_, L> {
    type Target = L;

    fn deref(&self) -> &L {
        &self.lock
    }
}

impl<L: Default> Drop for Lease<'_, L> {
    fn drop(&mut self) {
        let mut entries = self.table.entries();
        // Leases are only cloned out under the map lock, so a count of two
        // (the map and this lease) means nobody else holds or waits.
        if let Some(entry) = entries.get(&self.key)
            && Arc::ptr_eq(entry, &self.lock)
            && Arc::strong_count(entry) == 2
        {
            entries.remove(&self.key);
        }
    }
}
