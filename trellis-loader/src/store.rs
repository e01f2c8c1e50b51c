//! Node-local cache store.
//!
//! The in-memory portion of the partitioned cache a node hosts. The ingest
//! handler applies incoming batches here; local buffers apply directly.
//! Tests can inject per-cache failures to exercise the updater error path.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use trellis_core::CacheName;

struct StoreState {
    caches: HashMap<CacheName, HashMap<Bytes, Bytes>>,
    /// Caches currently rejecting writes, with the rejection message.
    failing: HashMap<CacheName, String>,
}

/// In-memory cache store of one node.
pub struct CacheStore {
    state: Mutex<StoreState>,
}

fn lock(state: &Mutex<StoreState>) -> MutexGuard<'_, StoreState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl CacheStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StoreState {
                caches: HashMap::new(),
                failing: HashMap::new(),
            }),
        }
    }

    /// Stores `value` under `key`.
    ///
    /// # Errors
    /// Returns the injected failure message when the cache is failing.
    pub fn put(&self, cache: &CacheName, key: Bytes, value: Bytes) -> Result<(), String> {
        let mut state = self.writable(cache)?;

        state.caches.entry(cache.clone()).or_default().insert(key, value);
        Ok(())
    }

    /// Removes `key`.
    ///
    /// # Errors
    /// Returns the injected failure message when the cache is failing.
    pub fn remove(&self, cache: &CacheName, key: &Bytes) -> Result<(), String> {
        let mut state = self.writable(cache)?;

        if let Some(entries) = state.caches.get_mut(cache) {
            entries.remove(key);
        }
        Ok(())
    }

    /// Stores every pair in one sweep.
    ///
    /// # Errors
    /// Returns the injected failure message when the cache is failing.
    pub fn put_all(&self, cache: &CacheName, pairs: Vec<(Bytes, Bytes)>) -> Result<(), String> {
        let mut state = self.writable(cache)?;

        let entries = state.caches.entry(cache.clone()).or_default();
        for (key, value) in pairs {
            entries.insert(key, value);
        }
        Ok(())
    }

    /// Removes every key in one sweep.
    ///
    /// # Errors
    /// Returns the injected failure message when the cache is failing.
    pub fn remove_all(&self, cache: &CacheName, keys: Vec<Bytes>) -> Result<(), String> {
        let mut state = self.writable(cache)?;

        if let Some(entries) = state.caches.get_mut(cache) {
            for key in keys {
                entries.remove(&key);
            }
        }
        Ok(())
    }

    /// Returns the value stored under `key`, if any.
    #[must_use]
    pub fn get(&self, cache: &CacheName, key: &Bytes) -> Option<Bytes> {
        lock(&self.state)
            .caches
            .get(cache)
            .and_then(|entries| entries.get(key).cloned())
    }

    /// Number of entries in a cache.
    #[must_use]
    pub fn len(&self, cache: &CacheName) -> usize {
        lock(&self.state)
            .caches
            .get(cache)
            .map_or(0, HashMap::len)
    }

    /// Returns true if the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self, cache: &CacheName) -> bool {
        self.len(cache) == 0
    }

    /// Makes subsequent writes to `cache` fail with `message`, or restores
    /// them with `None`. Test hook.
    pub fn set_failing(&self, cache: &CacheName, message: Option<String>) {
        let mut state = lock(&self.state);

        match message {
            Some(message) => {
                state.failing.insert(cache.clone(), message);
            }
            None => {
                state.failing.remove(cache);
            }
        }
    }

    fn writable(&self, cache: &CacheName) -> Result<MutexGuard<'_, StoreState>, String> {
        let state = lock(&self.state);

        if let Some(message) = state.failing.get(cache) {
            return Err(message.clone());
        }

        Ok(state)
    }
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);

        f.debug_struct("CacheStore")
            .field("caches", &state.caches.len())
            .finish_non_exhaustive()
    }
}
