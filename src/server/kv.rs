//! Write-through serving facade over the cache and the flat store.
//!
//! Requests on keys from different cache sets proceed in parallel; requests
//! on keys from the same set serialize on that set's lock, which is held
//! across both the store and the cache mutation so the two never diverge on
//! a successful write.

use std::sync::Arc;

use crate::cache::Cache;
use crate::server::KvStore;
use crate::utils::TandemError;
use crate::wire::{check_key, check_value};

/// One server's local cache + store pair.
#[derive(Debug)]
pub struct KvServer {
    cache: Cache,
    store: Arc<KvStore>,
}

impl KvServer {
    /// Creates a serving facade with a cache of the given geometry over an
    /// empty store.
    pub fn new(cache_sets: usize, cache_ways: usize) -> Self {
        KvServer {
            cache: Cache::new(cache_sets, cache_ways),
            store: Arc::new(KvStore::new()),
        }
    }

    /// Performs a write-through put.
    pub fn put(&self, key: &str, value: &str) -> Result<(), TandemError> {
        check_key(key)?;
        check_value(value)?;
        let mut set = self.cache.lock_for(key);
        self.store.put(key, value);
        set.put(key, value);
        Ok(())
    }

    /// Reads `key`, filling the cache from the store on a miss.
    pub fn get(&self, key: &str) -> Result<String, TandemError> {
        check_key(key)?;
        let mut set = self.cache.lock_for(key);
        if let Some(value) = set.get(key) {
            return Ok(value);
        }
        let value = self.store.get(key)?;
        set.put(key, &value);
        Ok(value)
    }

    /// Removes `key` from cache and store.
    pub fn del(&self, key: &str) -> Result<(), TandemError> {
        check_key(key)?;
        let mut set = self.cache.lock_for(key);
        set.delete(key);
        self.store.del(key)
    }

    /// Whether `key` exists, probing the store only. Used for vote
    /// validation, where a `get` would mutate cache recency state as a side
    /// effect.
    pub fn has_key(&self, key: &str) -> bool {
        self.store.contains(key)
    }

    /// The backing store, for WAL replay and snapshot dump/restore.
    pub fn store(&self) -> &Arc<KvStore> {
        &self.store
    }

    /// The cache, for stats and tests.
    pub fn cache(&self) -> &Cache {
        &self.cache
    }
}
