//! Set-associative read cache with second-chance (CLOCK) eviction.
//!
//! Every key maps to exactly one set; each set carries its own lock so that
//! operations on different sets proceed fully in parallel. The lock is
//! exposed to callers as a guard object: holding a [`CacheSetGuard`] *is*
//! holding the set lock, which lets a server combine a cache mutation with a
//! storage mutation in one critical section (write-through atomicity).

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use crate::utils::hash64;

/// One cached key-value pair plus its second-chance reference bit.
#[derive(Debug, Clone)]
struct CacheEntry {
    key: String,
    value: String,
    referenced: bool,
}

/// Fixed-geometry cache: `num_sets` sets of at most `ways` entries each.
#[derive(Debug)]
pub struct Cache {
    /// Per-set entry lists; front is the eviction scan position, back is the
    /// most-recently-placed position.
    sets: Vec<Mutex<VecDeque<CacheEntry>>>,

    /// Maximum number of entries per set.
    ways: usize,
}

/// Scoped lock over one cache set. All cache operations live here, so the
/// set lock is guaranteed held for their duration and released on every exit
/// path when the guard drops.
pub struct CacheSetGuard<'c> {
    set: MutexGuard<'c, VecDeque<CacheEntry>>,
    ways: usize,
}

impl Cache {
    /// Creates a cache of `num_sets` sets with `ways` entries each. Both
    /// dimensions must be nonzero.
    pub fn new(num_sets: usize, ways: usize) -> Self {
        assert!(num_sets > 0, "cache must have at least one set");
        assert!(ways > 0, "cache sets must hold at least one entry");
        Cache {
            sets: (0..num_sets).map(|_| Mutex::new(VecDeque::new())).collect(),
            ways,
        }
    }

    /// Index of the set that `key` deterministically maps to.
    fn set_idx(&self, key: &str) -> usize {
        (hash64(key) % self.sets.len() as u64) as usize
    }

    /// Acquires the lock of `key`'s set and returns the guard carrying the
    /// cache operations. Blocks until the current holder releases.
    pub fn lock_for(&self, key: &str) -> CacheSetGuard<'_> {
        let set = self.sets[self.set_idx(key)]
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        CacheSetGuard {
            set,
            ways: self.ways,
        }
    }

    /// Number of sets configured.
    pub fn num_sets(&self) -> usize {
        self.sets.len()
    }

    /// Current number of entries in set `idx` (for tests and stats).
    pub fn set_len(&self, idx: usize) -> usize {
        self.sets[idx]
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

impl CacheSetGuard<'_> {
    /// Looks `key` up in the locked set. On a hit, marks the entry
    /// referenced and moves it to the back (most-recently-used position).
    pub fn get(&mut self, key: &str) -> Option<String> {
        let pos = self.set.iter().position(|e| e.key == key)?;
        let mut entry = self.set.remove(pos).unwrap();
        entry.referenced = true;
        let value = entry.value.clone();
        self.set.push_back(entry);
        Some(value)
    }

    /// Inserts or overwrites `key`. An existing entry is overwritten in
    /// place and marked referenced. Otherwise, a full set is first relieved
    /// by the second-chance scan: entries are popped from the front, spared
    /// (flag cleared, moved to back) while referenced, and the first
    /// unreferenced one is evicted. The new entry always starts referenced.
    pub fn put(&mut self, key: &str, value: &str) {
        if let Some(entry) = self.set.iter_mut().find(|e| e.key == key) {
            entry.value = value.into();
            entry.referenced = true;
            return;
        }

        if self.set.len() >= self.ways {
            loop {
                let mut entry = self.set.pop_front().unwrap();
                if !entry.referenced {
                    break; // evicted
                }
                entry.referenced = false;
                self.set.push_back(entry);
            }
        }

        self.set.push_back(CacheEntry {
            key: key.into(),
            value: value.into(),
            referenced: true,
        });
    }

    /// Removes `key`'s entry if present; no-op otherwise.
    pub fn delete(&mut self, key: &str) {
        if let Some(pos) = self.set.iter().position(|e| e.key == key) {
            self.set.remove(pos);
        }
    }

    /// Number of entries currently in the locked set.
    pub fn len(&self) -> usize {
        self.set.len()
    }

    /// Whether the locked set is empty.
    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }
}
