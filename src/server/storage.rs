//! Flat key-value storage engine: an in-memory map with whole-contents
//! snapshot dump/restore. The coordination core treats this as an opaque
//! durable map; crash durability of in-flight writes is the WAL's job, not
//! this module's.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use rmp_serde::encode::to_vec as encode_to_vec;
use rmp_serde::decode::from_slice as decode_from_slice;

use tokio::fs;

use crate::utils::TandemError;

/// In-memory string-to-string store.
#[derive(Debug, Default)]
pub struct KvStore {
    /// Map state. Guarded here (rather than by the cache-set locks alone)
    /// because keys from different sets may mutate the map concurrently.
    state: Mutex<HashMap<String, String>>,
}

impl KvStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        KvStore {
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the value of `key`, or `NoSuchKey`.
    pub fn get(&self, key: &str) -> Result<String, TandemError> {
        self.lock_state()
            .get(key)
            .cloned()
            .ok_or(TandemError::NoSuchKey)
    }

    /// Inserts or overwrites `key`.
    pub fn put(&self, key: &str, value: &str) {
        self.lock_state().insert(key.into(), value.into());
    }

    /// Removes `key`, or `NoSuchKey` if absent.
    pub fn del(&self, key: &str) -> Result<(), TandemError> {
        match self.lock_state().remove(key) {
            Some(_) => Ok(()),
            None => Err(TandemError::NoSuchKey),
        }
    }

    /// Whether `key` is present.
    pub fn contains(&self, key: &str) -> bool {
        self.lock_state().contains_key(key)
    }

    /// Number of keys stored.
    pub fn len(&self) -> usize {
        self.lock_state().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.lock_state().is_empty()
    }

    /// Writes the full contents to `path` as one structured snapshot file.
    pub async fn dump_to_file(&self, path: &Path) -> Result<(), TandemError> {
        let bytes = {
            let state = self.lock_state();
            encode_to_vec(&*state)?
        };
        fs::write(path, &bytes).await?;
        Ok(())
    }

    /// Replaces the contents with the snapshot previously dumped to `path`.
    pub async fn restore_from_file(
        &self,
        path: &Path,
    ) -> Result<(), TandemError> {
        let bytes = fs::read(path).await?;
        let restored: HashMap<String, String> = decode_from_slice(&bytes)?;
        *self.lock_state() = restored;
        Ok(())
    }

    fn lock_state(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod storage_tests {
    use super::*;

    #[test]
    fn get_absent() {
        let store = KvStore::new();
        assert_eq!(store.get("nope"), Err(TandemError::NoSuchKey));
    }

    #[test]
    fn put_get_del() {
        let store = KvStore::new();
        store.put("a", "1");
        assert_eq!(store.get("a"), Ok("1".into()));
        store.put("a", "2");
        assert_eq!(store.get("a"), Ok("2".into()));
        assert_eq!(store.del("a"), Ok(()));
        assert_eq!(store.del("a"), Err(TandemError::NoSuchKey));
        assert!(store.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn dump_restore() -> Result<(), TandemError> {
        let path = Path::new("/tmp/test-tandem-store-0.snap");
        let store = KvStore::new();
        store.put("a", "1");
        store.put("b", "2");
        store.dump_to_file(path).await?;

        let restored = KvStore::new();
        restored.put("c", "3"); // replaced by restore
        restored.restore_from_file(path).await?;
        assert_eq!(restored.get("a"), Ok("1".into()));
        assert_eq!(restored.get("b"), Ok("2".into()));
        assert_eq!(restored.get("c"), Err(TandemError::NoSuchKey));
        assert_eq!(restored.len(), 2);
        Ok(())
    }
}
