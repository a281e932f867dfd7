/// Key-value backend abstraction
///
/// The store persists payloads, index buckets and write intents as opaque
/// byte values under string keys. Any implementation must be safe to share
/// between threads; the store serializes conflicting writers itself.

use crate::Result;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Storage collaborator used by the record store and index manager
pub trait KvBackend: Send + Sync {
    /// Read the value stored under `key`
    fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Store `value` under `key`, replacing any previous value
    fn set(&self, key: &str, value: &[u8]) -> Result<()>;

    /// All keys starting with `prefix`, in ascending order
    fn list_keys(&self, prefix: &str) -> Result<Vec<String>>;

    /// Remove `key`; returns whether it existed
    fn delete(&self, key: &str) -> Result<bool>;
}

impl<B: KvBackend + ?Sized> KvBackend for Arc<B> {
    fn get(&self, key: &str) -> Result<Option<Bytes>> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        (**self).set(key, value)
    }

    fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        (**self).list_keys(prefix)
    }

    fn delete(&self, key: &str) -> Result<bool> {
        (**self).delete(key)
    }
}

/// In-memory backend for tests and temporary stores
///
/// Clones share the same underlying map. All data is lost when the last
/// clone is dropped.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    entries: Arc<RwLock<BTreeMap<String, Bytes>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl KvBackend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<Bytes>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.entries
            .write()
            .insert(key.to_string(), Bytes::copy_from_slice(value));
        Ok(())
    }

    fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let entries = self.entries.read();
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries.write().remove(key).is_some())
    }
}
