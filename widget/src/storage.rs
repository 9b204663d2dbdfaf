//! Namespaced key-value persistence over a browser-like local storage.
//!
//! Browsers may refuse storage access outright (privacy modes, blocked third-party
//! storage), so every [LocalStore] operation probes the backend first and degrades to
//! "nothing stored" instead of failing.

use psicash_types::{storage_key, storage_prefix};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("storage is unavailable: {0}")]
    Unavailable(String),
}

/// Raw string storage, shaped like `window.localStorage`.
pub trait StorageBackend: Send + Sync + 'static {
    /// Checks that the storage can be written and read back.
    fn probe(&self) -> Result<(), StorageError>;
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove_item(&self, key: &str) -> Result<(), StorageError>;
    fn keys(&self) -> Result<Vec<String>, StorageError>;
    fn clear(&self) -> Result<(), StorageError>;
}

/// In-memory storage. Clones share contents, like two loads of the same origin.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    items: Arc<Mutex<BTreeMap<String, String>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn items(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
        self.items.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Copy of the raw contents.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.items().clone()
    }
}

impl StorageBackend for MemoryBackend {
    fn probe(&self) -> Result<(), StorageError> {
        Ok(())
    }

    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.items().get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.items().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        self.items().remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.items().keys().cloned().collect())
    }

    fn clear(&self) -> Result<(), StorageError> {
        self.items().clear();
        Ok(())
    }
}

/// Storage that refuses every access.
#[derive(Clone, Copy, Default)]
pub struct BlockedBackend;

impl BlockedBackend {
    fn refuse<T>(&self) -> Result<T, StorageError> {
        Err(StorageError::Unavailable("access denied".to_string()))
    }
}

impl StorageBackend for BlockedBackend {
    fn probe(&self) -> Result<(), StorageError> {
        self.refuse()
    }

    fn get_item(&self, _key: &str) -> Result<Option<String>, StorageError> {
        self.refuse()
    }

    fn set_item(&self, _key: &str, _value: &str) -> Result<(), StorageError> {
        self.refuse()
    }

    fn remove_item(&self, _key: &str) -> Result<(), StorageError> {
        self.refuse()
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        self.refuse()
    }

    fn clear(&self) -> Result<(), StorageError> {
        self.refuse()
    }
}

/// JSON values under a dev- or prod-namespaced key.
#[derive(Clone)]
pub struct LocalStore {
    backend: Option<Arc<dyn StorageBackend>>,
    warned: Arc<AtomicBool>,
}

impl LocalStore {
    pub fn new(backend: impl StorageBackend) -> Self {
        Self {
            backend: Some(Arc::new(backend)),
            warned: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A store with no backend at all.
    pub fn unavailable() -> Self {
        Self {
            backend: None,
            warned: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Returns the backend if it passes the probe.
    fn backend(&self) -> Option<&dyn StorageBackend> {
        let backend = self.backend.as_deref()?;
        match backend.probe() {
            Ok(()) => Some(backend),
            Err(err) => {
                if !self.warned.swap(true, Ordering::Relaxed) {
                    warn!(error = %err, "local storage unavailable");
                }
                None
            }
        }
    }

    pub fn available(&self) -> bool {
        self.backend().is_some()
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str, dev: bool) -> Option<T> {
        let backend = self.backend()?;
        let key = storage_key(key, dev);
        let raw = match backend.get_item(&key) {
            Ok(raw) => raw?,
            Err(err) => {
                warn!(key = %key, error = %err, "storage read failed");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(key = %key, error = %err, "ignoring malformed stored value");
                None
            }
        }
    }

    pub fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, dev: bool) {
        let Some(backend) = self.backend() else {
            return;
        };
        let key = storage_key(key, dev);
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(key = %key, error = %err, "failed to encode value for storage");
                return;
            }
        };
        if let Err(err) = backend.set_item(&key, &raw) {
            warn!(key = %key, error = %err, "storage write failed");
        }
    }

    /// Writes each entry of `incoming` unless a value is already stored under its key
    /// and `prefer_incoming` is false.
    pub fn merge(&self, incoming: &Map<String, Value>, prefer_incoming: bool, dev: bool) {
        if self.backend().is_none() {
            return;
        }
        for (key, value) in incoming {
            if prefer_incoming || self.get::<Value>(key, dev).is_none() {
                self.set(key, value, dev);
            }
        }
    }

    /// Removes every key in the `dev` namespace. The other namespace is untouched.
    pub fn clear_all(&self, dev: bool) {
        let Some(backend) = self.backend() else {
            return;
        };
        let prefix = storage_prefix(dev);
        let keys = match backend.keys() {
            Ok(keys) => keys,
            Err(err) => {
                warn!(error = %err, "failed to list storage keys");
                return;
            }
        };
        let mut removed = 0;
        for key in keys.iter().filter(|key| key.starts_with(prefix)) {
            match backend.remove_item(key) {
                Ok(()) => removed += 1,
                Err(err) => warn!(key = %key, error = %err, "failed to remove storage key"),
            }
        }
        debug!(removed, dev_env = dev, "cleared local storage namespace");
    }

    /// Removes everything, in every namespace.
    pub fn clear_everything(&self) {
        let Some(backend) = self.backend() else {
            return;
        };
        if let Err(err) = backend.clear() {
            warn!(error = %err, "failed to clear local storage");
        }
    }

    /// Raw contents of the whole storage.
    pub fn dump(&self) -> BTreeMap<String, String> {
        let Some(backend) = self.backend() else {
            return BTreeMap::new();
        };
        let keys = backend.keys().unwrap_or_default();
        keys.into_iter()
            .filter_map(|key| {
                let value = backend.get_item(&key).ok().flatten()?;
                Some((key, value))
            })
            .collect()
    }
}
