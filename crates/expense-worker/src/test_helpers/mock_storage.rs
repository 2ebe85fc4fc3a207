//! In-memory storage for testing without a filesystem

use async_trait::async_trait;
use bytes::Bytes;
use expense_storage::{Storage, StorageError, StorageResult};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Clone)]
pub struct MockStorage {
    root: PathBuf,
    files: Arc<Mutex<HashMap<String, Bytes>>>,
    fail_writes: Arc<AtomicBool>,
    reject_keys: Arc<AtomicBool>,
}

impl MockStorage {
    pub fn new() -> Self {
        Self {
            root: PathBuf::from("/mock-storage"),
            files: Arc::new(Mutex::new(HashMap::new())),
            fail_writes: Arc::new(AtomicBool::new(false)),
            reject_keys: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make `validate_path` refuse every key.
    pub fn set_reject_keys(&self, reject: bool) {
        self.reject_keys.store(reject, Ordering::SeqCst);
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.files.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl Default for MockStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for MockStorage {
    fn root(&self) -> &Path {
        &self.root
    }

    fn validate_path(&self, key: &str) -> StorageResult<PathBuf> {
        if self.reject_keys.load(Ordering::SeqCst) {
            return Err(StorageError::InvalidKey(format!("key rejected: {}", key)));
        }
        if key.is_empty() || key.contains('\0') {
            return Err(StorageError::InvalidKey(format!("invalid key: {:?}", key)));
        }
        let escapes = Path::new(key)
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(StorageError::InvalidKey(format!("key escapes root: {}", key)));
        }
        Ok(self.root.join(key))
    }

    async fn save(&self, key: &str, data: Bytes) -> StorageResult<String> {
        let path = self.validate_path(key)?;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::WriteFailed("disk full".to_string()));
        }
        self.files.lock().unwrap().insert(key.to_string(), data);
        Ok(path.to_string_lossy().into_owned())
    }

    async fn read(&self, key: &str) -> StorageResult<Bytes> {
        self.validate_path(key)?;
        self.files
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        self.validate_path(key)?;
        Ok(self.files.lock().unwrap().contains_key(key))
    }
}
