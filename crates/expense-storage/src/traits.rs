//! Storage abstraction trait

use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Invalid storage path: {0}")]
    InvalidKey(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("File not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Attachment file storage.
///
/// Keys are relative to [`root`](Storage::root). Callers should run
/// [`validate_path`](Storage::validate_path) before any network work so a bad
/// key fails fast; `save`, `read` and `exists` validate again regardless.
#[async_trait]
pub trait Storage: Send + Sync {
    fn root(&self) -> &Path;

    /// Resolve a key to its location under the root, or reject it.
    fn validate_path(&self, key: &str) -> StorageResult<PathBuf>;

    /// Write `data` at `key`, creating parent directories. Returns the
    /// resolved filesystem path as stored on the attachment row.
    async fn save(&self, key: &str, data: Bytes) -> StorageResult<String>;

    async fn read(&self, key: &str) -> StorageResult<Bytes>;

    async fn exists(&self, key: &str) -> StorageResult<bool>;
}
