use crate::traits::{Storage, StorageError, StorageResult};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Local filesystem storage rooted at a single directory.
#[derive(Clone, Debug)]
pub struct LocalStorage {
    base_path: PathBuf,
}

impl LocalStorage {
    /// Create the root directory if needed.
    pub async fn new(base_path: impl Into<PathBuf>) -> StorageResult<Self> {
        let base_path = base_path.into();

        if base_path.as_os_str().is_empty() {
            return Err(StorageError::ConfigError(
                "storage root must not be empty".to_string(),
            ));
        }

        fs::create_dir_all(&base_path).await.map_err(|e| {
            StorageError::ConfigError(format!(
                "Failed to create storage directory {}: {}",
                base_path.display(),
                e
            ))
        })?;

        Ok(LocalStorage { base_path })
    }

    /// Walk up from `path` to the closest existing ancestor and make sure it
    /// canonicalizes inside the root, so symlinked directories cannot be
    /// used to escape it.
    fn check_resolved(&self, path: &Path) -> StorageResult<()> {
        let base_canonical = self.base_path.canonicalize().map_err(|e| {
            StorageError::ConfigError(format!("Failed to canonicalize base path: {}", e))
        })?;

        let mut current = Some(path);
        while let Some(candidate) = current {
            if let Ok(canonical) = candidate.canonicalize() {
                if canonical.strip_prefix(&base_canonical).is_err() {
                    return Err(StorageError::InvalidKey(
                        "path resolves outside storage root".to_string(),
                    ));
                }
                return Ok(());
            }
            current = candidate.parent();
        }

        Ok(())
    }

    async fn ensure_parent_dir(&self, path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for LocalStorage {
    fn root(&self) -> &Path {
        &self.base_path
    }

    fn validate_path(&self, key: &str) -> StorageResult<PathBuf> {
        if key.is_empty() {
            return Err(StorageError::InvalidKey("path is empty".to_string()));
        }
        if key.contains('\0') {
            return Err(StorageError::InvalidKey("path contains a null byte".to_string()));
        }
        if key.starts_with('/') || key.starts_with('\\') || Path::new(key).is_absolute() {
            return Err(StorageError::InvalidKey(format!("absolute path not allowed: {}", key)));
        }

        for component in Path::new(key).components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                Component::ParentDir => {
                    return Err(StorageError::InvalidKey(format!(
                        "path traversal not allowed: {}",
                        key
                    )))
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(StorageError::InvalidKey(format!(
                        "absolute path not allowed: {}",
                        key
                    )))
                }
            }
        }

        let path = self.base_path.join(key);
        self.check_resolved(&path)?;
        Ok(path)
    }

    async fn save(&self, key: &str, data: Bytes) -> StorageResult<String> {
        let path = self.validate_path(key)?;
        let size = data.len();

        self.ensure_parent_dir(&path).await?;

        let start = std::time::Instant::now();

        let mut file = fs::File::create(&path).await.map_err(|e| {
            StorageError::WriteFailed(format!("Failed to create file {}: {}", path.display(), e))
        })?;

        file.write_all(&data).await.map_err(|e| {
            StorageError::WriteFailed(format!("Failed to write file {}: {}", path.display(), e))
        })?;

        file.sync_all().await.map_err(|e| {
            StorageError::WriteFailed(format!("Failed to sync file {}: {}", path.display(), e))
        })?;

        tracing::debug!(
            path = %path.display(),
            key = %key,
            size_bytes = size,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Attachment saved"
        );

        Ok(path.to_string_lossy().into_owned())
    }

    async fn read(&self, key: &str) -> StorageResult<Bytes> {
        let path = self.validate_path(key)?;

        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Err(StorageError::NotFound(key.to_string()));
        }

        let data = fs::read(&path).await.map_err(|e| {
            StorageError::ReadFailed(format!("Failed to read file {}: {}", path.display(), e))
        })?;

        Ok(Bytes::from(data))
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let path = self.validate_path(key)?;
        Ok(fs::try_exists(&path).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn save_then_read() {
        let dir = tempdir().unwrap();
        let storage = LocalStorage::new(dir.path()).await.unwrap();

        let stored = storage
            .save("attachments/inst-1/a_receipt.pdf", Bytes::from_static(b"%PDF-1.4"))
            .await
            .unwrap();

        assert!(stored.ends_with("a_receipt.pdf"));
        assert!(Path::new(&stored).starts_with(dir.path()));

        let data = storage.read("attachments/inst-1/a_receipt.pdf").await.unwrap();
        assert_eq!(&data[..], b"%PDF-1.4");
        assert!(storage.exists("attachments/inst-1/a_receipt.pdf").await.unwrap());
    }

    #[tokio::test]
    async fn rejects_traversal_and_absolute_paths() {
        let dir = tempdir().unwrap();
        let storage = LocalStorage::new(dir.path()).await.unwrap();

        for key in ["../../../etc/passwd", "attachments/../../x", "/etc/passwd", "a\0b", ""] {
            let result = storage.validate_path(key);
            assert!(
                matches!(result, Err(StorageError::InvalidKey(_))),
                "key {:?} should be rejected",
                key
            );
        }

        let result = storage.save("../escape.txt", Bytes::from_static(b"x")).await;
        assert!(matches!(result, Err(StorageError::InvalidKey(_))));
        assert!(!dir.path().parent().unwrap().join("escape.txt").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn rejects_symlink_escape() {
        let root = tempdir().unwrap();
        let outside = tempdir().unwrap();
        let storage = LocalStorage::new(root.path()).await.unwrap();

        std::os::unix::fs::symlink(outside.path(), root.path().join("link")).unwrap();

        let result = storage.validate_path("link/file.pdf");
        assert!(matches!(result, Err(StorageError::InvalidKey(_))));
    }

    #[tokio::test]
    async fn read_missing_file_is_not_found() {
        let dir = tempdir().unwrap();
        let storage = LocalStorage::new(dir.path()).await.unwrap();

        let result = storage.read("attachments/none.pdf").await;
        assert!(matches!(result, Err(StorageError::NotFound(_))));
        assert!(!storage.exists("attachments/none.pdf").await.unwrap());
    }
}
