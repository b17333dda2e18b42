use super::{BlobStorage, StorageError};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;

/// Filesystem-backed blob storage rooted at the configured database path.
/// Writes are synced to disk before returning.
#[derive(Debug)]
pub struct FileSystemBlobStorage {
    root: PathBuf,
}

impl FileSystemBlobStorage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn full_path(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }
}

#[async_trait]
impl BlobStorage for FileSystemBlobStorage {
    async fn get_raw(&self, path: &str) -> Result<Option<Bytes>, StorageError> {
        let full = self.full_path(path);
        match tokio::fs::read(&full).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StorageError::io(full.display().to_string(), err)),
        }
    }

    async fn put_raw(&self, path: &str, data: &[u8]) -> Result<(), StorageError> {
        let full = self.full_path(path);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| StorageError::io(parent.display().to_string(), err))?;
        }
        let mut file = tokio::fs::File::create(&full)
            .await
            .map_err(|err| StorageError::io(full.display().to_string(), err))?;
        file.write_all(data)
            .await
            .map_err(|err| StorageError::io(full.display().to_string(), err))?;
        file.sync_all()
            .await
            .map_err(|err| StorageError::io(full.display().to_string(), err))?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        let full = self.full_path(path);
        match tokio::fs::remove_file(&full).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StorageError::io(full.display().to_string(), err)),
        }
    }

    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        let full = self.full_path(path);
        match tokio::fs::metadata(&full).await {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(StorageError::io(full.display().to_string(), err)),
        }
    }
}
