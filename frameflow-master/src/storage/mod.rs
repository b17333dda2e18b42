use crate::config::BlobStorageConfig;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;

pub mod fs;
pub mod memory;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}

impl StorageError {
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// An opaque blob store addressed by canonical relative paths. All persisted
/// master metadata goes through this interface.
#[async_trait]
pub trait BlobStorage: Debug + Send + Sync {
    async fn get_raw(&self, path: &str) -> Result<Option<Bytes>, StorageError>;
    async fn put_raw(&self, path: &str, data: &[u8]) -> Result<(), StorageError>;
    async fn delete(&self, path: &str) -> Result<(), StorageError>;
    async fn exists(&self, path: &str) -> Result<bool, StorageError>;
}

pub fn configured(config: &BlobStorageConfig, db_path: &Path) -> Arc<dyn BlobStorage> {
    match config {
        BlobStorageConfig::Filesystem => {
            Arc::new(fs::FileSystemBlobStorage::new(db_path.to_path_buf()))
        }
        BlobStorageConfig::InMemory => Arc::new(memory::InMemoryBlobStorage::new()),
    }
}
