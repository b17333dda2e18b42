use super::{BlobStorage, StorageError};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::RwLock;

/// In-memory blob storage used in tests and local experiments.
#[derive(Debug, Default)]
pub struct InMemoryBlobStorage {
    data: RwLock<HashMap<String, Bytes>>,
}

impl InMemoryBlobStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStorage for InMemoryBlobStorage {
    async fn get_raw(&self, path: &str) -> Result<Option<Bytes>, StorageError> {
        Ok(self.data.read().unwrap().get(path).cloned())
    }

    async fn put_raw(&self, path: &str, data: &[u8]) -> Result<(), StorageError> {
        self.data
            .write()
            .unwrap()
            .insert(path.to_string(), Bytes::copy_from_slice(data));
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        self.data.write().unwrap().remove(path);
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        Ok(self.data.read().unwrap().contains_key(path))
    }
}
