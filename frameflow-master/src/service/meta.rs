use crate::error::MasterError;
use crate::model::{
    bulk_job_descriptor_path, db_metadata_path, table_descriptor_path, DatabaseMetadata,
    TableMetadata,
};
use crate::storage::BlobStorage;
use frameflow_api_grpc::proto::frameflow::common::{
    BulkJobDescriptor, DatabaseDescriptor, TableDescriptor,
};
use futures::stream::StreamExt;
use prost::Message;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

const PREFETCH_PARALLELISM: usize = 64;

/// Read/write access to the persisted catalog and descriptors through the
/// blob backend.
#[derive(Clone, Debug)]
pub struct MetadataStore {
    storage: Arc<dyn BlobStorage>,
}

impl MetadataStore {
    pub fn new(storage: Arc<dyn BlobStorage>) -> Self {
        Self { storage }
    }

    pub async fn read_db_meta(&self) -> Result<DatabaseMetadata, MasterError> {
        match self.storage.get_raw(&db_metadata_path()).await? {
            Some(bytes) => {
                let descriptor = DatabaseDescriptor::decode(bytes)?;
                Ok(DatabaseMetadata::from_descriptor(&descriptor))
            }
            None => Ok(DatabaseMetadata::default()),
        }
    }

    pub async fn write_db_meta(&self, meta: &DatabaseMetadata) -> Result<(), MasterError> {
        let bytes = meta.to_descriptor().encode_to_vec();
        self.storage.put_raw(&db_metadata_path(), &bytes).await?;
        Ok(())
    }

    pub async fn read_table_meta(
        &self,
        table_id: i32,
    ) -> Result<Option<TableMetadata>, MasterError> {
        match self.storage.get_raw(&table_descriptor_path(table_id)).await? {
            Some(bytes) => {
                let descriptor = TableDescriptor::decode(bytes)?;
                Ok(Some(TableMetadata::new(descriptor)))
            }
            None => Ok(None),
        }
    }

    pub async fn write_table_meta(&self, table: &TableMetadata) -> Result<(), MasterError> {
        let bytes = table.descriptor().encode_to_vec();
        self.storage
            .put_raw(&table_descriptor_path(table.id()), &bytes)
            .await?;
        Ok(())
    }

    pub async fn read_bulk_job_meta(
        &self,
        bulk_job_id: i32,
    ) -> Result<Option<BulkJobDescriptor>, MasterError> {
        match self
            .storage
            .get_raw(&bulk_job_descriptor_path(bulk_job_id))
            .await?
        {
            Some(bytes) => Ok(Some(BulkJobDescriptor::decode(bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn write_bulk_job_meta(
        &self,
        descriptor: &BulkJobDescriptor,
    ) -> Result<(), MasterError> {
        let bytes = descriptor.encode_to_vec();
        self.storage
            .put_raw(&bulk_job_descriptor_path(descriptor.id), &bytes)
            .await?;
        Ok(())
    }
}

/// In-memory cache of table descriptors, populated lazily and optionally
/// prefetched at startup.
#[derive(Debug)]
pub struct TableMetaCache {
    store: MetadataStore,
    cache: RwLock<HashMap<i32, TableMetadata>>,
}

impl TableMetaCache {
    pub fn new(store: MetadataStore) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn update(&self, table: TableMetadata) {
        self.cache.write().unwrap().insert(table.id(), table);
    }

    pub fn remove(&self, table_id: i32) {
        self.cache.write().unwrap().remove(&table_id);
    }

    pub fn get(&self, table_id: i32) -> Option<TableMetadata> {
        self.cache.read().unwrap().get(&table_id).cloned()
    }

    pub async fn get_or_load(
        &self,
        table_id: i32,
    ) -> Result<Option<TableMetadata>, MasterError> {
        if let Some(table) = self.get(table_id) {
            return Ok(Some(table));
        }
        match self.store.read_table_meta(table_id).await? {
            Some(table) => {
                self.update(table.clone());
                Ok(Some(table))
            }
            None => Ok(None),
        }
    }

    pub async fn get_by_name(
        &self,
        meta: &DatabaseMetadata,
        name: &str,
    ) -> Result<Option<TableMetadata>, MasterError> {
        match meta.get_table_id(name) {
            Some(table_id) => self.get_or_load(table_id).await,
            None => Ok(None),
        }
    }

    /// Loads every table descriptor listed in the catalog with bounded
    /// parallelism. Missing or unreadable descriptors are skipped with a
    /// warning so one bad blob cannot block startup.
    pub async fn prefetch(&self, meta: &DatabaseMetadata) {
        debug!("Prefetching table metadata");
        let store = self.store.clone();
        futures::stream::iter(meta.table_ids())
            .map(|table_id| {
                let store = store.clone();
                async move { (table_id, store.read_table_meta(table_id).await) }
            })
            .buffer_unordered(PREFETCH_PARALLELISM)
            .for_each(|(table_id, result)| {
                match result {
                    Ok(Some(table)) => self.update(table),
                    Ok(None) => warn!("Table {table_id} has no descriptor blob"),
                    Err(err) => warn!("Failed to prefetch table {table_id}: {err}"),
                }
                futures::future::ready(())
            })
            .await;
        debug!("Prefetch complete");
    }
}
