use crate::error::MasterError;
use crate::model::TableMetadata;
use crate::service::meta::MetadataStore;
use async_trait::async_trait;
use chrono::Utc;
use frameflow_api_grpc::proto::frameflow::common::{Column, ColumnType, TableDescriptor};
use tracing::info;

#[derive(Clone, Debug)]
pub struct FailedVideo {
    pub path: String,
    pub message: String,
}

/// External video ingest. The master only delegates here and refreshes its
/// catalog afterwards; probing and storing the video content is this
/// collaborator's concern.
#[async_trait]
pub trait IngestService: Send + Sync {
    async fn ingest_videos(
        &self,
        table_names: &[String],
        video_paths: &[String],
        inplace: bool,
    ) -> Result<Vec<FailedVideo>, MasterError>;
}

/// Filesystem-backed ingest: verifies each source path, registers one
/// committed single-video-column table per video, and reports per-path
/// failures.
pub struct FsVideoIngest {
    store: MetadataStore,
}

impl FsVideoIngest {
    pub fn new(store: MetadataStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl IngestService for FsVideoIngest {
    async fn ingest_videos(
        &self,
        table_names: &[String],
        video_paths: &[String],
        _inplace: bool,
    ) -> Result<Vec<FailedVideo>, MasterError> {
        if table_names.len() != video_paths.len() {
            return Err(MasterError::validation(format!(
                "Got {} table names but {} video paths",
                table_names.len(),
                video_paths.len()
            )));
        }

        let mut meta = self.store.read_db_meta().await?;
        let mut failed = Vec::new();

        for (table_name, video_path) in table_names.iter().zip(video_paths.iter()) {
            if meta.has_table(table_name) {
                failed.push(FailedVideo {
                    path: video_path.clone(),
                    message: format!("Table {table_name} already exists in the database"),
                });
                continue;
            }
            if tokio::fs::metadata(video_path).await.is_err() {
                failed.push(FailedVideo {
                    path: video_path.clone(),
                    message: format!("Video {video_path} does not exist"),
                });
                continue;
            }

            let table_id = meta.add_table(table_name);
            // Ingested tables are not produced by a bulk job, so they are
            // committed right away.
            meta.commit_table(table_id);
            let descriptor = TableDescriptor {
                id: table_id,
                name: table_name.clone(),
                columns: vec![Column {
                    id: 0,
                    name: "frame".to_string(),
                    r#type: ColumnType::Video as i32,
                }],
                end_rows: vec![],
                job_id: -1,
                timestamp: Utc::now().timestamp(),
            };
            self.store
                .write_table_meta(&TableMetadata::new(descriptor))
                .await?;
            info!("Ingested video {video_path} as table {table_name} ({table_id})");
        }

        self.store.write_db_meta(&meta).await?;
        Ok(failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::InMemoryBlobStorage;
    use std::sync::Arc;

    #[tokio::test]
    async fn mismatched_arity_is_rejected() {
        let store = MetadataStore::new(Arc::new(InMemoryBlobStorage::new()));
        let ingest = FsVideoIngest::new(store);
        let result = ingest
            .ingest_videos(&["a".to_string()], &[], false)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn missing_videos_are_reported_not_fatal() {
        let storage = Arc::new(InMemoryBlobStorage::new());
        let store = MetadataStore::new(storage.clone());
        let ingest = FsVideoIngest::new(store.clone());

        let failed = ingest
            .ingest_videos(
                &["clips".to_string()],
                &["/definitely/not/here.mp4".to_string()],
                false,
            )
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert!(failed[0].message.contains("does not exist"));

        let meta = store.read_db_meta().await.unwrap();
        assert!(!meta.has_table("clips"));
    }

    #[tokio::test]
    async fn existing_videos_become_committed_tables() {
        let dir = tempfile::tempdir().unwrap();
        let video = dir.path().join("clip.mp4");
        tokio::fs::write(&video, b"not really a video").await.unwrap();

        let storage = Arc::new(InMemoryBlobStorage::new());
        let store = MetadataStore::new(storage.clone());
        let ingest = FsVideoIngest::new(store.clone());

        let failed = ingest
            .ingest_videos(
                &["clips".to_string()],
                &[video.display().to_string()],
                false,
            )
            .await
            .unwrap();
        assert!(failed.is_empty());

        let meta = store.read_db_meta().await.unwrap();
        let table_id = meta.get_table_id("clips").unwrap();
        assert!(meta.table_is_committed(table_id));
        assert!(store
            .read_table_meta(table_id)
            .await
            .unwrap()
            .is_some());
    }
}
