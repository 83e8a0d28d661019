use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

use super::path::{FileType, PathContext, construct_storage_path};
use super::storage::{ArtifactStorage, StorageError};
use super::{ContributionMetrics, DocumentRelationships, ResourceRecord, ResourceType};
use crate::error::{DialecticError, Result};
use crate::store::Store;

/// How many attempt indices an upload walks through before giving up on collisions.
pub const MAX_UPLOAD_ATTEMPTS: u32 = 5;

/// One artifact to persist.
#[derive(Debug, Clone)]
pub struct UploadContext {
    pub path: PathContext,
    pub job_id: Uuid,
    pub model_id: String,
    pub content: Vec<u8>,
    /// Stage links. `source_group` is taken from `path`.
    pub relationships: DocumentRelationships,
    /// Required for continuation chunks.
    pub target_contribution_id: Option<Uuid>,
    pub metrics: Option<ContributionMetrics>,
    /// Pre-assigned so a first chunk can reference itself in its relationships.
    pub resource_id: Uuid,
}

impl UploadContext {
    pub fn new(path: PathContext, job_id: Uuid, model_id: &str, content: Vec<u8>) -> Self {
        Self {
            path,
            job_id,
            model_id: model_id.to_string(),
            content,
            relationships: DocumentRelationships::default(),
            target_contribution_id: None,
            metrics: None,
            resource_id: Uuid::new_v4(),
        }
    }

    fn resource_type(&self) -> ResourceType {
        match self.path.file_type {
            FileType::ModelContributionRaw => ResourceType::ModelContributionRaw,
            FileType::HeaderContext => ResourceType::HeaderContext,
            FileType::AssembledDocumentJson => ResourceType::AssembledJson,
            FileType::RenderedDocument => ResourceType::RenderedDocument,
        }
    }
}

/// Single choke point for persisting generated content.
pub struct FileManager {
    storage: Arc<dyn ArtifactStorage>,
    store: Arc<Store>,
    bucket: String,
    timeout: Duration,
}

impl FileManager {
    pub fn new(
        storage: Arc<dyn ArtifactStorage>,
        store: Arc<Store>,
        bucket: &str,
        timeout: Duration,
    ) -> Self {
        Self {
            storage,
            store,
            bucket: bucket.to_string(),
            timeout,
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Upload the artifact and register its resource row.
    ///
    /// An existing object at the computed path bumps the attempt index, up
    /// to [`MAX_UPLOAD_ATTEMPTS`] tries.
    pub async fn upload_and_register(&self, ctx: UploadContext) -> Result<ResourceRecord> {
        if ctx.path.file_type == FileType::ModelContributionRaw
            && ctx.path.turn_index > 0
            && ctx.target_contribution_id.is_none()
        {
            return Err(DialecticError::Validation(
                "continuation chunks need target_contribution_id".into(),
            ));
        }
        if ctx.model_id.trim().is_empty() || ctx.path.document_key.trim().is_empty() {
            return Err(DialecticError::Validation(
                "uploads need a model and a document key".into(),
            ));
        }

        let mut path_ctx = ctx.path.clone();
        let first_attempt = path_ctx.attempt;

        for _ in 0..MAX_UPLOAD_ATTEMPTS {
            let path = construct_storage_path(&path_ctx);
            let full = path.full();
            match self.put(&full, ctx.content.clone()).await {
                Ok(()) => {
                    let record = self.record(&ctx, path.storage_path, path.file_name);
                    let registered = record.clone();
                    self.store
                        .transaction(|tx| tx.insert_resource(registered))?;
                    debug!(
                        resource_id = %record.id,
                        path = %record.object_key(),
                        "registered artifact"
                    );
                    return Ok(record);
                }
                Err(StorageError::AlreadyExists { .. }) => {
                    warn!(path = %full, "storage path taken, bumping attempt index");
                    path_ctx.attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(StorageError::AlreadyExists {
            bucket: self.bucket.clone(),
            path: format!(
                "{} (attempts {first_attempt}..{})",
                construct_storage_path(&ctx.path).storage_path,
                path_ctx.attempt
            ),
        }
        .into())
    }

    async fn put(&self, path: &str, bytes: Vec<u8>) -> std::result::Result<(), StorageError> {
        match timeout(self.timeout, self.storage.upload(&self.bucket, path, bytes)).await {
            Ok(result) => result,
            Err(_) => Err(StorageError::Timeout {
                path: path.to_string(),
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        }
    }

    pub async fn download(&self, record: &ResourceRecord) -> Result<Vec<u8>> {
        let key = record.object_key();
        match timeout(
            self.timeout,
            self.storage.download(&record.storage_bucket, &key),
        )
        .await
        {
            Ok(result) => Ok(result?),
            Err(_) => Err(StorageError::Timeout {
                path: key,
                timeout_ms: self.timeout.as_millis() as u64,
            }
            .into()),
        }
    }

    pub async fn download_text(&self, record: &ResourceRecord) -> Result<String> {
        let bytes = self.download(record).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn record(&self, ctx: &UploadContext, storage_path: String, file_name: String) -> ResourceRecord {
        let mut relationships = ctx.relationships.clone();
        relationships.source_group = ctx.path.source_group;

        ResourceRecord {
            id: ctx.resource_id,
            project_id: ctx.path.project_id,
            session_id: ctx.path.session_id,
            job_id: ctx.job_id,
            stage_slug: ctx.path.stage,
            iteration_number: ctx.path.iteration,
            storage_bucket: self.bucket.clone(),
            storage_path,
            file_name,
            resource_type: ctx.resource_type(),
            document_key: ctx.path.document_key.clone(),
            model_id: ctx.model_id.clone(),
            document_relationships: relationships,
            turn_index: ctx.path.turn_index,
            target_contribution_id: ctx.target_contribution_id,
            mime_type: ctx.path.file_type.mime_type().to_string(),
            size_bytes: ctx.content.len() as u64,
            metrics: ctx.metrics,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::MemoryStorage;
    use crate::artifact::path::deconstruct_storage_path;
    use crate::session::Stage;
    use async_trait::async_trait;

    fn path_ctx(file_type: FileType) -> PathContext {
        PathContext {
            project_id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
            iteration: 1,
            stage: Stage::Thesis,
            file_type,
            model_slug: "claude-sonnet".into(),
            attempt: 0,
            document_key: "business_case".into(),
            source_group: Some(Uuid::new_v4()),
            source_anchor_model_slug: None,
            turn_index: 0,
        }
    }

    fn manager(storage: Arc<dyn ArtifactStorage>) -> (FileManager, Arc<Store>) {
        let store = Arc::new(Store::in_memory());
        let files = FileManager::new(storage, store.clone(), "artifacts", Duration::from_secs(5));
        (files, store)
    }

    #[tokio::test]
    async fn registers_uploaded_artifact() {
        let storage = Arc::new(MemoryStorage::new());
        let (files, store) = manager(storage.clone());
        let ctx = UploadContext::new(
            path_ctx(FileType::RenderedDocument),
            Uuid::new_v4(),
            "claude-sonnet",
            b"# Business case".to_vec(),
        );
        let group = ctx.path.source_group;

        let record = files.upload_and_register(ctx).await.unwrap();
        assert_eq!(record.resource_type, ResourceType::RenderedDocument);
        assert_eq!(record.mime_type, "text/markdown");
        assert_eq!(record.document_relationships.source_group, group);
        assert_eq!(storage.keys("artifacts"), vec![record.object_key()]);
        assert!(store.read(|t| t.resources.contains_key(&record.id)).unwrap());
        assert_eq!(files.download_text(&record).await.unwrap(), "# Business case");
    }

    #[tokio::test]
    async fn filename_fragment_matches_source_group() {
        let (files, _) = manager(Arc::new(MemoryStorage::new()));
        let ctx = UploadContext::new(
            path_ctx(FileType::ModelContributionRaw),
            Uuid::new_v4(),
            "claude-sonnet",
            b"{}".to_vec(),
        );
        let group = ctx.path.source_group.unwrap();

        let record = files.upload_and_register(ctx).await.unwrap();
        let parsed = deconstruct_storage_path(&record.file_name).unwrap();
        let expected: String = group.to_string().replace('-', "")[..8].to_string();
        assert_eq!(parsed.fragment.unwrap(), expected);
    }

    #[tokio::test]
    async fn collision_bumps_attempt_index() {
        let storage = Arc::new(MemoryStorage::new());
        let (files, _) = manager(storage.clone());
        let ctx = UploadContext::new(
            path_ctx(FileType::HeaderContext),
            Uuid::new_v4(),
            "claude-sonnet",
            b"{}".to_vec(),
        );
        let taken = construct_storage_path(&ctx.path).full();
        storage.upload("artifacts", &taken, b"old".to_vec()).await.unwrap();

        let record = files.upload_and_register(ctx).await.unwrap();
        let parsed = deconstruct_storage_path(&record.file_name).unwrap();
        assert_eq!(parsed.attempt, 1);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let storage = Arc::new(MemoryStorage::new());
        let (files, store) = manager(storage.clone());
        let ctx = UploadContext::new(
            path_ctx(FileType::HeaderContext),
            Uuid::new_v4(),
            "claude-sonnet",
            b"{}".to_vec(),
        );
        for attempt in 0..MAX_UPLOAD_ATTEMPTS {
            let mut taken = ctx.path.clone();
            taken.attempt = attempt;
            storage
                .upload("artifacts", &construct_storage_path(&taken).full(), Vec::new())
                .await
                .unwrap();
        }

        let err = files.upload_and_register(ctx).await.unwrap_err();
        assert!(matches!(
            err,
            DialecticError::Storage(StorageError::AlreadyExists { .. })
        ));
        assert!(store.read(|t| t.resources.is_empty()).unwrap());
    }

    #[tokio::test]
    async fn continuation_chunk_requires_target() {
        let (files, _) = manager(Arc::new(MemoryStorage::new()));
        let mut path = path_ctx(FileType::ModelContributionRaw);
        path.turn_index = 1;
        let ctx = UploadContext::new(path, Uuid::new_v4(), "claude-sonnet", b"{}".to_vec());

        let err = files.upload_and_register(ctx).await.unwrap_err();
        assert!(matches!(err, DialecticError::Validation(_)));
    }

    struct StalledStorage;

    #[async_trait]
    impl ArtifactStorage for StalledStorage {
        async fn upload(&self, _: &str, _: &str, _: Vec<u8>) -> std::result::Result<(), StorageError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }

        async fn download(&self, _: &str, _: &str) -> std::result::Result<Vec<u8>, StorageError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn storage_calls_are_bounded() {
        let store = Arc::new(Store::in_memory());
        let files = FileManager::new(
            Arc::new(StalledStorage),
            store,
            "artifacts",
            Duration::from_millis(20),
        );
        let ctx = UploadContext::new(
            path_ctx(FileType::RenderedDocument),
            Uuid::new_v4(),
            "claude-sonnet",
            Vec::new(),
        );
        let err = files.upload_and_register(ctx).await.unwrap_err();
        assert!(matches!(err, DialecticError::Storage(StorageError::Timeout { .. })));
    }
}
