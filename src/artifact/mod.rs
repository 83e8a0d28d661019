//! Generated artifacts: deterministic storage paths, the blob storage seam,
//! the upload/registration choke point and source document lookup.

pub mod manager;
pub mod path;
pub mod sources;
pub mod storage;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::session::Stage;

pub use manager::{FileManager, MAX_UPLOAD_ATTEMPTS, UploadContext};
pub use path::{FileType, PathContext, StoragePath, construct_storage_path, deconstruct_storage_path};
pub use sources::{SourceDocument, SourceScope, SourceSelection, find_source_documents, select_sources};
pub use storage::{ArtifactStorage, FsStorage, MemoryStorage, StorageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    ModelContributionRaw,
    HeaderContext,
    AssembledJson,
    RenderedDocument,
}

impl ResourceType {
    pub fn file_type(&self) -> FileType {
        match self {
            ResourceType::ModelContributionRaw => FileType::ModelContributionRaw,
            ResourceType::HeaderContext => FileType::HeaderContext,
            ResourceType::AssembledJson => FileType::AssembledDocumentJson,
            ResourceType::RenderedDocument => FileType::RenderedDocument,
        }
    }
}

/// Lineage links carried by every resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRelationships {
    /// Stage slug to the id of the contribution that owns this resource in that stage.
    #[serde(default)]
    pub stages: BTreeMap<String, Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_group: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContributionMetrics {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub processing_time_ms: u64,
}

/// A registered artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub id: Uuid,
    pub project_id: Uuid,
    pub session_id: Uuid,
    pub job_id: Uuid,
    pub stage_slug: Stage,
    pub iteration_number: u32,
    pub storage_bucket: String,
    /// Directory part of the object key.
    pub storage_path: String,
    pub file_name: String,
    pub resource_type: ResourceType,
    pub document_key: String,
    pub model_id: String,
    pub document_relationships: DocumentRelationships,
    /// Chunk index within a continued contribution.
    pub turn_index: u32,
    /// First chunk of the contribution this chunk continues.
    pub target_contribution_id: Option<Uuid>,
    pub mime_type: String,
    pub size_bytes: u64,
    pub metrics: Option<ContributionMetrics>,
    pub created_at: DateTime<Utc>,
}

impl ResourceRecord {
    /// Full object key inside the bucket.
    pub fn object_key(&self) -> String {
        format!("{}/{}", self.storage_path, self.file_name)
    }

    pub fn source_group(&self) -> Option<Uuid> {
        self.document_relationships.source_group
    }

    /// Id of the first chunk of this contribution.
    pub fn contribution_root(&self) -> Uuid {
        self.target_contribution_id.unwrap_or(self.id)
    }
}
