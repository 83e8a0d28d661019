//! Blob storage seam and the two adapters the crate ships with.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Error)]
pub enum StorageError {
    /// Paths are unique per attempt, so an existing object means a collision.
    #[error("object already exists: {bucket}/{path}")]
    AlreadyExists { bucket: String, path: String },

    #[error("object not found: {bucket}/{path}")]
    NotFound { bucket: String, path: String },

    #[error("storage call timed out after {timeout_ms}ms: {path}")]
    Timeout { path: String, timeout_ms: u64 },

    #[error("invalid object path: {0}")]
    InvalidPath(String),

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("storage IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Append-only object storage.
#[async_trait]
pub trait ArtifactStorage: Send + Sync {
    /// Store `bytes` at `path`. Fails with [`StorageError::AlreadyExists`]
    /// instead of overwriting.
    async fn upload(&self, bucket: &str, path: &str, bytes: Vec<u8>) -> Result<(), StorageError>;

    async fn download(&self, bucket: &str, path: &str) -> Result<Vec<u8>, StorageError>;
}

/// In-process storage, used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    objects: Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Object keys currently stored in `bucket`, sorted.
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        let Ok(objects) = self.objects.lock() else {
            return Vec::new();
        };
        let mut keys: Vec<String> = objects
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, p)| p.clone())
            .collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl ArtifactStorage for MemoryStorage {
    async fn upload(&self, bucket: &str, path: &str, bytes: Vec<u8>) -> Result<(), StorageError> {
        let mut objects = self
            .objects
            .lock()
            .map_err(|_| StorageError::Backend("memory storage lock poisoned".into()))?;
        let key = (bucket.to_string(), path.to_string());
        if objects.contains_key(&key) {
            return Err(StorageError::AlreadyExists {
                bucket: bucket.to_string(),
                path: path.to_string(),
            });
        }
        objects.insert(key, bytes);
        Ok(())
    }

    async fn download(&self, bucket: &str, path: &str) -> Result<Vec<u8>, StorageError> {
        let objects = self
            .objects
            .lock()
            .map_err(|_| StorageError::Backend("memory storage lock poisoned".into()))?;
        objects
            .get(&(bucket.to_string(), path.to_string()))
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                bucket: bucket.to_string(),
                path: path.to_string(),
            })
    }
}

/// Storage rooted at a local directory: `{root}/{bucket}/{path}`.
#[derive(Debug, Clone)]
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, bucket: &str, path: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(path);
        let escapes = relative.components().any(|c| {
            !matches!(c, std::path::Component::Normal(_))
        });
        if bucket.is_empty() || bucket.contains(['/', '\\']) || escapes {
            return Err(StorageError::InvalidPath(format!("{bucket}/{path}")));
        }
        Ok(self.root.join(bucket).join(relative))
    }
}

#[async_trait]
impl ArtifactStorage for FsStorage {
    async fn upload(&self, bucket: &str, path: &str, bytes: Vec<u8>) -> Result<(), StorageError> {
        let target = self.resolve(bucket, path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&target)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(StorageError::AlreadyExists {
                    bucket: bucket.to_string(),
                    path: path.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        file.write_all(&bytes).await?;
        file.flush().await?;
        Ok(())
    }

    async fn download(&self, bucket: &str, path: &str) -> Result<Vec<u8>, StorageError> {
        let target = self.resolve(bucket, path)?;
        match tokio::fs::read(&target).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StorageError::NotFound {
                bucket: bucket.to_string(),
                path: path.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }
}
