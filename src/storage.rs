use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, error, instrument};

pub const MAX_KEY_LENGTH: usize = 1024;
pub const MAX_BUCKET_LENGTH: usize = 63;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("object not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },

    #[error("storage io failed for {bucket}/{key}: {reason}")]
    Io {
        bucket: String,
        key: String,
        reason: String,
    },

    #[error("invalid object key {bucket}/{key}: {reason}")]
    InvalidKey {
        bucket: String,
        key: String,
        reason: String,
    },
}

impl StorageError {
    pub fn bucket(&self) -> &str {
        match self {
            StorageError::NotFound { bucket, .. }
            | StorageError::Io { bucket, .. }
            | StorageError::InvalidKey { bucket, .. } => bucket,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            StorageError::NotFound { key, .. }
            | StorageError::Io { key, .. }
            | StorageError::InvalidKey { key, .. } => key,
        }
    }
}

// ============================================================================
// Storage Trait
// ============================================================================

/// Bucket/key object store holding source images and redacted outputs.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    async fn fetch(&self, bucket: &str, key: &str) -> Result<Bytes, StorageError>;
    async fn store(&self, data: Bytes, bucket: &str, key: &str) -> Result<(), StorageError>;
}

fn invalid(bucket: &str, key: &str, reason: impl Into<String>) -> StorageError {
    StorageError::InvalidKey {
        bucket: bucket.to_string(),
        key: key.chars().take(80).collect(),
        reason: reason.into(),
    }
}

/// Rejects keys that could escape a bucket when mapped onto a filesystem.
pub fn validate_location(bucket: &str, key: &str) -> Result<(), StorageError> {
    if bucket.is_empty() || bucket.len() > MAX_BUCKET_LENGTH {
        return Err(invalid(bucket, key, "bucket name length out of range"));
    }
    if !bucket
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        || bucket.contains("..")
    {
        return Err(invalid(bucket, key, "bucket name contains invalid characters"));
    }

    if key.trim().is_empty() {
        return Err(invalid(bucket, key, "key cannot be empty"));
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(invalid(
            bucket,
            key,
            format!("key exceeds maximum length of {MAX_KEY_LENGTH} bytes"),
        ));
    }
    if key.starts_with('/') || key.starts_with('\\') {
        return Err(invalid(bucket, key, "key cannot start with path separator"));
    }
    if key.split(|c: char| c == '/' || c == '\\').any(|segment| segment == "..") {
        return Err(invalid(bucket, key, "key cannot contain path traversal sequences"));
    }
    if key.chars().any(|c| c.is_control()) {
        return Err(invalid(bucket, key, "key contains control characters"));
    }
    Ok(())
}

// ============================================================================
// In-memory Implementation
// ============================================================================

#[derive(Debug, Default)]
pub struct InMemoryStore {
    objects: RwLock<HashMap<(String, String), Bytes>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, bucket: &str, key: &str, data: impl Into<Bytes>) {
        self.objects
            .write()
            .await
            .insert((bucket.to_string(), key.to_string()), data.into());
    }

    pub async fn contains(&self, bucket: &str, key: &str) -> bool {
        self.objects
            .read()
            .await
            .contains_key(&(bucket.to_string(), key.to_string()))
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }
}

#[async_trait::async_trait]
impl ObjectStore for InMemoryStore {
    async fn fetch(&self, bucket: &str, key: &str) -> Result<Bytes, StorageError> {
        validate_location(bucket, key)?;
        self.objects
            .read()
            .await
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
    }

    async fn store(&self, data: Bytes, bucket: &str, key: &str) -> Result<(), StorageError> {
        validate_location(bucket, key)?;
        self.insert(bucket, key, data).await;
        Ok(())
    }
}

// ============================================================================
// Filesystem Implementation
// ============================================================================

/// Maps `bucket/key` onto `root/bucket/key`.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, bucket: &str, key: &str) -> Result<PathBuf, StorageError> {
        validate_location(bucket, key)?;
        Ok(self.root.join(bucket).join(key))
    }
}

fn io_error(bucket: &str, key: &str, e: std::io::Error) -> StorageError {
    if e.kind() == ErrorKind::NotFound {
        StorageError::NotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        }
    } else {
        StorageError::Io {
            bucket: bucket.to_string(),
            key: key.to_string(),
            reason: e.to_string(),
        }
    }
}

#[async_trait::async_trait]
impl ObjectStore for FsStore {
    #[instrument(skip(self))]
    async fn fetch(&self, bucket: &str, key: &str) -> Result<Bytes, StorageError> {
        let path = self.path_for(bucket, key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => {
                debug!(size = data.len(), "object fetched");
                Ok(Bytes::from(data))
            }
            Err(e) => {
                error!(error = %e, "object fetch failed");
                Err(io_error(bucket, key, e))
            }
        }
    }

    #[instrument(skip(self, data), fields(size = data.len()))]
    async fn store(&self, data: Bytes, bucket: &str, key: &str) -> Result<(), StorageError> {
        let path = self.path_for(bucket, key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(bucket, key, e))?;
        }
        tokio::fs::write(&path, &data).await.map_err(|e| {
            error!(error = %e, "object store failed");
            io_error(bucket, key, e)
        })
    }
}
