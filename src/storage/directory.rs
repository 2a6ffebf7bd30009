//! Local directory storage backend
//!
//! Each bucket is a sub-directory of the root and each object a file below
//! it. Used for dry runs and end-to-end tests without a storage service.

use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::core::config::StorageProfile;
use crate::core::error::StorageError;
use crate::core::traits::{StorageCapability, StorageProvider, UploadHandle};
use crate::core::types::UploadMetadata;
use crate::storage::handle::SpawnedUpload;

/// Storage backend writing objects below a local directory
#[derive(Debug, Clone)]
pub struct DirectoryStorage {
    root: PathBuf,
}

impl DirectoryStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of an object, whether or not it exists
    pub fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf, StorageError> {
        let bucket_path = self.bucket_path(bucket)?;
        validate_key(key)?;
        Ok(bucket_path.join(key))
    }

    fn bucket_path(&self, bucket: &str) -> Result<PathBuf, StorageError> {
        validate_bucket_name(bucket)?;
        Ok(self.root.join(bucket))
    }
}

/// Bucket names follow the usual object storage rules
fn validate_bucket_name(bucket: &str) -> Result<(), StorageError> {
    let invalid = |message: &str| StorageError::InvalidBucket {
        bucket: bucket.to_string(),
        message: message.to_string(),
    };

    if bucket.len() < 3 || bucket.len() > 63 {
        return Err(invalid("must be between 3 and 63 characters long"));
    }
    if !bucket
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
    {
        return Err(invalid(
            "may only contain lowercase letters, digits, dots and hyphens",
        ));
    }
    let first_last_ok = |c: Option<char>| c.is_some_and(|c| c.is_ascii_alphanumeric());
    if !first_last_ok(bucket.chars().next()) || !first_last_ok(bucket.chars().last()) {
        return Err(invalid("must start and end with a letter or digit"));
    }
    if bucket.contains("..") {
        return Err(invalid("must not contain two adjacent dots"));
    }

    Ok(())
}

fn validate_key(key: &str) -> Result<(), StorageError> {
    let escapes = Path::new(key)
        .components()
        .any(|c| !matches!(c, Component::Normal(_)));

    if key.is_empty() || escapes {
        return Err(StorageError::Other {
            message: format!("invalid object key '{}'", key),
        });
    }
    Ok(())
}

#[async_trait]
impl StorageProvider for DirectoryStorage {
    async fn connect(
        &self,
        profile: &StorageProfile,
    ) -> Result<Arc<dyn StorageCapability>, StorageError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| StorageError::io(self.root.display().to_string(), &e))?;

        info!(
            profile = profile.name(),
            access_key = %profile.masked_access_key(),
            root = %self.root.display(),
            "Opened directory storage session"
        );
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait]
impl StorageCapability for DirectoryStorage {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool, StorageError> {
        let path = self.bucket_path(bucket)?;
        Ok(tokio::fs::metadata(&path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false))
    }

    async fn create_bucket(&self, bucket: &str) -> Result<(), StorageError> {
        let path = self.bucket_path(bucket)?;
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| StorageError::io(path.display().to_string(), &e))?;
        debug!(bucket, "Created bucket directory");
        Ok(())
    }

    async fn upload(
        &self,
        bucket: &str,
        key: &str,
        local_path: &Path,
        metadata: &UploadMetadata,
    ) -> Result<Box<dyn UploadHandle>, StorageError> {
        if !self.bucket_exists(bucket).await? {
            return Err(StorageError::InvalidBucket {
                bucket: bucket.to_string(),
                message: "bucket does not exist".to_string(),
            });
        }

        let destination = self.object_path(bucket, key)?;
        let source = local_path.to_path_buf();
        let key = key.to_string();
        let expected = metadata.content_length;

        Ok(Box::new(SpawnedUpload::spawn(async move {
            if let Some(parent) = destination.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| StorageError::io(parent.display().to_string(), &e))?;
            }

            // Write next to the target and rename, so readers never see a partial object.
            let mut partial = destination.clone().into_os_string();
            partial.push(".partial");
            let partial = PathBuf::from(partial);
            let copied = tokio::fs::copy(&source, &partial)
                .await
                .map_err(|e| StorageError::io(source.display().to_string(), &e))?;

            if copied != expected {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(StorageError::SizeMismatch {
                    key,
                    expected,
                    actual: copied,
                });
            }

            tokio::fs::rename(&partial, &destination)
                .await
                .map_err(|e| StorageError::io(destination.display().to_string(), &e))?;
            Ok(())
        })))
    }
}
