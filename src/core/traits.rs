//! Collaborator contracts
//!
//! The publisher never talks to a storage service, a file system or the host
//! build directly. It goes through these traits so each collaborator can be
//! swapped or stubbed.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::core::cancellation::RunCancellation;
use crate::core::config::StorageProfile;
use crate::core::error::StorageError;
use crate::core::types::{BuildResult, PublishReport, UploadMetadata};

// ============================================================================
// Variable expansion
// ============================================================================

/// Macro substitution in configured patterns and bucket names
pub trait VariableExpansion: Send + Sync {
    /// Replace macros in `template` with values from `vars`.
    ///
    /// Unknown macros are left literal.
    fn expand(&self, template: &str, vars: &HashMap<String, String>) -> String;
}

// ============================================================================
// Workspace
// ============================================================================

/// Access to the files of a build workspace
#[async_trait]
pub trait WorkspaceResolver: Send + Sync {
    /// List the files matching an Ant-style mask
    async fn list(&self, pattern: &str) -> anyhow::Result<Vec<PathBuf>>;

    async fn exists(&self, path: &Path) -> bool;

    async fn is_directory(&self, path: &Path) -> bool;

    /// File length in bytes
    async fn length(&self, path: &Path) -> anyhow::Result<u64>;

    /// MD5 digest of the file contents
    async fn digest(&self, path: &Path) -> anyhow::Result<[u8; 16]>;

    /// Explain why a mask matches nothing. Returns `None` when it matches.
    async fn validate_mask(&self, pattern: &str) -> Option<String>;
}

// ============================================================================
// Storage
// ============================================================================

/// State of one in-flight transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferState {
    InProgress,
    Succeeded,
    Failed,
    Cancelled,
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

/// Live handle on one transfer started by a storage capability
#[async_trait]
pub trait UploadHandle: Send {
    fn is_done(&self) -> bool;

    fn state(&self) -> TransferState;

    /// Wait for the transfer to reach a terminal state
    async fn wait(&mut self) -> Result<(), StorageError>;

    /// Abort the transfer. No-op once it is done.
    fn cancel(&self);
}

/// An authenticated storage session
#[async_trait]
pub trait StorageCapability: Send + Sync {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool, StorageError>;

    async fn create_bucket(&self, bucket: &str) -> Result<(), StorageError>;

    /// Start uploading `local_path` to `bucket/key`
    async fn upload(
        &self,
        bucket: &str,
        key: &str,
        local_path: &Path,
        metadata: &UploadMetadata,
    ) -> Result<Box<dyn UploadHandle>, StorageError>;

    /// Release the session. Called exactly once at the end of a run.
    async fn close(&self) {}
}

/// Creates storage sessions from profile credentials
#[async_trait]
pub trait StorageProvider: Send + Sync {
    async fn connect(
        &self,
        profile: &StorageProfile,
    ) -> Result<Arc<dyn StorageCapability>, StorageError>;
}

// ============================================================================
// Host integration
// ============================================================================

/// What the host build hands to a publisher
#[derive(Debug, Clone)]
pub struct BuildContext {
    /// Result of the build so far
    pub result: BuildResult,
    /// Build environment used for macro expansion
    pub variables: HashMap<String, String>,
    pub cancellation: RunCancellation,
}

impl BuildContext {
    pub fn new(result: BuildResult, variables: HashMap<String, String>) -> Self {
        Self {
            result,
            variables,
            cancellation: RunCancellation::new(),
        }
    }
}

/// Post-build step discovered and invoked by the host
#[async_trait]
pub trait Publisher: Send + Sync {
    fn name(&self) -> &str;

    /// Publish artifacts for a finished build.
    ///
    /// Returns `None` when the step decided not to run.
    async fn perform(&self, build: &BuildContext) -> Option<PublishReport>;
}
