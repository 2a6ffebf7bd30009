//! Scripted in-memory storage for tests
//!
//! Every upload of a key consumes the next step of that key's script; once the
//! script is exhausted uploads succeed. All calls are counted so tests can
//! assert how the publisher used the service.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::core::config::StorageProfile;
use crate::core::error::StorageError;
use crate::core::traits::{StorageCapability, StorageProvider, UploadHandle};
use crate::core::types::UploadMetadata;
use crate::storage::handle::SpawnedUpload;

/// What one upload attempt does
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptStep {
    Succeed,
    Fail(StorageError),
    /// The transfer ends in the cancelled state
    Cancel,
    /// The transfer never finishes on its own
    Hang,
}

impl ScriptStep {
    /// A retryable network failure
    pub fn network_failure() -> Self {
        Self::Fail(StorageError::Network {
            message: "connection reset by peer".to_string(),
            retryable: true,
        })
    }
}

#[derive(Debug, Default)]
struct State {
    scripts: HashMap<String, VecDeque<ScriptStep>>,
    buckets: HashSet<String>,
    failing_buckets: HashMap<String, StorageError>,
    connect_error: Option<StorageError>,
    bucket_delay: Duration,
    upload_delay: Duration,
    create_calls: HashMap<String, usize>,
    upload_calls: HashMap<String, usize>,
    uploaded: Vec<(String, String)>,
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<State>,
    connect_calls: AtomicUsize,
    bucket_exists_calls: AtomicUsize,
    close_calls: AtomicUsize,
    active_uploads: AtomicUsize,
    max_active_uploads: AtomicUsize,
    aborted_uploads: AtomicUsize,
}

/// Scripted storage provider and capability
#[derive(Debug, Clone, Default)]
pub struct ScriptedStorage {
    inner: Arc<Inner>,
}

/// Tracks one running transfer; counts it as aborted if dropped unfinished
struct ActiveTransfer {
    inner: Arc<Inner>,
    finished: bool,
}

impl ActiveTransfer {
    fn start(inner: Arc<Inner>) -> Self {
        let active = inner.active_uploads.fetch_add(1, Ordering::SeqCst) + 1;
        inner.max_active_uploads.fetch_max(active, Ordering::SeqCst);
        Self {
            inner,
            finished: false,
        }
    }
}

impl Drop for ActiveTransfer {
    fn drop(&mut self) {
        self.inner.active_uploads.fetch_sub(1, Ordering::SeqCst);
        if !self.finished {
            self.inner.aborted_uploads.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl ScriptedStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Mark a bucket as already existing
    pub fn with_bucket(self, bucket: &str) -> Self {
        self.state().buckets.insert(bucket.to_string());
        self
    }

    /// Set the steps for successive uploads of `key`
    pub fn with_script(self, key: &str, steps: Vec<ScriptStep>) -> Self {
        self.state().scripts.insert(key.to_string(), steps.into());
        self
    }

    /// Make every check of `bucket` fail
    pub fn with_failing_bucket(self, bucket: &str, error: StorageError) -> Self {
        self.state().failing_buckets.insert(bucket.to_string(), error);
        self
    }

    /// Make session creation fail
    pub fn with_connect_error(self, error: StorageError) -> Self {
        self.state().connect_error = Some(error);
        self
    }

    /// Delay every bucket call, widening race windows
    pub fn with_bucket_delay(self, delay: Duration) -> Self {
        self.state().bucket_delay = delay;
        self
    }

    /// Delay every transfer before its scripted step runs
    pub fn with_upload_delay(self, delay: Duration) -> Self {
        self.state().upload_delay = delay;
        self
    }

    pub fn connect_calls(&self) -> usize {
        self.inner.connect_calls.load(Ordering::SeqCst)
    }

    pub fn bucket_exists_calls(&self) -> usize {
        self.inner.bucket_exists_calls.load(Ordering::SeqCst)
    }

    pub fn create_bucket_calls(&self, bucket: &str) -> usize {
        self.state().create_calls.get(bucket).copied().unwrap_or(0)
    }

    pub fn total_create_bucket_calls(&self) -> usize {
        self.state().create_calls.values().sum()
    }

    pub fn upload_calls(&self, key: &str) -> usize {
        self.state().upload_calls.get(key).copied().unwrap_or(0)
    }

    pub fn total_upload_calls(&self) -> usize {
        self.state().upload_calls.values().sum()
    }

    pub fn close_calls(&self) -> usize {
        self.inner.close_calls.load(Ordering::SeqCst)
    }

    /// Transfers currently running
    pub fn active_uploads(&self) -> usize {
        self.inner.active_uploads.load(Ordering::SeqCst)
    }

    /// Highest number of transfers that ran at the same time
    pub fn max_active_uploads(&self) -> usize {
        self.inner.max_active_uploads.load(Ordering::SeqCst)
    }

    /// Transfers stopped before they finished
    pub fn aborted_uploads(&self) -> usize {
        self.inner.aborted_uploads.load(Ordering::SeqCst)
    }

    /// `(bucket, key)` of every successful transfer, in completion order
    pub fn uploaded(&self) -> Vec<(String, String)> {
        self.state().uploaded.clone()
    }

    pub fn has_bucket(&self, bucket: &str) -> bool {
        self.state().buckets.contains(bucket)
    }
}

#[async_trait]
impl StorageProvider for ScriptedStorage {
    async fn connect(
        &self,
        _profile: &StorageProfile,
    ) -> Result<Arc<dyn StorageCapability>, StorageError> {
        self.inner.connect_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.state().connect_error.clone() {
            return Err(error);
        }
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait]
impl StorageCapability for ScriptedStorage {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool, StorageError> {
        self.inner.bucket_exists_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.state().bucket_delay;
        tokio::time::sleep(delay).await;

        let state = self.state();
        if let Some(error) = state.failing_buckets.get(bucket) {
            return Err(error.clone());
        }
        Ok(state.buckets.contains(bucket))
    }

    async fn create_bucket(&self, bucket: &str) -> Result<(), StorageError> {
        let delay = {
            let mut state = self.state();
            *state.create_calls.entry(bucket.to_string()).or_default() += 1;
            state.bucket_delay
        };
        tokio::time::sleep(delay).await;

        let mut state = self.state();
        if let Some(error) = state.failing_buckets.get(bucket) {
            return Err(error.clone());
        }
        state.buckets.insert(bucket.to_string());
        Ok(())
    }

    async fn upload(
        &self,
        bucket: &str,
        key: &str,
        _local_path: &Path,
        _metadata: &UploadMetadata,
    ) -> Result<Box<dyn UploadHandle>, StorageError> {
        let (step, delay) = {
            let mut state = self.state();
            *state.upload_calls.entry(key.to_string()).or_default() += 1;

            if !state.buckets.contains(bucket) {
                return Err(StorageError::InvalidBucket {
                    bucket: bucket.to_string(),
                    message: "bucket does not exist".to_string(),
                });
            }

            let step = state
                .scripts
                .get_mut(key)
                .and_then(VecDeque::pop_front)
                .unwrap_or(ScriptStep::Succeed);
            (step, state.upload_delay)
        };

        let storage = self.clone();
        let bucket = bucket.to_string();
        let key = key.to_string();
        let transfer = ActiveTransfer::start(Arc::clone(&self.inner));

        Ok(Box::new(SpawnedUpload::spawn(async move {
            // Bound whole, so the guard lives as long as the transfer.
            let mut transfer = transfer;
            tokio::time::sleep(delay).await;

            let result = match step {
                ScriptStep::Succeed => {
                    storage.state().uploaded.push((bucket, key));
                    Ok(())
                }
                ScriptStep::Fail(error) => Err(error),
                ScriptStep::Cancel => Err(StorageError::Cancelled),
                ScriptStep::Hang => {
                    std::future::pending::<()>().await;
                    Ok(())
                }
            };

            transfer.finished = true;
            result
        })))
    }

    async fn close(&self) {
        self.inner.close_calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::traits::TransferState;
    use crate::core::types::UploadTask;

    fn metadata() -> UploadMetadata {
        UploadTask::new("releases", "app.zip", "/ws/app.zip", 4).metadata
    }

    #[tokio::test]
    async fn test_script_is_consumed_in_order() {
        let storage = ScriptedStorage::new()
            .with_bucket("releases")
            .with_script("app.zip", vec![ScriptStep::network_failure(), ScriptStep::Succeed]);

        let mut first = storage
            .upload("releases", "app.zip", Path::new("/ws/app.zip"), &metadata())
            .await
            .unwrap();
        assert!(first.wait().await.is_err());
        assert_eq!(first.state(), TransferState::Failed);

        let mut second = storage
            .upload("releases", "app.zip", Path::new("/ws/app.zip"), &metadata())
            .await
            .unwrap();
        assert!(second.wait().await.is_ok());

        assert_eq!(storage.upload_calls("app.zip"), 2);
        assert_eq!(
            storage.uploaded(),
            vec![("releases".to_string(), "app.zip".to_string())]
        );
    }

    #[tokio::test]
    async fn test_upload_requires_bucket() {
        let storage = ScriptedStorage::new();

        let result = storage
            .upload("releases", "app.zip", Path::new("/ws/app.zip"), &metadata())
            .await;

        assert!(matches!(result, Err(StorageError::InvalidBucket { .. })));
    }

    #[tokio::test]
    async fn test_cancelled_hanging_upload_is_counted_as_aborted() {
        let storage = ScriptedStorage::new()
            .with_bucket("releases")
            .with_script("app.zip", vec![ScriptStep::Hang]);

        let mut handle = storage
            .upload("releases", "app.zip", Path::new("/ws/app.zip"), &metadata())
            .await
            .unwrap();
        handle.cancel();

        assert_eq!(handle.wait().await, Err(StorageError::Cancelled));
        assert_eq!(storage.active_uploads(), 0);
        assert_eq!(storage.aborted_uploads(), 1);
    }

    #[tokio::test]
    async fn test_transfer_counts_as_active_until_finished() {
        let storage = ScriptedStorage::new()
            .with_bucket("releases")
            .with_upload_delay(Duration::from_millis(50));

        let mut handle = storage
            .upload("releases", "app.zip", Path::new("/ws/app.zip"), &metadata())
            .await
            .unwrap();
        assert_eq!(storage.active_uploads(), 1);

        handle.wait().await.unwrap();

        assert_eq!(storage.active_uploads(), 0);
        assert_eq!(storage.max_active_uploads(), 1);
        assert_eq!(storage.aborted_uploads(), 0);
    }

    #[tokio::test]
    async fn test_bucket_calls_are_counted() {
        let storage = ScriptedStorage::new();

        assert!(!storage.bucket_exists("releases").await.unwrap());
        storage.create_bucket("releases").await.unwrap();

        assert!(storage.has_bucket("releases"));
        assert_eq!(storage.bucket_exists_calls(), 1);
        assert_eq!(storage.create_bucket_calls("releases"), 1);
    }
}
