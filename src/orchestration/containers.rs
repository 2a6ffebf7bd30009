//! Per-run set of ensured buckets
//!
//! `ensure` runs the exists/create sequence at most once per bucket name for
//! the lifetime of the registry, however many tasks and entries target it.
//! Concurrent callers for the same name wait on the first one and share its
//! result, including a failure.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::core::error::StorageError;
use crate::core::retry::{RetryManager, RetryOptions};
use crate::core::traits::StorageCapability;

type EnsureCell = Arc<OnceCell<Result<(), StorageError>>>;

/// Buckets ensured during one publish run
pub struct ContainerRegistry {
    storage: Arc<dyn StorageCapability>,
    retry: RetryManager,
    ensured: Mutex<HashMap<String, EnsureCell>>,
}

impl ContainerRegistry {
    pub fn new(storage: Arc<dyn StorageCapability>, retry: RetryOptions) -> Self {
        Self {
            storage,
            retry: RetryManager::new(retry),
            ensured: Mutex::new(HashMap::new()),
        }
    }

    /// Make sure `bucket` exists, creating it if it is absent
    pub async fn ensure(&self, bucket: &str) -> Result<(), StorageError> {
        let cell = {
            let mut ensured = self.ensured.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(ensured.entry(bucket.to_string()).or_default())
        };

        cell.get_or_init(|| self.create_if_absent(bucket))
            .await
            .clone()
    }

    async fn create_if_absent(&self, bucket: &str) -> Result<(), StorageError> {
        let result = self.check_and_create(bucket).await;

        match &result {
            Ok(()) => info!(bucket, "Bucket ensured"),
            Err(e) => warn!(bucket, error = %e, "Bucket unavailable"),
        }
        result
    }

    async fn check_and_create(&self, bucket: &str) -> Result<(), StorageError> {
        // Only the existence check is retried; creation is never repeated.
        let exists = self
            .retry
            .retry(|| self.storage.bucket_exists(bucket))
            .await?;

        if !exists {
            info!(bucket, "Creating bucket");
            self.storage.create_bucket(bucket).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::testing::ScriptedStorage;
    use futures::future::join_all;
    use std::time::Duration;

    fn registry(storage: &ScriptedStorage) -> ContainerRegistry {
        ContainerRegistry::new(Arc::new(storage.clone()), RetryOptions::immediate(3))
    }

    #[tokio::test]
    async fn test_creates_missing_bucket_once() {
        let storage = ScriptedStorage::new();
        let registry = registry(&storage);

        registry.ensure("releases").await.unwrap();
        registry.ensure("releases").await.unwrap();

        assert_eq!(storage.create_bucket_calls("releases"), 1);
        assert_eq!(storage.bucket_exists_calls(), 1);
    }

    #[tokio::test]
    async fn test_existing_bucket_is_not_created() {
        let storage = ScriptedStorage::new().with_bucket("releases");
        let registry = registry(&storage);

        registry.ensure("releases").await.unwrap();

        assert_eq!(storage.create_bucket_calls("releases"), 0);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_creation() {
        let storage = ScriptedStorage::new().with_bucket_delay(Duration::from_millis(20));
        let registry = registry(&storage);

        let results = join_all((0..16).map(|_| registry.ensure("releases"))).await;

        assert!(results.iter().all(Result::is_ok));
        assert_eq!(storage.create_bucket_calls("releases"), 1);
        assert_eq!(storage.bucket_exists_calls(), 1);
    }

    #[tokio::test]
    async fn test_failure_is_cached_for_the_run() {
        let storage = ScriptedStorage::new().with_failing_bucket(
            "locked",
            StorageError::AccessDenied {
                bucket: "locked".to_string(),
                message: "forbidden".to_string(),
            },
        );
        let registry = registry(&storage);

        assert!(registry.ensure("locked").await.is_err());
        assert!(registry.ensure("locked").await.is_err());

        // AccessDenied is not retryable, and the cached failure is not re-checked.
        assert_eq!(storage.bucket_exists_calls(), 1);
    }

    #[tokio::test]
    async fn test_distinct_buckets_are_independent() {
        let storage = ScriptedStorage::new().with_bucket("existing");
        let registry = registry(&storage);

        registry.ensure("existing").await.unwrap();
        registry.ensure("fresh").await.unwrap();

        assert_eq!(storage.create_bucket_calls("existing"), 0);
        assert_eq!(storage.create_bucket_calls("fresh"), 1);
    }
}
