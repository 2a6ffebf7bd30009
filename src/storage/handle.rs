//! Upload handle over a spawned tokio task

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::task::{AbortHandle, JoinHandle};

use crate::core::error::StorageError;
use crate::core::traits::{TransferState, UploadHandle};

const IN_PROGRESS: u8 = 0;
const SUCCEEDED: u8 = 1;
const FAILED: u8 = 2;
const CANCELLED: u8 = 3;

fn decode(state: u8) -> TransferState {
    match state {
        SUCCEEDED => TransferState::Succeeded,
        FAILED => TransferState::Failed,
        CANCELLED => TransferState::Cancelled,
        _ => TransferState::InProgress,
    }
}

fn encode(result: &Result<(), StorageError>) -> u8 {
    match result {
        Ok(()) => SUCCEEDED,
        Err(StorageError::Cancelled) => CANCELLED,
        Err(_) => FAILED,
    }
}

/// Runs a transfer future on the runtime and exposes it as an `UploadHandle`
///
/// `cancel` aborts the task. Dropping an unfinished handle aborts it too.
pub struct SpawnedUpload {
    state: Arc<AtomicU8>,
    join: Option<JoinHandle<Result<(), StorageError>>>,
    abort: AbortHandle,
    result: Option<Result<(), StorageError>>,
}

impl SpawnedUpload {
    pub fn spawn<F>(transfer: F) -> Self
    where
        F: Future<Output = Result<(), StorageError>> + Send + 'static,
    {
        let state = Arc::new(AtomicU8::new(IN_PROGRESS));
        let task_state = Arc::clone(&state);

        let join = tokio::spawn(async move {
            let result = transfer.await;
            // Loses against a concurrent cancel, which already set the final state.
            let _ = task_state.compare_exchange(
                IN_PROGRESS,
                encode(&result),
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
            result
        });
        let abort = join.abort_handle();

        Self {
            state,
            join: Some(join),
            abort,
            result: None,
        }
    }

    fn finish(&mut self, result: Result<(), StorageError>) -> Result<(), StorageError> {
        let result = if self.state.load(Ordering::SeqCst) == CANCELLED {
            Err(StorageError::Cancelled)
        } else {
            result
        };
        self.state.store(encode(&result), Ordering::SeqCst);
        self.result = Some(result.clone());
        result
    }
}

#[async_trait]
impl UploadHandle for SpawnedUpload {
    fn is_done(&self) -> bool {
        self.state.load(Ordering::SeqCst) != IN_PROGRESS
    }

    fn state(&self) -> TransferState {
        decode(self.state.load(Ordering::SeqCst))
    }

    async fn wait(&mut self) -> Result<(), StorageError> {
        if let Some(result) = &self.result {
            return result.clone();
        }

        let Some(join) = self.join.as_mut() else {
            return Err(StorageError::Cancelled);
        };

        // Borrowed so a wait dropped midway can be resumed later.
        let joined = join.await;
        self.join = None;

        let result = match joined {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(StorageError::Cancelled),
            Err(e) => Err(StorageError::Other {
                message: format!("upload task failed: {}", e),
            }),
        };

        self.finish(result)
    }

    fn cancel(&self) {
        if self
            .state
            .compare_exchange(IN_PROGRESS, CANCELLED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.abort.abort();
        }
    }
}

impl Drop for SpawnedUpload {
    fn drop(&mut self) {
        if self.join.is_some() && !self.is_done() {
            self.abort.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_successful_transfer() {
        let mut handle = SpawnedUpload::spawn(async { Ok(()) });

        assert_eq!(handle.wait().await, Ok(()));
        assert!(handle.is_done());
        assert_eq!(handle.state(), TransferState::Succeeded);
        // cached
        assert_eq!(handle.wait().await, Ok(()));
    }

    #[tokio::test]
    async fn test_failed_transfer() {
        let mut handle = SpawnedUpload::spawn(async {
            Err(StorageError::Network {
                message: "connection reset".to_string(),
                retryable: true,
            })
        });

        assert!(handle.wait().await.is_err());
        assert_eq!(handle.state(), TransferState::Failed);
    }

    #[tokio::test]
    async fn test_transfer_reporting_cancellation() {
        let mut handle = SpawnedUpload::spawn(async { Err(StorageError::Cancelled) });

        assert_eq!(handle.wait().await, Err(StorageError::Cancelled));
        assert_eq!(handle.state(), TransferState::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_aborts_hanging_transfer() {
        let mut handle = SpawnedUpload::spawn(async {
            std::future::pending::<()>().await;
            Ok(())
        });

        assert!(!handle.is_done());
        handle.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), handle.wait())
            .await
            .unwrap();
        assert_eq!(result, Err(StorageError::Cancelled));
        assert_eq!(handle.state(), TransferState::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_after_completion_is_noop() {
        let mut handle = SpawnedUpload::spawn(async { Ok(()) });
        handle.wait().await.unwrap();

        handle.cancel();

        assert_eq!(handle.state(), TransferState::Succeeded);
        assert_eq!(handle.wait().await, Ok(()));
    }
}
