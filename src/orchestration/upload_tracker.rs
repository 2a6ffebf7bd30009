//! Upload Tracker - Drives upload tasks to a terminal state
//!
//! Features:
//! - Bounded number of transfers in flight
//! - Whole-file restart on retryable failures, up to the attempt ceiling
//! - Every handle observed through an explicit await, never polled
//! - Run interruption cancels in-flight transfers and settles every task

use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::core::cancellation::RunCancellation;
use crate::core::config::DEFAULT_MAX_CONCURRENCY;
use crate::core::error::StorageError;
use crate::core::retry::RetryOptions;
use crate::core::state_machine::{TaskState, TaskStateMachine};
use crate::core::traits::{StorageCapability, TransferState};
use crate::core::types::{OutcomeState, UploadOutcome, UploadTask};

/// Upload tracker options
#[derive(Debug, Clone)]
pub struct TrackerOptions {
    /// Maximum concurrent transfers (default: 8)
    pub max_concurrency: usize,

    pub retry: RetryOptions,

    /// How long a cancelled transfer may take to stop before it is abandoned
    pub cancel_grace: Duration,
}

impl Default for TrackerOptions {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            retry: RetryOptions::default(),
            cancel_grace: Duration::from_secs(5),
        }
    }
}

/// Result of a single upload attempt
enum Attempt {
    Succeeded,
    Failed(StorageError),
    Interrupted,
}

/// UploadTracker - Runs upload tasks against one storage session
pub struct UploadTracker {
    storage: Arc<dyn StorageCapability>,
    options: TrackerOptions,
}

impl UploadTracker {
    pub fn new(storage: Arc<dyn StorageCapability>, options: TrackerOptions) -> Self {
        Self { storage, options }
    }

    pub fn options(&self) -> &TrackerOptions {
        &self.options
    }

    /// Run every task to a terminal state
    ///
    /// Returns one outcome per task, in submission order.
    pub async fn submit(
        &self,
        tasks: Vec<UploadTask>,
        cancellation: &RunCancellation,
    ) -> Vec<UploadOutcome> {
        if tasks.is_empty() {
            return Vec::new();
        }

        let max_concurrency = self.options.max_concurrency.max(1);
        debug!(tasks = tasks.len(), max_concurrency, "Submitting uploads");

        let mut outcomes: Vec<(usize, UploadOutcome)> = stream::iter(tasks.into_iter().enumerate())
            .map(|(index, task)| async move { (index, self.drive(task, cancellation).await) })
            .buffer_unordered(max_concurrency)
            .collect()
            .await;

        outcomes.sort_by_key(|(index, _)| *index);
        outcomes.into_iter().map(|(_, outcome)| outcome).collect()
    }

    /// Drive one task through its attempts
    async fn drive(&self, task: UploadTask, cancellation: &RunCancellation) -> UploadOutcome {
        let mut machine = TaskStateMachine::new(task.to_string());
        let mut last_error: Option<String> = None;
        let retry = &self.options.retry;

        loop {
            if cancellation.is_cancelled() {
                advance(&mut machine, &task, TaskState::Cancelled);
                last_error = Some(interrupted_message(cancellation));
                warn!(bucket = %task.container, key = %task.key, "Upload skipped, run interrupted");
                break;
            }

            advance(&mut machine, &task, TaskState::InFlight);
            let attempt = machine.attempts();
            info!(
                bucket = %task.container,
                key = %task.key,
                attempt,
                size = task.size_bytes,
                "Upload started"
            );

            match self.attempt(&task, cancellation).await {
                Attempt::Succeeded => {
                    advance(&mut machine, &task, TaskState::Succeeded);
                    info!(bucket = %task.container, key = %task.key, attempt, "Upload succeeded");
                    break;
                }
                Attempt::Interrupted => {
                    advance(&mut machine, &task, TaskState::Cancelled);
                    last_error = Some(interrupted_message(cancellation));
                    warn!(bucket = %task.container, key = %task.key, attempt, "Upload cancelled, run interrupted");
                    break;
                }
                Attempt::Failed(StorageError::Cancelled) => {
                    advance(&mut machine, &task, TaskState::Cancelled);
                    last_error = Some(StorageError::Cancelled.to_string());
                    warn!(bucket = %task.container, key = %task.key, attempt, "Upload cancelled by storage");
                    break;
                }
                Attempt::Failed(e) => {
                    last_error = Some(e.to_string());

                    if !e.is_retryable() || !retry.has_attempts_left(attempt) {
                        advance(&mut machine, &task, TaskState::Failed);
                        error!(
                            bucket = %task.container,
                            key = %task.key,
                            attempt,
                            error = %e,
                            "Upload failed"
                        );
                        break;
                    }

                    advance(&mut machine, &task, TaskState::Retrying);
                    let delay = retry.delay_for(attempt);
                    warn!(
                        bucket = %task.container,
                        key = %task.key,
                        attempt,
                        max_attempts = retry.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Upload failed, retrying"
                    );

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancellation.cancelled() => {}
                    }
                }
            }
        }

        debug!(
            task = %task,
            elapsed_ms = machine.elapsed_ms(),
            history = %machine.history(),
            "Upload settled"
        );

        UploadOutcome {
            state: machine.outcome_state().unwrap_or(OutcomeState::Failed),
            attempts: machine.attempts(),
            last_error,
            task,
        }
    }

    /// Start one transfer and await its terminal state
    async fn attempt(&self, task: &UploadTask, cancellation: &RunCancellation) -> Attempt {
        let started = tokio::select! {
            biased;
            _ = cancellation.cancelled() => return Attempt::Interrupted,
            started = self.storage.upload(&task.container, &task.key, &task.local_path, &task.metadata) => started,
        };

        let mut handle = match started {
            Ok(handle) => handle,
            Err(e) => return Attempt::Failed(e),
        };

        let waited = tokio::select! {
            result = handle.wait() => Some(result),
            _ = cancellation.cancelled() => None,
        };

        match waited {
            Some(Ok(())) if handle.state() == TransferState::Cancelled => {
                Attempt::Failed(StorageError::Cancelled)
            }
            Some(Ok(())) => Attempt::Succeeded,
            Some(Err(e)) => Attempt::Failed(e),
            None => {
                handle.cancel();
                if tokio::time::timeout(self.options.cancel_grace, handle.wait())
                    .await
                    .is_err()
                {
                    warn!(task = %task, "Transfer did not stop after cancellation");
                }
                Attempt::Interrupted
            }
        }
    }
}

fn advance(machine: &mut TaskStateMachine, task: &UploadTask, to: TaskState) {
    if let Err(e) = machine.transition(to) {
        error!(task = %task, error = %e, "Illegal upload state transition");
    }
}

fn interrupted_message(cancellation: &RunCancellation) -> String {
    match cancellation.reason() {
        Some(reason) => format!("Publish run interrupted: {}", reason),
        None => "Publish run interrupted".to_string(),
    }
}
