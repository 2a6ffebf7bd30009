//! Run interruption signal

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::info;

/// Cloneable signal used by the host to interrupt a publish run
///
/// All clones observe the same signal. The first `cancel` wins; its reason is
/// kept for the report.
#[derive(Debug, Clone)]
pub struct RunCancellation {
    sender: Arc<watch::Sender<Option<String>>>,
    receiver: watch::Receiver<Option<String>>,
}

impl Default for RunCancellation {
    fn default() -> Self {
        Self::new()
    }
}

impl RunCancellation {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(None);
        Self {
            sender: Arc::new(sender),
            receiver,
        }
    }

    /// Request interruption of the run
    pub fn cancel(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let changed = self.sender.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason.clone());
            true
        });

        if changed {
            info!(%reason, "Publish run interruption requested");
        }
    }

    /// Interrupt the run once `timeout` has elapsed
    pub fn cancel_after(&self, timeout: Duration) {
        let cancellation = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    cancellation.cancel(format!("timeout ({timeout:?})"));
                }
                _ = cancellation.cancelled() => {}
            }
        });
    }

    pub fn is_cancelled(&self) -> bool {
        self.receiver.borrow().is_some()
    }

    pub fn reason(&self) -> Option<String> {
        self.receiver.borrow().clone()
    }

    /// Resolves once the run has been interrupted
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        // The sender lives as long as `self`, so the channel cannot close here.
        let _ = receiver.wait_for(Option::is_some).await;
    }
}
