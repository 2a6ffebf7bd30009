//! Value types shared by the orchestrator, the tracker and the caller
//!
//! Everything here is run-scoped: created during a publish run and discarded
//! once the caller has read the `PublishReport`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

use crate::core::error::PublishError;

/// Content type used for every uploaded artifact
pub const OCTET_STREAM: &str = "application/octet-stream";

// ============================================================================
// Configuration entries
// ============================================================================

/// One configured source pattern / destination bucket pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// File mask relative to the workspace root. Can contain macros and wildcards.
    #[serde(rename = "sourceFile")]
    pub source_file_pattern: String,

    /// Destination bucket. Can contain macros.
    #[serde(rename = "bucket")]
    pub destination_container: String,
}

impl Entry {
    pub fn new(source_file_pattern: impl Into<String>, destination_container: impl Into<String>) -> Self {
        Self {
            source_file_pattern: source_file_pattern.into(),
            destination_container: destination_container.into(),
        }
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.source_file_pattern, self.destination_container)
    }
}

// ============================================================================
// Upload tasks
// ============================================================================

/// Object metadata sent along with an upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadMetadata {
    pub content_length: u64,
    pub content_type: String,
    /// Base64 encoded MD5 of the file contents
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_md5: Option<String>,
}

/// One planned transfer from a local file to a bucket and key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadTask {
    pub container: String,
    pub key: String,
    pub local_path: PathBuf,
    pub size_bytes: u64,
    pub metadata: UploadMetadata,
}

impl UploadTask {
    pub fn new(
        container: impl Into<String>,
        key: impl Into<String>,
        local_path: impl Into<PathBuf>,
        size_bytes: u64,
    ) -> Self {
        Self {
            container: container.into(),
            key: key.into(),
            local_path: local_path.into(),
            size_bytes,
            metadata: UploadMetadata {
                content_length: size_bytes,
                content_type: OCTET_STREAM.to_string(),
                content_md5: None,
            },
        }
    }

    pub fn with_content_md5(mut self, content_md5: impl Into<String>) -> Self {
        self.metadata.content_md5 = Some(content_md5.into());
        self
    }
}

impl fmt::Display for UploadTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.container, self.key)
    }
}

/// Terminal state of one upload task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeState {
    Succeeded,
    Failed,
    Cancelled,
}

/// Final result of one upload task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadOutcome {
    pub task: UploadTask,
    pub state: OutcomeState,
    /// Number of uploads started for this task
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl UploadOutcome {
    pub fn is_success(&self) -> bool {
        self.state == OutcomeState::Succeeded
    }
}

// ============================================================================
// Diagnostics
// ============================================================================

/// Kind of non-fatal problem found while planning an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiagnosticKind {
    /// The pattern matched no files
    NoMatch,
    /// The pattern could not be resolved against the workspace
    ResolutionFailed,
    /// A matched path is missing, a directory or empty
    RejectedPath,
    /// The destination bucket could not be ensured
    ContainerUnavailable,
    /// Planning stopped because the run was interrupted
    Interrupted,
}

impl DiagnosticKind {
    /// Whether this diagnostic means something that should have been uploaded was not
    pub fn is_failure(&self) -> bool {
        !matches!(self, Self::NoMatch | Self::Interrupted)
    }
}

/// Non-fatal problem recorded in the report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// The entry as configured (`pattern -> bucket`)
    pub entry: String,
    pub kind: DiagnosticKind,
    pub message: String,
}

impl Diagnostic {
    pub fn new(entry: &Entry, kind: DiagnosticKind, message: impl Into<String>) -> Self {
        Self {
            entry: entry.to_string(),
            kind,
            message: message.into(),
        }
    }
}

// ============================================================================
// Report
// ============================================================================

/// Overall status of a publish run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    AllSucceeded,
    PartialFailure,
    Interrupted,
    Fatal,
}

/// Build result a host would typically derive from a report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildResult {
    Success,
    Unstable,
    Failure,
    Aborted,
}

/// Aggregate result of one publish run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishReport {
    pub run_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    pub status: RunStatus,
    pub outcomes: Vec<UploadOutcome>,
    pub diagnostics: Vec<Diagnostic>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fatal_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fatal_code: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl PublishReport {
    /// Report for a run that stopped before any upload
    pub fn fatal(
        run_id: Uuid,
        profile: Option<String>,
        error: &PublishError,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id,
            profile,
            status: RunStatus::Fatal,
            outcomes: Vec::new(),
            diagnostics: Vec::new(),
            fatal_error: Some(error.to_string()),
            fatal_code: Some(error.code().to_string()),
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// Report for a run whose uploads all reached a terminal state
    pub fn completed(
        run_id: Uuid,
        profile: Option<String>,
        outcomes: Vec<UploadOutcome>,
        diagnostics: Vec<Diagnostic>,
        interrupted: bool,
        started_at: DateTime<Utc>,
    ) -> Self {
        let status = if interrupted {
            RunStatus::Interrupted
        } else if outcomes.iter().all(UploadOutcome::is_success)
            && !diagnostics.iter().any(|d| d.kind.is_failure())
        {
            RunStatus::AllSucceeded
        } else {
            RunStatus::PartialFailure
        };

        Self {
            run_id,
            profile,
            status,
            outcomes,
            diagnostics,
            fatal_error: None,
            fatal_code: None,
            started_at,
            finished_at: Utc::now(),
        }
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }

    pub fn outcome(&self, key: &str) -> Option<&UploadOutcome> {
        self.outcomes.iter().find(|o| o.task.key == key)
    }

    pub fn diagnostics_of(&self, kind: DiagnosticKind) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter().filter(move |d| d.kind == kind)
    }

    /// One-line human readable summary
    pub fn summary(&self) -> String {
        match self.status {
            RunStatus::Fatal => format!(
                "Publishing aborted: {}",
                self.fatal_error.as_deref().unwrap_or("unknown error")
            ),
            RunStatus::AllSucceeded => {
                format!("All {} uploads are complete", self.outcomes.len())
            }
            RunStatus::PartialFailure => format!(
                "{} of {} uploads succeeded ({} problems recorded)",
                self.succeeded(),
                self.outcomes.len(),
                self.failed()
                    + self
                        .diagnostics
                        .iter()
                        .filter(|d| d.kind.is_failure())
                        .count()
            ),
            RunStatus::Interrupted => format!(
                "Publishing interrupted: {} of {} uploads succeeded",
                self.succeeded(),
                self.outcomes.len()
            ),
        }
    }

    /// Build result a host would usually apply for this report
    pub fn suggested_build_result(&self) -> BuildResult {
        match self.status {
            RunStatus::AllSucceeded => BuildResult::Success,
            RunStatus::PartialFailure => BuildResult::Unstable,
            RunStatus::Interrupted => BuildResult::Aborted,
            RunStatus::Fatal => BuildResult::Failure,
        }
    }
}
