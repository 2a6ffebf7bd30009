//! Publish Orchestrator - Main driver of a publish run
//!
//! Manages the complete run:
//! - Storage profile selection and session lifetime
//! - Macro expansion and file resolution for every entry
//! - Path validation and upload metadata (length, Content-MD5)
//! - Bucket creation, once per name
//! - Upload tracking and the final report

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::core::cancellation::RunCancellation;
use crate::core::config::{ConfigurationStore, PublisherConfig, StorageProfile};
use crate::core::error::PublishError;
use crate::core::traits::{
    BuildContext, Publisher, StorageCapability, StorageProvider, VariableExpansion,
    WorkspaceResolver,
};
use crate::core::types::{
    BuildResult, Diagnostic, DiagnosticKind, Entry, OutcomeState, PublishReport, UploadOutcome,
    UploadTask,
};
use crate::orchestration::containers::ContainerRegistry;
use crate::orchestration::upload_tracker::{TrackerOptions, UploadTracker};
use crate::security::credentials::redact_profile;
use crate::workspace::macros::MacroExpander;

/// Orchestrator options
#[derive(Debug, Clone, Default)]
pub struct OrchestratorOptions {
    /// Storage profile to use (default: the first configured profile)
    pub profile_name: Option<String>,

    pub tracker: TrackerOptions,
}

impl OrchestratorOptions {
    pub fn from_config(config: &PublisherConfig) -> Self {
        Self {
            profile_name: config.profile_name.clone(),
            tracker: TrackerOptions {
                max_concurrency: config.max_concurrency(),
                retry: config.retry_options(),
                ..TrackerOptions::default()
            },
        }
    }
}

/// Tasks and findings produced by planning one entry
#[derive(Default)]
struct EntryPlan {
    tasks: Vec<UploadTask>,
    /// Tasks that cannot run because their bucket is unavailable
    rejected: Vec<UploadOutcome>,
    diagnostics: Vec<Diagnostic>,
}

/// Closes the storage session when the run ends, even if the run is dropped
struct SessionGuard {
    session: Option<Arc<dyn StorageCapability>>,
}

impl SessionGuard {
    fn new(session: Arc<dyn StorageCapability>) -> Self {
        Self {
            session: Some(session),
        }
    }

    async fn release(mut self) {
        if let Some(session) = self.session.take() {
            session.close().await;
            debug!("Storage session closed");
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Some(session) = self.session.take()
            && let Ok(runtime) = tokio::runtime::Handle::try_current()
        {
            runtime.spawn(async move { session.close().await });
        }
    }
}

/// PublishOrchestrator - Uploads build artifacts to object storage
pub struct PublishOrchestrator {
    profiles: Arc<ConfigurationStore>,
    provider: Arc<dyn StorageProvider>,
    workspace: Arc<dyn WorkspaceResolver>,
    expander: Arc<dyn VariableExpansion>,
    entries: Vec<Entry>,
    options: OrchestratorOptions,
}

impl PublishOrchestrator {
    /// Create a new PublishOrchestrator
    ///
    /// # Arguments
    ///
    /// * `profiles` - Storage profiles; a run reads one snapshot at start
    /// * `provider` - Opens a storage session from a profile
    /// * `workspace` - Resolves file masks of the build workspace
    pub fn new(
        profiles: Arc<ConfigurationStore>,
        provider: Arc<dyn StorageProvider>,
        workspace: Arc<dyn WorkspaceResolver>,
        options: OrchestratorOptions,
    ) -> Self {
        Self {
            profiles,
            provider,
            workspace,
            expander: Arc::new(MacroExpander::new()),
            entries: Vec::new(),
            options,
        }
    }

    /// Create an orchestrator publishing the entries of `config`
    pub fn from_config(
        config: &PublisherConfig,
        profiles: Arc<ConfigurationStore>,
        provider: Arc<dyn StorageProvider>,
        workspace: Arc<dyn WorkspaceResolver>,
    ) -> Self {
        Self::new(
            profiles,
            provider,
            workspace,
            OrchestratorOptions::from_config(config),
        )
        .with_entries(config.entries.clone())
    }

    pub fn with_expander(mut self, expander: Arc<dyn VariableExpansion>) -> Self {
        self.expander = expander;
        self
    }

    /// Entries published by `Publisher::perform`
    pub fn with_entries(mut self, entries: Vec<Entry>) -> Self {
        self.entries = entries;
        self
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// Run one publish
    ///
    /// Only a missing profile or a failed login stop the run early; every other
    /// problem is recorded in the report.
    pub async fn run(
        &self,
        entries: &[Entry],
        vars: &HashMap<String, String>,
        cancellation: &RunCancellation,
    ) -> PublishReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        let profile = match self.profiles.select(self.options.profile_name.as_deref()) {
            Ok(profile) => profile,
            Err(e) => {
                error!(%run_id, error = %e, "No usable storage profile");
                return PublishReport::fatal(run_id, self.options.profile_name.clone(), &e, started_at);
            }
        };
        info!(%run_id, profile = profile.name(), "Using storage profile");

        let session = match self.provider.connect(&profile).await {
            Ok(session) => session,
            Err(e) => {
                let error = PublishError::AuthenticationFailed {
                    profile: profile.name().to_string(),
                    message: redact_profile(&e.to_string(), &profile),
                };
                error!(%run_id, error = %error, "Storage login failed");
                return PublishReport::fatal(
                    run_id,
                    Some(profile.name().to_string()),
                    &error,
                    started_at,
                );
            }
        };

        let guard = SessionGuard::new(Arc::clone(&session));
        let report = self
            .publish(run_id, &profile, session, entries, vars, cancellation, started_at)
            .await;
        guard.release().await;

        report
    }

    #[allow(clippy::too_many_arguments)]
    async fn publish(
        &self,
        run_id: Uuid,
        profile: &StorageProfile,
        session: Arc<dyn StorageCapability>,
        entries: &[Entry],
        vars: &HashMap<String, String>,
        cancellation: &RunCancellation,
        started_at: DateTime<Utc>,
    ) -> PublishReport {
        debug!(%run_id, entries = ?entries.iter().map(Entry::to_string).collect::<Vec<_>>(), "Planning uploads");

        let containers = ContainerRegistry::new(
            Arc::clone(&session),
            self.options.tracker.retry.clone(),
        );

        let plans = join_all(
            entries
                .iter()
                .map(|entry| self.plan_entry(entry, vars, &containers, cancellation)),
        )
        .await;

        let mut tasks = Vec::new();
        let mut rejected = Vec::new();
        let mut diagnostics = Vec::new();
        // First local path planned for each bucket/key
        let mut targets: HashMap<(String, String), PathBuf> = HashMap::new();
        for (entry, plan) in entries.iter().zip(plans) {
            for task in plan.tasks {
                let target = (task.container.clone(), task.key.clone());
                if let Some(first) = targets.get(&target) {
                    let message = format!(
                        "{} would overwrite {} in bucket {}",
                        task.local_path.display(),
                        first.display(),
                        task.container
                    );
                    warn!(entry = %entry, %message, "Rejected path");
                    diagnostics.push(Diagnostic::new(entry, DiagnosticKind::RejectedPath, message));
                    continue;
                }
                targets.insert(target, task.local_path.clone());
                tasks.push(task);
            }
            rejected.extend(plan.rejected);
            diagnostics.extend(plan.diagnostics);
        }

        info!(%run_id, uploads = tasks.len(), "Waiting for uploads to complete");
        let tracker = UploadTracker::new(session, self.options.tracker.clone());
        let mut outcomes = tracker.submit(tasks, cancellation).await;
        outcomes.extend(rejected);

        // A cancel arriving after every upload settled leaves the run complete.
        let interrupted = cancellation.is_cancelled()
            && (outcomes.iter().any(|o| o.state == OutcomeState::Cancelled)
                || diagnostics.iter().any(|d| d.kind == DiagnosticKind::Interrupted));

        let report = PublishReport::completed(
            run_id,
            Some(profile.name().to_string()),
            outcomes,
            diagnostics,
            interrupted,
            started_at,
        );
        info!(%run_id, status = ?report.status, "{}", report.summary());

        report
    }

    /// Plan one entry, giving up when the run is interrupted
    async fn plan_entry(
        &self,
        entry: &Entry,
        vars: &HashMap<String, String>,
        containers: &ContainerRegistry,
        cancellation: &RunCancellation,
    ) -> EntryPlan {
        tokio::select! {
            biased;
            _ = cancellation.cancelled() => EntryPlan {
                diagnostics: vec![Diagnostic::new(
                    entry,
                    DiagnosticKind::Interrupted,
                    "Planning stopped, run interrupted",
                )],
                ..EntryPlan::default()
            },
            plan = self.expand_entry(entry, vars, containers) => plan,
        }
    }

    async fn expand_entry(
        &self,
        entry: &Entry,
        vars: &HashMap<String, String>,
        containers: &ContainerRegistry,
    ) -> EntryPlan {
        let mut plan = EntryPlan::default();
        let pattern = self.expander.expand(&entry.source_file_pattern, vars);
        let bucket = self.expander.expand(&entry.destination_container, vars);

        let paths = match self.workspace.list(&pattern).await {
            Ok(paths) => paths,
            Err(e) => {
                let message = format!("Can't resolve {}: {:#}", pattern, e);
                warn!(entry = %entry, %message, "File resolution failed");
                plan.diagnostics
                    .push(Diagnostic::new(entry, DiagnosticKind::ResolutionFailed, message));
                return plan;
            }
        };

        if paths.is_empty() {
            let mut message = format!("No file(s) found: {}", pattern);
            if let Some(hint) = self.workspace.validate_mask(&pattern).await {
                message.push_str(&format!(" ({})", hint));
            }
            warn!(entry = %entry, "{}", message);
            plan.diagnostics
                .push(Diagnostic::new(entry, DiagnosticKind::NoMatch, message));
            return plan;
        }

        let mut tasks = Vec::new();
        for path in paths {
            match self.build_task(&bucket, &path).await {
                Ok(task) => {
                    debug!(bucket = %task.container, key = %task.key, size = task.size_bytes, "Planned upload");
                    tasks.push(task);
                }
                Err(message) => {
                    warn!(entry = %entry, %message, "Rejected path");
                    plan.diagnostics
                        .push(Diagnostic::new(entry, DiagnosticKind::RejectedPath, message));
                }
            }
        }

        if tasks.is_empty() {
            return plan;
        }

        match containers.ensure(&bucket).await {
            Ok(()) => plan.tasks = tasks,
            Err(e) => {
                plan.diagnostics.push(Diagnostic::new(
                    entry,
                    DiagnosticKind::ContainerUnavailable,
                    format!("Bucket {} is unavailable: {}", bucket, e),
                ));
                plan.rejected = tasks
                    .into_iter()
                    .map(|task| UploadOutcome {
                        task,
                        state: OutcomeState::Failed,
                        attempts: 0,
                        last_error: Some(e.to_string()),
                    })
                    .collect();
            }
        }

        plan
    }

    /// Validate one resolved path and describe its upload
    async fn build_task(&self, bucket: &str, path: &Path) -> Result<UploadTask, String> {
        let display = path.display();

        if !self.workspace.exists(path).await {
            return Err(format!("{} does not exist", display));
        }
        if self.workspace.is_directory(path).await {
            return Err(format!("{} is a directory", display));
        }

        let size = self
            .workspace
            .length(path)
            .await
            .map_err(|e| format!("{}: {:#}", display, e))?;
        if size == 0 {
            return Err(format!("{} is 0 length", display));
        }

        let key = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| format!("{} has no file name", display))?;

        let digest = self
            .workspace
            .digest(path)
            .await
            .map_err(|e| format!("{}: {:#}", display, e))?;

        Ok(UploadTask::new(bucket, key, path, size).with_content_md5(STANDARD.encode(digest)))
    }
}

#[async_trait]
impl Publisher for PublishOrchestrator {
    fn name(&self) -> &str {
        "bucket-publisher"
    }

    async fn perform(&self, build: &BuildContext) -> Option<PublishReport> {
        if matches!(build.result, BuildResult::Failure | BuildResult::Aborted) {
            info!(result = ?build.result, "Skipping artifact publishing, build did not succeed");
            return None;
        }

        Some(self.run(&self.entries, &build.variables, &build.cancellation).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::StorageError;
    use crate::core::retry::RetryOptions;
    use crate::core::traits::{TransferState, UploadHandle};
    use crate::core::types::{RunStatus, UploadMetadata};
    use crate::storage::directory::DirectoryStorage;
    use crate::storage::testing::{ScriptStep, ScriptedStorage};
    use crate::workspace::local::LocalWorkspace;
    use std::time::Duration;
    use tempfile::TempDir;

    fn profiles() -> Arc<ConfigurationStore> {
        Arc::new(ConfigurationStore::new(vec![StorageProfile::new(
            "default",
            "AKIAEXAMPLE123456",
            "secret-key-value",
        )]))
    }

    fn options() -> OrchestratorOptions {
        OrchestratorOptions {
            profile_name: None,
            tracker: TrackerOptions {
                max_concurrency: 4,
                retry: RetryOptions::immediate(5),
                cancel_grace: Duration::from_secs(1),
            },
        }
    }

    fn workspace_with(files: &[(&str, usize)]) -> TempDir {
        let dir = TempDir::new().unwrap();
        for (name, size) in files {
            let path = dir.path().join(name);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, vec![b'x'; *size]).unwrap();
        }
        dir
    }

    fn orchestrator(dir: &TempDir, storage: &ScriptedStorage) -> PublishOrchestrator {
        PublishOrchestrator::new(
            profiles(),
            Arc::new(storage.clone()),
            Arc::new(LocalWorkspace::new(dir.path())),
            options(),
        )
    }

    fn vars() -> HashMap<String, String> {
        HashMap::from([("BUILD".to_string(), "42".to_string())])
    }

    #[tokio::test]
    async fn test_single_artifact_is_published() {
        let dir = workspace_with(&[("dist/app.zip", 1024)]);
        let storage = ScriptedStorage::new();

        let report = orchestrator(&dir, &storage)
            .run(
                &[Entry::new("dist/*.zip", "releases-${BUILD}")],
                &vars(),
                &RunCancellation::new(),
            )
            .await;

        assert_eq!(report.status, RunStatus::AllSucceeded);
        assert_eq!(report.outcomes.len(), 1);
        let outcome = &report.outcomes[0];
        assert_eq!(outcome.task.container, "releases-42");
        assert_eq!(outcome.task.key, "app.zip");
        assert_eq!(outcome.task.size_bytes, 1024);
        assert!(outcome.task.metadata.content_md5.is_some());
        assert_eq!(outcome.attempts, 1);
        assert_eq!(storage.create_bucket_calls("releases-42"), 1);
        assert_eq!(storage.bucket_exists_calls(), 1);
        assert_eq!(storage.close_calls(), 1);
        assert_eq!(report.profile.as_deref(), Some("default"));
    }

    #[tokio::test]
    async fn test_no_matching_files_is_not_a_failure() {
        let dir = workspace_with(&[("dist/readme.txt", 10)]);
        let storage = ScriptedStorage::new();

        let report = orchestrator(&dir, &storage)
            .run(
                &[Entry::new("dist/*.zip", "releases-${BUILD}")],
                &vars(),
                &RunCancellation::new(),
            )
            .await;

        assert_eq!(report.status, RunStatus::AllSucceeded);
        assert!(report.outcomes.is_empty());
        let diagnostics: Vec<_> = report.diagnostics_of(DiagnosticKind::NoMatch).collect();
        assert_eq!(diagnostics.len(), 1);
        assert!(diagnostics[0].message.starts_with("No file(s) found: dist/*.zip"));
        assert!(diagnostics[0].message.contains("'dist' exists"));
        assert_eq!(storage.total_create_bucket_calls(), 0);
        assert_eq!(storage.total_upload_calls(), 0);
    }

    #[tokio::test]
    async fn test_upload_succeeds_on_fourth_attempt() {
        let dir = workspace_with(&[("dist/app.zip", 64)]);
        let storage = ScriptedStorage::new()
            .with_script("app.zip", vec![ScriptStep::network_failure(); 3]);

        let report = orchestrator(&dir, &storage)
            .run(&[Entry::new("dist/*.zip", "releases")], &vars(), &RunCancellation::new())
            .await;

        assert_eq!(report.status, RunStatus::AllSucceeded);
        assert_eq!(report.outcomes[0].state, OutcomeState::Succeeded);
        assert_eq!(report.outcomes[0].attempts, 4);
    }

    #[tokio::test]
    async fn test_upload_fails_after_five_attempts() {
        let dir = workspace_with(&[("dist/app.zip", 64)]);
        let storage = ScriptedStorage::new()
            .with_script("app.zip", vec![ScriptStep::network_failure(); 5]);

        let report = orchestrator(&dir, &storage)
            .run(&[Entry::new("dist/*.zip", "releases")], &vars(), &RunCancellation::new())
            .await;

        assert_eq!(report.status, RunStatus::PartialFailure);
        assert_eq!(report.outcomes[0].state, OutcomeState::Failed);
        assert_eq!(report.outcomes[0].attempts, 5);
        assert_eq!(storage.upload_calls("app.zip"), 5);
        assert!(report.summary().starts_with("0 of 1 uploads succeeded"));
    }

    #[tokio::test]
    async fn test_shared_bucket_is_ensured_once() {
        let dir = workspace_with(&[("dist/app.zip", 64), ("docs/manual.pdf", 32)]);
        let storage = ScriptedStorage::new().with_bucket_delay(Duration::from_millis(20));

        let report = orchestrator(&dir, &storage)
            .run(
                &[
                    Entry::new("dist/*.zip", "releases-${BUILD}"),
                    Entry::new("docs/*.pdf", "releases-$BUILD"),
                ],
                &vars(),
                &RunCancellation::new(),
            )
            .await;

        assert_eq!(report.status, RunStatus::AllSucceeded);
        assert_eq!(report.outcomes.len(), 2);
        assert_eq!(storage.bucket_exists_calls(), 1);
        assert_eq!(storage.create_bucket_calls("releases-42"), 1);
    }

    #[tokio::test]
    async fn test_no_profile_is_fatal_without_storage_calls() {
        let dir = workspace_with(&[("dist/app.zip", 64)]);
        let storage = ScriptedStorage::new();
        let orchestrator = PublishOrchestrator::new(
            Arc::new(ConfigurationStore::default()),
            Arc::new(storage.clone()),
            Arc::new(LocalWorkspace::new(dir.path())),
            options(),
        );

        let report = orchestrator
            .run(&[Entry::new("dist/*.zip", "releases")], &vars(), &RunCancellation::new())
            .await;

        assert_eq!(report.status, RunStatus::Fatal);
        assert_eq!(report.fatal_code.as_deref(), Some("PROFILE_NOT_CONFIGURED"));
        assert!(report.outcomes.is_empty());
        assert_eq!(storage.connect_calls(), 0);
        assert_eq!(storage.bucket_exists_calls(), 0);
        assert_eq!(storage.total_upload_calls(), 0);
    }

    #[tokio::test]
    async fn test_unknown_profile_is_fatal() {
        let dir = workspace_with(&[]);
        let storage = ScriptedStorage::new();
        let orchestrator = PublishOrchestrator::new(
            profiles(),
            Arc::new(storage.clone()),
            Arc::new(LocalWorkspace::new(dir.path())),
            OrchestratorOptions {
                profile_name: Some("release".to_string()),
                ..options()
            },
        );

        let report = orchestrator.run(&[], &vars(), &RunCancellation::new()).await;

        assert_eq!(report.status, RunStatus::Fatal);
        assert_eq!(report.fatal_code.as_deref(), Some("PROFILE_NOT_FOUND"));
        assert_eq!(storage.connect_calls(), 0);
    }

    #[tokio::test]
    async fn test_login_failure_is_fatal_and_redacted() {
        let dir = workspace_with(&[("dist/app.zip", 64)]);
        let storage = ScriptedStorage::new().with_connect_error(StorageError::AccessDenied {
            bucket: "*".to_string(),
            message: "invalid key AKIAEXAMPLE123456".to_string(),
        });

        let report = orchestrator(&dir, &storage)
            .run(&[Entry::new("dist/*.zip", "releases")], &vars(), &RunCancellation::new())
            .await;

        assert_eq!(report.status, RunStatus::Fatal);
        assert_eq!(report.fatal_code.as_deref(), Some("AUTHENTICATION_FAILED"));
        let message = report.fatal_error.unwrap();
        assert!(message.contains("AKI...456"));
        assert!(!message.contains("AKIAEXAMPLE123456"));
        assert_eq!(storage.total_upload_calls(), 0);
        assert_eq!(storage.close_calls(), 0);
    }

    #[tokio::test]
    async fn test_zero_length_file_is_rejected() {
        let dir = workspace_with(&[("dist/app.zip", 64), ("dist/empty.zip", 0)]);
        let storage = ScriptedStorage::new();

        let report = orchestrator(&dir, &storage)
            .run(&[Entry::new("dist/*.zip", "releases")], &vars(), &RunCancellation::new())
            .await;

        assert_eq!(report.status, RunStatus::PartialFailure);
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(report.outcomes[0].task.key, "app.zip");
        let rejected: Vec<_> = report.diagnostics_of(DiagnosticKind::RejectedPath).collect();
        assert_eq!(rejected.len(), 1);
        assert!(rejected[0].message.ends_with("empty.zip is 0 length"));
        assert_eq!(storage.upload_calls("empty.zip"), 0);
    }

    /// Workspace reporting a directory and a vanished file among its matches
    struct FakeWorkspace {
        files: Vec<PathBuf>,
        directories: Vec<PathBuf>,
        missing: Vec<PathBuf>,
    }

    #[async_trait]
    impl WorkspaceResolver for FakeWorkspace {
        async fn list(&self, _pattern: &str) -> anyhow::Result<Vec<PathBuf>> {
            Ok(self
                .files
                .iter()
                .chain(&self.directories)
                .chain(&self.missing)
                .cloned()
                .collect())
        }

        async fn exists(&self, path: &Path) -> bool {
            !self.missing.iter().any(|p| p == path)
        }

        async fn is_directory(&self, path: &Path) -> bool {
            self.directories.iter().any(|p| p == path)
        }

        async fn length(&self, _path: &Path) -> anyhow::Result<u64> {
            Ok(128)
        }

        async fn digest(&self, _path: &Path) -> anyhow::Result<[u8; 16]> {
            Ok([0u8; 16])
        }

        async fn validate_mask(&self, _pattern: &str) -> Option<String> {
            None
        }
    }

    #[tokio::test]
    async fn test_directories_and_missing_paths_never_reach_storage() {
        let storage = ScriptedStorage::new();
        let workspace = FakeWorkspace {
            files: vec![PathBuf::from("/ws/dist/app.zip")],
            directories: vec![PathBuf::from("/ws/dist/classes")],
            missing: vec![PathBuf::from("/ws/dist/gone.zip")],
        };
        let orchestrator = PublishOrchestrator::new(
            profiles(),
            Arc::new(storage.clone()),
            Arc::new(workspace),
            options(),
        );

        let report = orchestrator
            .run(&[Entry::new("dist/*", "releases")], &vars(), &RunCancellation::new())
            .await;

        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(report.outcomes[0].task.metadata.content_md5.as_deref(), Some("AAAAAAAAAAAAAAAAAAAAAA=="));
        let messages: Vec<&str> = report
            .diagnostics_of(DiagnosticKind::RejectedPath)
            .map(|d| d.message.as_str())
            .collect();
        assert_eq!(
            messages,
            vec!["/ws/dist/classes is a directory", "/ws/dist/gone.zip does not exist"]
        );
        assert_eq!(storage.total_upload_calls(), 1);
        assert_eq!(storage.upload_calls("classes"), 0);
    }

    #[tokio::test]
    async fn test_unavailable_bucket_fails_its_tasks_only() {
        let dir = workspace_with(&[("dist/app.zip", 64), ("docs/manual.pdf", 32)]);
        let storage = ScriptedStorage::new().with_failing_bucket(
            "locked",
            StorageError::AccessDenied {
                bucket: "locked".to_string(),
                message: "forbidden".to_string(),
            },
        );

        let report = orchestrator(&dir, &storage)
            .run(
                &[
                    Entry::new("dist/*.zip", "locked"),
                    Entry::new("docs/*.pdf", "manuals"),
                ],
                &vars(),
                &RunCancellation::new(),
            )
            .await;

        assert_eq!(report.status, RunStatus::PartialFailure);
        assert_eq!(report.succeeded(), 1);
        let failed = report.outcome("app.zip").unwrap();
        assert_eq!(failed.state, OutcomeState::Failed);
        assert_eq!(failed.attempts, 0);
        assert_eq!(
            report.diagnostics_of(DiagnosticKind::ContainerUnavailable).count(),
            1
        );
        assert_eq!(storage.upload_calls("app.zip"), 0);
    }

    #[tokio::test]
    async fn test_interrupted_run_settles_and_closes_session() {
        let dir = workspace_with(&[("dist/a.zip", 8), ("dist/b.zip", 8)]);
        let storage = ScriptedStorage::new()
            .with_script("a.zip", vec![ScriptStep::Hang])
            .with_script("b.zip", vec![ScriptStep::Hang]);
        let cancellation = RunCancellation::new();
        cancellation.cancel_after(Duration::from_millis(50));

        let report = tokio::time::timeout(
            Duration::from_secs(5),
            orchestrator(&dir, &storage).run(
                &[Entry::new("dist/*.zip", "releases")],
                &vars(),
                &cancellation,
            ),
        )
        .await
        .unwrap();

        assert_eq!(report.status, RunStatus::Interrupted);
        assert_eq!(report.outcomes.len(), 2);
        assert!(report.outcomes.iter().all(|o| o.state == OutcomeState::Cancelled));
        assert_eq!(storage.active_uploads(), 0);
        assert_eq!(storage.aborted_uploads(), 2);
        assert_eq!(storage.close_calls(), 1);
    }

    #[tokio::test]
    async fn test_files_sharing_a_key_are_uploaded_once() {
        let dir = workspace_with(&[("a/app.zip", 16), ("b/app.zip", 32)]);
        let storage = ScriptedStorage::new();

        let report = orchestrator(&dir, &storage)
            .run(&[Entry::new("**/*.zip", "releases")], &vars(), &RunCancellation::new())
            .await;

        assert_eq!(report.status, RunStatus::PartialFailure);
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(report.outcomes[0].task.size_bytes, 16);
        assert_eq!(storage.upload_calls("app.zip"), 1);
        let rejected: Vec<_> = report.diagnostics_of(DiagnosticKind::RejectedPath).collect();
        assert_eq!(rejected.len(), 1);
        assert!(rejected[0].message.contains("b/app.zip would overwrite"));
        assert!(rejected[0].message.ends_with("a/app.zip in bucket releases"));
    }

    #[tokio::test]
    async fn test_same_key_in_different_buckets_is_allowed() {
        let dir = workspace_with(&[("dist/app.zip", 16)]);
        let storage = ScriptedStorage::new();

        let report = orchestrator(&dir, &storage)
            .run(
                &[
                    Entry::new("dist/*.zip", "releases"),
                    Entry::new("dist/*.zip", "archive"),
                ],
                &vars(),
                &RunCancellation::new(),
            )
            .await;

        assert_eq!(report.status, RunStatus::AllSucceeded);
        assert_eq!(report.outcomes.len(), 2);
        assert_eq!(storage.upload_calls("app.zip"), 2);
    }

    /// Storage whose transfers cancel the run just as they complete
    #[derive(Clone)]
    struct CancelOnCompletion {
        storage: ScriptedStorage,
        cancellation: RunCancellation,
    }

    struct CancellingHandle {
        inner: Box<dyn UploadHandle>,
        cancellation: RunCancellation,
    }

    #[async_trait]
    impl UploadHandle for CancellingHandle {
        fn is_done(&self) -> bool {
            self.inner.is_done()
        }

        fn state(&self) -> TransferState {
            self.inner.state()
        }

        async fn wait(&mut self) -> Result<(), StorageError> {
            let result = self.inner.wait().await;
            self.cancellation.cancel("late abort");
            result
        }

        fn cancel(&self) {
            self.inner.cancel();
        }
    }

    #[async_trait]
    impl StorageProvider for CancelOnCompletion {
        async fn connect(
            &self,
            _profile: &StorageProfile,
        ) -> Result<Arc<dyn StorageCapability>, StorageError> {
            Ok(Arc::new(self.clone()))
        }
    }

    #[async_trait]
    impl StorageCapability for CancelOnCompletion {
        async fn bucket_exists(&self, bucket: &str) -> Result<bool, StorageError> {
            self.storage.bucket_exists(bucket).await
        }

        async fn create_bucket(&self, bucket: &str) -> Result<(), StorageError> {
            self.storage.create_bucket(bucket).await
        }

        async fn upload(
            &self,
            bucket: &str,
            key: &str,
            local_path: &Path,
            metadata: &UploadMetadata,
        ) -> Result<Box<dyn UploadHandle>, StorageError> {
            let inner = self.storage.upload(bucket, key, local_path, metadata).await?;
            Ok(Box::new(CancellingHandle {
                inner,
                cancellation: self.cancellation.clone(),
            }))
        }
    }

    #[tokio::test]
    async fn test_cancel_after_every_upload_settled_keeps_run_complete() {
        let dir = workspace_with(&[("dist/app.zip", 64)]);
        let cancellation = RunCancellation::new();
        let storage = CancelOnCompletion {
            storage: ScriptedStorage::new(),
            cancellation: cancellation.clone(),
        };
        let orchestrator = PublishOrchestrator::new(
            profiles(),
            Arc::new(storage.clone()),
            Arc::new(LocalWorkspace::new(dir.path())),
            options(),
        );

        let report = orchestrator
            .run(&[Entry::new("dist/*.zip", "releases")], &vars(), &cancellation)
            .await;

        assert!(cancellation.is_cancelled());
        assert_eq!(report.outcomes[0].state, OutcomeState::Succeeded);
        assert_eq!(report.status, RunStatus::AllSucceeded);
    }

    #[tokio::test]
    async fn test_perform_skips_failed_build() {
        let dir = workspace_with(&[("dist/app.zip", 64)]);
        let storage = ScriptedStorage::new();
        let publisher = orchestrator(&dir, &storage)
            .with_entries(vec![Entry::new("dist/*.zip", "releases")]);

        let build = BuildContext::new(BuildResult::Failure, vars());

        assert!(publisher.perform(&build).await.is_none());
        assert_eq!(storage.connect_calls(), 0);
    }

    #[tokio::test]
    async fn test_perform_publishes_configured_entries_to_directory_storage() {
        let dir = workspace_with(&[("dist/app.zip", 64)]);
        let target = TempDir::new().unwrap();
        let storage = DirectoryStorage::new(target.path());
        let config: PublisherConfig = serde_yaml::from_str(
            "entries:\n  - sourceFile: \"dist/*.zip\"\n    bucket: \"releases-${BUILD}\"\n",
        )
        .unwrap();
        let publisher = PublishOrchestrator::from_config(
            &config,
            profiles(),
            Arc::new(storage.clone()),
            Arc::new(LocalWorkspace::new(dir.path())),
        );

        let report = publisher
            .perform(&BuildContext::new(BuildResult::Success, vars()))
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::AllSucceeded);
        assert_eq!(publisher.name(), "bucket-publisher");
        let stored = storage.object_path("releases-42", "app.zip").unwrap();
        assert_eq!(std::fs::read(stored).unwrap().len(), 64);
    }

    #[tokio::test]
    async fn test_run_reads_profiles_when_it_starts() {
        let dir = workspace_with(&[("dist/app.zip", 64)]);
        let storage = ScriptedStorage::new();
        let store = profiles();
        let orchestrator = PublishOrchestrator::new(
            Arc::clone(&store),
            Arc::new(storage.clone()),
            Arc::new(LocalWorkspace::new(dir.path())),
            options(),
        );

        let entries = [Entry::new("dist/*.zip", "releases")];
        let vars = vars();
        let cancellation = RunCancellation::new();

        let run = orchestrator.run(&entries, &vars, &cancellation);
        store.replace(vec![StorageProfile::new("other", "AKIAOTHER12345", "s")]);
        let report = run.await;

        // The run had not started yet, so it sees the replaced list.
        assert_eq!(report.profile.as_deref(), Some("other"));
        assert_eq!(report.status, RunStatus::AllSucceeded);
    }
}
