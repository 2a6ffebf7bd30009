//! Configuration structures for bucket-publisher
//!
//! Two kinds of configuration exist:
//! - `PublisherConfig`: what one build publishes (entries, profile, limits)
//! - `ConfigurationStore`: the process-wide list of storage profiles, replaced
//!   wholesale by an administrative update and read as a snapshot by each run

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{info, warn};

use crate::core::error::PublishError;
use crate::core::retry::{DEFAULT_MAX_ATTEMPTS, RetryOptions};
use crate::core::traits::StorageProvider;
use crate::core::types::Entry;
use crate::security::credentials::{mask_secret, redact_profile};

/// Default number of concurrent transfers per run
pub const DEFAULT_MAX_CONCURRENCY: usize = 8;

// ============================================================================
// Storage profiles
// ============================================================================

/// Named storage credentials
#[derive(Debug, Clone)]
pub struct StorageProfile {
    name: String,
    access_key: String,
    secret_key: SecretString,
}

impl StorageProfile {
    pub fn new(
        name: impl Into<String>,
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            access_key: access_key.into(),
            secret_key: SecretString::from(secret_key.into()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn access_key(&self) -> &str {
        &self.access_key
    }

    pub fn secret_key(&self) -> &SecretString {
        &self.secret_key
    }

    /// Access key safe to print in logs
    pub fn masked_access_key(&self) -> String {
        mask_secret(&self.access_key)
    }
}

/// Profile as written in a profiles file
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ProfileConfig {
    pub name: String,
    #[serde(rename = "accessKey")]
    pub access_key: String,
    #[serde(rename = "secretKey")]
    pub secret_key: String,
}

impl From<ProfileConfig> for StorageProfile {
    fn from(config: ProfileConfig) -> Self {
        StorageProfile::new(config.name, config.access_key, config.secret_key)
    }
}

/// Root object of a profiles file
#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
pub struct ProfilesFile {
    #[serde(default)]
    pub profiles: Vec<ProfileConfig>,
}

// ============================================================================
// Publisher configuration
// ============================================================================

/// Retry settings as written in configuration files
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RetryConfig {
    /// Attempts per upload, including the first (default: 5)
    #[serde(skip_serializing_if = "Option::is_none", rename = "maxAttempts")]
    pub max_attempts: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none", rename = "initialDelayMs")]
    pub initial_delay_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none", rename = "maxDelayMs")]
    pub max_delay_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none", rename = "backoffMultiplier")]
    pub backoff_multiplier: Option<f64>,
}

impl RetryConfig {
    pub fn to_options(&self) -> RetryOptions {
        let defaults = RetryOptions::default();
        RetryOptions {
            max_attempts: self.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
            initial_delay: self
                .initial_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.initial_delay),
            max_delay: self
                .max_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_delay),
            backoff_multiplier: self.backoff_multiplier.unwrap_or(defaults.backoff_multiplier),
        }
    }
}

/// What a build publishes and how
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PublisherConfig {
    /// Storage profile to use (default: the first configured profile)
    #[serde(skip_serializing_if = "Option::is_none", rename = "profileName")]
    pub profile_name: Option<String>,

    #[serde(default)]
    pub entries: Vec<Entry>,

    /// Concurrent transfer ceiling (default: 8)
    #[serde(skip_serializing_if = "Option::is_none", rename = "maxConcurrency")]
    pub max_concurrency: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,
}

impl PublisherConfig {
    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency.unwrap_or(DEFAULT_MAX_CONCURRENCY)
    }

    pub fn retry_options(&self) -> RetryOptions {
        self.retry.clone().unwrap_or_default().to_options()
    }
}

// ============================================================================
// Configuration store
// ============================================================================

/// Immutable view of the configured profiles
pub type ProfileSnapshot = Arc<Vec<Arc<StorageProfile>>>;

/// Process-wide list of storage profiles
///
/// Runs read a snapshot; `replace` swaps the whole list so an update never
/// changes the profiles an active run is using.
#[derive(Debug, Default)]
pub struct ConfigurationStore {
    profiles: RwLock<ProfileSnapshot>,
}

impl ConfigurationStore {
    pub fn new(profiles: Vec<StorageProfile>) -> Self {
        Self {
            profiles: RwLock::new(Arc::new(profiles.into_iter().map(Arc::new).collect())),
        }
    }

    /// Replace every profile at once
    pub fn replace(&self, profiles: Vec<StorageProfile>) {
        let snapshot: ProfileSnapshot = Arc::new(profiles.into_iter().map(Arc::new).collect());
        let count = snapshot.len();
        *self.profiles.write().unwrap_or_else(|e| e.into_inner()) = snapshot;
        info!(count, "Storage profiles replaced");
    }

    pub fn snapshot(&self) -> ProfileSnapshot {
        Arc::clone(&self.profiles.read().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn names(&self) -> Vec<String> {
        self.snapshot().iter().map(|p| p.name().to_string()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Pick the profile for a run: the named one, or the first one
    pub fn select(&self, name: Option<&str>) -> Result<Arc<StorageProfile>, PublishError> {
        let snapshot = self.snapshot();

        match name {
            None => snapshot
                .first()
                .cloned()
                .ok_or(PublishError::ProfileNotConfigured),
            Some(name) => snapshot
                .iter()
                .find(|p| p.name() == name)
                .cloned()
                .ok_or_else(|| {
                    if snapshot.is_empty() {
                        PublishError::ProfileNotConfigured
                    } else {
                        PublishError::ProfileNotFound {
                            name: name.to_string(),
                        }
                    }
                }),
        }
    }

    /// Check that a profile can open a session, then release it
    pub async fn check_profile(
        &self,
        provider: &dyn StorageProvider,
        name: &str,
    ) -> Result<(), PublishError> {
        let profile = self.select(Some(name))?;

        match provider.connect(&profile).await {
            Ok(session) => {
                session.close().await;
                info!(profile = name, "Storage profile login check succeeded");
                Ok(())
            }
            Err(e) => {
                warn!(profile = name, error = %e, "Storage profile login check failed");
                Err(PublishError::AuthenticationFailed {
                    profile: name.to_string(),
                    message: redact_profile(&e.to_string(), &profile),
                })
            }
        }
    }
}
