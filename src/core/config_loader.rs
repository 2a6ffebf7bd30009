//! Configuration file loader for bucket-publisher
//!
//! Loads publisher configuration and storage profiles from YAML or TOML files,
//! applies environment overrides and validates the result.

use super::config::*;
use crate::core::error::PublishError;
use serde::de::DeserializeOwned;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tokio::fs;
use tracing::{debug, warn};

/// Environment override for `profileName`
pub const ENV_PROFILE: &str = "BUCKET_PUBLISHER_PROFILE";
/// Environment override for `maxConcurrency`
pub const ENV_MAX_CONCURRENCY: &str = "BUCKET_PUBLISHER_MAX_CONCURRENCY";
/// Environment override for `retry.maxAttempts`
pub const ENV_MAX_ATTEMPTS: &str = "BUCKET_PUBLISHER_MAX_ATTEMPTS";

/// Concurrency above this only produces a warning
const CONCURRENCY_WARNING_THRESHOLD: usize = 64;

/// Configuration validation result
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigValidationResult {
    pub valid: bool,
    pub errors: Vec<ConfigValidationError>,
    pub warnings: Vec<ConfigValidationWarning>,
}

/// Configuration validation error
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigValidationError {
    /// Field path (e.g., "entries[0].bucket")
    pub field: String,
    pub message: String,
}

/// Configuration validation warning
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigValidationWarning {
    pub field: String,
    pub message: String,
    pub suggestion: Option<String>,
}

enum Format {
    Yaml,
    Toml,
}

impl Format {
    fn of(path: &Path) -> Result<Self, PublishError> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Ok(Self::Yaml),
            Some("toml") => Ok(Self::Toml),
            _ => Err(PublishError::ConfigError(format!(
                "Unsupported config file format: {} (expected .yaml, .yml or .toml)",
                path.display()
            ))),
        }
    }
}

/// Configuration file loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load and validate publisher configuration from a file
    pub async fn load_publisher_config(path: &Path) -> Result<PublisherConfig, PublishError> {
        let config: PublisherConfig = Self::load_file(path).await?;
        Self::ensure_valid(config)
    }

    /// Load publisher configuration, apply environment overrides, then validate
    pub async fn load_with_env(
        path: &Path,
        env: &HashMap<String, String>,
    ) -> Result<PublisherConfig, PublishError> {
        let config: PublisherConfig = Self::load_file(path).await?;
        Self::ensure_valid(Self::apply_env_overrides(config, env)?)
    }

    fn ensure_valid(config: PublisherConfig) -> Result<PublisherConfig, PublishError> {
        let result = Self::validate(&config);
        if !result.valid {
            return Err(PublishError::ConfigError(Self::format_validation_result(
                &result,
            )));
        }

        for warning in &result.warnings {
            warn!(field = %warning.field, "{}", warning.message);
        }
        Ok(config)
    }

    /// Load storage profiles from a file
    pub async fn load_profiles(path: &Path) -> Result<Vec<StorageProfile>, PublishError> {
        let file: ProfilesFile = Self::load_file(path).await?;

        let result = Self::validate_profiles(&file.profiles);
        if !result.valid {
            return Err(PublishError::ConfigError(Self::format_validation_result(
                &result,
            )));
        }

        Ok(file.profiles.into_iter().map(StorageProfile::from).collect())
    }

    async fn load_file<T: DeserializeOwned>(path: &Path) -> Result<T, PublishError> {
        let format = Format::of(path)?;

        let content = fs::read_to_string(path).await.map_err(|e| {
            PublishError::ConfigError(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        debug!(path = %path.display(), "Loaded configuration file");
        Self::parse(format, &content)
    }

    fn parse<T: DeserializeOwned>(format: Format, content: &str) -> Result<T, PublishError> {
        match format {
            Format::Yaml => serde_yaml::from_str(content).map_err(|e| {
                PublishError::ConfigError(format!("Failed to parse YAML config: {}", e))
            }),
            Format::Toml => toml::from_str(content).map_err(|e| {
                PublishError::ConfigError(format!("Failed to parse TOML config: {}", e))
            }),
        }
    }

    /// Apply environment overrides on top of file configuration
    pub fn apply_env_overrides(
        mut config: PublisherConfig,
        env: &HashMap<String, String>,
    ) -> Result<PublisherConfig, PublishError> {
        if let Some(profile) = env.get(ENV_PROFILE).filter(|p| !p.is_empty()) {
            config.profile_name = Some(profile.clone());
        }

        if let Some(value) = env.get(ENV_MAX_CONCURRENCY) {
            config.max_concurrency = Some(Self::parse_number(ENV_MAX_CONCURRENCY, value)?);
        }

        if let Some(value) = env.get(ENV_MAX_ATTEMPTS) {
            let attempts = Self::parse_number(ENV_MAX_ATTEMPTS, value)?;
            config.retry.get_or_insert_with(RetryConfig::default).max_attempts = Some(attempts);
        }

        Ok(config)
    }

    fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, PublishError> {
        value.trim().parse().map_err(|_| PublishError::InvalidConfig {
            field: name.to_string(),
            message: format!("expected a positive number, got '{}'", value),
        })
    }

    /// Validate publisher configuration
    pub fn validate(config: &PublisherConfig) -> ConfigValidationResult {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        if config.entries.is_empty() {
            warnings.push(ConfigValidationWarning {
                field: "entries".to_string(),
                message: "No entries configured; nothing will be published".to_string(),
                suggestion: Some("Add at least one sourceFile / bucket pair".to_string()),
            });
        }

        for (i, entry) in config.entries.iter().enumerate() {
            if entry.source_file_pattern.trim().is_empty() {
                errors.push(ConfigValidationError {
                    field: format!("entries[{}].sourceFile", i),
                    message: "sourceFile is required".to_string(),
                });
            }
            if entry.destination_container.trim().is_empty() {
                errors.push(ConfigValidationError {
                    field: format!("entries[{}].bucket", i),
                    message: "bucket is required".to_string(),
                });
            }
        }

        match config.max_concurrency {
            Some(0) => errors.push(ConfigValidationError {
                field: "maxConcurrency".to_string(),
                message: "maxConcurrency must be at least 1".to_string(),
            }),
            Some(n) if n > CONCURRENCY_WARNING_THRESHOLD => {
                warnings.push(ConfigValidationWarning {
                    field: "maxConcurrency".to_string(),
                    message: format!("maxConcurrency {} is unusually high", n),
                    suggestion: Some(format!(
                        "Values above {} rarely improve throughput",
                        CONCURRENCY_WARNING_THRESHOLD
                    )),
                })
            }
            _ => {}
        }

        if let Some(retry) = &config.retry {
            if retry.max_attempts == Some(0) {
                errors.push(ConfigValidationError {
                    field: "retry.maxAttempts".to_string(),
                    message: "maxAttempts must be at least 1".to_string(),
                });
            }
            if let Some(multiplier) = retry.backoff_multiplier
                && !(multiplier >= 1.0)
            {
                errors.push(ConfigValidationError {
                    field: "retry.backoffMultiplier".to_string(),
                    message: format!("backoffMultiplier must be >= 1.0, got {}", multiplier),
                });
            }
            if let (Some(initial), Some(max)) = (retry.initial_delay_ms, retry.max_delay_ms)
                && initial > max
            {
                warnings.push(ConfigValidationWarning {
                    field: "retry.initialDelayMs".to_string(),
                    message: "initialDelayMs is larger than maxDelayMs".to_string(),
                    suggestion: Some("Every retry will wait maxDelayMs".to_string()),
                });
            }
        }

        ConfigValidationResult {
            valid: errors.is_empty(),
            errors,
            warnings,
        }
    }

    /// Validate storage profiles before they are installed
    pub fn validate_profiles(profiles: &[ProfileConfig]) -> ConfigValidationResult {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        let mut seen = HashSet::new();

        if profiles.is_empty() {
            warnings.push(ConfigValidationWarning {
                field: "profiles".to_string(),
                message: "No storage profiles configured".to_string(),
                suggestion: Some("Publishing will fail until a profile is added".to_string()),
            });
        }

        for (i, profile) in profiles.iter().enumerate() {
            if profile.name.trim().is_empty() {
                errors.push(ConfigValidationError {
                    field: format!("profiles[{}].name", i),
                    message: "name is required".to_string(),
                });
            } else if !seen.insert(profile.name.as_str()) {
                errors.push(ConfigValidationError {
                    field: format!("profiles[{}].name", i),
                    message: format!("duplicate profile name '{}'", profile.name),
                });
            }

            if profile.access_key.is_empty() || profile.secret_key.is_empty() {
                errors.push(ConfigValidationError {
                    field: format!("profiles[{}]", i),
                    message: "accessKey and secretKey are required".to_string(),
                });
            }
        }

        ConfigValidationResult {
            valid: errors.is_empty(),
            errors,
            warnings,
        }
    }

    /// Format validation result as human-readable string
    pub fn format_validation_result(result: &ConfigValidationResult) -> String {
        let mut lines = Vec::new();

        if result.valid {
            lines.push("✅ Configuration validation succeeded".to_string());
        } else {
            lines.push("❌ Configuration has errors".to_string());
        }

        if !result.errors.is_empty() {
            lines.push("\n🔴 Errors:".to_string());
            for error in &result.errors {
                lines.push(format!("  - [{}] {}", error.field, error.message));
            }
        }

        if !result.warnings.is_empty() {
            lines.push("\n🟡 Warnings:".to_string());
            for warning in &result.warnings {
                lines.push(format!("  - [{}] {}", warning.field, warning.message));
                if let Some(suggestion) = &warning.suggestion {
                    lines.push(format!("    Suggestion: {}", suggestion));
                }
            }
        }

        lines.join("\n")
    }
}
