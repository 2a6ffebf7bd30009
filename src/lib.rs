//! Publishes build workspace artifacts to object storage buckets.
//!
//! A [`PublishOrchestrator`] expands each configured entry, validates the
//! matched files, makes sure every destination bucket exists, and hands the
//! uploads to an [`UploadTracker`] that retries failed transfers a bounded
//! number of times. The run ends with a [`PublishReport`].

pub mod core;
pub mod logging;
pub mod orchestration;
pub mod security;
pub mod storage;
pub mod workspace;

pub use crate::core::*;
pub use logging::init_logging;
pub use orchestration::{
    ContainerRegistry, OrchestratorOptions, PublishOrchestrator, TrackerOptions, UploadTracker,
};
pub use storage::{DirectoryStorage, SpawnedUpload};
pub use workspace::{LocalWorkspace, MacroExpander};
