//! Orchestration layer for artifact publishing
//!
//! This module provides the components that drive one publish run:
//! planning entries, ensuring buckets and tracking uploads.

pub mod containers;
pub mod publish_orchestrator;
pub mod upload_tracker;

// Re-export main types for convenience
pub use containers::ContainerRegistry;
pub use publish_orchestrator::{OrchestratorOptions, PublishOrchestrator};
pub use upload_tracker::{TrackerOptions, UploadTracker};
