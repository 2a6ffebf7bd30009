//! Storage backends shipped with the crate
//!
//! The publisher only needs `StorageProvider`/`StorageCapability`; a real object
//! storage client is plugged in by the host. These backends cover dry runs and
//! tests.

pub mod directory;
pub mod handle;
pub mod testing;

pub use directory::DirectoryStorage;
pub use handle::SpawnedUpload;
pub use testing::{ScriptStep, ScriptedStorage};
