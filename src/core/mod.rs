pub mod cancellation;
pub mod config;
pub mod config_loader;
pub mod error;
pub mod retry;
pub mod state_machine;
pub mod traits;
pub mod types;

pub use cancellation::*;
pub use error::*;
pub use retry::*;
pub use traits::*;
pub use types::*;
