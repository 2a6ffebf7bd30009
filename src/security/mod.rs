pub mod credentials;

pub use credentials::{mask_secret, redact_profile};
