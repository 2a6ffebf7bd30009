//! Default workspace collaborators: macro expansion and local file resolution

pub mod local;
pub mod macros;

pub use local::LocalWorkspace;
pub use macros::MacroExpander;
