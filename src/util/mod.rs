//! Shared utilities

pub mod cancel;
pub mod config;
pub mod diagnostic;
pub mod fs;
pub mod hash;
pub mod process;
pub mod shell;

pub use cancel::CancelToken;
pub use config::Config;
pub use diagnostic::Diagnostic;
pub use shell::Shell;
