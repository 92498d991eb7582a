//! Operation catalog and executors.
//!
//! BuildOps run during assembly through [`build::BuildExecutor`];
//! InstallOps are written to a bundle's recipe and run later by
//! [`replay::Replayer`].

pub mod build;
pub mod objects;
pub mod op;
pub mod provision;
pub mod replay;
pub mod template;

pub use build::{BuildExecutor, OpOutcome};
pub use op::{ArtifactLocation, BuildOp, InstallOp, Readiness, Recipe, RecipeEntry, RetryPolicy};
