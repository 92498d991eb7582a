//! Stagehand - assembles air-gapped installer bundles for a cluster control
//! plane and replays their install steps on the target.
//!
//! This crate provides the component orchestration engine, the operation
//! catalog with its build and replay executors, artifact stores, the
//! certificate primitive, and the addressing-plan validator.

pub mod artifacts;
pub mod components;
pub mod core;
pub mod engine;
pub mod ipam;
pub mod ops;
pub mod pki;
pub mod util;

pub use core::{fallback, ArtifactRef, Bundle, Defaults, Preset, Stage, Topology};
pub use engine::{Component, GlobalInput, Manager, RunError, RunMode, RunReport};
