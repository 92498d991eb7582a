//! Core value types shared by the engine, operations, and components.

pub mod artifact;
pub mod defaults;
pub mod flags;
pub mod preset;
pub mod stage;
pub mod topology;

pub use artifact::{fallback, ArtifactRef, ArtifactRefError};
pub use defaults::{Defaults, PresetDefaults};
pub use flags::{DeclaredFlag, Flag, FlagError, FlagKind, FlagValue, FlagValues};
pub use preset::Preset;
pub use stage::{Bundle, BundleSet, Stage};
pub use topology::{ControlNode, Topology};
