//! Error taxonomy of an assembly run.
//!
//! [`ConfigError`]s are detected before any component is hydrated;
//! [`RunError`] tags everything else with the phase and component that
//! failed. Component hooks themselves return `anyhow::Result`.

use std::path::PathBuf;

use thiserror::Error;

use crate::core::flags::FlagError;
use crate::core::preset::Preset;
use crate::core::stage::Stage;

/// Invalid preset, flag, registration, or persisted-state combination.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("preset `{preset}` is not supported (expected one of: {supported})")]
    UnsupportedPreset { preset: Preset, supported: String },

    #[error("at least one preset, one bundle and one stage are required")]
    Empty,

    #[error("bundle `{0}` is declared twice")]
    DuplicateBundle(String),

    #[error("component `{0}` is registered twice")]
    DuplicateComponent(String),

    #[error(transparent)]
    Flag(#[from] FlagError),

    #[error("flag `--{flag}` belongs to component `{component}`, which is disabled for preset `{preset}`")]
    DisabledFlag {
        flag: String,
        component: String,
        preset: Preset,
    },

    #[error("component `{component}` depends on `{dependency}`, which is {detail}")]
    MissingDependency {
        component: String,
        dependency: String,
        detail: String,
    },

    #[error("dependency cycle between components: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),

    #[error("{} was assembled for preset `{found}`, not `{requested}`", path.display())]
    PresetMismatch {
        path: PathBuf,
        found: Preset,
        requested: Preset,
    },

    #[error("{} has version {found}; this build understands {expected}", path.display())]
    StateVersion {
        path: PathBuf,
        found: u32,
        expected: u32,
    },

    #[error("failed to read persisted state {}", path.display())]
    InvalidState {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("component `{component}` cannot load its persisted state")]
    ComponentState {
        component: String,
        #[source]
        source: StateError,
    },
}

/// A component's persisted record could not be read or written.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("schema version {found} is not supported (supported: {supported})")]
    UnsupportedVersion { found: u32, supported: String },

    #[error("invalid configuration record")]
    Invalid(#[from] serde_yaml::Error),
}

impl StateError {
    pub fn unsupported(found: u32, supported: &[u32]) -> Self {
        StateError::UnsupportedVersion {
            found,
            supported: supported
                .iter()
                .map(u32::to_string)
                .collect::<Vec<_>>()
                .join(", "),
        }
    }
}

/// Illegal cross-component read.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ViewError {
    #[error("component `{requester}` reads `{target}` without declaring it as a dependency")]
    Undeclared {
        requester: &'static str,
        target: &'static str,
    },

    #[error("component `{requester}` reads `{target}` before it is hydrated")]
    NotHydrated {
        requester: &'static str,
        target: &'static str,
    },

    #[error("component `{requester}` reads `{target}`, which is not enabled in this run")]
    Unavailable {
        requester: &'static str,
        target: &'static str,
    },

    #[error("component `{target}` is registered with a different type")]
    TypeMismatch { target: &'static str },
}

/// Rejected operation emission.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EmitError {
    #[error("operation `{name}` targets unknown bundle `{bundle}`")]
    UnknownBundle { bundle: String, name: String },

    #[error("operation `{name}` targets {stage}, but only {count} stages exist")]
    StageOutOfRange { name: String, stage: Stage, count: u8 },

    #[error("operation `{name}` is emitted twice in bundle `{bundle}` (by `{first}` and `{second}`)")]
    DuplicateName {
        bundle: String,
        name: String,
        first: String,
        second: String,
    },

    #[error("install operation `{name}` targets bundle `{bundle}`, which is not an installer")]
    NotInstaller { bundle: String, name: String },
}

/// Failure of [`Manager::run`](crate::engine::Manager::run).
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to hydrate component `{component}`")]
    Hydrate {
        component: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to build component `{component}`")]
    Build {
        component: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("validation failed for component `{component}`")]
    Validate {
        component: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to write {}", path.display())]
    Persist {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
}

impl RunError {
    /// Phase the run stopped in.
    pub fn phase(&self) -> &'static str {
        match self {
            RunError::Config(_) => "configuration",
            RunError::Hydrate { .. } => "hydrate",
            RunError::Build { .. } => "build",
            RunError::Validate { .. } => "validate",
            RunError::Persist { .. } => "persist",
        }
    }

    /// Component that failed, when the failure belongs to one.
    pub fn component(&self) -> Option<&str> {
        match self {
            RunError::Hydrate { component, .. }
            | RunError::Build { component, .. }
            | RunError::Validate { component, .. } => Some(component),
            RunError::Config(ConfigError::ComponentState { component, .. }) => Some(component),
            _ => None,
        }
    }
}
