//! Component orchestration: contract, typed view, operation sink, persisted
//! state, and the run manager.

pub mod component;
pub mod emit;
pub mod error;
pub mod manager;
pub mod persist;
pub mod view;

pub use component::{BuildContext, Component, HydrateContext, Named, ValidateContext};
pub use emit::{BundlePlan, Plan, PlannedOp};
pub use error::{ConfigError, EmitError, RunError, StateError, ViewError};
pub use manager::{GlobalInput, Manager, RunMode, RunReport, RESERVED_FLAGS};
pub use persist::{ComponentState, StateDocument, STATE_FILE};
pub use view::View;
