//! The component contract.
//!
//! A component owns one configuration record and the behavior around it:
//! the flags it understands, how it derives its final configuration
//! (hydrate), the operations it emits (build), and optional cross-checks
//! (validate). Components only ever read each other through a [`View`].

use std::any::Any;
use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::core::defaults::Defaults;
use crate::core::flags::{Flag, FlagValues};
use crate::core::preset::Preset;
use crate::core::stage::Stage;
use crate::core::topology::Topology;
use crate::engine::emit::Emitter;
use crate::engine::error::StateError;
use crate::engine::persist::ComponentState;
use crate::engine::view::View;
use crate::ops::op::{BuildOp, InstallOp};

/// Static identity of a component type, used by [`View::get`].
pub trait Named {
    const NAME: &'static str;
}

/// A pluggable configuration-and-build unit.
pub trait Component: Any {
    /// Unique key used for persistence and cross-reads.
    fn name(&self) -> &'static str;

    /// Components this one reads during hydrate, build or validate.
    fn depends_on(&self) -> &'static [&'static str] {
        &[]
    }

    fn is_enabled(&self, _preset: Preset) -> bool {
        true
    }

    fn flags(&self) -> Vec<Flag> {
        Vec::new()
    }

    /// Overlay a persisted record onto the defaults.
    fn load(&mut self, state: &ComponentState) -> Result<(), StateError>;

    /// The record persisted after a successful run.
    fn save(&self) -> Result<ComponentState, StateError>;

    /// Derive the final configuration. Must not touch the network or disk.
    fn hydrate(&mut self, ctx: &HydrateContext<'_>) -> Result<()>;

    /// Emit build and install operations.
    fn build(&mut self, ctx: &mut BuildContext<'_, '_>) -> Result<()>;

    fn validate(&self, _ctx: &ValidateContext<'_>) -> Result<()> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any;
}

/// Inputs to [`Component::hydrate`].
pub struct HydrateContext<'a> {
    pub preset: Preset,
    pub flags: &'a FlagValues,
    pub defaults: &'a Defaults,
    pub topology: &'a Topology,
    pub view: View<'a>,
}

/// Inputs to [`Component::build`] plus the operation sink.
pub struct BuildContext<'a, 'e> {
    pub preset: Preset,
    pub base_dir: &'a Path,
    pub defaults: &'a Defaults,
    pub topology: &'a Topology,
    pub view: View<'a>,
    owner: &'static str,
    emitter: &'a mut Emitter<'e>,
}

impl<'a, 'e> BuildContext<'a, 'e> {
    pub(crate) fn new(
        preset: Preset,
        base_dir: &'a Path,
        defaults: &'a Defaults,
        topology: &'a Topology,
        view: View<'a>,
        emitter: &'a mut Emitter<'e>,
    ) -> Self {
        BuildContext {
            preset,
            base_dir,
            defaults,
            topology,
            owner: view.requester(),
            view,
            emitter,
        }
    }

    /// Output directory of `bundle`.
    pub fn bundle_dir(&self, bundle: &str) -> PathBuf {
        self.base_dir.join(bundle)
    }

    /// Emit a BuildOp; it runs before this call returns unless planning.
    pub fn build_op(&mut self, bundle: &str, stage: Stage, name: impl Into<String>, op: BuildOp) -> Result<()> {
        self.emitter.build_op(self.owner, bundle, stage, name.into(), op)
    }

    /// Record an InstallOp for the bundle's recipe.
    pub fn install_op(&mut self, bundle: &str, stage: Stage, name: impl Into<String>, op: InstallOp) -> Result<()> {
        self.emitter.install_op(self.owner, bundle, stage, name.into(), op)?;
        Ok(())
    }
}

/// Inputs to [`Component::validate`].
pub struct ValidateContext<'a> {
    pub preset: Preset,
    pub base_dir: &'a Path,
    pub topology: &'a Topology,
    pub view: View<'a>,
}
