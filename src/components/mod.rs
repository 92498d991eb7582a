//! Built-in components of the control node installer.
//!
//! | component   | reads                 |
//! |-------------|-----------------------|
//! | `base`      |                       |
//! | `bootstrap` | `base`                |
//! | `registry`  | `base`, `bootstrap`   |
//! | `fabric`    | `base`, `registry`    |

pub mod base;
pub mod bootstrap;
pub mod fabric;
pub mod registry;

use std::fmt::Display;
use std::str::FromStr;

use anyhow::{anyhow, Result};

use crate::core::flags::FlagValues;
use crate::core::preset::Preset;
use crate::core::stage::{Bundle, BundleSet};
use crate::engine::{Component, ConfigError, GlobalInput, HydrateContext, Manager};
use crate::ops::op::{InstallOp, RetryPolicy};

pub use base::Base;
pub use bootstrap::Bootstrap;
pub use fabric::Fabric;
pub use registry::Registry;

/// Install checkpoints of the control node.
pub mod stages {
    use crate::core::stage::Stage;

    pub const BOOTSTRAP: Stage = Stage::new(0);
    pub const REGISTRY: Stage = Stage::new(1);
    pub const FABRIC: Stage = Stage::new(2);
    pub const READY: Stage = Stage::new(3);
}

pub const STAGE_COUNT: u8 = 4;

/// Installer bundle replayed on the control node.
pub const CONTROL_INSTALL: &str = "control-install";

/// Provisioning descriptor for the control node OS.
pub const CONTROL_OS: &str = "control-os";

/// Manifests in this directory are applied by the bootstrap cluster.
pub(crate) const AUTO_DEPLOY_DIR: &str = "/var/lib/rancher/k3s/server/manifests";

pub fn bundles() -> BundleSet {
    BundleSet::new([Bundle::new(CONTROL_INSTALL, true), Bundle::new(CONTROL_OS, false)])
}

/// Built-in components in registration order.
pub fn builtin() -> Vec<Box<dyn Component>> {
    vec![
        Box::new(Base::default()),
        Box::new(Bootstrap::default()),
        Box::new(Registry::default()),
        Box::new(Fabric::default()),
    ]
}

/// Manager over the built-in components, bundles, and stages.
pub fn manager(input: GlobalInput) -> Result<Manager, ConfigError> {
    Manager::new(Preset::ALL, bundles(), STAGE_COUNT, builtin(), input)
}

/// Copy a bundle file into place on the target host.
pub(crate) fn install_file(src: &str, dest: &str, mode: &str) -> InstallOp {
    InstallOp::command(["install", "-D", "-m", mode, src, dest])
}

/// Readiness policy of a wait: the persisted override, or `default` with its
/// attempts scaled for the preset.
pub(crate) fn ready_retry(ctx: &HydrateContext<'_>, over: Option<RetryPolicy>, default: RetryPolicy) -> RetryPolicy {
    over.unwrap_or_else(|| {
        let scale = ctx.defaults.preset(ctx.preset).wait_scale.max(1);
        RetryPolicy {
            attempts: default.attempts.saturating_mul(scale),
            ..default
        }
    })
}

/// Parse a string flag into `T`.
pub(crate) fn parse_flag<T>(flags: &FlagValues, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    match flags.get_str(name)? {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e| anyhow!("invalid value `{}` for --{}: {}", raw, name, e)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::flags::FlagValues;
    use crate::core::stage::Stage;
    use crate::engine::{RunError, RunMode};
    use crate::ipam::ValidationError;
    use crate::engine::persist::{state_path, write_state};
    use crate::ops::op::{BuildOp, RenderTarget};
    use std::collections::HashSet;
    use tempfile::TempDir;

    fn plan_input(tmp: &TempDir) -> GlobalInput {
        GlobalInput {
            base_dir: tmp.path().to_path_buf(),
            mode: RunMode::Plan,
            ..GlobalInput::default()
        }
    }

    #[test]
    fn test_builtin_flags_do_not_collide() {
        let m = manager(GlobalInput::default()).unwrap();
        let flags = m.declared_flags().unwrap();
        assert!(flags.iter().any(|d| d.owner == "base" && d.flag.name == "control-vip"));
        assert!(flags.iter().any(|d| d.owner == "fabric" && d.flag.name == "vtep-subnet"));
    }

    #[test]
    fn test_plan_for_builtin_components() {
        let tmp = TempDir::new().unwrap();
        let report = manager(plan_input(&tmp)).unwrap().run(Preset::Lab).unwrap();

        assert_eq!(report.order, ["base", "bootstrap", "registry", "fabric"]);
        assert!(std::fs::read_dir(tmp.path()).unwrap().next().is_none());

        let recipe = report.plan.recipe(CONTROL_INSTALL).unwrap();
        let stages: Vec<Stage> = recipe.ops.iter().map(|e| e.stage).collect();
        let mut sorted = stages.clone();
        sorted.sort();
        assert_eq!(stages, sorted);
        assert_eq!(
            recipe.stages(),
            [stages::BOOTSTRAP, stages::REGISTRY, stages::FABRIC, stages::READY]
        );

        let names: HashSet<&str> = recipe.ops.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names.len(), recipe.ops.len());
        assert_eq!(recipe.ops[0].name, "ca-trust");
        assert!(names.contains("node-ready"));
        assert!(names.contains("registry-ready"));

        let os = report.plan.bundle(CONTROL_OS).unwrap();
        assert!(os.install.is_empty());
        assert!(os.build.iter().any(|p| matches!(
            &p.op,
            BuildOp::RenderTemplate {
                target: RenderTarget::Provisioning { .. },
                ..
            }
        )));
    }

    #[test]
    fn test_registry_address_flows_from_base() {
        let tmp = TempDir::new().unwrap();
        let mut input = plan_input(&tmp);
        input.flags = FlagValues::new()
            .with("control-vip", "172.30.0.9/32")
            .with("fabric-version", "v9.9.9");
        let report = manager(input).unwrap().run(Preset::Vlab).unwrap();

        let plan = serde_json::to_string(&report.plan).unwrap();
        assert!(plan.contains("172.30.0.9:31000/airgap"));
        assert!(plan.contains("https://172.30.0.9:31000/v2/"));
        assert!(plan.contains("v9.9.9"));
    }

    #[test]
    fn test_conflicting_plan_fails_validation() {
        let tmp = TempDir::new().unwrap();
        let mut input = plan_input(&tmp);
        input.flags = FlagValues::new().with("vtep-subnet", "172.30.0.128/25");

        let err = manager(input).unwrap().run(Preset::Lab).unwrap_err();
        match err {
            RunError::Validate { component, source } => {
                assert_eq!(component, "fabric");
                let plan = source.downcast_ref::<ValidationError>().unwrap();
                assert!(plan.to_string().contains("172.30.0.128/25"));
            }
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    fn wait_attempts(tmp: &TempDir, preset: Preset) -> Vec<(String, u32)> {
        let report = manager(plan_input(tmp)).unwrap().run(preset).unwrap();
        report
            .plan
            .recipe(CONTROL_INSTALL)
            .unwrap()
            .ops
            .into_iter()
            .filter_map(|e| match e.op {
                InstallOp::WaitForResource { retry, .. } | InstallOp::WaitForEndpoint { retry, .. } => {
                    Some((e.name, retry.attempts))
                }
                InstallOp::RunCommand { .. } => None,
            })
            .collect()
    }

    #[test]
    fn test_vlab_waits_longer_than_lab() {
        let lab = wait_attempts(&TempDir::new().unwrap(), Preset::Lab);
        let vlab = wait_attempts(&TempDir::new().unwrap(), Preset::Vlab);

        assert!(lab.contains(&("node-ready".to_string(), 60)));
        assert!(lab.contains(&("fabric-ready".to_string(), 120)));
        assert_eq!(lab.len(), vlab.len());
        for ((name, attempts), (vlab_name, vlab_attempts)) in lab.iter().zip(&vlab) {
            assert_eq!(name, vlab_name);
            assert_eq!(*vlab_attempts, attempts * 2, "{}", name);
        }
    }

    #[test]
    fn test_persisted_retry_is_not_scaled() {
        let tmp = TempDir::new().unwrap();
        let first = manager(plan_input(&tmp)).unwrap().run(Preset::Vlab).unwrap().state;
        assert!(first.components["registry"].config.get("readyRetryOverride").is_none());

        let mut doc = first.clone();
        let retry: serde_yaml::Value = serde_yaml::from_str("{attempts: 7, interval: 2}").unwrap();
        let registry = doc.components.get_mut("registry").unwrap();
        registry
            .config
            .as_mapping_mut()
            .unwrap()
            .insert("readyRetryOverride".into(), retry);
        write_state(&state_path(tmp.path()), &doc).unwrap();

        let waits = wait_attempts(&tmp, Preset::Vlab);
        assert!(waits.contains(&("registry-ready".to_string(), 7)));
        assert!(waits.contains(&("node-ready".to_string(), 120)));
    }
}
