//! Operation sink used during the Build pass.
//!
//! Every emitted op is admitted against the bundle set and stage count,
//! and its name must be unique within its bundle. BuildOps are executed on
//! admission unless the run only plans; InstallOps are only recorded.

use std::collections::{BTreeMap, HashMap};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::core::stage::{BundleSet, Stage};
use crate::engine::error::EmitError;
use crate::ops::build::{BuildExecutor, OpOutcome};
use crate::ops::op::{BuildOp, InstallOp, Recipe, RecipeEntry};

/// An admitted operation with its stage, name, and emitting component.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedOp<O> {
    pub stage: Stage,
    pub name: String,
    pub component: &'static str,
    #[serde(flatten)]
    pub op: O,
}

/// Operations of one bundle, in emission order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BundlePlan {
    pub installer: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub build: Vec<PlannedOp<BuildOp>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub install: Vec<PlannedOp<InstallOp>>,
}

impl BundlePlan {
    pub fn is_empty(&self) -> bool {
        self.build.is_empty() && self.install.is_empty()
    }
}

/// Every operation of a run, keyed by bundle.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct Plan {
    bundles: BTreeMap<String, BundlePlan>,
}

impl Plan {
    pub fn bundle(&self, name: &str) -> Option<&BundlePlan> {
        self.bundles.get(name)
    }

    pub fn bundles(&self) -> impl Iterator<Item = (&str, &BundlePlan)> {
        self.bundles.iter().map(|(name, plan)| (name.as_str(), plan))
    }

    pub fn op_count(&self) -> usize {
        self.bundles
            .values()
            .map(|b| b.build.len() + b.install.len())
            .sum()
    }

    /// Replay recipe of an installer bundle.
    pub fn recipe(&self, bundle: &str) -> Option<Recipe> {
        let plan = self.bundles.get(bundle).filter(|p| p.installer)?;
        let entries = plan
            .install
            .iter()
            .map(|p| RecipeEntry {
                bundle: bundle.to_string(),
                stage: p.stage,
                name: p.name.clone(),
                op: p.op.clone(),
            })
            .collect();
        Some(Recipe::new(bundle, entries))
    }
}

/// Collects operations emitted by components.
pub struct Emitter<'a> {
    bundles: &'a BundleSet,
    stage_count: u8,
    executor: Option<&'a BuildExecutor>,
    plan: Plan,
    owners: HashMap<(String, String), &'static str>,
    changed: usize,
}

impl<'a> Emitter<'a> {
    /// `executor` is `None` when BuildOps should only be planned.
    pub fn new(bundles: &'a BundleSet, stage_count: u8, executor: Option<&'a BuildExecutor>) -> Self {
        let plan = Plan {
            bundles: bundles
                .iter()
                .map(|b| {
                    (
                        b.name.to_string(),
                        BundlePlan {
                            installer: b.installer,
                            ..BundlePlan::default()
                        },
                    )
                })
                .collect(),
        };
        Emitter {
            bundles,
            stage_count,
            executor,
            plan,
            owners: HashMap::new(),
            changed: 0,
        }
    }

    fn admit(
        &mut self,
        owner: &'static str,
        bundle: &str,
        stage: Stage,
        name: &str,
        install: bool,
    ) -> Result<(), EmitError> {
        let Some(target) = self.bundles.get(bundle) else {
            return Err(EmitError::UnknownBundle {
                bundle: bundle.to_string(),
                name: name.to_string(),
            });
        };
        if install && !target.installer {
            return Err(EmitError::NotInstaller {
                bundle: bundle.to_string(),
                name: name.to_string(),
            });
        }
        if stage.index() >= self.stage_count {
            return Err(EmitError::StageOutOfRange {
                name: name.to_string(),
                stage,
                count: self.stage_count,
            });
        }

        let key = (bundle.to_string(), name.to_string());
        if let Some(first) = self.owners.get(&key) {
            return Err(EmitError::DuplicateName {
                bundle: bundle.to_string(),
                name: name.to_string(),
                first: first.to_string(),
                second: owner.to_string(),
            });
        }
        self.owners.insert(key, owner);
        Ok(())
    }

    fn bundle_plan(&mut self, bundle: &str) -> &mut BundlePlan {
        self.plan.bundles.entry(bundle.to_string()).or_default()
    }

    /// Admit a BuildOp and execute it unless planning.
    pub fn build_op(
        &mut self,
        owner: &'static str,
        bundle: &str,
        stage: Stage,
        name: String,
        op: BuildOp,
    ) -> Result<()> {
        self.admit(owner, bundle, stage, &name, false)?;

        if let Some(executor) = self.executor {
            let outcome = executor
                .execute(bundle, &op)
                .with_context(|| format!("operation `{}` ({}) in bundle `{}` failed", name, op.kind(), bundle))?;
            match outcome {
                OpOutcome::Changed => {
                    self.changed += 1;
                    tracing::debug!("{}/{}: {} changed", bundle, name, op.kind());
                }
                OpOutcome::Unchanged => {
                    tracing::debug!("{}/{}: {} up to date", bundle, name, op.kind());
                }
            }
        }

        self.bundle_plan(bundle).build.push(PlannedOp {
            stage,
            name,
            component: owner,
            op,
        });
        Ok(())
    }

    /// Record an InstallOp for replay.
    pub fn install_op(
        &mut self,
        owner: &'static str,
        bundle: &str,
        stage: Stage,
        name: String,
        op: InstallOp,
    ) -> Result<(), EmitError> {
        self.admit(owner, bundle, stage, &name, true)?;
        self.bundle_plan(bundle).install.push(PlannedOp {
            stage,
            name,
            component: owner,
            op,
        });
        Ok(())
    }

    /// Number of executed BuildOps that changed something.
    pub fn changed(&self) -> usize {
        self.changed
    }

    pub fn finish(self) -> (Plan, usize) {
        (self.plan, self.changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::stage::Bundle;
    use crate::ops::op::{RenderTarget, Template};
    use crate::util::cancel::CancelToken;
    use crate::util::config::Config;
    use serde_json::json;
    use tempfile::TempDir;

    fn bundles() -> BundleSet {
        BundleSet::new([Bundle::new("install", true), Bundle::new("os", false)])
    }

    fn render(path: &str) -> BuildOp {
        BuildOp::RenderTemplate {
            template: Template::new("t", "x={{ x }}\n"),
            vars: json!({"x": 1}),
            target: RenderTarget::File {
                path: path.into(),
                mode: None,
            },
        }
    }

    #[test]
    fn test_names_unique_per_bundle() {
        let set = bundles();
        let mut emitter = Emitter::new(&set, 2, None);
        emitter
            .install_op("a", "install", Stage(0), "step".into(), InstallOp::command(["true"]))
            .unwrap();
        emitter
            .build_op("a", "os", Stage(0), "step".into(), render("x"))
            .unwrap();

        let err = emitter
            .install_op("b", "install", Stage(1), "step".into(), InstallOp::command(["true"]))
            .unwrap_err();
        assert_eq!(
            err,
            EmitError::DuplicateName {
                bundle: "install".into(),
                name: "step".into(),
                first: "a".into(),
                second: "b".into(),
            }
        );
    }

    #[test]
    fn test_admission_checks() {
        let set = bundles();
        let mut emitter = Emitter::new(&set, 2, None);

        assert!(matches!(
            emitter.install_op("a", "nope", Stage(0), "x".into(), InstallOp::command(["true"])),
            Err(EmitError::UnknownBundle { .. })
        ));
        assert!(matches!(
            emitter.install_op("a", "install", Stage(2), "x".into(), InstallOp::command(["true"])),
            Err(EmitError::StageOutOfRange { count: 2, .. })
        ));
        assert!(matches!(
            emitter.install_op("a", "os", Stage(0), "x".into(), InstallOp::command(["true"])),
            Err(EmitError::NotInstaller { .. })
        ));
    }

    #[test]
    fn test_plan_only_does_not_execute() {
        let tmp = TempDir::new().unwrap();
        let executor = BuildExecutor::new(tmp.path(), Config::default(), CancelToken::new());
        let set = bundles();

        let mut planning = Emitter::new(&set, 1, None);
        planning
            .build_op("a", "os", Stage(0), "render".into(), render("out.txt"))
            .unwrap();
        assert!(!tmp.path().join("os/out.txt").exists());

        let mut executing = Emitter::new(&set, 1, Some(&executor));
        executing
            .build_op("a", "os", Stage(0), "render".into(), render("out.txt"))
            .unwrap();
        assert_eq!(executing.changed(), 1);
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("os/out.txt")).unwrap(),
            "x=1\n"
        );
    }

    #[test]
    fn test_recipe_orders_by_stage_then_emission() {
        let set = bundles();
        let mut emitter = Emitter::new(&set, 3, None);
        for (stage, name) in [(2, "late"), (0, "first"), (1, "middle"), (0, "second")] {
            emitter
                .install_op("a", "install", Stage(stage), name.into(), InstallOp::command(["true"]))
                .unwrap();
        }
        let (plan, _) = emitter.finish();

        let recipe = plan.recipe("install").unwrap();
        let names: Vec<_> = recipe.ops.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["first", "second", "middle", "late"]);
        assert!(plan.recipe("os").is_none());
        assert_eq!(plan.op_count(), 4);
    }
}
