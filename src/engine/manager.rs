//! Run orchestration.
//!
//! A [`Manager`] sequences one run: flag checks, dependency ordering,
//! loading persisted state, then the hydrate, build, and validate passes
//! over the enabled components, and finally persistence of state, bundle
//! snapshots, and recipes.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::path::PathBuf;

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;

use crate::core::defaults::Defaults;
use crate::core::flags::{collect_flags, DeclaredFlag, FlagValues};
use crate::core::preset::Preset;
use crate::core::stage::BundleSet;
use crate::core::topology::Topology;
use crate::engine::component::{BuildContext, Component, HydrateContext, ValidateContext};
use crate::engine::emit::{Emitter, Plan};
use crate::engine::error::{ConfigError, RunError};
use crate::engine::persist::{self, StateDocument};
use crate::engine::view::View;
use crate::ops::build::BuildExecutor;
use crate::ops::replay::RECIPE_FILE;
use crate::util::cancel::CancelToken;
use crate::util::config::Config;
use crate::util::fs::{ensure_dir, WriteOutcome};

/// Global flag names no component may declare.
pub const RESERVED_FLAGS: &[&str] = &[
    "preset", "base-dir", "topology", "defaults", "plan", "config", "verbose", "quiet", "color", "help",
    "version",
];

/// What a run does beyond hydrating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    /// Execute BuildOps and persist everything.
    #[default]
    Assemble,
    /// Record operations only; nothing is executed or written.
    Plan,
    /// Skip the build pass; run validate hooks only.
    ValidateOnly,
}

/// Run-wide input shared by every component.
#[derive(Debug, Clone, Default)]
pub struct GlobalInput {
    pub base_dir: PathBuf,
    pub topology: Topology,
    pub flags: FlagValues,
    pub defaults: Defaults,
    pub config: Config,
    pub mode: RunMode,
    pub cancel: CancelToken,
}

/// Result of a successful run.
#[derive(Debug)]
pub struct RunReport {
    pub preset: Preset,
    /// Enabled components in execution order.
    pub order: Vec<&'static str>,
    pub plan: Plan,
    /// BuildOps that changed something on disk or in a store.
    pub changed: usize,
    /// Persisted files that were (re)written.
    pub written: Vec<PathBuf>,
    pub state: StateDocument,
}

/// Drives the components through one run.
pub struct Manager {
    presets: Vec<Preset>,
    bundles: BundleSet,
    stage_count: u8,
    components: Vec<Box<dyn Component>>,
    input: GlobalInput,
}

impl Manager {
    pub fn new(
        presets: impl IntoIterator<Item = Preset>,
        bundles: BundleSet,
        stage_count: u8,
        components: Vec<Box<dyn Component>>,
        input: GlobalInput,
    ) -> Result<Self, ConfigError> {
        let presets: Vec<Preset> = presets.into_iter().collect();
        if presets.is_empty() || stage_count == 0 || bundles.iter().next().is_none() {
            return Err(ConfigError::Empty);
        }
        if let Some(dup) = bundles.duplicate() {
            return Err(ConfigError::DuplicateBundle(dup.to_string()));
        }
        for (i, component) in components.iter().enumerate() {
            if components[..i].iter().any(|c| c.name() == component.name()) {
                return Err(ConfigError::DuplicateComponent(component.name().to_string()));
            }
        }

        Ok(Manager {
            presets,
            bundles,
            stage_count,
            components,
            input,
        })
    }

    pub fn bundles(&self) -> &BundleSet {
        &self.bundles
    }

    pub fn components(&self) -> impl Iterator<Item = &dyn Component> {
        self.components.iter().map(|c| c.as_ref())
    }

    fn component(&self, name: &str) -> Option<&dyn Component> {
        self.components().find(|c| c.name() == name)
    }

    fn check_preset(&self, preset: Preset) -> Result<(), ConfigError> {
        if self.presets.contains(&preset) {
            return Ok(());
        }
        Err(ConfigError::UnsupportedPreset {
            preset,
            supported: self
                .presets
                .iter()
                .map(|p| p.as_str())
                .collect::<Vec<_>>()
                .join(", "),
        })
    }

    /// Flags of every registered component, rejecting collisions.
    pub fn declared_flags(&self) -> Result<Vec<DeclaredFlag>, ConfigError> {
        let declarations = self.components.iter().map(|c| (c.name(), c.flags()));
        Ok(collect_flags(declarations, RESERVED_FLAGS)?)
    }

    /// Flags of the components enabled for `preset`.
    pub fn enabled_flags(&self, preset: Preset) -> Result<Vec<DeclaredFlag>, ConfigError> {
        self.check_preset(preset)?;
        let declared = self.declared_flags()?;
        Ok(declared
            .into_iter()
            .filter(|d| self.component(d.owner).is_some_and(|c| c.is_enabled(preset)))
            .collect())
    }

    fn check_flags(&self, preset: Preset) -> Result<(), ConfigError> {
        let declared = self.declared_flags()?;
        self.input.flags.check_known(&declared)?;

        for name in self.input.flags.names() {
            let Some(owner) = declared.iter().find(|d| d.flag.name == name).map(|d| d.owner) else {
                continue;
            };
            if !self.component(owner).is_some_and(|c| c.is_enabled(preset)) {
                return Err(ConfigError::DisabledFlag {
                    flag: name.to_string(),
                    component: owner.to_string(),
                    preset,
                });
            }
        }
        Ok(())
    }

    /// Registration indices of the enabled components, dependencies first.
    ///
    /// Among components whose dependencies are all satisfied, the one
    /// registered earliest runs first.
    pub fn order(&self, preset: Preset) -> Result<Vec<usize>, ConfigError> {
        let mut graph: DiGraph<usize, ()> = DiGraph::new();
        let mut nodes: HashMap<&str, NodeIndex> = HashMap::new();

        for (i, component) in self.components.iter().enumerate() {
            if component.is_enabled(preset) {
                nodes.insert(component.name(), graph.add_node(i));
            }
        }

        for component in self.components.iter().filter(|c| c.is_enabled(preset)) {
            let to = nodes[component.name()];
            for &dep in component.depends_on() {
                match nodes.get(dep) {
                    Some(&from) => {
                        graph.update_edge(from, to, ());
                    }
                    None => {
                        let detail = if self.component(dep).is_some() {
                            format!("disabled for preset `{}`", preset)
                        } else {
                            "not registered".to_string()
                        };
                        return Err(ConfigError::MissingDependency {
                            component: component.name().to_string(),
                            dependency: dep.to_string(),
                            detail,
                        });
                    }
                }
            }
        }

        let mut indegree: Vec<usize> = graph
            .node_indices()
            .map(|n| graph.neighbors_directed(n, Direction::Incoming).count())
            .collect();
        let mut ready: BinaryHeap<Reverse<(usize, NodeIndex)>> = graph
            .node_indices()
            .filter(|n| indegree[n.index()] == 0)
            .map(|n| Reverse((graph[n], n)))
            .collect();

        let mut order = Vec::with_capacity(graph.node_count());
        while let Some(Reverse((index, node))) = ready.pop() {
            order.push(index);
            for next in graph.neighbors(node) {
                indegree[next.index()] -= 1;
                if indegree[next.index()] == 0 {
                    ready.push(Reverse((graph[next], next)));
                }
            }
        }

        if order.len() < graph.node_count() {
            return Err(ConfigError::DependencyCycle(self.cycle_members(&graph)));
        }
        Ok(order)
    }

    fn cycle_members(&self, graph: &DiGraph<usize, ()>) -> Vec<String> {
        let cycle = tarjan_scc(graph)
            .into_iter()
            .find(|scc| scc.len() > 1 || graph.contains_edge(scc[0], scc[0]))
            .unwrap_or_default();

        let mut indices: Vec<usize> = cycle.iter().map(|&n| graph[n]).collect();
        indices.sort_unstable();
        let mut names: Vec<String> = indices
            .iter()
            .map(|&i| self.components[i].name().to_string())
            .collect();
        if let Some(first) = names.first().cloned() {
            names.push(first);
        }
        names
    }

    /// Run every phase for `preset`.
    pub fn run(&mut self, preset: Preset) -> Result<RunReport, RunError> {
        self.check_preset(preset)?;
        self.check_flags(preset)?;
        let order = self.order(preset)?;

        let state = persist::load_state(&self.input.base_dir)?;
        if let Some(doc) = &state {
            if doc.preset != preset {
                return Err(ConfigError::PresetMismatch {
                    path: persist::state_path(&self.input.base_dir),
                    found: doc.preset,
                    requested: preset,
                }
                .into());
            }
        }

        let mut slots: Vec<Option<Box<dyn Component>>> =
            std::mem::take(&mut self.components).into_iter().map(Some).collect();
        let mut ordered: Vec<Box<dyn Component>> =
            order.iter().filter_map(|&i| slots[i].take()).collect();

        let result = self.run_ordered(preset, &mut ordered, state.as_ref());

        for (component, &i) in ordered.into_iter().zip(&order) {
            slots[i] = Some(component);
        }
        self.components = slots.into_iter().flatten().collect();

        result
    }

    fn run_ordered(
        &self,
        preset: Preset,
        ordered: &mut [Box<dyn Component>],
        state: Option<&StateDocument>,
    ) -> Result<RunReport, RunError> {
        let input = &self.input;
        let names: Vec<&'static str> = ordered.iter().map(|c| c.name()).collect();
        tracing::info!("running {} components for preset {}: {}", names.len(), preset, names.join(", "));

        if let Some(doc) = state {
            for component in ordered.iter_mut() {
                if let Some(record) = doc.components.get(component.name()) {
                    component
                        .load(record)
                        .map_err(|source| ConfigError::ComponentState {
                            component: component.name().to_string(),
                            source,
                        })?;
                }
            }
        }

        for i in 0..ordered.len() {
            let (done, rest) = ordered.split_at_mut(i);
            let current = &mut rest[0];
            let ctx = HydrateContext {
                preset,
                flags: &input.flags,
                defaults: &input.defaults,
                topology: &input.topology,
                view: View::new(current.name(), current.depends_on(), done, &names[i..]),
            };
            tracing::debug!("hydrating {}", current.name());
            current.hydrate(&ctx).map_err(|source| RunError::Hydrate {
                component: current.name().to_string(),
                source,
            })?;
        }

        let executor = (input.mode == RunMode::Assemble)
            .then(|| BuildExecutor::new(&input.base_dir, input.config.clone(), input.cancel.clone()));
        let mut emitter = Emitter::new(&self.bundles, self.stage_count, executor.as_ref());

        if input.mode != RunMode::ValidateOnly {
            if input.mode == RunMode::Assemble {
                for bundle in self.bundles.iter() {
                    let dir = input.base_dir.join(bundle.name);
                    ensure_dir(&dir).map_err(|source| RunError::Persist { path: dir, source })?;
                }
            }

            for i in 0..ordered.len() {
                let (done, rest) = ordered.split_at_mut(i);
                let current = &mut rest[0];
                let name = current.name();
                input.cancel.check().map_err(|e| RunError::Build {
                    component: name.to_string(),
                    source: e.into(),
                })?;

                let view = View::new(name, current.depends_on(), done, &names[i..]);
                let mut ctx = BuildContext::new(
                    preset,
                    &input.base_dir,
                    &input.defaults,
                    &input.topology,
                    view,
                    &mut emitter,
                );
                tracing::debug!("building {}", name);
                current.build(&mut ctx).map_err(|source| RunError::Build {
                    component: name.to_string(),
                    source,
                })?;
            }
        }
        let (plan, changed) = emitter.finish();

        let finalized: &[Box<dyn Component>] = ordered;
        for component in finalized {
            let ctx = ValidateContext {
                preset,
                base_dir: &input.base_dir,
                topology: &input.topology,
                view: View::new(component.name(), component.depends_on(), finalized, &[]),
            };
            component.validate(&ctx).map_err(|source| RunError::Validate {
                component: component.name().to_string(),
                source,
            })?;
        }

        let state_path = persist::state_path(&input.base_dir);
        let mut doc = StateDocument::new(preset);
        for component in finalized {
            let record = component.save().map_err(|e| RunError::Persist {
                path: state_path.clone(),
                source: anyhow::Error::new(e)
                    .context(format!("failed to save state of component `{}`", component.name())),
            })?;
            doc.components.insert(component.name().to_string(), record);
        }

        let written = if input.mode == RunMode::Assemble {
            self.persist(&doc, &plan)?
        } else {
            Vec::new()
        };

        tracing::info!(
            "{} operations across {} bundles, {} changed",
            plan.op_count(),
            self.bundles.names().len(),
            changed
        );

        Ok(RunReport {
            preset,
            order: names,
            plan,
            changed,
            written,
            state: doc,
        })
    }

    fn persist(&self, doc: &StateDocument, plan: &Plan) -> Result<Vec<PathBuf>, RunError> {
        let base_dir = &self.input.base_dir;
        let mut written = Vec::new();

        let mut record = |path: PathBuf, outcome: anyhow::Result<WriteOutcome>| {
            match outcome {
                Ok(o) if o.is_written() => {
                    tracing::debug!("wrote {}", path.display());
                    written.push(path);
                    Ok(())
                }
                Ok(_) => Ok(()),
                Err(source) => Err(RunError::Persist { path, source }),
            }
        };

        let state_path = persist::state_path(base_dir);
        record(state_path.clone(), persist::write_state(&state_path, doc))?;

        for bundle in self.bundles.iter() {
            let dir = base_dir.join(bundle.name);
            let snapshot = persist::state_path(&dir);
            record(snapshot.clone(), persist::write_state(&snapshot, doc))?;

            if let Some(recipe) = plan.recipe(bundle.name) {
                let path = dir.join(RECIPE_FILE);
                record(path, persist::write_recipe(&dir, &recipe))?;
            }
        }

        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::flags::{Flag, FlagError};
    use crate::core::stage::{Bundle, Stage};
    use crate::engine::component::Named;
    use crate::engine::error::{StateError, ViewError};
    use crate::engine::persist::ComponentState;
    use crate::ops::op::{BuildOp, InstallOp, RenderTarget, Template};
    use serde_json::json;
    use std::any::Any;
    use tempfile::TempDir;

    struct Node {
        name: &'static str,
        deps: &'static [&'static str],
        only: Option<Preset>,
        flags: Vec<Flag>,
    }

    impl Node {
        fn new(name: &'static str, deps: &'static [&'static str]) -> Box<dyn Component> {
            Box::new(Node {
                name,
                deps,
                only: None,
                flags: Vec::new(),
            })
        }
    }

    impl Component for Node {
        fn name(&self) -> &'static str {
            self.name
        }
        fn depends_on(&self) -> &'static [&'static str] {
            self.deps
        }
        fn is_enabled(&self, preset: Preset) -> bool {
            self.only.map_or(true, |p| p == preset)
        }
        fn flags(&self) -> Vec<Flag> {
            self.flags.clone()
        }
        fn load(&mut self, _state: &ComponentState) -> Result<(), StateError> {
            Ok(())
        }
        fn save(&self) -> Result<ComponentState, StateError> {
            ComponentState::encode(1, &())
        }
        fn hydrate(&mut self, _ctx: &HydrateContext<'_>) -> anyhow::Result<()> {
            Ok(())
        }
        fn build(&mut self, _ctx: &mut BuildContext<'_, '_>) -> anyhow::Result<()> {
            Ok(())
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[derive(Default)]
    struct Upstream {
        value: String,
    }

    impl Named for Upstream {
        const NAME: &'static str = "upstream";
    }

    impl Component for Upstream {
        fn name(&self) -> &'static str {
            Self::NAME
        }
        fn flags(&self) -> Vec<Flag> {
            vec![Flag::string("upstream-value", "Value handed downstream")]
        }
        fn load(&mut self, state: &ComponentState) -> Result<(), StateError> {
            match state.version {
                1 => {
                    self.value = state.decode()?;
                    Ok(())
                }
                v => Err(StateError::unsupported(v, &[1])),
            }
        }
        fn save(&self) -> Result<ComponentState, StateError> {
            ComponentState::encode(1, &self.value)
        }
        fn hydrate(&mut self, ctx: &HydrateContext<'_>) -> anyhow::Result<()> {
            if let Some(v) = ctx.flags.get_str("upstream-value")? {
                self.value = v.to_string();
            }
            if self.value.is_empty() {
                self.value = "default".to_string();
            }
            Ok(())
        }
        fn build(&mut self, ctx: &mut BuildContext<'_, '_>) -> anyhow::Result<()> {
            ctx.install_op(
                "install",
                Stage(0),
                "upstream-ready",
                InstallOp::command(["echo", self.value.as_str()]),
            )
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    struct Downstream {
        deps: &'static [&'static str],
        seen: String,
    }

    impl Downstream {
        fn boxed(deps: &'static [&'static str]) -> Box<dyn Component> {
            Box::new(Downstream {
                deps,
                seen: String::new(),
            })
        }
    }

    impl Component for Downstream {
        fn name(&self) -> &'static str {
            "downstream"
        }
        fn depends_on(&self) -> &'static [&'static str] {
            self.deps
        }
        fn load(&mut self, _state: &ComponentState) -> Result<(), StateError> {
            Ok(())
        }
        fn save(&self) -> Result<ComponentState, StateError> {
            ComponentState::encode(1, &self.seen)
        }
        fn hydrate(&mut self, ctx: &HydrateContext<'_>) -> anyhow::Result<()> {
            self.seen = format!("{}-down", ctx.view.get::<Upstream>()?.value);
            Ok(())
        }
        fn build(&mut self, ctx: &mut BuildContext<'_, '_>) -> anyhow::Result<()> {
            ctx.build_op(
                "os",
                Stage(1),
                "motd",
                BuildOp::RenderTemplate {
                    template: Template::new("motd", "{{ seen }}\n"),
                    vars: json!({ "seen": self.seen }),
                    target: RenderTarget::File {
                        path: "motd".into(),
                        mode: None,
                    },
                },
            )?;
            ctx.install_op("install", Stage(1), "downstream", InstallOp::command(["true"]))
        }
        fn validate(&self, ctx: &ValidateContext<'_>) -> anyhow::Result<()> {
            let upstream = ctx.view.get::<Upstream>()?;
            anyhow::ensure!(self.seen.starts_with(&upstream.value), "stale upstream value");
            Ok(())
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn bundles() -> BundleSet {
        BundleSet::new([Bundle::new("install", true), Bundle::new("os", false)])
    }

    fn input(base: &std::path::Path, mode: RunMode) -> GlobalInput {
        GlobalInput {
            base_dir: base.to_path_buf(),
            mode,
            ..GlobalInput::default()
        }
    }

    fn manager(components: Vec<Box<dyn Component>>, input: GlobalInput) -> Manager {
        Manager::new(Preset::ALL, bundles(), 2, components, input).unwrap()
    }

    fn order_names(m: &Manager, preset: Preset) -> Result<Vec<&'static str>, ConfigError> {
        let order = m.order(preset)?;
        Ok(order.into_iter().map(|i| m.components[i].name()).collect())
    }

    #[test]
    fn test_order_is_stable_topological() {
        let m = manager(
            vec![Node::new("c", &["a"]), Node::new("a", &[]), Node::new("b", &[])],
            GlobalInput::default(),
        );
        assert_eq!(order_names(&m, Preset::Lab).unwrap(), ["a", "c", "b"]);
    }

    #[test]
    fn test_cycle_names_members() {
        let m = manager(
            vec![Node::new("a", &["b"]), Node::new("b", &["a"]), Node::new("c", &[])],
            GlobalInput::default(),
        );
        match order_names(&m, Preset::Lab) {
            Err(ConfigError::DependencyCycle(members)) => assert_eq!(members, ["a", "b", "a"]),
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_and_disabled_dependencies() {
        let m = manager(vec![Node::new("a", &["ghost"])], GlobalInput::default());
        match order_names(&m, Preset::Lab) {
            Err(ConfigError::MissingDependency { detail, .. }) => assert_eq!(detail, "not registered"),
            other => panic!("expected missing dependency, got {:?}", other),
        }

        let vlab_only = Box::new(Node {
            name: "sim",
            deps: &[],
            only: Some(Preset::Vlab),
            flags: Vec::new(),
        });
        let m = manager(vec![vlab_only, Node::new("a", &["sim"])], GlobalInput::default());
        assert!(order_names(&m, Preset::Vlab).is_ok());
        match order_names(&m, Preset::Lab) {
            Err(ConfigError::MissingDependency { detail, .. }) => assert!(detail.contains("disabled")),
            other => panic!("expected disabled dependency, got {:?}", other),
        }
    }

    #[test]
    fn test_registration_errors() {
        assert!(matches!(
            Manager::new(Preset::ALL, bundles(), 2, vec![Node::new("a", &[]), Node::new("a", &[])], GlobalInput::default()),
            Err(ConfigError::DuplicateComponent(name)) if name == "a"
        ));
        assert!(matches!(
            Manager::new(Vec::new(), bundles(), 2, Vec::new(), GlobalInput::default()),
            Err(ConfigError::Empty)
        ));
        let mut m = Manager::new([Preset::Lab], bundles(), 2, Vec::new(), GlobalInput::default()).unwrap();
        assert!(matches!(
            m.run(Preset::Vlab),
            Err(RunError::Config(ConfigError::UnsupportedPreset { .. }))
        ));
    }

    #[test]
    fn test_flag_checks() {
        let with_flag = |name: &'static str, flag: &'static str, only: Option<Preset>| -> Box<dyn Component> {
            Box::new(Node {
                name,
                deps: &[],
                only,
                flags: vec![Flag::string(flag, "")],
            })
        };

        let m = manager(
            vec![with_flag("a", "shared", None), with_flag("b", "shared", None)],
            GlobalInput::default(),
        );
        assert!(matches!(
            m.declared_flags(),
            Err(ConfigError::Flag(FlagError::Duplicate { .. }))
        ));

        let tmp = TempDir::new().unwrap();
        let mut unknown = input(tmp.path(), RunMode::Plan);
        unknown.flags = FlagValues::new().with("nope", "x");
        let mut m = manager(vec![with_flag("a", "real", None)], unknown);
        assert!(matches!(
            m.run(Preset::Lab),
            Err(RunError::Config(ConfigError::Flag(FlagError::Unknown { .. })))
        ));

        let mut disabled = input(tmp.path(), RunMode::Plan);
        disabled.flags = FlagValues::new().with("sim-only", "x");
        let mut m = manager(vec![with_flag("sim", "sim-only", Some(Preset::Vlab))], disabled);
        assert!(matches!(
            m.run(Preset::Lab),
            Err(RunError::Config(ConfigError::DisabledFlag { .. }))
        ));
        assert!(m.enabled_flags(Preset::Lab).unwrap().is_empty());
        assert_eq!(m.enabled_flags(Preset::Vlab).unwrap().len(), 1);
    }

    #[test]
    fn test_reserved_flag_rejected() {
        let m = manager(
            vec![Box::new(Node {
                name: "a",
                deps: &[],
                only: None,
                flags: vec![Flag::string("preset", "")],
            })],
            GlobalInput::default(),
        );
        assert!(matches!(
            m.declared_flags(),
            Err(ConfigError::Flag(FlagError::Reserved { .. }))
        ));
    }

    #[test]
    fn test_view_reports_undeclared_read() {
        let tmp = TempDir::new().unwrap();
        let mut m = manager(
            vec![Box::new(Upstream::default()), Downstream::boxed(&[])],
            input(tmp.path(), RunMode::Plan),
        );
        let err = m.run(Preset::Lab).unwrap_err();
        assert_eq!(err.component(), Some("downstream"));
        match err {
            RunError::Hydrate { source, .. } => assert_eq!(
                source.downcast_ref::<ViewError>(),
                Some(&ViewError::Undeclared {
                    requester: "downstream",
                    target: "upstream"
                })
            ),
            other => panic!("expected hydrate error, got {:?}", other),
        }
    }

    #[test]
    fn test_view_rejects_pending_component() {
        let pending = ["downstream", "upstream"];
        let view = View::new("downstream", &["upstream"], &[], &pending);
        assert_eq!(
            view.get::<Upstream>().err(),
            Some(ViewError::NotHydrated {
                requester: "downstream",
                target: "upstream"
            })
        );
    }

    #[test]
    fn test_assemble_persists_and_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let components = || vec![Downstream::boxed(&["upstream"]), Box::new(Upstream::default()) as Box<dyn Component>];

        let mut first = input(tmp.path(), RunMode::Assemble);
        first.flags = FlagValues::new().with("upstream-value", "v1");
        let report = manager(components(), first).run(Preset::Lab).unwrap();
        assert_eq!(report.order, ["upstream", "downstream"]);
        assert_eq!(report.changed, 1);
        assert!(report.written.contains(&tmp.path().join("install/recipe.yaml")));
        assert!(tmp.path().join("os/stagehand.yaml").is_file());
        assert!(!tmp.path().join("os/recipe.yaml").exists());
        assert_eq!(std::fs::read_to_string(tmp.path().join("os/motd")).unwrap(), "v1-down\n");

        let snapshot = std::fs::read(tmp.path().join("install/recipe.yaml")).unwrap();

        // No flags: the persisted value carries over and nothing is rewritten.
        let report = manager(components(), input(tmp.path(), RunMode::Assemble))
            .run(Preset::Lab)
            .unwrap();
        assert_eq!(report.changed, 0);
        assert!(report.written.is_empty(), "rewrote {:?}", report.written);
        assert_eq!(std::fs::read(tmp.path().join("install/recipe.yaml")).unwrap(), snapshot);

        let recipe = report.plan.recipe("install").unwrap();
        let names: Vec<_> = recipe.ops.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["upstream-ready", "downstream"]);
    }

    #[test]
    fn test_plan_mode_writes_nothing() {
        let tmp = TempDir::new().unwrap();
        let mut m = manager(
            vec![Box::new(Upstream::default()), Downstream::boxed(&["upstream"])],
            input(tmp.path(), RunMode::Plan),
        );
        let report = m.run(Preset::Lab).unwrap();
        assert_eq!(report.plan.op_count(), 3);
        assert!(std::fs::read_dir(tmp.path()).unwrap().next().is_none());

        // The manager can run again after a run.
        assert!(m.run(Preset::Lab).is_ok());
    }

    #[test]
    fn test_preset_mismatch_with_persisted_state() {
        let tmp = TempDir::new().unwrap();
        manager(vec![Box::new(Upstream::default())], input(tmp.path(), RunMode::Assemble))
            .run(Preset::Lab)
            .unwrap();

        let err = manager(vec![Box::new(Upstream::default())], input(tmp.path(), RunMode::Assemble))
            .run(Preset::Vlab)
            .unwrap_err();
        assert!(matches!(
            err,
            RunError::Config(ConfigError::PresetMismatch {
                found: Preset::Lab,
                requested: Preset::Vlab,
                ..
            })
        ));
    }

    #[test]
    fn test_unsupported_component_state_version() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join("stagehand.yaml"),
            "version: 1\npreset: lab\ncomponents:\n  upstream:\n    version: 4\n    config: x\n",
        )
        .unwrap();
        let err = manager(vec![Box::new(Upstream::default())], input(tmp.path(), RunMode::Plan))
            .run(Preset::Lab)
            .unwrap_err();
        assert!(matches!(
            err,
            RunError::Config(ConfigError::ComponentState {
                source: StateError::UnsupportedVersion { found: 4, .. },
                ..
            })
        ));
    }

    #[test]
    fn test_validate_only_skips_build() {
        let tmp = TempDir::new().unwrap();
        let report = manager(
            vec![Box::new(Upstream::default()), Downstream::boxed(&["upstream"])],
            input(tmp.path(), RunMode::ValidateOnly),
        )
        .run(Preset::Lab)
        .unwrap();
        assert_eq!(report.plan.op_count(), 0);
        assert!(!tmp.path().join("os").exists());
    }
}
