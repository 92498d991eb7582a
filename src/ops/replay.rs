//! Install-time replay of a bundle's recipe.
//!
//! The replayer knows nothing about components: it reads `recipe.yaml` and
//! runs each record in (stage, registration order). The first failing
//! command or exhausted wait stops the replay; later stages never start.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use thiserror::Error;

use crate::core::stage::Stage;
use crate::ops::op::{InstallOp, Recipe, RecipeEntry, RECIPE_VERSION};
use crate::util::cancel::{CancelToken, Cancelled};
use crate::util::config::Config;
use crate::util::process::{find_executable, ProcessBuilder};
use crate::util::shell::{Shell, Status};

/// Name of the recipe file inside an installer bundle.
pub const RECIPE_FILE: &str = "recipe.yaml";

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("failed to load recipe from {}", path.display())]
    Load {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("recipe {} has version {found}; this build understands {expected}", path.display())]
    Version {
        path: PathBuf,
        found: u32,
        expected: u32,
    },

    #[error("bundle `{bundle}` {stage} `{name}` failed")]
    Op {
        bundle: String,
        stage: Stage,
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("bundle `{bundle}` {stage} `{name}`: {what} not ready after {attempts} attempts")]
    WaitExhausted {
        bundle: String,
        stage: Stage,
        name: String,
        what: String,
        attempts: u32,
    },

    #[error("replay cancelled during bundle `{bundle}` {stage} `{name}`")]
    Cancelled {
        bundle: String,
        stage: Stage,
        name: String,
    },
}

impl ReplayError {
    /// `(bundle, stage, name)` of the failing record, when there is one.
    pub fn location(&self) -> Option<(&str, Stage, &str)> {
        match self {
            ReplayError::Op {
                bundle, stage, name, ..
            }
            | ReplayError::WaitExhausted {
                bundle, stage, name, ..
            }
            | ReplayError::Cancelled { bundle, stage, name } => Some((bundle, *stage, name)),
            _ => None,
        }
    }
}

/// Load and version-check a recipe.
pub fn load_recipe(bundle_dir: &Path) -> Result<Recipe, ReplayError> {
    let path = bundle_dir.join(RECIPE_FILE);
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))
        .map_err(|source| ReplayError::Load {
            path: path.clone(),
            source,
        })?;

    #[derive(serde::Deserialize)]
    struct Header {
        version: u32,
    }
    let header: Header = serde_yaml::from_str(&contents).map_err(|e| ReplayError::Load {
        path: path.clone(),
        source: e.into(),
    })?;
    if header.version != RECIPE_VERSION {
        return Err(ReplayError::Version {
            path,
            found: header.version,
            expected: RECIPE_VERSION,
        });
    }

    let recipe: Recipe = serde_yaml::from_str(&contents).map_err(|e| ReplayError::Load {
        path: path.clone(),
        source: e.into(),
    })?;
    if let Some(entry) = recipe.foreign_entry() {
        return Err(ReplayError::Load {
            path,
            source: anyhow!(
                "step `{}` belongs to bundle `{}`, not `{}`",
                entry.name,
                entry.bundle,
                recipe.bundle
            ),
        });
    }
    // Stage order is part of the contract; do not trust the file to be sorted.
    Ok(Recipe::new(recipe.bundle, recipe.ops))
}

/// Host-side effects of install ops.
pub trait InstallRunner {
    /// Run a command to completion; non-zero exit is an error.
    fn run_command(&self, argv: &[String], env: &std::collections::BTreeMap<String, String>) -> Result<()>;

    /// JSON form of a cluster resource, `None` when it does not exist.
    fn get_resource(
        &self,
        resource: &str,
        name: &str,
        namespace: Option<&str>,
    ) -> Result<Option<serde_json::Value>>;

    /// Whether the endpoint answers with a success status.
    fn probe(&self, url: &str, ca_file: Option<&Path>) -> Result<bool>;
}

/// Runner for the real target host: commands via the OS, resources via
/// `kubectl`, endpoints via HTTP.
pub struct SystemRunner {
    workdir: PathBuf,
    kubectl: PathBuf,
    kubeconfig: Option<PathBuf>,
    timeout: std::time::Duration,
    cancel: CancelToken,
}

impl SystemRunner {
    pub fn new(workdir: impl Into<PathBuf>, config: &Config, cancel: CancelToken) -> Self {
        SystemRunner {
            workdir: workdir.into(),
            kubectl: config
                .replay
                .kubectl
                .clone()
                .or_else(|| find_executable("kubectl"))
                .unwrap_or_else(|| PathBuf::from("kubectl")),
            kubeconfig: config.replay.kubeconfig.clone(),
            timeout: config.net_timeout(),
            cancel,
        }
    }
}

impl InstallRunner for SystemRunner {
    fn run_command(&self, argv: &[String], env: &std::collections::BTreeMap<String, String>) -> Result<()> {
        let Some((program, args)) = argv.split_first() else {
            bail!("empty command");
        };
        let cmd = ProcessBuilder::new(program)
            .args(args)
            .envs(env)
            .cwd(&self.workdir);
        tracing::debug!("running {}", cmd.display_command());

        let status = cmd.status_cancellable(&self.cancel)?;
        if !status.success() {
            bail!(
                "`{}` exited with {}",
                cmd.display_command(),
                status
                    .code()
                    .map_or_else(|| "a signal".to_string(), |c| format!("status {}", c))
            );
        }
        Ok(())
    }

    fn get_resource(
        &self,
        resource: &str,
        name: &str,
        namespace: Option<&str>,
    ) -> Result<Option<serde_json::Value>> {
        let mut cmd = ProcessBuilder::new(&self.kubectl).args(["get", resource, name, "-o", "json"]);
        if let Some(ns) = namespace {
            cmd = cmd.args(["-n", ns]);
        }
        if let Some(kubeconfig) = &self.kubeconfig {
            cmd = cmd.arg("--kubeconfig").arg(kubeconfig);
        }

        let output = cmd.exec()?;
        if !output.status.success() {
            // Missing resources and an API server that is not up yet both
            // count as "not ready".
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::debug!("{} failed: {}", cmd.display_command(), stderr.trim());
            return Ok(None);
        }
        let value = serde_json::from_slice(&output.stdout)
            .with_context(|| format!("invalid JSON from {}", cmd.display_command()))?;
        Ok(Some(value))
    }

    fn probe(&self, url: &str, ca_file: Option<&Path>) -> Result<bool> {
        self.cancel.check()?;
        let mut builder = reqwest::blocking::Client::builder().timeout(self.timeout);
        if let Some(path) = ca_file {
            let pem = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
            builder = builder.add_root_certificate(
                reqwest::Certificate::from_pem(&pem)
                    .with_context(|| format!("invalid certificate in {}", path.display()))?,
            );
        }
        let client = builder.build().context("failed to build HTTP client")?;
        match client.get(url).send() {
            Ok(response) => Ok(response.status().is_success()),
            Err(e) => {
                tracing::debug!("probe {} failed: {}", url, e);
                Ok(false)
            }
        }
    }
}

/// Replay settings.
#[derive(Debug, Clone, Default)]
pub struct ReplayOptions {
    /// Skip stages below this one.
    pub from_stage: Option<Stage>,
    /// List the records instead of running them.
    pub dry_run: bool,
}

/// What a replay did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub executed: Vec<String>,
    pub skipped: Vec<String>,
}

/// Runs a recipe against an [`InstallRunner`].
pub struct Replayer<'a> {
    runner: &'a dyn InstallRunner,
    shell: &'a Shell,
    cancel: CancelToken,
}

impl<'a> Replayer<'a> {
    pub fn new(runner: &'a dyn InstallRunner, shell: &'a Shell, cancel: CancelToken) -> Self {
        Replayer {
            runner,
            shell,
            cancel,
        }
    }

    pub fn replay(&self, recipe: &Recipe, options: &ReplayOptions) -> Result<ReplayReport, ReplayError> {
        let mut report = ReplayReport::default();
        let mut current: Option<Stage> = None;

        for entry in &recipe.ops {
            if options.from_stage.is_some_and(|from| entry.stage < from) {
                report.skipped.push(entry.name.clone());
                continue;
            }
            if current != Some(entry.stage) {
                current = Some(entry.stage);
                tracing::info!("bundle `{}`: entering {}", recipe.bundle, entry.stage);
            }

            if options.dry_run {
                self.shell.status(
                    Status::Planned,
                    format!("{} `{}`: {}", entry.stage, entry.name, describe(&entry.op)),
                );
                report.executed.push(entry.name.clone());
                continue;
            }

            self.run_entry(&recipe.bundle, entry)?;
            report.executed.push(entry.name.clone());
        }

        Ok(report)
    }

    fn run_entry(&self, bundle: &str, entry: &RecipeEntry) -> Result<(), ReplayError> {
        let fail = |source: anyhow::Error| {
            if source.downcast_ref::<Cancelled>().is_some() {
                ReplayError::Cancelled {
                    bundle: bundle.to_string(),
                    stage: entry.stage,
                    name: entry.name.clone(),
                }
            } else {
                ReplayError::Op {
                    bundle: bundle.to_string(),
                    stage: entry.stage,
                    name: entry.name.clone(),
                    source,
                }
            }
        };
        let exhausted = |what: String, attempts: u32| ReplayError::WaitExhausted {
            bundle: bundle.to_string(),
            stage: entry.stage,
            name: entry.name.clone(),
            what,
            attempts,
        };

        self.cancel.check().map_err(|e| fail(e.into()))?;

        match &entry.op {
            InstallOp::RunCommand { argv, env } => {
                self.shell.status(Status::Running, &entry.name);
                self.runner.run_command(argv, env).map_err(fail)
            }
            InstallOp::WaitForResource {
                resource,
                name,
                namespace,
                ready,
                retry,
            } => {
                let what = match namespace {
                    Some(ns) => format!("{} {}/{}", resource, ns, name),
                    None => format!("{} {}", resource, name),
                };
                let spinner = self
                    .shell
                    .spinner(Status::Waiting, format!("{} ({})", what, ready));
                let outcome = retry.poll(&self.cancel, |attempt| {
                    spinner.set_message(format!("{} ({}) attempt {}/{}", what, ready, attempt, retry.attempts));
                    let found = self.runner.get_resource(resource, name, namespace.as_deref())?;
                    Ok(found.filter(|r| ready.holds(r)).map(|_| ()))
                });
                spinner.finish();
                match outcome.map_err(fail)? {
                    Some(()) => Ok(()),
                    None => Err(exhausted(format!("{} ({})", what, ready), retry.attempts)),
                }
            }
            InstallOp::WaitForEndpoint { url, ca_file, retry } => {
                let spinner = self.shell.spinner(Status::Waiting, url);
                let outcome = retry.poll(&self.cancel, |_| {
                    Ok(self.runner.probe(url, ca_file.as_deref())?.then_some(()))
                });
                spinner.finish();
                match outcome.map_err(fail)? {
                    Some(()) => Ok(()),
                    None => Err(exhausted(url.clone(), retry.attempts)),
                }
            }
        }
    }
}

/// One-line description of an install op.
pub fn describe(op: &InstallOp) -> String {
    match op {
        InstallOp::RunCommand { argv, .. } => argv.join(" "),
        InstallOp::WaitForResource {
            resource,
            name,
            ready,
            ..
        } => format!("wait for {} {} ({})", resource, name, ready),
        InstallOp::WaitForEndpoint { url, .. } => format!("wait for {}", url),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::op::{Readiness, RetryPolicy};
    use std::cell::RefCell;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Records every call; commands named `fail` exit non-zero and
    /// resources become ready after `ready_after` polls.
    #[derive(Default)]
    struct FakeRunner {
        log: RefCell<Vec<String>>,
        polls: RefCell<u32>,
        ready_after: u32,
    }

    impl InstallRunner for FakeRunner {
        fn run_command(&self, argv: &[String], _env: &BTreeMap<String, String>) -> Result<()> {
            self.log.borrow_mut().push(argv.join(" "));
            if argv.first().map(String::as_str) == Some("fail") {
                bail!("exit status 1");
            }
            Ok(())
        }

        fn get_resource(&self, resource: &str, name: &str, _ns: Option<&str>) -> Result<Option<serde_json::Value>> {
            self.log.borrow_mut().push(format!("get {} {}", resource, name));
            *self.polls.borrow_mut() += 1;
            if *self.polls.borrow() >= self.ready_after {
                Ok(Some(serde_json::json!({
                    "status": {"conditions": [{"type": "Ready", "status": "True"}]}
                })))
            } else {
                Ok(None)
            }
        }

        fn probe(&self, url: &str, _ca: Option<&Path>) -> Result<bool> {
            self.log.borrow_mut().push(format!("probe {}", url));
            Ok(true)
        }
    }

    fn entry(stage: u8, name: &str, op: InstallOp) -> RecipeEntry {
        RecipeEntry::new(Stage(stage), name, op)
    }

    fn wait(attempts: u32) -> InstallOp {
        InstallOp::WaitForResource {
            resource: "node".to_string(),
            name: "control-1".to_string(),
            namespace: None,
            ready: Readiness::condition("Ready"),
            retry: RetryPolicy::new(attempts, Duration::from_millis(1)),
        }
    }

    fn shell() -> Shell {
        Shell::from_flags(true, false, Default::default())
    }

    #[test]
    fn test_stages_run_in_order() {
        let recipe = Recipe::new(
            "control-install",
            vec![
                entry(1, "late", InstallOp::command(["echo", "late"])),
                entry(0, "early", InstallOp::command(["echo", "early"])),
                entry(0, "wait", wait(5)),
            ],
        );
        let runner = FakeRunner {
            ready_after: 2,
            ..Default::default()
        };
        let shell = shell();
        let report = Replayer::new(&runner, &shell, CancelToken::new())
            .replay(&recipe, &ReplayOptions::default())
            .unwrap();

        assert_eq!(report.executed, ["early", "wait", "late"]);
        assert_eq!(
            *runner.log.borrow(),
            ["echo early", "get node control-1", "get node control-1", "echo late"]
        );
    }

    #[test]
    fn test_failure_stops_later_stages() {
        let recipe = Recipe::new(
            "control-install",
            vec![
                entry(0, "ok", InstallOp::command(["echo"])),
                entry(0, "boom", InstallOp::command(["fail"])),
                entry(1, "never", InstallOp::command(["echo", "never"])),
            ],
        );
        let runner = FakeRunner::default();
        let shell = shell();
        let err = Replayer::new(&runner, &shell, CancelToken::new())
            .replay(&recipe, &ReplayOptions::default())
            .unwrap_err();

        assert_eq!(err.location(), Some(("control-install", Stage(0), "boom")));
        assert!(err.to_string().contains("stage 0 `boom` failed"));
        assert!(!runner.log.borrow().iter().any(|l| l.contains("never")));
    }

    #[test]
    fn test_exhausted_wait_is_fatal() {
        let recipe = Recipe::new(
            "b",
            vec![entry(0, "node-ready", wait(3)), entry(1, "after", InstallOp::command(["echo"]))],
        );
        let runner = FakeRunner {
            ready_after: 10,
            ..Default::default()
        };
        let shell = shell();
        let err = Replayer::new(&runner, &shell, CancelToken::new())
            .replay(&recipe, &ReplayOptions::default())
            .unwrap_err();

        assert!(matches!(err, ReplayError::WaitExhausted { attempts: 3, .. }));
        assert_eq!(*runner.polls.borrow(), 3);
    }

    #[test]
    fn test_from_stage_and_dry_run() {
        let recipe = Recipe::new(
            "b",
            vec![
                entry(0, "a", InstallOp::command(["fail"])),
                entry(1, "b", InstallOp::command(["echo"])),
            ],
        );
        let runner = FakeRunner::default();
        let shell = shell();
        let replayer = Replayer::new(&runner, &shell, CancelToken::new());

        let report = replayer
            .replay(
                &recipe,
                &ReplayOptions {
                    from_stage: Some(Stage(1)),
                    dry_run: false,
                },
            )
            .unwrap();
        assert_eq!(report.skipped, ["a"]);
        assert_eq!(report.executed, ["b"]);

        runner.log.borrow_mut().clear();
        let report = replayer
            .replay(
                &recipe,
                &ReplayOptions {
                    from_stage: None,
                    dry_run: true,
                },
            )
            .unwrap();
        assert_eq!(report.executed, ["a", "b"]);
        assert!(runner.log.borrow().is_empty());
    }

    #[test]
    fn test_cancelled_replay() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let recipe = Recipe::new("b", vec![entry(0, "a", InstallOp::command(["echo"]))]);
        let runner = FakeRunner::default();
        let shell = shell();
        let err = Replayer::new(&runner, &shell, cancel)
            .replay(&recipe, &ReplayOptions::default())
            .unwrap_err();
        assert!(matches!(err, ReplayError::Cancelled { .. }));
    }

    #[test]
    fn test_load_recipe_checks_version() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join(RECIPE_FILE),
            "version: 1\nbundle: b\nops:\n  - stage: 1\n    name: second\n    kind: run-command\n    payload:\n      argv: [echo]\n  - stage: 0\n    name: first\n    kind: wait-for-endpoint\n    payload:\n      url: https://x\n      retry: {attempts: 2, interval: 1}\n",
        )
        .unwrap();
        let recipe = load_recipe(tmp.path()).unwrap();
        assert_eq!(recipe.ops[0].name, "first");
        assert_eq!(recipe.ops[0].bundle, "b");

        std::fs::write(tmp.path().join(RECIPE_FILE), "version: 9\nbundle: b\nops: []\n").unwrap();
        assert!(matches!(
            load_recipe(tmp.path()),
            Err(ReplayError::Version { found: 9, .. })
        ));
    }

    #[test]
    fn test_load_recipe_checks_record_bundle() {
        let tmp = TempDir::new().unwrap();
        let record = |bundle: &str| {
            format!(
                "version: 1\nbundle: control-install\nops:\n  - bundle: {}\n    stage: 0\n    name: first\n    kind: run-command\n    payload:\n      argv: [echo]\n",
                bundle
            )
        };

        std::fs::write(tmp.path().join(RECIPE_FILE), record("control-install")).unwrap();
        let recipe = load_recipe(tmp.path()).unwrap();
        assert_eq!(recipe.ops[0].bundle, "control-install");

        std::fs::write(tmp.path().join(RECIPE_FILE), record("control-os")).unwrap();
        let err = load_recipe(tmp.path()).unwrap_err();
        assert!(matches!(err, ReplayError::Load { .. }));
        let msg = format!("{:#}", anyhow::Error::from(err));
        assert!(msg.contains("belongs to bundle `control-os`"));
    }
}
