//! The closed operation catalog.
//!
//! [`BuildOp`]s run during assembly against the local filesystem and the
//! network; [`InstallOp`]s are pure data at assembly time and are replayed
//! later by `stagehand-replay`. Both are tagged enums so every executor can
//! match them exhaustively.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::core::artifact::ArtifactRef;
use crate::core::stage::Stage;
use crate::ops::objects::ClusterObject;
use crate::util::cancel::CancelToken;

/// Version of the recipe file format.
pub const RECIPE_VERSION: u32 = 1;

/// Bounded retry: at most `attempts` tries, `interval` apart, after an
/// optional `initial_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub attempts: u32,
    #[serde(with = "secs")]
    pub interval: Duration,
    #[serde(default, with = "secs", skip_serializing_if = "Duration::is_zero")]
    pub initial_delay: Duration,
}

impl RetryPolicy {
    pub const fn new(attempts: u32, interval: Duration) -> Self {
        RetryPolicy {
            attempts,
            interval,
            initial_delay: Duration::ZERO,
        }
    }

    pub const fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Upper bound on time spent sleeping between attempts.
    pub fn budget(&self) -> Duration {
        self.initial_delay + self.interval * self.attempts.saturating_sub(1)
    }

    /// Call `attempt` until it yields a value or the attempts run out.
    ///
    /// `attempt` returns `Ok(Some(_))` on success, `Ok(None)` to try again,
    /// and `Err(_)` to stop immediately. Returns `Ok(None)` when exhausted.
    /// The token is checked before every attempt and during every sleep.
    pub fn poll<T>(
        &self,
        cancel: &CancelToken,
        mut attempt: impl FnMut(u32) -> Result<Option<T>>,
    ) -> Result<Option<T>> {
        if !self.initial_delay.is_zero() {
            cancel.sleep(self.initial_delay)?;
        }
        for n in 1..=self.attempts.max(1) {
            cancel.check()?;
            if let Some(value) = attempt(n)? {
                return Ok(Some(value));
            }
            if n < self.attempts {
                cancel.sleep(self.interval)?;
            }
        }
        Ok(None)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::new(60, Duration::from_secs(5))
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

/// Where an artifact lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "store", rename_all = "kebab-case")]
pub enum ArtifactLocation {
    /// An OCI distribution registry.
    Registry { reference: ArtifactRef },
    /// An OCI image layout tree inside the bundle, one layout per repository.
    Layout { root: PathBuf, reference: ArtifactRef },
}

impl ArtifactLocation {
    pub fn reference(&self) -> &ArtifactRef {
        match self {
            ArtifactLocation::Registry { reference } | ArtifactLocation::Layout { reference, .. } => {
                reference
            }
        }
    }
}

impl fmt::Display for ArtifactLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactLocation::Registry { reference } => write!(f, "{}", reference),
            ArtifactLocation::Layout { root, reference } => {
                write!(f, "{} (layout {})", reference, root.display())
            }
        }
    }
}

/// Post-processing applied to a fetched file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Unpack {
    #[default]
    None,
    Gunzip,
    Untar,
    UntarGz,
}

/// One file pulled out of an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchFile {
    /// Layer title (`org.opencontainers.image.title`).
    pub name: String,
    /// Destination relative to the bundle; a directory for tar unpacking.
    pub to: PathBuf,
    #[serde(skip_serializing_if = "is_none_unpack")]
    pub unpack: Unpack,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,
}

fn is_none_unpack(u: &Unpack) -> bool {
    *u == Unpack::None
}

impl FetchFile {
    pub fn new(name: impl Into<String>, to: impl Into<PathBuf>) -> Self {
        FetchFile {
            name: name.into(),
            to: to.into(),
            unpack: Unpack::None,
            mode: None,
        }
    }

    pub fn unpack(mut self, unpack: Unpack) -> Self {
        self.unpack = unpack;
        self
    }

    pub fn mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }
}

/// A named template compiled into the binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Template {
    pub name: &'static str,
    #[serde(skip)]
    pub source: &'static str,
}

impl Template {
    pub const fn new(name: &'static str, source: &'static str) -> Self {
        Template { name, source }
    }
}

/// What a rendered template becomes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "as", rename_all = "kebab-case")]
pub enum RenderTarget {
    /// Plain file.
    File {
        path: PathBuf,
        #[serde(skip_serializing_if = "Option::is_none")]
        mode: Option<u32>,
    },
    /// Multi-document cluster manifest, normalized after rendering.
    Objects { path: PathBuf },
    /// Machine-provisioning descriptor: the rendered YAML is converted to
    /// provisioning JSON.
    Provisioning { path: PathBuf },
}

impl RenderTarget {
    pub fn path(&self) -> &PathBuf {
        match self {
            RenderTarget::File { path, .. }
            | RenderTarget::Objects { path }
            | RenderTarget::Provisioning { path } => path,
        }
    }
}

/// Assembly-time action. Every variant is safe to re-run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum BuildOp {
    /// Copy an image or chart, skipping content the target already has.
    SyncArtifact {
        source: ArtifactLocation,
        target: ArtifactLocation,
    },
    /// Pull named files out of an artifact.
    FetchAndUnpack {
        source: ArtifactLocation,
        files: Vec<FetchFile>,
    },
    RenderTemplate {
        template: Template,
        vars: serde_json::Value,
        target: RenderTarget,
    },
    /// Serialize typed cluster objects into one YAML stream.
    RenderObjects {
        path: PathBuf,
        objects: Vec<ClusterObject>,
    },
}

impl BuildOp {
    pub fn kind(&self) -> &'static str {
        match self {
            BuildOp::SyncArtifact { .. } => "sync-artifact",
            BuildOp::FetchAndUnpack { .. } => "fetch-and-unpack",
            BuildOp::RenderTemplate { .. } => "render-template",
            BuildOp::RenderObjects { .. } => "render-objects",
        }
    }
}

/// Condition a cluster resource must meet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Readiness {
    /// The resource exists.
    Exists,
    /// `status.conditions[]` has an entry `{type: condition, status}`.
    Condition { condition: String, status: String },
    /// The value at a JSON pointer equals `value`.
    Field { pointer: String, value: serde_json::Value },
}

impl Readiness {
    pub fn condition(condition: impl Into<String>) -> Self {
        Readiness::Condition {
            condition: condition.into(),
            status: "True".to_string(),
        }
    }

    /// Evaluate against the resource's JSON representation.
    pub fn holds(&self, resource: &serde_json::Value) -> bool {
        match self {
            Readiness::Exists => true,
            Readiness::Condition { condition, status } => resource
                .pointer("/status/conditions")
                .and_then(|c| c.as_array())
                .is_some_and(|conditions| {
                    conditions.iter().any(|c| {
                        c.get("type").and_then(|t| t.as_str()) == Some(condition.as_str())
                            && c.get("status").and_then(|s| s.as_str()) == Some(status.as_str())
                    })
                }),
            Readiness::Field { pointer, value } => resource.pointer(pointer) == Some(value),
        }
    }
}

impl fmt::Display for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Readiness::Exists => f.write_str("exists"),
            Readiness::Condition { condition, status } => write!(f, "{}={}", condition, status),
            Readiness::Field { pointer, value } => write!(f, "{} == {}", pointer, value),
        }
    }
}

/// Install-time action, recorded during assembly and replayed later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "kebab-case")]
pub enum InstallOp {
    RunCommand {
        argv: Vec<String>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        env: BTreeMap<String, String>,
    },
    WaitForResource {
        resource: String,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        namespace: Option<String>,
        ready: Readiness,
        retry: RetryPolicy,
    },
    WaitForEndpoint {
        url: String,
        /// PEM CA bundle path on the target host.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ca_file: Option<PathBuf>,
        retry: RetryPolicy,
    },
}

impl InstallOp {
    pub fn command<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        InstallOp::RunCommand {
            argv: argv.into_iter().map(Into::into).collect(),
            env: BTreeMap::new(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            InstallOp::RunCommand { .. } => "run-command",
            InstallOp::WaitForResource { .. } => "wait-for-resource",
            InstallOp::WaitForEndpoint { .. } => "wait-for-endpoint",
        }
    }
}

/// One replay record: `{bundle, stage, name, kind, payload}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipeEntry {
    /// Owning bundle; empty until the entry joins a [`Recipe`].
    #[serde(default)]
    pub bundle: String,
    pub stage: Stage,
    pub name: String,
    #[serde(flatten)]
    pub op: InstallOp,
}

impl RecipeEntry {
    pub fn new(stage: Stage, name: impl Into<String>, op: InstallOp) -> Self {
        RecipeEntry {
            bundle: String::new(),
            stage,
            name: name.into(),
            op,
        }
    }
}

/// Ordered install operations of one installer bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipe {
    pub version: u32,
    pub bundle: String,
    pub ops: Vec<RecipeEntry>,
}

impl Recipe {
    /// Build a recipe; entries are stably sorted by stage so registration
    /// order is kept within a stage, and entries without a bundle take this one.
    pub fn new(bundle: impl Into<String>, mut ops: Vec<RecipeEntry>) -> Self {
        let bundle = bundle.into();
        ops.sort_by_key(|e| e.stage);
        for entry in &mut ops {
            if entry.bundle.is_empty() {
                entry.bundle = bundle.clone();
            }
        }
        Recipe {
            version: RECIPE_VERSION,
            bundle,
            ops,
        }
    }

    /// First entry that names a different bundle than the recipe.
    pub fn foreign_entry(&self) -> Option<&RecipeEntry> {
        self.ops.iter().find(|e| !e.bundle.is_empty() && e.bundle != self.bundle)
    }

    /// Distinct stages in ascending order.
    pub fn stages(&self) -> Vec<Stage> {
        let mut stages: Vec<Stage> = self.ops.iter().map(|e| e.stage).collect();
        stages.dedup();
        stages
    }
}
