//! BuildOp execution.
//!
//! Every operation writes below its bundle directory and goes through
//! [`write_if_changed`], so executing the same op twice leaves the tree
//! byte-identical and reports [`OpOutcome::Unchanged`] the second time.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::artifacts::remote::RegistryOptions;
use crate::artifacts::{self, ArtifactStore, LayoutStore, RemoteRegistry, SyncOutcome};
use crate::ops::objects;
use crate::ops::op::{ArtifactLocation, BuildOp, RenderTarget};
use crate::ops::provision::Provisioning;
use crate::ops::template;
use crate::util::cancel::CancelToken;
use crate::util::config::Config;
use crate::util::fs::{join_relative, set_mode, write_string, WriteOutcome};

/// Whether an op changed anything on disk or in a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpOutcome {
    Changed,
    Unchanged,
}

impl From<WriteOutcome> for OpOutcome {
    fn from(w: WriteOutcome) -> Self {
        match w {
            WriteOutcome::Written => OpOutcome::Changed,
            WriteOutcome::Unchanged => OpOutcome::Unchanged,
        }
    }
}

impl OpOutcome {
    fn any(outcomes: impl IntoIterator<Item = WriteOutcome>) -> Self {
        if outcomes.into_iter().any(WriteOutcome::is_written) {
            OpOutcome::Changed
        } else {
            OpOutcome::Unchanged
        }
    }
}

/// Executes BuildOps against `<base_dir>/<bundle>/`.
pub struct BuildExecutor {
    base_dir: PathBuf,
    config: Config,
    cancel: CancelToken,
}

impl BuildExecutor {
    pub fn new(base_dir: impl Into<PathBuf>, config: Config, cancel: CancelToken) -> Self {
        BuildExecutor {
            base_dir: base_dir.into(),
            config,
            cancel,
        }
    }

    pub fn bundle_dir(&self, bundle: &str) -> PathBuf {
        self.base_dir.join(bundle)
    }

    fn open_store(&self, bundle_dir: &Path, location: &ArtifactLocation) -> Result<Box<dyn ArtifactStore>> {
        match location {
            ArtifactLocation::Layout { root, .. } => {
                Ok(Box::new(LayoutStore::new(join_relative(bundle_dir, root)?)))
            }
            ArtifactLocation::Registry { reference } => {
                let host = reference.registry_host();
                let options = RegistryOptions::from_config(&self.config, host);
                Ok(Box::new(RemoteRegistry::new(host, options, self.cancel.clone())?))
            }
        }
    }

    /// Execute one op for `bundle`.
    pub fn execute(&self, bundle: &str, op: &BuildOp) -> Result<OpOutcome> {
        self.cancel.check()?;
        let bundle_dir = self.bundle_dir(bundle);

        match op {
            BuildOp::SyncArtifact { source, target } => {
                let from = self.open_store(&bundle_dir, source)?;
                let mut to = self.open_store(&bundle_dir, target)?;
                let outcome = artifacts::sync(from.as_ref(), source.reference(), to.as_mut(), target.reference())
                    .with_context(|| format!("failed to sync {} to {}", source, target))?;
                Ok(match outcome {
                    SyncOutcome::UpToDate => OpOutcome::Unchanged,
                    SyncOutcome::Copied { .. } => OpOutcome::Changed,
                })
            }
            BuildOp::FetchAndUnpack { source, files } => {
                let store = self.open_store(&bundle_dir, source)?;
                let outcomes = artifacts::fetch(store.as_ref(), source.reference(), files, &bundle_dir)
                    .with_context(|| format!("failed to fetch files from {}", source))?;
                Ok(OpOutcome::any(outcomes))
            }
            BuildOp::RenderTemplate {
                template,
                vars,
                target,
            } => {
                let rendered = template::render(template, vars)?;
                let path = join_relative(&bundle_dir, target.path())?;
                let contents = match target {
                    RenderTarget::File { .. } => rendered,
                    RenderTarget::Objects { .. } => objects::normalize_stream(&rendered, template.name)?,
                    RenderTarget::Provisioning { .. } => Provisioning::parse(&rendered, template.name)?.render()?,
                };
                let outcome = write_string(&path, &contents)?;
                if let RenderTarget::File { mode: Some(mode), .. } = target {
                    set_mode(&path, *mode)?;
                }
                Ok(outcome.into())
            }
            BuildOp::RenderObjects { path, objects } => {
                let stream = objects::render_stream(objects)?;
                Ok(write_string(&join_relative(&bundle_dir, path)?, &stream)?.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::testing::publish;
    use crate::core::artifact::ArtifactRef;
    use crate::ops::objects::ClusterObject;
    use crate::ops::op::{FetchFile, Template};
    use serde_json::json;
    use tempfile::TempDir;

    fn executor(tmp: &TempDir) -> BuildExecutor {
        BuildExecutor::new(tmp.path(), Config::default(), CancelToken::new())
    }

    #[test]
    fn test_render_template_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let exec = executor(&tmp);
        let op = BuildOp::RenderTemplate {
            template: Template::new("motd", "hello {{ who }}\n"),
            vars: json!({"who": "world"}),
            target: RenderTarget::File {
                path: "etc/motd".into(),
                mode: Some(0o600),
            },
        };

        assert_eq!(exec.execute("b", &op).unwrap(), OpOutcome::Changed);
        assert_eq!(exec.execute("b", &op).unwrap(), OpOutcome::Unchanged);
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("b/etc/motd")).unwrap(),
            "hello world\n"
        );
    }

    #[test]
    fn test_render_provisioning_descriptor() {
        let tmp = TempDir::new().unwrap();
        let op = BuildOp::RenderTemplate {
            template: Template::new("os", "hostname: {{ host }}\n"),
            vars: json!({"host": "control-1"}),
            target: RenderTarget::Provisioning {
                path: "ignition.json".into(),
            },
        };
        executor(&tmp).execute("os", &op).unwrap();
        let out: serde_json::Value =
            serde_json::from_slice(&std::fs::read(tmp.path().join("os/ignition.json")).unwrap()).unwrap();
        assert_eq!(out["storage"]["files"][0]["path"], "/etc/hostname");
    }

    #[test]
    fn test_render_objects_and_path_escape() {
        let tmp = TempDir::new().unwrap();
        let exec = executor(&tmp);
        let objects = vec![ClusterObject::config_map("c", "ns", [("k".to_string(), "v".to_string())])];

        let op = BuildOp::RenderObjects {
            path: "manifests/c.yaml".into(),
            objects: objects.clone(),
        };
        exec.execute("b", &op).unwrap();
        assert!(tmp.path().join("b/manifests/c.yaml").is_file());

        let escape = BuildOp::RenderObjects {
            path: "../outside.yaml".into(),
            objects,
        };
        assert!(exec.execute("b", &escape).is_err());
    }

    #[test]
    fn test_sync_and_fetch_between_layouts() {
        let tmp = TempDir::new().unwrap();
        let exec = executor(&tmp);
        let src_ref = ArtifactRef::new("ghcr.io/acme", "k3s-airgap", "v1");
        let dst_ref = ArtifactRef::new("172.30.0.1:31000/airgap", "k3s-airgap", "v1");
        publish(
            &mut LayoutStore::new(tmp.path().join("b/upstream")),
            &src_ref,
            &[("k3s", &b"bin"[..])],
        );

        let sync = BuildOp::SyncArtifact {
            source: ArtifactLocation::Layout {
                root: "upstream".into(),
                reference: src_ref,
            },
            target: ArtifactLocation::Layout {
                root: "registry".into(),
                reference: dst_ref.clone(),
            },
        };
        assert_eq!(exec.execute("b", &sync).unwrap(), OpOutcome::Changed);
        assert_eq!(exec.execute("b", &sync).unwrap(), OpOutcome::Unchanged);

        let fetch = BuildOp::FetchAndUnpack {
            source: ArtifactLocation::Layout {
                root: "registry".into(),
                reference: dst_ref,
            },
            files: vec![FetchFile::new("k3s", "bin/k3s").mode(0o755)],
        };
        assert_eq!(exec.execute("b", &fetch).unwrap(), OpOutcome::Changed);
        assert_eq!(std::fs::read(tmp.path().join("b/bin/k3s")).unwrap(), b"bin");
    }

    #[test]
    fn test_cancelled_executor_does_nothing() {
        let tmp = TempDir::new().unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        let exec = BuildExecutor::new(tmp.path(), Config::default(), cancel);
        let op = BuildOp::RenderObjects {
            path: "x.yaml".into(),
            objects: Vec::new(),
        };
        assert!(exec.execute("b", &op).is_err());
        assert!(!tmp.path().join("b/x.yaml").exists());
    }
}
