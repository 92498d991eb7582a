//! The in-cluster OCI registry every other artifact is served from.
//!
//! The registry image is imported straight into the bootstrap cluster's
//! container store, its chart is served by the cluster itself, and its
//! storage is seeded from the `registry/` layout of the installer bundle.

use std::any::Any;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::components::base::{Base, CA_TRUST_PATH, REGISTRY_PORT};
use crate::components::bootstrap::Bootstrap;
use crate::components::{install_file, ready_retry, stages, AUTO_DEPLOY_DIR, CONTROL_INSTALL};
use crate::core::artifact::{fallback, ArtifactRef};
use crate::core::defaults::ids;
use crate::core::flags::Flag;
use crate::engine::{BuildContext, Component, ComponentState, HydrateContext, Named, StateError};
use crate::ops::objects::{ClusterObject, HelmChart, CHART_NAMESPACE};
use crate::ops::op::{ArtifactLocation, BuildOp, FetchFile, InstallOp, RetryPolicy};
use crate::pki::{self, CertMaterial, CertRequest, CertUsage};

/// Bundle directory laid out like the registry's storage.
pub const REGISTRY_LAYOUT: &str = "registry";

/// Registry storage on the control node.
pub const STORAGE_DIR: &str = "/var/lib/stagehand/registry";

const IMAGES_LAYOUT: &str = "images";
const IMAGE_ARCHIVE: &str = "images/zot.oci.tar";
const CHART_FILE: &str = "charts/zot.tgz";
const MANIFEST_FILE: &str = "manifests/registry.yaml";
const STATIC_CHARTS_DIR: &str = "/var/lib/rancher/k3s/server/static/charts";
const TLS_SECRET: &str = "registry-tls";

const SCHEMA_VERSIONS: &[u32] = &[1];

const READY_RETRY: RetryPolicy = RetryPolicy::new(60, Duration::from_secs(5));

/// Copy `upstream` into the registry layout of the installer bundle.
pub fn mirror(base: &Base, upstream: &ArtifactRef) -> BuildOp {
    BuildOp::SyncArtifact {
        source: ArtifactLocation::Registry {
            reference: upstream.clone(),
        },
        target: ArtifactLocation::Layout {
            root: REGISTRY_LAYOUT.into(),
            reference: base.local(upstream),
        },
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryConfig {
    #[serde(skip_serializing_if = "ArtifactRef::is_empty")]
    pub zot_override: ArtifactRef,
    #[serde(skip_serializing_if = "ArtifactRef::is_empty")]
    pub chart_override: ArtifactRef,
    pub zot: ArtifactRef,
    pub chart: ArtifactRef,
    /// Extra DNS names the registry certificate must cover.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dns_sans: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<CertMaterial>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ready_retry_override: Option<RetryPolicy>,
    pub ready_retry: RetryPolicy,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig {
            zot_override: ArtifactRef::default(),
            chart_override: ArtifactRef::default(),
            zot: ArtifactRef::default(),
            chart: ArtifactRef::default(),
            dns_sans: Vec::new(),
            tls: None,
            ready_retry_override: None,
            ready_retry: READY_RETRY,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RegistryOverridesV1 {
    zot_override: Option<ArtifactRef>,
    chart_override: Option<ArtifactRef>,
    dns_sans: Option<Vec<String>>,
    tls: Option<CertMaterial>,
    ready_retry_override: Option<RetryPolicy>,
}

impl RegistryOverridesV1 {
    fn apply(self, config: &mut RegistryConfig) {
        if let Some(zot) = self.zot_override {
            config.zot_override = zot;
        }
        if let Some(chart) = self.chart_override {
            config.chart_override = chart;
        }
        if let Some(sans) = self.dns_sans {
            config.dns_sans = sans;
        }
        if let Some(tls) = self.tls {
            config.tls = Some(tls);
        }
        if let Some(retry) = self.ready_retry_override {
            config.ready_retry_override = Some(retry);
        }
    }
}

#[derive(Debug, Default)]
pub struct Registry {
    config: RegistryConfig,
}

impl Named for Registry {
    const NAME: &'static str = "registry";
}

impl Registry {
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn tls(&self) -> Result<&CertMaterial> {
        self.config.tls.as_ref().context("the registry certificate has not been issued")
    }

    fn chart_values(&self, base: &Base) -> serde_json::Value {
        let image = base.local(&self.config.zot);
        serde_json::json!({
            "image": {
                "repository": format!("{}/{}", image.repository, image.name),
                "tag": image.tag,
                "pullPolicy": "IfNotPresent",
            },
            "service": {
                "type": "NodePort",
                "port": 5000,
                "nodePort": REGISTRY_PORT,
            },
            "persistence": {
                "hostPath": STORAGE_DIR,
            },
            "tls": {
                "secretName": TLS_SECRET,
            },
        })
    }
}

impl Component for Registry {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn depends_on(&self) -> &'static [&'static str] {
        &[Base::NAME, Bootstrap::NAME]
    }

    fn flags(&self) -> Vec<Flag> {
        vec![
            Flag::string("zot-version", "Tag of the registry image"),
            Flag::list("registry-dns-sans", "Extra DNS names of the registry certificate"),
        ]
    }

    fn load(&mut self, state: &ComponentState) -> Result<(), StateError> {
        match state.version {
            1 => {
                state.decode::<RegistryOverridesV1>()?.apply(&mut self.config);
                Ok(())
            }
            found => Err(StateError::unsupported(found, SCHEMA_VERSIONS)),
        }
    }

    fn save(&self) -> Result<ComponentState, StateError> {
        ComponentState::encode(1, &self.config)
    }

    fn hydrate(&mut self, ctx: &HydrateContext<'_>) -> Result<()> {
        let base = ctx.view.get::<Base>()?;
        let bootstrap = ctx.view.get::<Bootstrap>()?;
        let config = &mut self.config;

        if let Some(tag) = ctx.flags.get_str("zot-version")? {
            config.zot_override.tag = tag.to_string();
        }
        if let Some(sans) = ctx.flags.get_list("registry-dns-sans")? {
            config.dns_sans = sans.to_vec();
        }

        config.zot = fallback([&config.zot_override, ctx.defaults.artifact(ids::ZOT)?]);
        config.zot.require_complete().context("cannot resolve the registry image")?;
        config.chart = fallback([&config.chart_override, ctx.defaults.artifact(ids::ZOT_CHART)?]);
        config.chart.require_complete().context("cannot resolve the registry chart")?;

        let ips = base.endpoint_ips();
        let mut dns = vec![bootstrap.node_name().to_string(), "localhost".to_string()];
        dns.extend(config.dns_sans.iter().cloned());
        dns.dedup();

        let request = CertRequest::leaf("stagehand-registry", CertUsage::Server, base.ca()?, &ips, &dns);
        config.tls = Some(pki::ensure(&request, config.tls.as_ref())?);
        config.ready_retry = ready_retry(ctx, config.ready_retry_override, READY_RETRY);
        Ok(())
    }

    fn build(&mut self, ctx: &mut BuildContext<'_, '_>) -> Result<()> {
        let base = ctx.view.get::<Base>()?;
        let config = &self.config;
        let tls = self.tls()?;
        let image = base.local(&config.zot);

        ctx.build_op(
            CONTROL_INSTALL,
            stages::REGISTRY,
            "zot-image",
            BuildOp::SyncArtifact {
                source: ArtifactLocation::Registry {
                    reference: config.zot.clone(),
                },
                target: ArtifactLocation::Layout {
                    root: IMAGES_LAYOUT.into(),
                    reference: image.clone(),
                },
            },
        )?;
        ctx.build_op(
            CONTROL_INSTALL,
            stages::REGISTRY,
            "zot-chart",
            BuildOp::FetchAndUnpack {
                source: ArtifactLocation::Registry {
                    reference: config.chart.clone(),
                },
                files: vec![FetchFile::new("chart.tgz", CHART_FILE)],
            },
        )?;

        let chart = HelmChart {
            name: "stagehand-registry".to_string(),
            chart: "https://%{KUBERNETES_API}%/static/charts/zot.tgz".to_string(),
            version: config.chart.tag.clone(),
            target_namespace: CHART_NAMESPACE.to_string(),
            values: self.chart_values(base),
            repo_ca: None,
        };
        ctx.build_op(
            CONTROL_INSTALL,
            stages::REGISTRY,
            "registry-objects",
            BuildOp::RenderObjects {
                path: MANIFEST_FILE.into(),
                objects: vec![
                    ClusterObject::tls_secret(TLS_SECRET, CHART_NAMESPACE, &tls.cert, &tls.key, &base.ca()?.cert),
                    ClusterObject::HelmChart(chart),
                ],
            },
        )?;

        let layout = format!("{}/{}", IMAGES_LAYOUT, image.path());
        let base_name = format!("{}/{}", image.repository, image.name);
        let seed = format!("{}/.", REGISTRY_LAYOUT);
        let install = [
            (
                "zot-image-archive",
                InstallOp::command(["tar", "-C", layout.as_str(), "-cf", IMAGE_ARCHIVE, "."]),
            ),
            (
                "zot-image-import",
                InstallOp::command([
                    "k3s",
                    "ctr",
                    "-n",
                    "k8s.io",
                    "images",
                    "import",
                    "--base-name",
                    base_name.as_str(),
                    IMAGE_ARCHIVE,
                ]),
            ),
            ("registry-storage", InstallOp::command(["mkdir", "-p", STORAGE_DIR])),
            (
                "registry-seed",
                InstallOp::command(["cp", "-a", seed.as_str(), STORAGE_DIR]),
            ),
            (
                "registry-chart",
                install_file(CHART_FILE, &format!("{}/zot.tgz", STATIC_CHARTS_DIR), "0644"),
            ),
            (
                "registry-manifests",
                install_file(
                    MANIFEST_FILE,
                    &format!("{}/stagehand-registry.yaml", AUTO_DEPLOY_DIR),
                    "0600",
                ),
            ),
            (
                "registry-ready",
                InstallOp::WaitForEndpoint {
                    url: format!("https://{}/v2/", base.registry()),
                    ca_file: Some(CA_TRUST_PATH.into()),
                    retry: config.ready_retry,
                },
            ),
        ];
        for (name, op) in install {
            ctx.install_op(CONTROL_INSTALL, stages::REGISTRY, name, op)?;
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
