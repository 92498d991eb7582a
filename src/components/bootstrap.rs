//! The single-node bootstrap cluster on the control node, and the control
//! node's provisioning descriptor.

use std::any::Any;
use std::time::Duration;

use anyhow::{Context, Result};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::components::base::{Base, CA_TRUST_PATH};
use crate::components::{install_file, parse_flag, ready_retry, stages, CONTROL_INSTALL, CONTROL_OS};
use crate::core::artifact::{fallback, ArtifactRef};
use crate::core::defaults::ids;
use crate::core::flags::Flag;
use crate::engine::{BuildContext, Component, ComponentState, HydrateContext, Named, StateError};
use crate::ops::op::{
    ArtifactLocation, BuildOp, FetchFile, InstallOp, Readiness, RenderTarget, RetryPolicy, Template,
};

const K3S_CONFIG: Template = Template::new("k3s-config.yaml", include_str!("templates/k3s-config.yaml"));
const REGISTRIES: Template = Template::new("registries.yaml", include_str!("templates/registries.yaml"));
const CONTROL_OS_TEMPLATE: Template =
    Template::new("control-os.yaml", include_str!("templates/control-os.yaml"));
const INSTALL_UNIT: &str = include_str!("templates/stagehand-install.service");

/// Node name used when the topology lists no control node.
pub const DEFAULT_NODE: &str = "control-1";

const IMAGES_FILE: &str = "images/k3s-airgap-images.tar.gz";

const SCHEMA_VERSIONS: &[u32] = &[1];

const READY_RETRY: RetryPolicy = RetryPolicy::new(60, Duration::from_secs(5));

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapConfig {
    /// Fields set by flags or a previous run; empty fields follow the defaults.
    #[serde(skip_serializing_if = "ArtifactRef::is_empty")]
    pub k3s_override: ArtifactRef,
    pub k3s: ArtifactRef,
    pub node_name: String,
    #[serde(rename = "clusterCIDR")]
    pub cluster_cidr: Ipv4Net,
    #[serde(rename = "serviceCIDR")]
    pub service_cidr: Ipv4Net,
    pub cluster_domain: String,
    pub tls_sans: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ready_retry_override: Option<RetryPolicy>,
    pub ready_retry: RetryPolicy,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        BootstrapConfig {
            k3s_override: ArtifactRef::default(),
            k3s: ArtifactRef::default(),
            node_name: DEFAULT_NODE.to_string(),
            cluster_cidr: Ipv4Net::new_assert([10, 42, 0, 0].into(), 16),
            service_cidr: Ipv4Net::new_assert([10, 43, 0, 0].into(), 16),
            cluster_domain: "cluster.local".to_string(),
            tls_sans: Vec::new(),
            ready_retry_override: None,
            ready_retry: READY_RETRY,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct BootstrapOverridesV1 {
    k3s_override: Option<ArtifactRef>,
    #[serde(rename = "clusterCIDR")]
    cluster_cidr: Option<Ipv4Net>,
    #[serde(rename = "serviceCIDR")]
    service_cidr: Option<Ipv4Net>,
    cluster_domain: Option<String>,
    ready_retry_override: Option<RetryPolicy>,
}

impl BootstrapOverridesV1 {
    fn apply(self, config: &mut BootstrapConfig) {
        if let Some(k3s) = self.k3s_override {
            config.k3s_override = k3s;
        }
        if let Some(cidr) = self.cluster_cidr {
            config.cluster_cidr = cidr;
        }
        if let Some(cidr) = self.service_cidr {
            config.service_cidr = cidr;
        }
        if let Some(domain) = self.cluster_domain {
            config.cluster_domain = domain;
        }
        if let Some(retry) = self.ready_retry_override {
            config.ready_retry_override = Some(retry);
        }
    }
}

#[derive(Debug, Default)]
pub struct Bootstrap {
    config: BootstrapConfig,
}

impl Named for Bootstrap {
    const NAME: &'static str = "bootstrap";
}

impl Bootstrap {
    pub fn config(&self) -> &BootstrapConfig {
        &self.config
    }

    pub fn node_name(&self) -> &str {
        &self.config.node_name
    }

    fn emit_provisioning(&self, base: &Base, ctx: &mut BuildContext<'_, '_>) -> Result<()> {
        let user = &base.config().default_user;
        let vars = serde_json::json!({
            "hostname": self.config.node_name,
            "user": {
                "name": user.name,
                "passwordHash": user.password_hash,
                "authorizedKeys": user.authorized_keys,
            },
            "caPath": CA_TRUST_PATH,
            "caCert": base.ca()?.cert,
            "registry": base.registry(),
            "installUnit": INSTALL_UNIT,
        });
        ctx.build_op(
            CONTROL_OS,
            stages::BOOTSTRAP,
            "ignition",
            BuildOp::RenderTemplate {
                template: CONTROL_OS_TEMPLATE,
                vars,
                target: RenderTarget::Provisioning {
                    path: "ignition.json".into(),
                },
            },
        )
    }
}

impl Component for Bootstrap {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn depends_on(&self) -> &'static [&'static str] {
        &[Base::NAME]
    }

    fn flags(&self) -> Vec<Flag> {
        vec![
            Flag::string("k3s-version", "Tag of the k3s airgap artifact"),
            Flag::string("cluster-domain", "DNS domain of the bootstrap cluster"),
        ]
    }

    fn load(&mut self, state: &ComponentState) -> Result<(), StateError> {
        match state.version {
            1 => {
                state.decode::<BootstrapOverridesV1>()?.apply(&mut self.config);
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
        let config = &mut self.config;

        if let Some(tag) = ctx.flags.get_str("k3s-version")? {
            config.k3s_override.tag = tag.to_string();
        }
        if let Some(domain) = parse_flag::<String>(ctx.flags, "cluster-domain")? {
            config.cluster_domain = domain;
        }

        let default = ctx.defaults.artifact(ids::K3S)?;
        config.k3s = fallback([&config.k3s_override, default]);
        config.k3s.require_complete().context("cannot resolve the k3s artifact")?;

        config.node_name = ctx
            .topology
            .primary()
            .map_or(DEFAULT_NODE, |node| node.name.as_str())
            .to_string();
        config.tls_sans = vec![
            base.control_vip().addr().to_string(),
            config.node_name.clone(),
        ];
        config.ready_retry = ready_retry(ctx, config.ready_retry_override, READY_RETRY);
        Ok(())
    }

    fn build(&mut self, ctx: &mut BuildContext<'_, '_>) -> Result<()> {
        let base = ctx.view.get::<Base>()?;
        let config = &self.config;

        ctx.build_op(
            CONTROL_INSTALL,
            stages::BOOTSTRAP,
            "k3s-fetch",
            BuildOp::FetchAndUnpack {
                source: ArtifactLocation::Registry {
                    reference: config.k3s.clone(),
                },
                files: vec![
                    FetchFile::new("k3s", "bin/k3s").mode(0o755),
                    FetchFile::new("k3s-airgap-images-amd64.tar.gz", IMAGES_FILE),
                    FetchFile::new("install.sh", "bin/k3s-install.sh").mode(0o755),
                ],
            },
        )?;
        ctx.build_op(
            CONTROL_INSTALL,
            stages::BOOTSTRAP,
            "k3s-config-render",
            BuildOp::RenderTemplate {
                template: K3S_CONFIG,
                vars: serde_json::json!({
                    "node": config.node_name,
                    "clusterCIDR": config.cluster_cidr.to_string(),
                    "serviceCIDR": config.service_cidr.to_string(),
                    "clusterDomain": config.cluster_domain,
                    "tlsSANs": config.tls_sans,
                }),
                target: RenderTarget::File {
                    path: "config/k3s.yaml".into(),
                    mode: Some(0o600),
                },
            },
        )?;
        ctx.build_op(
            CONTROL_INSTALL,
            stages::BOOTSTRAP,
            "k3s-registries-render",
            BuildOp::RenderTemplate {
                template: REGISTRIES,
                vars: serde_json::json!({
                    "registry": base.registry(),
                    "caFile": CA_TRUST_PATH,
                }),
                target: RenderTarget::File {
                    path: "config/registries.yaml".into(),
                    mode: None,
                },
            },
        )?;
        self.emit_provisioning(base, ctx)?;

        let install = [
            ("k3s-binary", install_file("bin/k3s", "/usr/local/bin/k3s", "0755")),
            (
                "k3s-images",
                install_file(
                    IMAGES_FILE,
                    "/var/lib/rancher/k3s/agent/images/k3s-airgap-images.tar.gz",
                    "0644",
                ),
            ),
            (
                "k3s-config",
                install_file("config/k3s.yaml", "/etc/rancher/k3s/config.yaml", "0600"),
            ),
            (
                "k3s-registries",
                install_file("config/registries.yaml", "/etc/rancher/k3s/registries.yaml", "0644"),
            ),
            (
                "k3s-install",
                InstallOp::RunCommand {
                    argv: vec!["sh".into(), "bin/k3s-install.sh".into()],
                    env: [
                        ("INSTALL_K3S_SKIP_DOWNLOAD".to_string(), "true".to_string()),
                        ("INSTALL_K3S_EXEC".to_string(), "server".to_string()),
                    ]
                    .into_iter()
                    .collect(),
                },
            ),
        ];
        for (name, op) in install {
            ctx.install_op(CONTROL_INSTALL, stages::BOOTSTRAP, name, op)?;
        }

        ctx.install_op(
            CONTROL_INSTALL,
            stages::BOOTSTRAP,
            "node-ready",
            InstallOp::WaitForResource {
                resource: "node".to_string(),
                name: config.node_name.clone(),
                namespace: None,
                ready: Readiness::condition("Ready"),
                retry: config.ready_retry,
            },
        )?;

        tracing::debug!("bootstrap node `{}` pulls from {}", config.node_name, base.registry());
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
