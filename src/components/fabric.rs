//! The fabric controller, its CLI, and the addressing plan it is handed.

use std::any::Any;
use std::time::Duration;

use anyhow::{Context, Result};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::components::base::Base;
use crate::components::registry::{mirror, Registry};
use crate::components::{install_file, parse_flag, ready_retry, stages, AUTO_DEPLOY_DIR, CONTROL_INSTALL};
use crate::core::artifact::{fallback, ArtifactRef};
use crate::core::defaults::{ids, Defaults};
use crate::core::flags::Flag;
use crate::engine::{
    BuildContext, Component, ComponentState, HydrateContext, Named, StateError, ValidateContext,
};
use crate::ipam::NetworkPlan;
use crate::ops::objects::{ClusterObject, HelmChart, CHART_NAMESPACE};
use crate::ops::op::{
    ArtifactLocation, BuildOp, FetchFile, InstallOp, Readiness, RenderTarget, RetryPolicy, Template,
    Unpack,
};

const NAMESPACE_TEMPLATE: Template =
    Template::new("fabric-namespace.yaml", include_str!("templates/fabric-namespace.yaml"));

pub const NAMESPACE: &str = "fabric";

const CONTROLLER: &str = "fabric-controller-manager";
const CONFIG_MAP: &str = "fabric-config";
const NAMESPACE_MANIFEST: &str = "manifests/fabric-namespace.yaml";
const MANIFEST_FILE: &str = "manifests/fabric.yaml";

const SCHEMA_VERSIONS: &[u32] = &[1];

/// Controller rollout includes pulling every fabric image through the registry.
const READY_RETRY: RetryPolicy = RetryPolicy::new(120, Duration::from_secs(5));

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FabricConfig {
    #[serde(skip_serializing_if = "ArtifactRef::is_empty")]
    pub fabric_override: ArtifactRef,
    #[serde(skip_serializing_if = "ArtifactRef::is_empty")]
    pub chart_override: ArtifactRef,
    #[serde(skip_serializing_if = "ArtifactRef::is_empty")]
    pub ctl_override: ArtifactRef,
    pub fabric: ArtifactRef,
    pub chart: ArtifactRef,
    pub ctl: ArtifactRef,
    pub network: NetworkPlan,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ready_retry_override: Option<RetryPolicy>,
    pub ready_retry: RetryPolicy,
}

impl Default for FabricConfig {
    fn default() -> Self {
        FabricConfig {
            fabric_override: ArtifactRef::default(),
            chart_override: ArtifactRef::default(),
            ctl_override: ArtifactRef::default(),
            fabric: ArtifactRef::default(),
            chart: ArtifactRef::default(),
            ctl: ArtifactRef::default(),
            network: NetworkPlan::default_plan(),
            ready_retry_override: None,
            ready_retry: READY_RETRY,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct FabricOverridesV1 {
    fabric_override: Option<ArtifactRef>,
    chart_override: Option<ArtifactRef>,
    ctl_override: Option<ArtifactRef>,
    network: Option<NetworkPlan>,
    ready_retry_override: Option<RetryPolicy>,
}

impl FabricOverridesV1 {
    fn apply(self, config: &mut FabricConfig) {
        if let Some(fabric) = self.fabric_override {
            config.fabric_override = fabric;
        }
        if let Some(chart) = self.chart_override {
            config.chart_override = chart;
        }
        if let Some(ctl) = self.ctl_override {
            config.ctl_override = ctl;
        }
        if let Some(network) = self.network {
            config.network = network;
        }
        if let Some(retry) = self.ready_retry_override {
            config.ready_retry_override = Some(retry);
        }
    }
}

#[derive(Debug, Default)]
pub struct Fabric {
    config: FabricConfig,
}

impl Named for Fabric {
    const NAME: &'static str = "fabric";
}

impl Fabric {
    pub fn config(&self) -> &FabricConfig {
        &self.config
    }

    fn set_version(&mut self, version: &str) {
        let config = &mut self.config;
        config.fabric_override.tag = version.to_string();
        config.ctl_override.tag = version.to_string();
        // charts carry bare semver
        config.chart_override.tag = version.trim_start_matches('v').to_string();
    }

    fn resolve(&mut self, defaults: &Defaults) -> Result<()> {
        let config = &mut self.config;
        for (id, over, resolved) in [
            (ids::FABRIC, &config.fabric_override, &mut config.fabric),
            (ids::FABRIC_CHART, &config.chart_override, &mut config.chart),
            (ids::FABRIC_CTL, &config.ctl_override, &mut config.ctl),
        ] {
            *resolved = fallback([over, defaults.artifact(id)?]);
            resolved
                .require_complete()
                .with_context(|| format!("cannot resolve artifact `{}`", id))?;
        }
        Ok(())
    }

    fn objects(&self, base: &Base) -> Result<Vec<ClusterObject>> {
        let config = &self.config;
        let image = base.local(&config.fabric);
        let chart = base.local(&config.chart);
        let network = serde_yaml::to_string(&config.network).context("failed to serialize the network plan")?;

        Ok(vec![
            ClusterObject::config_map(CONFIG_MAP, NAMESPACE, [("network.yaml".to_string(), network)]),
            ClusterObject::HelmChart(HelmChart {
                name: "fabric".to_string(),
                chart: format!("oci://{}/{}", chart.repository, chart.name),
                version: chart.tag.clone(),
                target_namespace: NAMESPACE.to_string(),
                values: serde_json::json!({
                    "image": {
                        "repository": format!("{}/{}", image.repository, image.name),
                        "tag": image.tag,
                    },
                    "config": {
                        "configMap": CONFIG_MAP,
                    },
                }),
                repo_ca: Some(base.ca()?.cert.clone()),
            }),
        ])
    }
}

impl Component for Fabric {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn depends_on(&self) -> &'static [&'static str] {
        &[Base::NAME, Registry::NAME]
    }

    fn flags(&self) -> Vec<Flag> {
        vec![
            Flag::string("fabric-version", "Version of the fabric image, chart and CLI"),
            Flag::string("vtep-subnet", "Subnet VTEP addresses are allocated from"),
            Flag::string("fabric-subnet", "Subnet of the switch-to-switch links"),
            Flag::string("spine-asn", "ASN shared by all spine switches"),
        ]
    }

    fn load(&mut self, state: &ComponentState) -> Result<(), StateError> {
        match state.version {
            1 => {
                state.decode::<FabricOverridesV1>()?.apply(&mut self.config);
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

        if let Some(version) = ctx.flags.get_str("fabric-version")? {
            self.set_version(version);
        }
        self.resolve(ctx.defaults)?;

        let network = &mut self.config.network;
        if let Some(subnet) = parse_flag::<Ipv4Net>(ctx.flags, "vtep-subnet")? {
            network.vtep_subnet = subnet;
        }
        if let Some(subnet) = parse_flag::<Ipv4Net>(ctx.flags, "fabric-subnet")? {
            network.fabric_subnet = subnet;
        }
        if let Some(asn) = parse_flag::<u32>(ctx.flags, "spine-asn")? {
            network.asn.spine = asn;
        }
        network.management_subnet = base.config().management_subnet;
        network.control_vip = base.control_vip();
        self.config.ready_retry = ready_retry(ctx, self.config.ready_retry_override, READY_RETRY);
        Ok(())
    }

    fn build(&mut self, ctx: &mut BuildContext<'_, '_>) -> Result<()> {
        let base = ctx.view.get::<Base>()?;
        let config = &self.config;

        ctx.build_op(CONTROL_INSTALL, stages::FABRIC, "fabric-image", mirror(base, &config.fabric))?;
        ctx.build_op(CONTROL_INSTALL, stages::FABRIC, "fabric-chart", mirror(base, &config.chart))?;
        ctx.build_op(
            CONTROL_INSTALL,
            stages::FABRIC,
            "fabric-ctl",
            BuildOp::FetchAndUnpack {
                source: ArtifactLocation::Registry {
                    reference: config.ctl.clone(),
                },
                files: vec![FetchFile::new("fabric-ctl.tar.gz", "bin").unpack(Unpack::UntarGz)],
            },
        )?;
        ctx.build_op(
            CONTROL_INSTALL,
            stages::FABRIC,
            "fabric-namespace",
            BuildOp::RenderTemplate {
                template: NAMESPACE_TEMPLATE,
                vars: serde_json::json!({
                    "namespace": NAMESPACE,
                    "controlVIP": config.network.control_vip.addr().to_string(),
                    "registry": base.registry(),
                }),
                target: RenderTarget::Objects {
                    path: NAMESPACE_MANIFEST.into(),
                },
            },
        )?;
        ctx.build_op(
            CONTROL_INSTALL,
            stages::FABRIC,
            "fabric-objects",
            BuildOp::RenderObjects {
                path: MANIFEST_FILE.into(),
                objects: self.objects(base)?,
            },
        )?;

        let namespace_dest = format!("{}/stagehand-fabric-namespace.yaml", AUTO_DEPLOY_DIR);
        let manifest_dest = format!("{}/stagehand-fabric.yaml", AUTO_DEPLOY_DIR);
        let install = [
            ("fabric-ctl-install", install_file("bin/fabric-ctl", "/usr/local/bin/fabric-ctl", "0755")),
            ("fabric-namespace-manifest", install_file(NAMESPACE_MANIFEST, &namespace_dest, "0600")),
            ("fabric-manifests", install_file(MANIFEST_FILE, &manifest_dest, "0600")),
        ];
        for (name, op) in install {
            ctx.install_op(CONTROL_INSTALL, stages::FABRIC, name, op)?;
        }

        ctx.install_op(
            CONTROL_INSTALL,
            stages::READY,
            "fabric-chart-ready",
            InstallOp::WaitForResource {
                resource: "helmchart".to_string(),
                name: "fabric".to_string(),
                namespace: Some(CHART_NAMESPACE.to_string()),
                ready: Readiness::Exists,
                retry: config.ready_retry,
            },
        )?;
        ctx.install_op(
            CONTROL_INSTALL,
            stages::READY,
            "fabric-ready",
            InstallOp::WaitForResource {
                resource: "deployment".to_string(),
                name: CONTROLLER.to_string(),
                namespace: Some(NAMESPACE.to_string()),
                ready: Readiness::condition("Available"),
                retry: config.ready_retry,
            },
        )
    }

    fn validate(&self, ctx: &ValidateContext<'_>) -> Result<()> {
        self.config.network.validate(ctx.topology)?;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::flags::FlagValues;
    use crate::core::preset::Preset;
    use crate::core::topology::Topology;
    use crate::engine::View;

    fn hydrated(fabric: &mut Fabric, flags: &FlagValues) -> Result<()> {
        let defaults = Defaults::builtin();
        let topology = Topology::default();
        let mut base: Vec<Box<dyn Component>> = vec![Box::new(Base::default())];
        base[0]
            .hydrate(&HydrateContext {
                preset: Preset::Vlab,
                flags: &FlagValues::new().with("control-vip", "172.30.0.5/32"),
                defaults: &defaults,
                topology: &topology,
                view: View::new(Base::NAME, &[], &[], &[]),
            })
            .unwrap();

        fabric.hydrate(&HydrateContext {
            preset: Preset::Vlab,
            flags,
            defaults: &defaults,
            topology: &topology,
            view: View::new(Fabric::NAME, &[Base::NAME, Registry::NAME], &base, &[]),
        })
    }

    #[test]
    fn test_version_flag_tags_every_artifact() {
        let mut fabric = Fabric::default();
        hydrated(&mut fabric, &FlagValues::new().with("fabric-version", "v1.2.3")).unwrap();

        let config = fabric.config();
        assert_eq!(config.fabric.tag, "v1.2.3");
        assert_eq!(config.ctl.tag, "v1.2.3");
        assert_eq!(config.chart.tag, "1.2.3");
        assert_eq!(config.chart.name, "charts/fabric");
    }

    #[test]
    fn test_plan_takes_addresses_from_base() {
        let mut fabric = Fabric::default();
        hydrated(&mut fabric, &FlagValues::new().with("spine-asn", "64999")).unwrap();

        let network = &fabric.config().network;
        assert_eq!(network.control_vip, "172.30.0.5/32".parse::<Ipv4Net>().unwrap());
        assert_eq!(network.asn.spine, 64999);
        network.validate(&Topology::default()).unwrap();
    }

    #[test]
    fn test_bad_flag_value() {
        let mut fabric = Fabric::default();
        let err = hydrated(&mut fabric, &FlagValues::new().with("spine-asn", "spine")).unwrap_err();
        assert!(err.to_string().contains("--spine-asn"));
    }

    #[test]
    fn test_persisted_plan_survives() {
        let mut fabric = Fabric::default();
        hydrated(&mut fabric, &FlagValues::new().with("vtep-subnet", "172.31.0.0/22")).unwrap();
        let state = fabric.save().unwrap();

        let mut again = Fabric::default();
        again.load(&state).unwrap();
        hydrated(&mut again, &FlagValues::new()).unwrap();
        assert_eq!(again.config().network.vtep_subnet, "172.31.0.0/22".parse::<Ipv4Net>().unwrap());
        assert_eq!(again.save().unwrap(), state);
    }
}
