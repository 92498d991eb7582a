//! Platform-wide settings: control VIP, local registry address, CA, and the
//! default user of the control node.

use std::any::Any;
use std::net::{Ipv4Addr, IpAddr};

use anyhow::{bail, Context, Result};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::components::{install_file, parse_flag, stages, CONTROL_INSTALL};
use crate::core::artifact::{fallback, ArtifactRef};
use crate::core::flags::Flag;
use crate::engine::{BuildContext, Component, ComponentState, HydrateContext, Named, StateError};
use crate::ops::op::{BuildOp, InstallOp, RenderTarget, Template};
use crate::pki::{self, CertMaterial, CertRequest};

/// Node port the local registry listens on behind the VIP.
pub const REGISTRY_PORT: u16 = 31000;

/// Repository prefix of mirrored artifacts in the local registry.
pub const REGISTRY_PREFIX: &str = "airgap";

pub const CA_SUBJECT: &str = "Stagehand Root CA";

/// Bundle-relative path of the CA certificate.
pub const CA_FILE: &str = "certs/ca.crt";

/// Where the CA is installed into the host trust store.
pub const CA_TRUST_PATH: &str = "/usr/local/share/ca-certificates/stagehand-ca.crt";

pub const DEFAULT_USER: &str = "core";

const CA_TEMPLATE: Template = Template::new("ca.crt", "{{ cert }}");

const SCHEMA_VERSIONS: &[u32] = &[1];

/// Accepted format of the default user's password hash.
///
/// Only hashes with the policy's literal prefix are accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PasswordHashPolicy {
    /// SHA-256 crypt, prefix `$5$`.
    #[default]
    Sha256Crypt,
}

impl PasswordHashPolicy {
    pub const fn prefix(self) -> &'static str {
        match self {
            PasswordHashPolicy::Sha256Crypt => "$5$",
        }
    }

    pub fn accepts(self, hash: &str) -> bool {
        hash.starts_with(self.prefix())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefaultUser {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authorized_keys: Vec<String>,
}

impl Default for DefaultUser {
    fn default() -> Self {
        DefaultUser {
            name: DEFAULT_USER.to_string(),
            password_hash: None,
            authorized_keys: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BaseConfig {
    #[serde(rename = "controlVIP")]
    pub control_vip: Ipv4Net,
    pub management_subnet: Ipv4Net,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dns_servers: Vec<Ipv4Addr>,
    pub default_user: DefaultUser,
    pub password_policy: PasswordHashPolicy,
    /// `<vip>:<port>` of the local registry.
    pub registry: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca: Option<CertMaterial>,
}

impl Default for BaseConfig {
    fn default() -> Self {
        BaseConfig {
            control_vip: Ipv4Net::new_assert(Ipv4Addr::new(172, 30, 0, 1), 32),
            management_subnet: Ipv4Net::new_assert(Ipv4Addr::new(172, 30, 0, 0), 21),
            dns_servers: Vec::new(),
            default_user: DefaultUser::default(),
            password_policy: PasswordHashPolicy::default(),
            registry: String::new(),
            ca: None,
        }
    }
}

/// Fields of a version 1 record that survive into the next run.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct BaseOverridesV1 {
    #[serde(rename = "controlVIP")]
    control_vip: Option<Ipv4Net>,
    management_subnet: Option<Ipv4Net>,
    dns_servers: Option<Vec<Ipv4Addr>>,
    default_user: Option<DefaultUser>,
    ca: Option<CertMaterial>,
}

impl BaseOverridesV1 {
    fn apply(self, config: &mut BaseConfig) {
        if let Some(vip) = self.control_vip {
            config.control_vip = vip;
        }
        if let Some(subnet) = self.management_subnet {
            config.management_subnet = subnet;
        }
        if let Some(dns) = self.dns_servers {
            config.dns_servers = dns;
        }
        if let Some(user) = self.default_user {
            config.default_user = user;
        }
        if let Some(ca) = self.ca {
            config.ca = Some(ca);
        }
    }
}

#[derive(Debug, Default)]
pub struct Base {
    config: BaseConfig,
}

impl Named for Base {
    const NAME: &'static str = "base";
}

impl Base {
    pub fn config(&self) -> &BaseConfig {
        &self.config
    }

    pub fn control_vip(&self) -> Ipv4Net {
        self.config.control_vip
    }

    pub fn registry(&self) -> &str {
        &self.config.registry
    }

    /// Repository all mirrored artifacts live under.
    pub fn registry_repository(&self) -> String {
        format!("{}/{}", self.config.registry, REGISTRY_PREFIX)
    }

    /// Coordinate of `upstream` once mirrored into the local registry.
    pub fn local(&self, upstream: &ArtifactRef) -> ArtifactRef {
        fallback([&ArtifactRef::repository(self.registry_repository()), upstream])
    }

    pub fn ca(&self) -> Result<&CertMaterial> {
        self.config.ca.as_ref().context("the platform CA has not been issued")
    }

    /// Addresses every control-plane endpoint is reached at.
    pub fn endpoint_ips(&self) -> Vec<IpAddr> {
        vec![
            IpAddr::V4(self.config.control_vip.addr()),
            IpAddr::V4(Ipv4Addr::LOCALHOST),
        ]
    }
}

impl Component for Base {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn flags(&self) -> Vec<Flag> {
        vec![
            Flag::string("control-vip", "Control plane virtual IP, as a /32"),
            Flag::string("management-subnet", "Management network of the control nodes"),
            Flag::list("dns-servers", "DNS servers handed to the control nodes"),
            Flag::string("default-user", "Name of the default control node user"),
            Flag::string(
                "default-password-hash",
                "Password hash of the default user (SHA-256 crypt, `$5$...`)",
            )
            .env("STAGEHAND_PASSWORD_HASH"),
            Flag::list("authorized-keys", "SSH public keys of the default user"),
        ]
    }

    fn load(&mut self, state: &ComponentState) -> Result<(), StateError> {
        match state.version {
            1 => {
                state.decode::<BaseOverridesV1>()?.apply(&mut self.config);
                Ok(())
            }
            found => Err(StateError::unsupported(found, SCHEMA_VERSIONS)),
        }
    }

    fn save(&self) -> Result<ComponentState, StateError> {
        ComponentState::encode(1, &self.config)
    }

    fn hydrate(&mut self, ctx: &HydrateContext<'_>) -> Result<()> {
        let flags = ctx.flags;
        let config = &mut self.config;

        if let Some(vip) = parse_flag(flags, "control-vip")? {
            config.control_vip = vip;
        }
        if let Some(subnet) = parse_flag(flags, "management-subnet")? {
            config.management_subnet = subnet;
        }
        if let Some(dns) = flags.get_list("dns-servers")? {
            config.dns_servers = dns
                .iter()
                .map(|s| s.parse().with_context(|| format!("invalid DNS server `{}`", s)))
                .collect::<Result<_>>()?;
        }
        if let Some(name) = flags.get_str("default-user")? {
            config.default_user.name = name.to_string();
        }
        if let Some(hash) = flags.get_str("default-password-hash")? {
            config.default_user.password_hash = Some(hash.to_string());
        }
        if let Some(keys) = flags.get_list("authorized-keys")? {
            config.default_user.authorized_keys = keys.to_vec();
        }

        if let Some(hash) = &config.default_user.password_hash {
            let policy = config.password_policy;
            if !policy.accepts(hash) {
                bail!(
                    "password hash of user `{}` must start with `{}` ({:?} policy)",
                    config.default_user.name,
                    policy.prefix(),
                    policy
                );
            }
        }

        config.registry = format!("{}:{}", config.control_vip.addr(), REGISTRY_PORT);
        config.ca = Some(pki::ensure(&CertRequest::ca(CA_SUBJECT), config.ca.as_ref())?);
        Ok(())
    }

    fn build(&mut self, ctx: &mut BuildContext<'_, '_>) -> Result<()> {
        let ca = self.ca()?;

        ctx.build_op(
            CONTROL_INSTALL,
            stages::BOOTSTRAP,
            "ca-certificate",
            BuildOp::RenderTemplate {
                template: CA_TEMPLATE,
                vars: serde_json::json!({ "cert": ca.cert }),
                target: RenderTarget::File {
                    path: CA_FILE.into(),
                    mode: Some(0o644),
                },
            },
        )?;

        ctx.install_op(
            CONTROL_INSTALL,
            stages::BOOTSTRAP,
            "ca-trust",
            install_file(CA_FILE, CA_TRUST_PATH, "0644"),
        )?;
        ctx.install_op(
            CONTROL_INSTALL,
            stages::BOOTSTRAP,
            "ca-refresh",
            InstallOp::command(["update-ca-certificates"]),
        )
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
