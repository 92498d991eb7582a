//! Machine-provisioning descriptors.
//!
//! Components describe a machine in a small YAML dialect ([`Provisioning`]),
//! usually rendered from a template; [`Provisioning::to_ignition`] turns it
//! into the Ignition JSON consumed by the OS image at first boot.

use std::fmt::Write as _;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};

/// Ignition spec version emitted.
pub const IGNITION_VERSION: &str = "3.4.0";

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct Provisioning {
    pub hostname: Option<String>,
    pub users: Vec<User>,
    pub files: Vec<File>,
    pub units: Vec<Unit>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct User {
    pub name: String,
    #[serde(default)]
    pub password_hash: Option<String>,
    #[serde(default)]
    pub ssh_keys: Vec<String>,
    #[serde(default)]
    pub groups: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct File {
    pub path: String,
    #[serde(default = "default_file_mode")]
    pub mode: u32,
    pub contents: String,
}

fn default_file_mode() -> u32 {
    0o644
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Unit {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub contents: Option<String>,
}

fn default_enabled() -> bool {
    true
}

/// RFC 2397 `data:` URL with percent-encoded payload.
pub fn data_url(contents: &str) -> String {
    let mut out = String::from("data:,");
    for b in contents.bytes() {
        if b.is_ascii_alphanumeric() || b"-._~".contains(&b) {
            out.push(b as char);
        } else {
            let _ = write!(out, "%{:02X}", b);
        }
    }
    out
}

impl Provisioning {
    /// Parse the YAML dialect.
    pub fn parse(source: &str, origin: &str) -> Result<Self> {
        serde_yaml::from_str(source).with_context(|| format!("{}: invalid provisioning descriptor", origin))
    }

    pub fn to_ignition(&self) -> Value {
        let users: Vec<Value> = self
            .users
            .iter()
            .map(|u| {
                let mut user = json!({"name": u.name});
                if let Some(hash) = &u.password_hash {
                    user["passwordHash"] = json!(hash);
                }
                if !u.ssh_keys.is_empty() {
                    user["sshAuthorizedKeys"] = json!(u.ssh_keys);
                }
                if !u.groups.is_empty() {
                    user["groups"] = json!(u.groups);
                }
                user
            })
            .collect();

        let file = |path: &str, mode: u32, contents: &str| {
            json!({
                "path": path,
                "mode": mode,
                "overwrite": true,
                "contents": {"source": data_url(contents)},
            })
        };
        let mut files: Vec<Value> = Vec::new();
        if let Some(hostname) = &self.hostname {
            files.push(file("/etc/hostname", 0o644, &format!("{}\n", hostname)));
        }
        files.extend(self.files.iter().map(|f| file(&f.path, f.mode, &f.contents)));

        let units: Vec<Value> = self
            .units
            .iter()
            .map(|u| {
                let mut unit = json!({"name": u.name, "enabled": u.enabled});
                if let Some(contents) = &u.contents {
                    unit["contents"] = json!(contents);
                }
                unit
            })
            .collect();

        json!({
            "ignition": {"version": IGNITION_VERSION},
            "passwd": {"users": users},
            "storage": {"files": files},
            "systemd": {"units": units},
        })
    }

    /// Pretty JSON with a trailing newline.
    pub fn render(&self) -> Result<String> {
        let mut out =
            serde_json::to_string_pretty(&self.to_ignition()).context("failed to serialize provisioning descriptor")?;
        out.push('\n');
        Ok(out)
    }
}
