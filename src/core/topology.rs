//! Topology input: the machines the bundles are assembled for.

use std::path::Path;

use anyhow::{bail, Context, Result};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

/// A control node that will run the bootstrap cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlNode {
    pub name: String,
    /// Management address with the management prefix length.
    #[serde(rename = "managementIP")]
    pub management_ip: Ipv4Net,
    /// Loopback address handed to the fabric; must be a /32.
    #[serde(rename = "loopbackIP", default, skip_serializing_if = "Option::is_none")]
    pub loopback_ip: Option<Ipv4Net>,
}

/// Machines targeted by this run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Topology {
    pub control: Vec<ControlNode>,
}

impl Topology {
    /// Load a topology from YAML.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read topology: {}", path.display()))?;
        let topology: Topology = serde_yaml::from_str(&contents)
            .with_context(|| format!("failed to parse topology: {}", path.display()))?;
        topology.check()?;
        Ok(topology)
    }

    /// Single-node topology used when none is supplied.
    pub fn single(name: &str, management_ip: Ipv4Net) -> Self {
        Topology {
            control: vec![ControlNode {
                name: name.to_string(),
                management_ip,
                loopback_ip: None,
            }],
        }
    }

    /// Structural checks that do not depend on any component.
    pub fn check(&self) -> Result<()> {
        for (i, node) in self.control.iter().enumerate() {
            if node.name.is_empty() {
                bail!("control node #{} has no name", i);
            }
            if self.control[..i].iter().any(|n| n.name == node.name) {
                bail!("control node `{}` is listed twice", node.name);
            }
        }
        Ok(())
    }

    /// The first control node, where installer bundles are replayed.
    pub fn primary(&self) -> Option<&ControlNode> {
        self.control.first()
    }
}
