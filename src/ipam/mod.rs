//! Network, AS-number, and VLAN plan validation.
//!
//! A [`NetworkPlan`] is the already-hydrated addressing record of the fabric
//! component. [`NetworkPlan::validate`] runs every check and reports all
//! conflicts at once, each naming the members involved and their values.

pub mod checks;

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use checks::{check_no_overlap, check_position, check_range, check_vlans, overlaps};
pub use checks::{AddrRange, AsnPlan, VlanRange};

use crate::core::topology::Topology;

/// A conflict or inconsistency in the addressing plan.
#[derive(Debug, Error, Diagnostic, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{first} subnet {first_net} overlaps with {second} subnet {second_net}")]
    #[diagnostic(code(stagehand::ipam::overlap))]
    Overlap {
        first: String,
        first_net: Ipv4Net,
        second: String,
        second_net: Ipv4Net,
    },

    #[error("{position} {addr} is not in {parent} subnet {parent_net}")]
    #[diagnostic(code(stagehand::ipam::not_contained))]
    NotContained {
        position: String,
        addr: Ipv4Net,
        parent: String,
        parent_net: Ipv4Net,
    },

    #[error("{position} {addr} must be a /{expected}")]
    #[diagnostic(code(stagehand::ipam::prefix_length))]
    PrefixLength {
        position: String,
        addr: Ipv4Net,
        expected: u8,
    },

    #[error("{what} start {start} must be before end {end}")]
    #[diagnostic(code(stagehand::ipam::range_order))]
    RangeOrder {
        what: String,
        start: String,
        end: String,
    },

    #[error("{what} ASN must be outside leaf ASN range {start}-{end} (got {asn})")]
    #[diagnostic(code(stagehand::ipam::asn_in_range))]
    AsnInRange {
        what: &'static str,
        asn: u32,
        start: u32,
        end: u32,
    },

    #[error("{first} ASN and {second} ASN must differ (both {asn})")]
    #[diagnostic(code(stagehand::ipam::asn_equal))]
    AsnEqual {
        first: &'static str,
        second: &'static str,
        asn: u32,
    },

    #[error("{first} VLAN range {first_range} overlaps with {second} VLAN range {second_range}")]
    #[diagnostic(code(stagehand::ipam::vlan_overlap))]
    VlanOverlap {
        first: String,
        first_range: VlanRange,
        second: String,
        second_range: VlanRange,
    },

    #[error("{name} VLAN range {range} must be ordered and within 1-4094")]
    #[diagnostic(code(stagehand::ipam::vlan_invalid))]
    VlanInvalid { name: String, range: VlanRange },

    #[error("{} addressing conflicts:\n  {}", .0.len(), join_errors(.0))]
    #[diagnostic(code(stagehand::ipam::multiple))]
    Multiple(Vec<ValidationError>),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("\n  ")
}

impl ValidationError {
    /// Collapse a list of findings; `None` when the list is empty.
    pub fn from_all(mut errors: Vec<ValidationError>) -> Option<Self> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(ValidationError::Multiple(errors)),
        }
    }

    /// Flattened individual findings.
    pub fn findings(&self) -> Vec<&ValidationError> {
        match self {
            ValidationError::Multiple(errors) => errors.iter().collect(),
            e => vec![e],
        }
    }
}

/// Addressing record of the fabric.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPlan {
    pub management_subnet: Ipv4Net,
    #[serde(rename = "controlVIP")]
    pub control_vip: Ipv4Net,
    pub management_dhcp: AddrRange,
    pub protocol_subnet: Ipv4Net,
    pub vtep_subnet: Ipv4Net,
    pub fabric_subnet: Ipv4Net,
    pub loopback_subnet: Ipv4Net,
    pub session_subnet: Ipv4Net,
    /// Point-to-point link between the redundant gateway pair.
    pub session_link: Ipv4Net,
    pub vpc_workaround_subnet: Ipv4Net,
    pub asn: AsnPlan,
    pub reserved_vlans: VlanRange,
    pub vpc_vlans: VlanRange,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vpc_workaround_vlans: Option<VlanRange>,
}

impl NetworkPlan {
    /// Plan used for both presets unless overridden.
    pub fn default_plan() -> Self {
        let net = |a: u8, b: u8, c: u8, d: u8, len: u8| {
            Ipv4Net::new_assert(Ipv4Addr::new(a, b, c, d), len)
        };

        NetworkPlan {
            management_subnet: net(172, 30, 0, 0, 21),
            control_vip: net(172, 30, 0, 1, 32),
            management_dhcp: AddrRange::new(
                Ipv4Addr::new(172, 30, 4, 0),
                Ipv4Addr::new(172, 30, 7, 254),
            ),
            protocol_subnet: net(172, 30, 8, 0, 22),
            vtep_subnet: net(172, 30, 12, 0, 22),
            fabric_subnet: net(172, 30, 128, 0, 17),
            loopback_subnet: net(172, 30, 16, 0, 22),
            session_subnet: net(172, 30, 20, 0, 24),
            session_link: net(172, 30, 20, 0, 31),
            vpc_workaround_subnet: net(172, 30, 24, 0, 21),
            asn: AsnPlan {
                spine: 65100,
                leaf_start: 65101,
                leaf_end: 65534,
                gateway: Some(65000),
            },
            reserved_vlans: VlanRange::new(1000, 1999),
            vpc_vlans: VlanRange::new(2000, 2999),
            vpc_workaround_vlans: Some(VlanRange::new(3000, 3999)),
        }
    }

    /// Named prefixes that must not overlap.
    pub fn prefixes(&self) -> Vec<(&'static str, Ipv4Net)> {
        vec![
            ("management", self.management_subnet),
            ("protocol", self.protocol_subnet),
            ("VTEP", self.vtep_subnet),
            ("fabric", self.fabric_subnet),
            ("loopback", self.loopback_subnet),
            ("session", self.session_subnet),
            ("VPC workaround", self.vpc_workaround_subnet),
        ]
    }

    /// Run every check against the plan and the topology's node addresses.
    pub fn validate(&self, topology: &Topology) -> Result<(), ValidationError> {
        let mut errors = check_no_overlap(&self.prefixes());

        errors.extend(
            check_position(
                "control VIP",
                self.control_vip,
                "management",
                self.management_subnet,
                Some(32),
            )
            .err(),
        );
        errors.extend(check_range(
            "management DHCP range",
            self.management_dhcp,
            "management",
            self.management_subnet,
        ));
        if self.management_dhcp.start <= self.control_vip.addr()
            && self.control_vip.addr() <= self.management_dhcp.end
        {
            errors.push(ValidationError::NotContained {
                position: "control VIP".to_string(),
                addr: self.control_vip,
                parent: "non-DHCP management".to_string(),
                parent_net: self.management_subnet.trunc(),
            });
        }
        errors.extend(
            check_position(
                "session link",
                self.session_link,
                "session",
                self.session_subnet,
                Some(31),
            )
            .err(),
        );

        for node in &topology.control {
            errors.extend(
                check_position(
                    &format!("control node `{}` management IP", node.name),
                    node.management_ip,
                    "management",
                    self.management_subnet,
                    Some(self.management_subnet.prefix_len()),
                )
                .err(),
            );
            if let Some(loopback) = node.loopback_ip {
                errors.extend(
                    check_position(
                        &format!("control node `{}` loopback IP", node.name),
                        loopback,
                        "loopback",
                        self.loopback_subnet,
                        Some(32),
                    )
                    .err(),
                );
            }
        }

        errors.extend(self.asn.check());

        let mut vlans = vec![("reserved", self.reserved_vlans), ("VPC", self.vpc_vlans)];
        if let Some(workaround) = self.vpc_workaround_vlans {
            vlans.push(("VPC workaround", workaround));
        }
        errors.extend(check_vlans(&vlans));

        match ValidationError::from_all(errors) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
