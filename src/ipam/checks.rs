//! Primitive address, AS-number, and VLAN predicates.
//!
//! Every check is pure: it inspects already-parsed values and reports the
//! offending names together with the concrete values that conflict.

use std::fmt;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use super::ValidationError;

/// Whether two prefixes share at least one address.
pub fn overlaps(a: &Ipv4Net, b: &Ipv4Net) -> bool {
    a.contains(&b.network()) || b.contains(&a.network())
}

/// Pairwise overlap check across every named prefix.
pub fn check_no_overlap(prefixes: &[(&str, Ipv4Net)]) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    for (i, (first, first_net)) in prefixes.iter().enumerate() {
        for (second, second_net) in &prefixes[i + 1..] {
            if overlaps(first_net, second_net) {
                errors.push(ValidationError::Overlap {
                    first: first.to_string(),
                    first_net: first_net.trunc(),
                    second: second.to_string(),
                    second_net: second_net.trunc(),
                });
            }
        }
    }
    errors
}

/// Check that a position address sits inside its parent prefix and, when
/// `exact_len` is given, carries exactly that prefix length.
pub fn check_position(
    position: &str,
    addr: Ipv4Net,
    parent: &str,
    parent_net: Ipv4Net,
    exact_len: Option<u8>,
) -> Result<(), ValidationError> {
    if let Some(expected) = exact_len {
        if addr.prefix_len() != expected {
            return Err(ValidationError::PrefixLength {
                position: position.to_string(),
                addr,
                expected,
            });
        }
    }
    if !parent_net.contains(&addr.addr()) {
        return Err(ValidationError::NotContained {
            position: position.to_string(),
            addr,
            parent: parent.to_string(),
            parent_net: parent_net.trunc(),
        });
    }
    Ok(())
}

/// Inclusive address range, e.g. DHCP lease bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddrRange {
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
}

impl AddrRange {
    pub fn new(start: Ipv4Addr, end: Ipv4Addr) -> Self {
        AddrRange { start, end }
    }
}

impl fmt::Display for AddrRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Check that both range bounds sit inside the parent and are strictly ordered.
pub fn check_range(
    what: &str,
    range: AddrRange,
    parent: &str,
    parent_net: Ipv4Net,
) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    for (bound, addr) in [("start", range.start), ("end", range.end)] {
        if !parent_net.contains(&addr) {
            errors.push(ValidationError::NotContained {
                position: format!("{} {}", what, bound),
                addr: Ipv4Net::from(addr),
                parent: parent.to_string(),
                parent_net: parent_net.trunc(),
            });
        }
    }
    if range.start >= range.end {
        errors.push(ValidationError::RangeOrder {
            what: what.to_string(),
            start: range.start.to_string(),
            end: range.end.to_string(),
        });
    }
    errors
}

/// Autonomous-system numbering plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AsnPlan {
    pub spine: u32,
    pub leaf_start: u32,
    pub leaf_end: u32,
    pub gateway: Option<u32>,
}

impl AsnPlan {
    fn leaf_contains(&self, asn: u32) -> bool {
        (self.leaf_start..=self.leaf_end).contains(&asn)
    }

    /// Spine, leaf range, and gateway numbers must be pairwise disjoint and
    /// the leaf range strictly ordered.
    pub fn check(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.leaf_start >= self.leaf_end {
            errors.push(ValidationError::RangeOrder {
                what: "leaf ASN range".to_string(),
                start: self.leaf_start.to_string(),
                end: self.leaf_end.to_string(),
            });
        }
        if self.leaf_contains(self.spine) {
            errors.push(ValidationError::AsnInRange {
                what: "spine",
                asn: self.spine,
                start: self.leaf_start,
                end: self.leaf_end,
            });
        }
        if let Some(gateway) = self.gateway {
            if self.leaf_contains(gateway) {
                errors.push(ValidationError::AsnInRange {
                    what: "gateway",
                    asn: gateway,
                    start: self.leaf_start,
                    end: self.leaf_end,
                });
            }
            if gateway == self.spine {
                errors.push(ValidationError::AsnEqual {
                    first: "spine",
                    second: "gateway",
                    asn: gateway,
                });
            }
        }

        errors
    }
}

/// Inclusive VLAN id range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VlanRange {
    pub from: u16,
    pub to: u16,
}

impl VlanRange {
    pub const MIN: u16 = 1;
    pub const MAX: u16 = 4094;

    pub fn new(from: u16, to: u16) -> Self {
        VlanRange { from, to }
    }

    pub fn overlaps(&self, other: &VlanRange) -> bool {
        self.from <= other.to && other.from <= self.to
    }
}

impl fmt::Display for VlanRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.from, self.to)
    }
}

/// Bounds and pairwise disjointness for named VLAN ranges.
pub fn check_vlans(ranges: &[(&str, VlanRange)]) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    for (name, range) in ranges {
        if range.from > range.to || range.from < VlanRange::MIN || range.to > VlanRange::MAX {
            errors.push(ValidationError::VlanInvalid {
                name: name.to_string(),
                range: *range,
            });
        }
    }
    for (i, (first, first_range)) in ranges.iter().enumerate() {
        for (second, second_range) in &ranges[i + 1..] {
            if first_range.overlaps(second_range) {
                errors.push(ValidationError::VlanOverlap {
                    first: first.to_string(),
                    first_range: *first_range,
                    second: second.to_string(),
                    second_range: *second_range,
                });
            }
        }
    }

    errors
}
