//! Deterministic kernel object names
//!
//! Every bridge, namespace, veth and chain the tool creates carries the `vc`
//! prefix, so the tool only ever touches objects matching this scheme.
//! Interface names are capped at 15 characters (IFNAMSIZ - 1); overflow is
//! resolved by a SHA-256 derived suffix, never randomly.
//!
//! Entity names are restricted to `[A-Za-z0-9_-]`, which keeps `.` and `/`
//! free to act as unambiguous separators inside derived names.

use crate::error::{Error, Result};
use sha2::{Digest, Sha256};

/// Maximum interface name length on Linux
pub const IFNAME_MAX: usize = 15;

/// Maximum length of a VPC or subnet name
pub const ENTITY_NAME_MAX: usize = 32;

/// Bridge name prefix
pub const BRIDGE_PREFIX: &str = "vcbr-";

/// iptables interface wildcard matching every VPC bridge
pub const BRIDGE_WILDCARD: &str = "vcbr-+";

/// Namespace name prefix
pub const NAMESPACE_PREFIX: &str = "vcns-";

/// Ingress chain created inside each subnet namespace
pub const INGRESS_CHAIN: &str = "VC-INGRESS";

const NAMESPACE_MAX: usize = 40;

/// Validate a user-chosen VPC or subnet name
pub fn validate_name(kind: &str, name: &str) -> Result<()> {
    if name.is_empty() || name.len() > ENTITY_NAME_MAX {
        return Err(Error::Validation(format!(
            "{} name '{}' must be 1-{} characters",
            kind, name, ENTITY_NAME_MAX
        )));
    }

    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
    {
        return Err(Error::Validation(format!(
            "{} name '{}' contains invalid character '{}' (allowed: letters, digits, '_', '-')",
            kind, name, bad
        )));
    }

    Ok(())
}

/// Hex digest over unambiguously joined parts
fn digest(parts: &[&str], len: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(parts.join("/").as_bytes());
    let mut encoded = hex::encode(hasher.finalize());
    encoded.truncate(len);
    encoded
}

/// Bridge acting as the router of a VPC
///
/// Short names are kept readable (`vcbr-prod`); longer ones keep a 4
/// character stem and a hash (`vcbr-stag.3f9a1`).
pub fn bridge_name(vpc: &str) -> String {
    let room = IFNAME_MAX - BRIDGE_PREFIX.len();
    if vpc.len() <= room {
        format!("{}{}", BRIDGE_PREFIX, vpc)
    } else {
        let stem: String = vpc.chars().take(4).collect();
        format!("{}{}.{}", BRIDGE_PREFIX, stem, digest(&["bridge", vpc], 5))
    }
}

/// Network namespace backing a subnet
pub fn namespace_name(vpc: &str, subnet: &str) -> String {
    let readable = format!("{}{}.{}", NAMESPACE_PREFIX, vpc, subnet);
    if readable.len() <= NAMESPACE_MAX {
        readable
    } else {
        format!("{}{}", NAMESPACE_PREFIX, digest(&["namespace", vpc, subnet], 16))
    }
}

/// Veth pair wiring a subnet namespace to its VPC bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubnetVeth {
    /// End enslaved to the bridge, holds the gateway address
    pub bridge_side: String,
    /// End moved into the namespace, holds the host address
    pub namespace_side: String,
}

pub fn subnet_veth(vpc: &str, subnet: &str) -> SubnetVeth {
    let id = digest(&["subnet", vpc, subnet], 8);
    SubnetVeth {
        bridge_side: format!("vcs{}b", id),
        namespace_side: format!("vcs{}n", id),
    }
}

/// Canonical (lexicographically ordered) form of an unordered VPC pair
pub fn canonical_pair<'a>(a: &'a str, b: &'a str) -> (&'a str, &'a str) {
    if a <= b { (a, b) } else { (b, a) }
}

/// Veth pair connecting two VPC bridges
///
/// `first` attaches to the bridge of the lexicographically smaller VPC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeeringVeth {
    pub first: String,
    pub second: String,
}

pub fn peering_veth(a: &str, b: &str) -> PeeringVeth {
    let (first, second) = canonical_pair(a, b);
    let id = digest(&["peering", first, second], 8);
    PeeringVeth {
        first: format!("vcp{}a", id),
        second: format!("vcp{}b", id),
    }
}
