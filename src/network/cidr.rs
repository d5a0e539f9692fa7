//! CIDR parsing and address derivation for VPC networks
//!
//! Provides:
//! - Strict IPv4 CIDR parsing (host bits must be clear)
//! - Gateway/host address derivation for subnets
//! - Containment and overlap checks between blocks

use crate::error::{Error, Result};
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;

/// Parse an IPv4 network in CIDR notation
///
/// Rejects IPv6, missing prefixes and addresses with host bits set
/// (`10.0.1.5/24` is an address, not a network).
pub fn parse_cidr(input: &str) -> Result<Ipv4Net> {
    let trimmed = input.trim();
    if !trimmed.contains('/') {
        return Err(Error::Validation(format!(
            "Invalid CIDR '{}': missing prefix length (e.g. 10.0.0.0/16)",
            input
        )));
    }

    let net: Ipv4Net = trimmed.parse().map_err(|e| {
        Error::Validation(format!("Invalid CIDR '{}': {} (only IPv4 is supported)", input, e))
    })?;

    if net != net.trunc() {
        return Err(Error::Validation(format!(
            "Invalid CIDR '{}': host bits are set, did you mean {}?",
            input,
            net.trunc()
        )));
    }

    Ok(net)
}

/// True if the two blocks share at least one address
pub fn overlaps(a: &Ipv4Net, b: &Ipv4Net) -> bool {
    a.contains(&b.network()) || b.contains(&a.network())
}

/// Addressing derived from a subnet CIDR
///
/// The gateway is the first usable address (held by the VPC bridge), the
/// host is the second (held inside the namespace).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubnetAddressing {
    gateway: Ipv4Addr,
    host: Ipv4Addr,
}

impl SubnetAddressing {
    /// Derive gateway and host addresses for a subnet
    pub fn for_subnet(network: Ipv4Net) -> Result<Self> {
        let mut hosts = network.hosts();
        let (Some(gateway), Some(host)) = (hosts.next(), hosts.next()) else {
            return Err(Error::Validation(format!(
                "Subnet {} is too small: at least 2 usable host addresses are required",
                network
            )));
        };

        Ok(Self { gateway, host })
    }

    pub fn gateway(&self) -> Ipv4Addr {
        self.gateway
    }

    pub fn host(&self) -> Ipv4Addr {
        self.host
    }
}

/// Check a new VPC block against the blocks of existing VPCs
pub fn validate_vpc_cidr<'a>(
    cidr: &Ipv4Net,
    existing: impl IntoIterator<Item = (&'a str, &'a Ipv4Net)>,
) -> Result<()> {
    for (name, other) in existing {
        if overlaps(cidr, other) {
            return Err(Error::Validation(format!(
                "CIDR {} overlaps VPC '{}' ({})",
                cidr, name, other
            )));
        }
    }
    Ok(())
}

/// Check a new subnet block against its VPC block and its siblings
pub fn validate_subnet_cidr<'a>(
    cidr: &Ipv4Net,
    vpc_cidr: &Ipv4Net,
    siblings: impl IntoIterator<Item = (&'a str, &'a Ipv4Net)>,
) -> Result<()> {
    if !vpc_cidr.contains(cidr) {
        return Err(Error::Validation(format!(
            "Subnet CIDR {} is not contained in VPC CIDR {}",
            cidr, vpc_cidr
        )));
    }

    for (name, other) in siblings {
        if overlaps(cidr, other) {
            return Err(Error::Validation(format!(
                "Subnet CIDR {} overlaps subnet '{}' ({})",
                cidr, name, other
            )));
        }
    }

    SubnetAddressing::for_subnet(*cidr).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_cidr() {
        assert_eq!(parse_cidr("10.0.0.0/16").unwrap(), net("10.0.0.0/16"));
        assert_eq!(parse_cidr(" 10.0.1.0/24 ").unwrap(), net("10.0.1.0/24"));
    }

    #[test]
    fn test_parse_cidr_rejects_malformed() {
        assert!(matches!(parse_cidr("10.0.0.0"), Err(Error::Validation(_))));
        assert!(matches!(parse_cidr("10.0.0.0/33"), Err(Error::Validation(_))));
        assert!(matches!(parse_cidr("banana/8"), Err(Error::Validation(_))));
        assert!(matches!(parse_cidr("fd00::/64"), Err(Error::Validation(_))));
    }

    #[test]
    fn test_parse_cidr_rejects_host_bits() {
        let err = parse_cidr("10.0.1.5/24").unwrap_err();
        assert!(err.to_string().contains("10.0.1.0/24"));
    }

    #[test]
    fn test_addressing_first_and_second_usable() {
        let addr = SubnetAddressing::for_subnet(net("10.0.1.0/24")).unwrap();
        assert_eq!(addr.gateway(), Ipv4Addr::new(10, 0, 1, 1));
        assert_eq!(addr.host(), Ipv4Addr::new(10, 0, 1, 2));

        let addr = SubnetAddressing::for_subnet(net("192.168.4.64/26")).unwrap();
        assert_eq!(addr.gateway(), Ipv4Addr::new(192, 168, 4, 65));
        assert_eq!(addr.host(), Ipv4Addr::new(192, 168, 4, 66));
    }

    #[test]
    fn test_addressing_too_small() {
        assert!(SubnetAddressing::for_subnet(net("10.0.1.7/32")).is_err());
        assert!(SubnetAddressing::for_subnet(net("10.0.1.0/30")).is_ok());
    }

    #[test]
    fn test_overlaps() {
        assert!(overlaps(&net("10.0.0.0/16"), &net("10.0.5.0/24")));
        assert!(overlaps(&net("10.0.5.0/24"), &net("10.0.0.0/16")));
        assert!(!overlaps(&net("10.0.0.0/16"), &net("10.1.0.0/16")));
    }

    #[test]
    fn test_validate_vpc_cidr() {
        let other = net("10.0.0.0/16");
        assert!(validate_vpc_cidr(&net("10.1.0.0/16"), [("v1", &other)]).is_ok());
        let err = validate_vpc_cidr(&net("10.0.128.0/17"), [("v1", &other)]).unwrap_err();
        assert!(err.to_string().contains("v1"));
    }

    #[test]
    fn test_validate_subnet_cidr() {
        let vpc = net("10.0.0.0/16");
        let sibling = net("10.0.1.0/24");

        assert!(validate_subnet_cidr(&net("10.0.2.0/24"), &vpc, [("pub", &sibling)]).is_ok());
        assert!(validate_subnet_cidr(&net("10.1.2.0/24"), &vpc, []).is_err());
        assert!(validate_subnet_cidr(&net("10.0.1.128/25"), &vpc, [("pub", &sibling)]).is_err());
        assert!(validate_subnet_cidr(&net("10.0.3.3/32"), &vpc, []).is_err());
    }
}
