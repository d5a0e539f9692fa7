//! NAT gateway and cross-VPC isolation
//!
//! All rules live in the host's `filter/FORWARD` and `nat/POSTROUTING`
//! chains and are matched by specification, so they can be checked before
//! insertion and removed regardless of their position.

use crate::error::{Error, Result};
use crate::naming::{self, BRIDGE_WILDCARD};
use crate::network::{Kernel, Rule, Table};
use crate::state::{NatGateway, Outcome, StateGraph, Vpc};
use ipnet::Ipv4Net;
use tracing::{info, warn};

/// Drop forwarding from a VPC bridge towards any other VPC bridge
fn isolation_drop(bridge: &str) -> Rule {
    Rule::new(
        Table::Filter,
        "FORWARD",
        &["-i", bridge, "-o", BRIDGE_WILDCARD, "-j", "DROP"],
    )
}

/// Accept forwarding between subnets of the same VPC
fn isolation_accept(bridge: &str) -> Rule {
    Rule::new(
        Table::Filter,
        "FORWARD",
        &["-i", bridge, "-o", bridge, "-j", "ACCEPT"],
    )
}

/// Rules installed for every VPC, in the order they sit in `FORWARD`
pub fn isolation_rules(bridge: &str) -> Vec<Rule> {
    vec![isolation_accept(bridge), isolation_drop(bridge)]
}

/// Install the isolation rules of a VPC bridge
///
/// The intra-VPC accept must precede the drop, so a missing drop forces the
/// accept to be re-inserted in front of it.
pub fn install_isolation(kernel: &Kernel, bridge: &str) -> Result<()> {
    let filter = &kernel.filter;
    let drop = isolation_drop(bridge);
    let accept = isolation_accept(bridge);

    if !filter.rule_exists(&drop)? {
        filter.remove_all(&accept)?;
        filter.insert_rule(&drop)?;
    }
    filter.ensure_inserted(&accept)?;

    // Subnets of one VPC are routed through the host
    kernel.link.set_ip_forwarding(true)?;
    Ok(())
}

pub fn remove_isolation(kernel: &Kernel, bridge: &str) -> Result<()> {
    for rule in isolation_rules(bridge) {
        kernel.filter.remove_all(&rule)?;
    }
    Ok(())
}

fn masquerade(vpc_cidr: &Ipv4Net, interface: &str) -> Rule {
    Rule::new(
        Table::Nat,
        "POSTROUTING",
        &["-s", &vpc_cidr.to_string(), "-o", interface, "-j", "MASQUERADE"],
    )
}

/// Egress drop keeping a private subnet off the internet
pub fn private_drop(subnet_cidr: &Ipv4Net, interface: &str) -> Rule {
    Rule::new(
        Table::Filter,
        "FORWARD",
        &["-s", &subnet_cidr.to_string(), "-o", interface, "-j", "DROP"],
    )
}

fn egress_accept(bridge: &str, interface: &str) -> Rule {
    Rule::new(
        Table::Filter,
        "FORWARD",
        &["-i", bridge, "-o", interface, "-j", "ACCEPT"],
    )
}

fn return_accept(bridge: &str, interface: &str) -> Rule {
    Rule::new(
        Table::Filter,
        "FORWARD",
        &[
            "-i",
            interface,
            "-o",
            bridge,
            "-m",
            "state",
            "--state",
            "RELATED,ESTABLISHED",
            "-j",
            "ACCEPT",
        ],
    )
}

/// Every rule of a VPC's NAT gateway on `interface`
pub fn nat_rules(vpc: &Vpc, interface: &str) -> Vec<Rule> {
    let mut rules = vec![masquerade(&vpc.cidr, interface)];
    rules.extend(vpc.private_subnets().map(|s| private_drop(&s.cidr, interface)));
    rules.push(egress_accept(&vpc.bridge, interface));
    rules.push(return_accept(&vpc.bridge, interface));
    rules
}

pub fn install_rules(kernel: &Kernel, vpc: &Vpc, interface: &str) -> Result<()> {
    let filter = &kernel.filter;

    kernel.link.set_ip_forwarding(true)?;
    filter.ensure_appended(&masquerade(&vpc.cidr, interface))?;
    for subnet in vpc.private_subnets() {
        filter.ensure_inserted(&private_drop(&subnet.cidr, interface))?;
    }
    filter.ensure_appended(&egress_accept(&vpc.bridge, interface))?;
    filter.ensure_appended(&return_accept(&vpc.bridge, interface))?;
    Ok(())
}

/// Remove the NAT rules of a VPC for an interface; absent rules are skipped
pub fn remove_rules(kernel: &Kernel, vpc: &Vpc, interface: &str) -> Result<()> {
    for rule in nat_rules(vpc, interface) {
        kernel.filter.remove_all(&rule)?;
    }
    Ok(())
}

fn validate_interface(interface: &str) -> Result<()> {
    let valid = !interface.is_empty()
        && interface.len() <= naming::IFNAME_MAX
        && !interface.contains(|c: char| c.is_whitespace() || c == '/' || c == ':');
    if !valid {
        return Err(Error::Validation(format!(
            "'{}' is not a valid interface name",
            interface
        )));
    }
    if interface.starts_with("vc") {
        return Err(Error::Validation(format!(
            "Interface '{}' is managed by vpcctl and cannot be a NAT uplink",
            interface
        )));
    }
    Ok(())
}

/// Give the public subnets of a VPC outbound access through `interface`
pub fn enable(kernel: &Kernel, graph: &mut StateGraph, vpc_name: &str, interface: &str) -> Result<Outcome> {
    validate_interface(interface)?;
    let vpc = graph.require_vpc(vpc_name)?.clone();

    let outcome = match &vpc.nat {
        Some(nat) if nat.interface == interface => Outcome::Unchanged,
        Some(nat) => {
            info!(vpc = %vpc_name, from = %nat.interface, to = %interface, "moving NAT gateway");
            remove_rules(kernel, &vpc, &nat.interface)?;
            Outcome::Applied
        }
        None => Outcome::Applied,
    };

    info!(vpc = %vpc_name, interface = %interface, "enabling NAT");
    if let Err(e) = install_rules(kernel, &vpc, interface) {
        if outcome == Outcome::Applied
            && let Err(rollback) = remove_rules(kernel, &vpc, interface)
        {
            warn!(vpc = %vpc_name, error = %rollback, "NAT rollback failed");
        }
        if outcome == Outcome::Applied {
            graph.require_vpc_mut(vpc_name)?.nat = None;
        }
        return Err(e);
    }

    graph.require_vpc_mut(vpc_name)?.nat = Some(NatGateway {
        interface: interface.to_string(),
    });
    Ok(outcome)
}

/// Remove the NAT gateway of a VPC
pub fn disable(kernel: &Kernel, graph: &mut StateGraph, vpc_name: &str) -> Result<Outcome> {
    let vpc = graph.require_vpc(vpc_name)?;
    let Some(nat) = vpc.nat.clone() else {
        return Ok(Outcome::Unchanged);
    };

    info!(vpc = %vpc_name, interface = %nat.interface, "disabling NAT");
    remove_rules(kernel, vpc, &nat.interface)?;
    graph.require_vpc_mut(vpc_name)?.nat = None;
    Ok(Outcome::Applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::sim::SimKernel;
    use crate::state::SubnetKind;
    use crate::topology;

    fn setup() -> (SimKernel, Kernel, StateGraph) {
        let sim = SimKernel::new();
        let kernel = Kernel::simulated(&sim);
        let mut graph = StateGraph::default();
        topology::create_vpc(&kernel, &mut graph, "v1", "10.0.0.0/16").unwrap();
        topology::add_subnet(&kernel, &mut graph, "v1", "pub", "10.0.1.0/24", SubnetKind::Public).unwrap();
        topology::add_subnet(&kernel, &mut graph, "v1", "priv", "10.0.2.0/24", SubnetKind::Private).unwrap();
        (sim, kernel, graph)
    }

    fn position(rules: &[String], needle: &str) -> usize {
        rules
            .iter()
            .position(|r| r == needle)
            .unwrap_or_else(|| panic!("rule '{}' missing from {:?}", needle, rules))
    }

    #[test]
    fn test_isolation_accept_precedes_drop() {
        let sim = SimKernel::new();
        let kernel = Kernel::simulated(&sim);
        install_isolation(&kernel, "vcbr-v1").unwrap();
        install_isolation(&kernel, "vcbr-v1").unwrap();

        let forward = sim.state().chain_rules(None, Table::Filter, "FORWARD");
        assert_eq!(
            forward,
            vec![
                "-i vcbr-v1 -o vcbr-v1 -j ACCEPT",
                "-i vcbr-v1 -o vcbr-+ -j DROP",
            ]
        );
        assert!(sim.state().ip_forward);
    }

    #[test]
    fn test_isolation_repairs_order_when_drop_missing() {
        let sim = SimKernel::new();
        let kernel = Kernel::simulated(&sim);
        install_isolation(&kernel, "vcbr-v1").unwrap();
        kernel.filter.delete_rule(&isolation_drop("vcbr-v1")).unwrap();

        install_isolation(&kernel, "vcbr-v1").unwrap();

        let forward = sim.state().chain_rules(None, Table::Filter, "FORWARD");
        assert!(position(&forward, "-i vcbr-v1 -o vcbr-v1 -j ACCEPT") < position(&forward, "-i vcbr-v1 -o vcbr-+ -j DROP"));
        assert_eq!(forward.len(), 2);
    }

    #[test]
    fn test_enable_nat_rules() {
        let (sim, kernel, mut graph) = setup();
        let outcome = enable(&kernel, &mut graph, "v1", "eth0").unwrap();
        assert_eq!(outcome, Outcome::Applied);

        let state = sim.state();
        assert!(state.ip_forward);
        assert_eq!(
            state.chain_rules(None, Table::Nat, "POSTROUTING"),
            vec!["-s 10.0.0.0/16 -o eth0 -j MASQUERADE"]
        );

        let forward = state.chain_rules(None, Table::Filter, "FORWARD");
        let drop = position(&forward, "-s 10.0.2.0/24 -o eth0 -j DROP");
        let accept = position(&forward, "-i vcbr-v1 -o eth0 -j ACCEPT");
        assert!(drop < accept);
        position(
            &forward,
            "-i eth0 -o vcbr-v1 -m state --state RELATED,ESTABLISHED -j ACCEPT",
        );
        assert!(!forward.iter().any(|r| r.contains("10.0.1.0/24")));
        assert_eq!(
            graph.vpc("v1").unwrap().nat,
            Some(NatGateway {
                interface: "eth0".into()
            })
        );
    }

    #[test]
    fn test_enable_twice_is_noop() {
        let (sim, kernel, mut graph) = setup();
        enable(&kernel, &mut graph, "v1", "eth0").unwrap();
        let rules = sim.state().rules.clone();

        assert_eq!(enable(&kernel, &mut graph, "v1", "eth0").unwrap(), Outcome::Unchanged);
        assert_eq!(sim.state().rules, rules);
    }

    #[test]
    fn test_enable_on_other_interface_moves_rules() {
        let (sim, kernel, mut graph) = setup();
        enable(&kernel, &mut graph, "v1", "eth0").unwrap();
        enable(&kernel, &mut graph, "v1", "wlan0").unwrap();

        let state = sim.state();
        assert!(!state.rules.iter().any(|r| r.references("eth0")));
        assert_eq!(state.rules.iter().filter(|r| r.references("wlan0")).count(), 4);
    }

    #[test]
    fn test_disable_removes_rules() {
        let (sim, kernel, mut graph) = setup();
        enable(&kernel, &mut graph, "v1", "eth0").unwrap();

        assert_eq!(disable(&kernel, &mut graph, "v1").unwrap(), Outcome::Applied);
        assert_eq!(disable(&kernel, &mut graph, "v1").unwrap(), Outcome::Unchanged);
        assert!(!sim.state().rules.iter().any(|r| r.references("eth0")));
        assert!(graph.vpc("v1").unwrap().nat.is_none());
    }

    #[test]
    fn test_enable_rejects_bad_input() {
        let (_sim, kernel, mut graph) = setup();
        assert!(matches!(enable(&kernel, &mut graph, "nope", "eth0"), Err(Error::VpcNotFound(_))));
        assert!(matches!(enable(&kernel, &mut graph, "v1", "vcbr-v1"), Err(Error::Validation(_))));
        assert!(matches!(enable(&kernel, &mut graph, "v1", "bad name"), Err(Error::Validation(_))));
    }

    #[test]
    fn test_failed_enable_leaves_no_rules() {
        let (sim, kernel, mut graph) = setup();
        sim.fail_on("append_rule", "RELATED,ESTABLISHED");

        assert!(enable(&kernel, &mut graph, "v1", "eth0").is_err());
        assert!(!sim.state().rules.iter().any(|r| r.references("eth0")));
        assert!(graph.vpc("v1").unwrap().nat.is_none());
    }
}
