//! VPC and subnet provisioning
//!
//! A VPC is a Linux bridge; each subnet is a network namespace wired to the
//! bridge by a veth pair. The gateway address of every subnet sits on the
//! bridge, the host address on the namespace end of the veth.
//!
//! Every step is check-before-act. Steps that create something push an undo
//! entry, and a failure part way unwinds them in reverse order, so the
//! kernel is left as it was found and nothing is recorded.

use crate::error::{Error, Result};
use crate::manifest::RouteMode;
use crate::naming;
use crate::nat;
use crate::network::cidr::{self, SubnetAddressing};
use crate::network::{Kernel, Route, Rule};
use crate::state::{Outcome, StateGraph, Subnet, SubnetKind, Vpc};
use ipnet::Ipv4Net;
use tracing::{debug, info, warn};

/// A kernel change that can be reverted
#[derive(Debug, Clone)]
pub enum Undo {
    Link(String),
    Namespace(String),
    Address { link: String, addr: Ipv4Net },
    Route(Route),
    Rule(Rule),
    Isolation(String),
}

/// Changes applied so far by one logical operation
pub struct Rollback<'k> {
    kernel: &'k Kernel,
    applied: Vec<Undo>,
}

impl<'k> Rollback<'k> {
    pub fn new(kernel: &'k Kernel) -> Self {
        Self {
            kernel,
            applied: Vec::new(),
        }
    }

    pub fn push(&mut self, undo: Undo) {
        self.applied.push(undo);
    }

    /// Revert everything in reverse order; failures are logged and skipped
    pub fn run(self) {
        for undo in self.applied.into_iter().rev() {
            debug!(?undo, "rolling back");
            let result = match &undo {
                Undo::Link(name) => self.kernel.link.delete_link(name, None),
                Undo::Namespace(name) => self.kernel.link.delete_namespace(name),
                Undo::Address { link, addr } => self.kernel.link.delete_address(link, *addr, None),
                Undo::Route(route) => self.kernel.link.delete_route(route),
                Undo::Rule(rule) => self.kernel.filter.delete_rule(rule),
                Undo::Isolation(bridge) => nat::remove_isolation(self.kernel, bridge),
            };
            if let Err(e) = result {
                warn!(?undo, error = %e, "rollback step failed");
            }
        }
    }
}

/// Create a VPC and its bridge
pub fn create_vpc(kernel: &Kernel, graph: &mut StateGraph, name: &str, cidr: &str) -> Result<Outcome> {
    naming::validate_name("VPC", name)?;
    let cidr = cidr::parse_cidr(cidr)?;

    if let Some(existing) = graph.vpc(name) {
        if existing.cidr == cidr {
            debug!(vpc = %name, "VPC already exists");
            return Ok(Outcome::Unchanged);
        }
        return Err(Error::Conflict(format!(
            "VPC '{}' already exists with CIDR {}",
            name, existing.cidr
        )));
    }

    cidr::validate_vpc_cidr(
        &cidr,
        graph.vpcs.values().map(|v| (v.name.as_str(), &v.cidr)),
    )?;

    let vpc = Vpc::new(name, cidr);
    info!(vpc = %name, cidr = %cidr, bridge = %vpc.bridge, "creating VPC");

    let mut rollback = Rollback::new(kernel);
    if let Err(e) = provision_vpc(kernel, &vpc, &mut rollback) {
        rollback.run();
        return Err(e);
    }

    graph.vpcs.insert(name.to_string(), vpc);
    Ok(Outcome::Applied)
}

/// Bridge and isolation rules of a VPC
pub fn provision_vpc(kernel: &Kernel, vpc: &Vpc, rollback: &mut Rollback) -> Result<()> {
    if !kernel.link.link_exists(&vpc.bridge, None)? {
        kernel.link.create_bridge(&vpc.bridge)?;
        rollback.push(Undo::Link(vpc.bridge.clone()));
    }
    kernel.link.set_up(&vpc.bridge, None)?;

    rollback.push(Undo::Isolation(vpc.bridge.clone()));
    nat::install_isolation(kernel, &vpc.bridge)?;
    Ok(())
}

/// Add a subnet to a VPC
pub fn add_subnet(
    kernel: &Kernel,
    graph: &mut StateGraph,
    vpc_name: &str,
    name: &str,
    cidr: &str,
    kind: SubnetKind,
) -> Result<Outcome> {
    naming::validate_name("Subnet", name)?;
    let cidr = cidr::parse_cidr(cidr)?;
    let vpc = graph.require_vpc(vpc_name)?;

    if let Some(existing) = vpc.subnet(name) {
        if existing.cidr == cidr && existing.kind == kind {
            debug!(vpc = %vpc_name, subnet = %name, "subnet already exists");
            return Ok(Outcome::Unchanged);
        }
        return Err(Error::Conflict(format!(
            "Subnet '{}' already exists in VPC '{}' as {} {}",
            name, vpc_name, existing.kind, existing.cidr
        )));
    }

    cidr::validate_subnet_cidr(
        &cidr,
        &vpc.cidr,
        vpc.subnets.iter().map(|s| (s.name.as_str(), &s.cidr)),
    )?;

    let subnet = new_subnet(vpc_name, name, cidr, kind)?;

    // Namespace-mode peerings route the peer CIDR from every subnet
    let peer_routes: Vec<(String, Route)> = graph
        .peerings_of(vpc_name)
        .filter(|p| p.route_mode == RouteMode::Namespace)
        .filter_map(|p| {
            let other = graph.vpc(p.other(vpc_name))?;
            Some((
                p.key(),
                Route::namespace_via(&subnet.namespace, other.cidr, subnet.gateway),
            ))
        })
        .collect();

    info!(
        vpc = %vpc_name,
        subnet = %name,
        cidr = %cidr,
        kind = %kind,
        namespace = %subnet.namespace,
        "adding subnet"
    );

    let mut rollback = Rollback::new(kernel);
    let provisioned = provision_subnet(kernel, vpc, &subnet, &mut rollback).and_then(|()| {
        for (_, route) in &peer_routes {
            if !kernel.link.route_exists(route)? {
                kernel.link.add_route(route)?;
            }
        }
        Ok(())
    });
    if let Err(e) = provisioned {
        rollback.run();
        return Err(e);
    }

    for (key, route) in peer_routes {
        if let Some(peering) = graph.peerings.get_mut(&key) {
            peering.routes.push(route);
        }
    }
    graph.require_vpc_mut(vpc_name)?.subnets.push(subnet);
    Ok(Outcome::Applied)
}

/// Derive the record of a new subnet
pub fn new_subnet(vpc: &str, name: &str, cidr: Ipv4Net, kind: SubnetKind) -> Result<Subnet> {
    let addressing = SubnetAddressing::for_subnet(cidr)?;
    let veth = naming::subnet_veth(vpc, name);
    Ok(Subnet {
        name: name.to_string(),
        cidr,
        kind,
        namespace: naming::namespace_name(vpc, name),
        veth_bridge: veth.bridge_side,
        veth_namespace: veth.namespace_side,
        gateway: addressing.gateway(),
        host: addressing.host(),
        firewall: None,
    })
}

/// Namespace, veth wiring, addressing and default route of a subnet
pub fn provision_subnet(kernel: &Kernel, vpc: &Vpc, subnet: &Subnet, rollback: &mut Rollback) -> Result<()> {
    let link = &kernel.link;
    let ns = subnet.namespace.as_str();

    if !link.namespace_exists(ns)? {
        link.create_namespace(ns)?;
        rollback.push(Undo::Namespace(ns.to_string()));
    }
    link.set_up("lo", Some(ns))?;

    // The veth must exist before its end can be moved into the namespace
    let moved = link.link_exists(&subnet.veth_namespace, Some(ns))?;
    if !moved && !link.link_exists(&subnet.veth_bridge, None)? {
        link.create_veth(&subnet.veth_bridge, &subnet.veth_namespace)?;
        rollback.push(Undo::Link(subnet.veth_bridge.clone()));
    }
    link.set_master(&subnet.veth_bridge, &vpc.bridge)?;
    if !moved {
        link.set_namespace(&subnet.veth_namespace, ns)?;
    }

    link.add_address(&vpc.bridge, subnet.gateway_cidr(), None)?;
    rollback.push(Undo::Address {
        link: vpc.bridge.clone(),
        addr: subnet.gateway_cidr(),
    });
    link.add_address(&subnet.veth_namespace, subnet.host_cidr(), Some(ns))?;

    link.set_up(&subnet.veth_bridge, None)?;
    link.set_up(&subnet.veth_namespace, Some(ns))?;

    let default = Route::default_via(ns, subnet.gateway);
    if !link.route_exists(&default)? {
        link.add_route(&default)?;
    }

    if let Some(gateway) = &vpc.nat
        && subnet.kind == SubnetKind::Private
    {
        let drop = nat::private_drop(&subnet.cidr, &gateway.interface);
        if kernel.filter.ensure_inserted(&drop)? {
            rollback.push(Undo::Rule(drop));
        }
    }

    Ok(())
}

/// Remove the wiring of a subnet: veth pair, gateway address, namespace
///
/// Each object that is already gone is skipped.
pub fn teardown_subnet(kernel: &Kernel, vpc: &Vpc, subnet: &Subnet) -> Result<()> {
    let link = &kernel.link;
    debug!(subnet = %subnet.name, namespace = %subnet.namespace, "tearing down subnet");

    // Deleting either end destroys the pair
    link.delete_link(&subnet.veth_bridge, None)?;
    if link.link_exists(&vpc.bridge, None)? {
        link.delete_address(&vpc.bridge, subnet.gateway_cidr(), None)?;
    }
    link.delete_namespace(&subnet.namespace)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::sim::SimKernel;
    use crate::network::Table;
    use std::net::Ipv4Addr;

    fn setup() -> (SimKernel, Kernel, StateGraph) {
        let sim = SimKernel::new();
        let kernel = Kernel::simulated(&sim);
        (sim, kernel, StateGraph::default())
    }

    #[test]
    fn test_create_vpc() {
        let (sim, kernel, mut graph) = setup();
        assert_eq!(
            create_vpc(&kernel, &mut graph, "v1", "10.0.0.0/16").unwrap(),
            Outcome::Applied
        );

        let state = sim.state();
        let bridge = state.links.get(&(None, "vcbr-v1".to_string())).unwrap();
        assert!(bridge.up);
        assert_eq!(graph.vpc("v1").unwrap().bridge, "vcbr-v1");
        assert!(
            state
                .chain_rules(None, Table::Filter, "FORWARD")
                .contains(&"-i vcbr-v1 -o vcbr-+ -j DROP".to_string())
        );
    }

    #[test]
    fn test_create_vpc_twice_is_noop() {
        let (sim, kernel, mut graph) = setup();
        create_vpc(&kernel, &mut graph, "v1", "10.0.0.0/16").unwrap();
        let ops = sim.state().ops.len();

        assert_eq!(
            create_vpc(&kernel, &mut graph, "v1", "10.0.0.0/16").unwrap(),
            Outcome::Unchanged
        );
        assert_eq!(sim.state().ops.len(), ops);
        assert_eq!(graph.vpcs.len(), 1);
        assert_eq!(sim.state().links.len(), 1);
    }

    #[test]
    fn test_create_vpc_conflicts_and_validation() {
        let (sim, kernel, mut graph) = setup();
        create_vpc(&kernel, &mut graph, "v1", "10.0.0.0/16").unwrap();
        let ops = sim.state().ops.len();

        assert!(matches!(
            create_vpc(&kernel, &mut graph, "v1", "10.9.0.0/16"),
            Err(Error::Conflict(_))
        ));
        assert!(matches!(
            create_vpc(&kernel, &mut graph, "v2", "10.0.128.0/17"),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            create_vpc(&kernel, &mut graph, "v2", "10.1.0.5/16"),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            create_vpc(&kernel, &mut graph, "bad name", "10.1.0.0/16"),
            Err(Error::Validation(_))
        ));
        // Nothing reached the kernel
        assert_eq!(sim.state().ops.len(), ops);
    }

    #[test]
    fn test_create_vpc_rolls_back_bridge() {
        let (sim, kernel, mut graph) = setup();
        sim.fail_on("insert_rule", "vcbr-v1 -o vcbr-v1");

        assert!(create_vpc(&kernel, &mut graph, "v1", "10.0.0.0/16").is_err());
        let state = sim.state();
        assert!(!state.has_link("vcbr-v1"));
        assert!(state.rules.is_empty());
        assert!(graph.vpcs.is_empty());
    }

    #[test]
    fn test_add_subnet_addressing_and_wiring() {
        let (sim, kernel, mut graph) = setup();
        create_vpc(&kernel, &mut graph, "v1", "10.0.0.0/16").unwrap();
        add_subnet(&kernel, &mut graph, "v1", "pub", "10.0.1.0/24", SubnetKind::Public).unwrap();

        let subnet = graph.require_subnet("v1", "pub").unwrap();
        assert_eq!(subnet.gateway, Ipv4Addr::new(10, 0, 1, 1));
        assert_eq!(subnet.host, Ipv4Addr::new(10, 0, 1, 2));
        assert_eq!(subnet.namespace, "vcns-v1.pub");

        let state = sim.state();
        let ns = Some(subnet.namespace.clone());
        assert!(state.namespaces.contains("vcns-v1.pub"));
        assert!(state.links.get(&(ns.clone(), "lo".to_string())).unwrap().up);

        let bridge_end = state.links.get(&(None, subnet.veth_bridge.clone())).unwrap();
        assert_eq!(bridge_end.master.as_deref(), Some("vcbr-v1"));
        assert!(bridge_end.up);

        let ns_end = state.links.get(&(ns, subnet.veth_namespace.clone())).unwrap();
        assert_eq!(ns_end.addrs, vec!["10.0.1.2/24".parse::<Ipv4Net>().unwrap()]);
        assert!(ns_end.up);

        let bridge = state.links.get(&(None, "vcbr-v1".to_string())).unwrap();
        assert!(bridge.addrs.contains(&"10.0.1.1/24".parse().unwrap()));

        assert!(state.routes.contains(&Route::default_via("vcns-v1.pub", subnet.gateway)));
    }

    #[test]
    fn test_add_subnet_idempotent_and_conflicts() {
        let (_sim, kernel, mut graph) = setup();
        create_vpc(&kernel, &mut graph, "v1", "10.0.0.0/16").unwrap();
        add_subnet(&kernel, &mut graph, "v1", "pub", "10.0.1.0/24", SubnetKind::Public).unwrap();

        assert_eq!(
            add_subnet(&kernel, &mut graph, "v1", "pub", "10.0.1.0/24", SubnetKind::Public).unwrap(),
            Outcome::Unchanged
        );
        assert!(matches!(
            add_subnet(&kernel, &mut graph, "v1", "pub", "10.0.1.0/24", SubnetKind::Private),
            Err(Error::Conflict(_))
        ));
        assert!(matches!(
            add_subnet(&kernel, &mut graph, "v1", "other", "10.0.1.128/25", SubnetKind::Public),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            add_subnet(&kernel, &mut graph, "v1", "outside", "10.5.0.0/24", SubnetKind::Public),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            add_subnet(&kernel, &mut graph, "v1", "tiny", "10.0.9.9/32", SubnetKind::Public),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            add_subnet(&kernel, &mut graph, "v9", "pub", "10.0.1.0/24", SubnetKind::Public),
            Err(Error::VpcNotFound(_))
        ));
        assert_eq!(graph.vpc("v1").unwrap().subnets.len(), 1);
    }

    #[test]
    fn test_add_subnet_failure_leaves_nothing() {
        let (sim, kernel, mut graph) = setup();
        create_vpc(&kernel, &mut graph, "v1", "10.0.0.0/16").unwrap();
        sim.fail_on("add_route", "default");

        assert!(add_subnet(&kernel, &mut graph, "v1", "pub", "10.0.1.0/24", SubnetKind::Public).is_err());

        let state = sim.state();
        assert!(state.namespaces.is_empty());
        assert_eq!(state.links.len(), 1);
        assert!(state.links.values().all(|l| l.addrs.is_empty()));
        assert!(graph.vpc("v1").unwrap().subnets.is_empty());
    }

    #[test]
    fn test_add_private_subnet_with_nat_installs_drop() {
        let (sim, kernel, mut graph) = setup();
        create_vpc(&kernel, &mut graph, "v1", "10.0.0.0/16").unwrap();
        nat::enable(&kernel, &mut graph, "v1", "eth0").unwrap();
        add_subnet(&kernel, &mut graph, "v1", "priv", "10.0.2.0/24", SubnetKind::Private).unwrap();

        let forward = sim.state().chain_rules(None, Table::Filter, "FORWARD");
        let drop = forward
            .iter()
            .position(|r| r == "-s 10.0.2.0/24 -o eth0 -j DROP")
            .unwrap();
        let accept = forward
            .iter()
            .position(|r| r == "-i vcbr-v1 -o eth0 -j ACCEPT")
            .unwrap();
        assert!(drop < accept);
    }

    #[test]
    fn test_teardown_subnet_is_repeatable() {
        let (sim, kernel, mut graph) = setup();
        create_vpc(&kernel, &mut graph, "v1", "10.0.0.0/16").unwrap();
        add_subnet(&kernel, &mut graph, "v1", "pub", "10.0.1.0/24", SubnetKind::Public).unwrap();

        let vpc = graph.vpc("v1").unwrap().clone();
        let subnet = vpc.subnet("pub").unwrap().clone();
        teardown_subnet(&kernel, &vpc, &subnet).unwrap();
        teardown_subnet(&kernel, &vpc, &subnet).unwrap();

        let state = sim.state();
        assert!(state.namespaces.is_empty());
        assert!(!state.has_link(&subnet.veth_bridge));
        assert!(!state.has_link(&subnet.veth_namespace));
        assert!(state.links.get(&(None, "vcbr-v1".to_string())).unwrap().addrs.is_empty());
    }
}
