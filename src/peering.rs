//! VPC peering
//!
//! Two VPC bridges are joined by a veth pair, forwarding between them is
//! accepted ahead of the isolation drops, and static routes scoped to the
//! peer CIDRs are installed. Every installed route is recorded on the
//! peering so teardown removes exactly what was added.

use crate::error::{Error, Result};
use crate::manifest::RouteMode;
use crate::naming;
use crate::network::cidr;
use crate::network::{Kernel, Route, Rule, Table};
use crate::state::{Outcome, Peering, StateGraph, Vpc};
use crate::topology::{Rollback, Undo};
use tracing::{debug, info};

/// Forward accepts between two bridges, both directions
pub fn accept_rules(bridge_a: &str, bridge_b: &str) -> Vec<Rule> {
    vec![
        Rule::new(Table::Filter, "FORWARD", &["-i", bridge_a, "-o", bridge_b, "-j", "ACCEPT"]),
        Rule::new(Table::Filter, "FORWARD", &["-i", bridge_b, "-o", bridge_a, "-j", "ACCEPT"]),
    ]
}

/// Routes a peering needs for the given mode
pub fn plan_routes(mode: RouteMode, a: &Vpc, b: &Vpc, veth_a: &str, veth_b: &str) -> Vec<Route> {
    match mode {
        RouteMode::Bridge => vec![
            Route::host_dev(b.cidr, veth_a),
            Route::host_dev(a.cidr, veth_b),
        ],
        RouteMode::Namespace => {
            let towards = |from: &Vpc, to: &Vpc| -> Vec<Route> {
                from.subnets
                    .iter()
                    .map(|s| Route::namespace_via(&s.namespace, to.cidr, s.gateway))
                    .collect()
            };
            let mut routes = towards(a, b);
            routes.extend(towards(b, a));
            routes
        }
    }
}

/// Peer two VPCs; the argument order does not matter
pub fn create(kernel: &Kernel, graph: &mut StateGraph, a: &str, b: &str, mode: RouteMode) -> Result<Outcome> {
    if a == b {
        return Err(Error::Validation(format!("Cannot peer VPC '{}' with itself", a)));
    }

    let (first, second) = naming::canonical_pair(a, b);
    let vpc_a = graph.require_vpc(first)?;
    let vpc_b = graph.require_vpc(second)?;

    if graph.peering_exists(first, second) {
        debug!(a = %first, b = %second, "peering already exists");
        return Ok(Outcome::Unchanged);
    }

    if cidr::overlaps(&vpc_a.cidr, &vpc_b.cidr) {
        return Err(Error::Validation(format!(
            "Cannot peer '{}' ({}) with '{}' ({}): CIDRs overlap",
            first, vpc_a.cidr, second, vpc_b.cidr
        )));
    }

    let veth = naming::peering_veth(first, second);
    let routes = plan_routes(mode, vpc_a, vpc_b, &veth.first, &veth.second);

    info!(a = %first, b = %second, mode = %mode, routes = routes.len(), "creating peering");

    let mut rollback = Rollback::new(kernel);
    if let Err(e) = provision(kernel, vpc_a, vpc_b, &veth.first, &veth.second, &routes, &mut rollback) {
        rollback.run();
        return Err(e);
    }

    let peering = Peering {
        vpc_a: first.to_string(),
        vpc_b: second.to_string(),
        veth_a: veth.first,
        veth_b: veth.second,
        route_mode: mode,
        routes,
    };
    graph.peerings.insert(peering.key(), peering);
    Ok(Outcome::Applied)
}

/// Veth wiring, forward accepts and routes of a peering
pub fn provision(
    kernel: &Kernel,
    a: &Vpc,
    b: &Vpc,
    veth_a: &str,
    veth_b: &str,
    routes: &[Route],
    rollback: &mut Rollback,
) -> Result<()> {
    let link = &kernel.link;

    if !link.link_exists(veth_a, None)? {
        link.create_veth(veth_a, veth_b)?;
        rollback.push(Undo::Link(veth_a.to_string()));
    }
    link.set_master(veth_a, &a.bridge)?;
    link.set_master(veth_b, &b.bridge)?;
    link.set_up(veth_a, None)?;
    link.set_up(veth_b, None)?;

    for rule in accept_rules(&a.bridge, &b.bridge) {
        if kernel.filter.ensure_inserted(&rule)? {
            rollback.push(Undo::Rule(rule));
        }
    }

    for route in routes {
        if !link.route_exists(route)? {
            link.add_route(route)?;
            rollback.push(Undo::Route(route.clone()));
        }
    }

    Ok(())
}

/// Remove the kernel objects of a peering; absent objects are skipped
pub fn teardown(kernel: &Kernel, peering: &Peering) -> Result<()> {
    for route in &peering.routes {
        kernel.link.delete_route(route)?;
    }

    let bridge_a = naming::bridge_name(&peering.vpc_a);
    let bridge_b = naming::bridge_name(&peering.vpc_b);
    for rule in accept_rules(&bridge_a, &bridge_b) {
        kernel.filter.remove_all(&rule)?;
    }

    kernel.link.delete_link(&peering.veth_a, None)?;
    Ok(())
}

/// Delete the peering between two VPCs; absent is success
pub fn delete(kernel: &Kernel, graph: &mut StateGraph, a: &str, b: &str) -> Result<Outcome> {
    let Some(peering) = graph.peering(a, b).cloned() else {
        debug!(a = %a, b = %b, "no peering to delete");
        return Ok(Outcome::Unchanged);
    };

    info!(a = %peering.vpc_a, b = %peering.vpc_b, "deleting peering");
    teardown(kernel, &peering)?;
    graph.peerings.remove(&peering.key());
    Ok(Outcome::Applied)
}
