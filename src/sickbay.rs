//! Drift inspection and repair
//!
//! The store says what should exist; the kernel says what does. `check`
//! probes every recorded object and reports the ones that are gone, and
//! `repair` re-runs the idempotent provisioning steps for each diverged
//! VPC and peering.

use crate::bulkhead;
use crate::error::{Error, Result};
use crate::naming::{self, INGRESS_CHAIN};
use crate::nat;
use crate::network::{Kernel, Policy, Route, Rule, Table};
use crate::peering;
use crate::state::{Peering, StateGraph, Subnet, Vpc};
use crate::topology::{self, Rollback};
use std::collections::BTreeSet;
use std::fmt;
use tracing::{debug, info, warn};

/// Health of the checked entities
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Diverged,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Diverged => write!(f, "diverged"),
        }
    }
}

/// Something the store records
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Entity {
    Vpc(String),
    Subnet { vpc: String, subnet: String },
    Peering(String),
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entity::Vpc(name) => write!(f, "vpc {}", name),
            Entity::Subnet { vpc, subnet } => write!(f, "subnet {}/{}", vpc, subnet),
            Entity::Peering(key) => write!(f, "peering {}", key),
        }
    }
}

/// Missing kernel objects of one entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub entity: Entity,
    pub missing: Vec<String>,
}

/// Result of a check run
#[derive(Debug, Clone, Default)]
pub struct HealthReport {
    /// Number of entities probed
    pub checked: usize,
    pub findings: Vec<Finding>,
}

impl HealthReport {
    pub fn status(&self) -> HealthStatus {
        if self.findings.is_empty() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Diverged
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status() == HealthStatus::Healthy
    }

    /// One line for the terminal
    pub fn summary(&self) -> String {
        match self.status() {
            HealthStatus::Healthy => format!("{} entities checked, all healthy", self.checked),
            HealthStatus::Diverged => format!(
                "{} entities checked, {} diverged",
                self.checked,
                self.findings.len()
            ),
        }
    }

    /// Turn a diverged report into an error
    pub fn into_result(self) -> Result<()> {
        if self.is_healthy() {
            return Ok(());
        }
        let entity = self
            .findings
            .iter()
            .map(|f| f.entity.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        let missing = self.findings.into_iter().flat_map(|f| f.missing).collect();
        Err(Error::Divergence { entity, missing })
    }

    fn record(&mut self, entity: Entity, missing: Vec<String>) {
        self.checked += 1;
        if !missing.is_empty() {
            debug!(entity = %entity, missing = missing.len(), "diverged");
            self.findings.push(Finding { entity, missing });
        }
    }
}

/// Collects the objects a probe could not find
struct Probe<'k> {
    kernel: &'k Kernel,
    missing: Vec<String>,
}

impl<'k> Probe<'k> {
    fn new(kernel: &'k Kernel) -> Self {
        Self {
            kernel,
            missing: Vec::new(),
        }
    }

    fn link(&mut self, name: &str, namespace: Option<&str>) -> Result<bool> {
        let present = self.kernel.link.link_exists(name, namespace)?;
        if !present {
            match namespace {
                Some(ns) => self.missing.push(format!("link {} (netns {})", name, ns)),
                None => self.missing.push(format!("link {}", name)),
            }
        }
        Ok(present)
    }

    fn namespace(&mut self, name: &str) -> Result<bool> {
        let present = self.kernel.link.namespace_exists(name)?;
        if !present {
            self.missing.push(format!("namespace {}", name));
        }
        Ok(present)
    }

    fn route(&mut self, route: &Route) -> Result<()> {
        if !self.kernel.link.route_exists(route)? {
            self.missing.push(format!("route {}", route));
        }
        Ok(())
    }

    fn rule(&mut self, rule: &Rule) -> Result<()> {
        if !self.kernel.filter.rule_exists(rule)? {
            self.missing.push(format!("rule {}", rule));
        }
        Ok(())
    }

    fn finish(self) -> Vec<String> {
        self.missing
    }
}

/// Probe the kernel objects of every recorded entity, or of one VPC and its peerings
pub fn check(kernel: &Kernel, graph: &StateGraph, vpc: Option<&str>, default_policy: Policy) -> Result<HealthReport> {
    let vpcs: Vec<&Vpc> = match vpc {
        Some(name) => vec![graph.require_vpc(name)?],
        None => graph.vpcs.values().collect(),
    };

    let mut report = HealthReport::default();
    for vpc in &vpcs {
        report.record(Entity::Vpc(vpc.name.clone()), check_vpc(kernel, vpc)?);
        for subnet in &vpc.subnets {
            let entity = Entity::Subnet {
                vpc: vpc.name.clone(),
                subnet: subnet.name.clone(),
            };
            report.record(entity, check_subnet(kernel, subnet, default_policy)?);
        }
    }

    for record in graph.peerings.values() {
        if vpc.is_some_and(|name| !record.involves(name)) {
            continue;
        }
        report.record(Entity::Peering(record.key()), check_peering(kernel, record)?);
    }

    info!(checked = report.checked, diverged = report.findings.len(), "drift check finished");
    Ok(report)
}

fn check_vpc(kernel: &Kernel, vpc: &Vpc) -> Result<Vec<String>> {
    let mut probe = Probe::new(kernel);
    probe.link(&vpc.bridge, None)?;
    for rule in nat::isolation_rules(&vpc.bridge) {
        probe.rule(&rule)?;
    }
    if let Some(gateway) = &vpc.nat {
        for rule in nat::nat_rules(vpc, &gateway.interface) {
            probe.rule(&rule)?;
        }
    }
    Ok(probe.finish())
}

fn check_subnet(kernel: &Kernel, subnet: &Subnet, default_policy: Policy) -> Result<Vec<String>> {
    let mut probe = Probe::new(kernel);
    let ns = subnet.namespace.as_str();

    probe.link(&subnet.veth_bridge, None)?;
    // Everything else lives inside the namespace
    if !probe.namespace(ns)? {
        return Ok(probe.finish());
    }
    probe.link(&subnet.veth_namespace, Some(ns))?;
    probe.route(&Route::default_via(ns, subnet.gateway))?;

    if let Some(policy) = &subnet.firewall {
        probe.rule(&bulkhead::ingress_jump(ns))?;
        let actual = kernel.filter.list_rules(Some(ns), Table::Filter, INGRESS_CHAIN)?;
        let expected: Vec<String> = policy
            .chain_rules(default_policy)
            .iter()
            .map(|spec| spec.join(" "))
            .collect();
        if actual != expected {
            probe
                .missing
                .push(format!("chain {} (netns {}) out of date", INGRESS_CHAIN, ns));
        }
    }
    Ok(probe.finish())
}

fn check_peering(kernel: &Kernel, record: &Peering) -> Result<Vec<String>> {
    let mut probe = Probe::new(kernel);
    probe.link(&record.veth_a, None)?;
    probe.link(&record.veth_b, None)?;

    let bridge_a = naming::bridge_name(&record.vpc_a);
    let bridge_b = naming::bridge_name(&record.vpc_b);
    for rule in peering::accept_rules(&bridge_a, &bridge_b) {
        probe.rule(&rule)?;
    }
    for route in &record.routes {
        probe.route(route)?;
    }
    Ok(probe.finish())
}

/// Re-provision everything `check` reports as diverged, then check again
///
/// Repair works per VPC: a missing subnet object re-runs the provisioning of
/// the whole VPC, and every peering of a repaired VPC is re-provisioned with
/// its accepts moved back ahead of the isolation drops.
pub fn repair(kernel: &Kernel, graph: &StateGraph, vpc: Option<&str>, default_policy: Policy) -> Result<HealthReport> {
    let before = check(kernel, graph, vpc, default_policy)?;
    if before.is_healthy() {
        return Ok(before);
    }

    let mut vpcs = BTreeSet::new();
    let mut peerings = BTreeSet::new();
    for finding in &before.findings {
        match &finding.entity {
            Entity::Vpc(name) | Entity::Subnet { vpc: name, .. } => {
                vpcs.insert(name.clone());
            }
            Entity::Peering(key) => {
                peerings.insert(key.clone());
            }
        }
    }
    for record in graph.peerings.values() {
        if vpcs.iter().any(|name| record.involves(name)) {
            peerings.insert(record.key());
        }
    }

    for name in &vpcs {
        let record = graph.require_vpc(name)?;
        info!(vpc = %name, "repairing VPC");
        repair_vpc(kernel, record, default_policy)?;
    }

    for key in &peerings {
        let Some(record) = graph.peerings.get(key) else {
            continue;
        };
        info!(peering = %key, "repairing peering");
        repair_peering(kernel, graph, record)?;
    }

    let after = check(kernel, graph, vpc, default_policy)?;
    if !after.is_healthy() {
        warn!(diverged = after.findings.len(), "repair left diverged entities");
    }
    Ok(after)
}

fn repair_vpc(kernel: &Kernel, vpc: &Vpc, default_policy: Policy) -> Result<()> {
    // Repaired objects stay in place even if a later step fails
    let mut rollback = Rollback::new(kernel);
    topology::provision_vpc(kernel, vpc, &mut rollback)?;
    for subnet in &vpc.subnets {
        topology::provision_subnet(kernel, vpc, subnet, &mut rollback)?;
        if let Some(policy) = &subnet.firewall {
            bulkhead::install(kernel, &subnet.namespace, policy, default_policy)?;
        }
    }
    if let Some(gateway) = &vpc.nat {
        nat::install_rules(kernel, vpc, &gateway.interface)?;
    }
    Ok(())
}

fn repair_peering(kernel: &Kernel, graph: &StateGraph, record: &Peering) -> Result<()> {
    let a = graph.require_vpc(&record.vpc_a)?;
    let b = graph.require_vpc(&record.vpc_b)?;

    // Re-inserting puts the accepts back at the head of FORWARD
    for rule in peering::accept_rules(&a.bridge, &b.bridge) {
        kernel.filter.remove_all(&rule)?;
    }
    let mut rollback = Rollback::new(kernel);
    peering::provision(kernel, a, b, &record.veth_a, &record.veth_b, &record.routes, &mut rollback)
}
