//! Dependency-ordered teardown
//!
//! The kernel objects of a VPC form a dependency graph: the bridge carries
//! the subnets, subnets carry firewall chains, NAT rules reference subnets,
//! peerings hang off bridges. Teardown walks that graph in reverse
//! topological order, saving the store after every completed step so an
//! interrupted run resumes where it stopped.

use crate::bulkhead;
use crate::error::{Error, Result};
use crate::nat;
use crate::network::Kernel;
use crate::peering;
use crate::state::{Outcome, StateGraph, StateStore, SubnetKind};
use crate::topology;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::fmt;
use tracing::{debug, info, warn};

/// One unit of teardown work
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Step {
    /// Ingress chain of a subnet
    Firewall { vpc: String, subnet: String },
    /// Peering by record key
    Peering(String),
    /// NAT rules of a VPC
    Nat(String),
    /// Veth pair, gateway address and namespace of a subnet
    Subnet { vpc: String, subnet: String },
    /// Cross-VPC isolation rules
    Isolation(String),
    Bridge(String),
    /// Store record of a VPC
    Record(String),
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Firewall { vpc, subnet } => write!(f, "firewall {}/{}", vpc, subnet),
            Step::Peering(key) => write!(f, "peering {}", key),
            Step::Nat(vpc) => write!(f, "nat {}", vpc),
            Step::Subnet { vpc, subnet } => write!(f, "subnet {}/{}", vpc, subnet),
            Step::Isolation(vpc) => write!(f, "isolation {}", vpc),
            Step::Bridge(vpc) => write!(f, "bridge {}", vpc),
            Step::Record(vpc) => write!(f, "record {}", vpc),
        }
    }
}

/// Ordered teardown steps
#[derive(Debug, Clone)]
pub struct TeardownPlan {
    steps: Vec<Step>,
}

/// Creation dependencies: an edge `a -> b` means `a` exists before `b`
struct Dependencies {
    graph: DiGraph<Step, ()>,
}

impl Dependencies {
    fn new() -> Self {
        Self {
            graph: DiGraph::new(),
        }
    }

    fn node(&mut self, step: Step) -> NodeIndex {
        match self.graph.node_indices().find(|i| self.graph[*i] == step) {
            Some(idx) => idx,
            None => self.graph.add_node(step),
        }
    }

    fn edge(&mut self, before: NodeIndex, after: NodeIndex) {
        self.graph.update_edge(before, after, ());
    }

    /// Reverse topological order
    fn teardown_order(self) -> Result<Vec<Step>> {
        let order = toposort(&self.graph, None).map_err(|cycle| {
            Error::Validation(format!(
                "Cyclic teardown dependency involving {}",
                self.graph[cycle.node_id()]
            ))
        })?;
        Ok(order
            .into_iter()
            .rev()
            .map(|idx| self.graph[idx].clone())
            .collect())
    }
}

impl TeardownPlan {
    /// Everything belonging to a VPC, including its peerings
    pub fn for_vpc(graph: &StateGraph, name: &str) -> Result<Self> {
        let vpc = graph.require_vpc(name)?;
        let mut deps = Dependencies::new();

        let record = deps.node(Step::Record(name.to_string()));
        let bridge = deps.node(Step::Bridge(name.to_string()));
        let isolation = deps.node(Step::Isolation(name.to_string()));
        let nat = deps.node(Step::Nat(name.to_string()));
        deps.edge(record, bridge);
        deps.edge(bridge, isolation);
        deps.edge(isolation, nat);

        let peerings: Vec<NodeIndex> = graph
            .peerings_of(name)
            .map(|p| deps.node(Step::Peering(p.key())))
            .collect();
        for &p in &peerings {
            deps.edge(bridge, p);
            deps.edge(nat, p);
        }

        for subnet in &vpc.subnets {
            let s = deps.node(Step::Subnet {
                vpc: name.to_string(),
                subnet: subnet.name.clone(),
            });
            let fw = deps.node(Step::Firewall {
                vpc: name.to_string(),
                subnet: subnet.name.clone(),
            });
            deps.edge(isolation, s);
            deps.edge(s, nat);
            deps.edge(s, fw);
            for &p in &peerings {
                deps.edge(p, fw);
            }
        }

        Ok(Self {
            steps: deps.teardown_order()?,
        })
    }

    /// A single subnet
    pub fn for_subnet(graph: &StateGraph, vpc: &str, subnet: &str) -> Result<Self> {
        graph.require_subnet(vpc, subnet)?;
        let mut deps = Dependencies::new();
        let s = deps.node(Step::Subnet {
            vpc: vpc.to_string(),
            subnet: subnet.to_string(),
        });
        let fw = deps.node(Step::Firewall {
            vpc: vpc.to_string(),
            subnet: subnet.to_string(),
        });
        deps.edge(s, fw);
        Ok(Self {
            steps: deps.teardown_order()?,
        })
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Run every step, persisting after each one
    pub fn execute(&self, kernel: &Kernel, store: &StateStore, graph: &mut StateGraph) -> Result<()> {
        for step in &self.steps {
            debug!(step = %step, "teardown");
            run_step(kernel, graph, step)?;
            store.save(graph)?;
        }
        Ok(())
    }
}

fn run_step(kernel: &Kernel, graph: &mut StateGraph, step: &Step) -> Result<()> {
    match step {
        Step::Firewall { vpc, subnet } => {
            let Some(record) = graph.vpc_mut(vpc).and_then(|v| v.subnet_mut(subnet)) else {
                return Ok(());
            };
            bulkhead::clear(kernel, &record.namespace)?;
            record.firewall = None;
        }
        Step::Peering(key) => {
            if let Some(record) = graph.peerings.get(key).cloned() {
                peering::teardown(kernel, &record)?;
                graph.peerings.remove(key);
            }
        }
        Step::Nat(vpc) => {
            if graph.exists(vpc) {
                nat::disable(kernel, graph, vpc)?;
            }
        }
        Step::Subnet { vpc, subnet } => remove_subnet(kernel, graph, vpc, subnet)?,
        Step::Isolation(vpc) => {
            if let Some(record) = graph.vpc(vpc) {
                nat::remove_isolation(kernel, &record.bridge)?;
            }
        }
        Step::Bridge(vpc) => {
            if let Some(record) = graph.vpc(vpc) {
                kernel.link.delete_link(&record.bridge, None)?;
            }
        }
        Step::Record(vpc) => {
            graph.vpcs.remove(vpc);
        }
    }
    Ok(())
}

fn remove_subnet(kernel: &Kernel, graph: &mut StateGraph, vpc_name: &str, subnet_name: &str) -> Result<()> {
    let Some(vpc) = graph.vpc(vpc_name).cloned() else {
        return Ok(());
    };
    let Some(subnet) = vpc.subnet(subnet_name).cloned() else {
        return Ok(());
    };

    if let Some(gateway) = &vpc.nat
        && subnet.kind == SubnetKind::Private
    {
        kernel
            .filter
            .remove_all(&nat::private_drop(&subnet.cidr, &gateway.interface))?;
    }

    topology::teardown_subnet(kernel, &vpc, &subnet)?;

    // Namespace routes died with the namespace
    for peering in graph.peerings.values_mut() {
        peering
            .routes
            .retain(|r| r.namespace.as_deref() != Some(subnet.namespace.as_str()));
    }
    if let Some(record) = graph.vpc_mut(vpc_name) {
        record.subnets.retain(|s| s.name != subnet_name);
    }
    Ok(())
}

/// Delete a VPC and everything attached to it; absent is success
pub fn delete_vpc(kernel: &Kernel, store: &StateStore, graph: &mut StateGraph, name: &str) -> Result<Outcome> {
    if !graph.exists(name) {
        debug!(vpc = %name, "no VPC to delete");
        return Ok(Outcome::Unchanged);
    }

    let plan = TeardownPlan::for_vpc(graph, name)?;
    info!(vpc = %name, steps = plan.steps().len(), "deleting VPC");
    plan.execute(kernel, store, graph)?;
    Ok(Outcome::Applied)
}

/// Delete one subnet; absent is success
pub fn delete_subnet(
    kernel: &Kernel,
    store: &StateStore,
    graph: &mut StateGraph,
    vpc: &str,
    subnet: &str,
) -> Result<Outcome> {
    if !graph.subnet_exists(vpc, subnet) {
        debug!(vpc = %vpc, subnet = %subnet, "no subnet to delete");
        return Ok(Outcome::Unchanged);
    }

    let plan = TeardownPlan::for_subnet(graph, vpc, subnet)?;
    info!(vpc = %vpc, subnet = %subnet, "deleting subnet");
    plan.execute(kernel, store, graph)?;
    Ok(Outcome::Applied)
}

/// Tear down every VPC and remove the state file
///
/// Keeps going past a failing VPC and reports the first error at the end.
pub fn cleanup(kernel: &Kernel, store: &StateStore, graph: &mut StateGraph) -> Result<usize> {
    let names: Vec<String> = graph.vpcs.keys().cloned().collect();
    let mut first_error = None;
    let mut removed = 0;

    for name in &names {
        match delete_vpc(kernel, store, graph, name) {
            Ok(_) => removed += 1,
            Err(e) => {
                warn!(vpc = %name, error = %e, "cleanup failed");
                first_error.get_or_insert(e);
            }
        }
    }

    if let Some(e) = first_error {
        return Err(e);
    }

    // Orphaned peering records, if any were written by hand
    let orphans: Vec<_> = graph.peerings.values().cloned().collect();
    for record in orphans {
        peering::teardown(kernel, &record)?;
        graph.peerings.remove(&record.key());
    }

    store.destroy()?;
    Ok(removed)
}
