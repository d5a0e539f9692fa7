//! Persisted VPC state
//!
//! The state graph is the declarative record of every VPC, subnet and
//! peering the tool manages. Kernel state is a projection of it. Only this
//! module knows the on-disk layout: a single `state.json` in the state
//! directory, replaced atomically on every save.

use crate::bulkhead::FirewallPolicy;
use crate::error::{Error, Result};
use crate::manifest::RouteMode;
use crate::naming;
use crate::network::Route;
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use tracing::debug;

/// Result of an idempotent operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    Unchanged,
}

/// Subnet classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SubnetKind {
    /// Egress to the internet through the NAT gateway
    Public,
    /// No internet egress
    #[default]
    Private,
}

impl std::fmt::Display for SubnetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubnetKind::Public => write!(f, "public"),
            SubnetKind::Private => write!(f, "private"),
        }
    }
}

/// A namespace-isolated segment of a VPC
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subnet {
    pub name: String,
    pub cidr: Ipv4Net,
    #[serde(rename = "type")]
    pub kind: SubnetKind,
    pub namespace: String,
    /// Veth end enslaved to the VPC bridge
    pub veth_bridge: String,
    /// Veth end inside the namespace
    pub veth_namespace: String,
    pub gateway: Ipv4Addr,
    pub host: Ipv4Addr,
    /// Last applied ingress policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firewall: Option<FirewallPolicy>,
}

impl Subnet {
    /// Gateway address with the subnet prefix
    pub fn gateway_cidr(&self) -> Ipv4Net {
        Ipv4Net::new(self.gateway, self.cidr.prefix_len()).unwrap_or(self.cidr)
    }

    /// Host address with the subnet prefix
    pub fn host_cidr(&self) -> Ipv4Net {
        Ipv4Net::new(self.host, self.cidr.prefix_len()).unwrap_or(self.cidr)
    }
}

/// NAT gateway configuration of a VPC
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NatGateway {
    /// Outbound (internet-facing) host interface
    pub interface: String,
}

/// A virtual private cloud
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vpc {
    pub name: String,
    pub cidr: Ipv4Net,
    pub bridge: String,
    /// Present while NAT is enabled
    #[serde(default)]
    pub nat: Option<NatGateway>,
    /// Subnets in creation order
    #[serde(default)]
    pub subnets: Vec<Subnet>,
}

impl Vpc {
    pub fn new(name: &str, cidr: Ipv4Net) -> Self {
        Self {
            name: name.to_string(),
            cidr,
            bridge: naming::bridge_name(name),
            nat: None,
            subnets: Vec::new(),
        }
    }

    pub fn subnet(&self, name: &str) -> Option<&Subnet> {
        self.subnets.iter().find(|s| s.name == name)
    }

    pub fn subnet_mut(&mut self, name: &str) -> Option<&mut Subnet> {
        self.subnets.iter_mut().find(|s| s.name == name)
    }

    pub fn subnet_by_cidr(&self, cidr: &Ipv4Net) -> Option<&Subnet> {
        self.subnets.iter().find(|s| s.cidr == *cidr)
    }

    pub fn private_subnets(&self) -> impl Iterator<Item = &Subnet> {
        self.subnets
            .iter()
            .filter(|s| s.kind == SubnetKind::Private)
    }
}

/// Link between two VPC bridges
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peering {
    /// Lexicographically smaller VPC
    pub vpc_a: String,
    pub vpc_b: String,
    /// Veth end attached to `vpc_a`'s bridge
    pub veth_a: String,
    /// Veth end attached to `vpc_b`'s bridge
    pub veth_b: String,
    pub route_mode: RouteMode,
    /// Routes installed for this peering
    #[serde(default)]
    pub routes: Vec<Route>,
}

impl Peering {
    pub fn key(&self) -> String {
        peering_key(&self.vpc_a, &self.vpc_b)
    }

    pub fn involves(&self, vpc: &str) -> bool {
        self.vpc_a == vpc || self.vpc_b == vpc
    }

    /// The VPC on the other side
    pub fn other(&self, vpc: &str) -> &str {
        if self.vpc_a == vpc { &self.vpc_b } else { &self.vpc_a }
    }
}

/// Record key of an unordered VPC pair
pub fn peering_key(a: &str, b: &str) -> String {
    let (first, second) = naming::canonical_pair(a, b);
    format!("{}:{}", first, second)
}

/// Full persisted model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateGraph {
    pub version: u32,
    #[serde(default)]
    pub vpcs: BTreeMap<String, Vpc>,
    #[serde(default)]
    pub peerings: BTreeMap<String, Peering>,
}

impl Default for StateGraph {
    fn default() -> Self {
        Self {
            version: StateStore::CURRENT_VERSION,
            vpcs: BTreeMap::new(),
            peerings: BTreeMap::new(),
        }
    }
}

impl StateGraph {
    pub fn vpc(&self, name: &str) -> Option<&Vpc> {
        self.vpcs.get(name)
    }

    pub fn vpc_mut(&mut self, name: &str) -> Option<&mut Vpc> {
        self.vpcs.get_mut(name)
    }

    /// Look up a VPC that must exist
    pub fn require_vpc(&self, name: &str) -> Result<&Vpc> {
        self.vpcs
            .get(name)
            .ok_or_else(|| Error::VpcNotFound(name.to_string()))
    }

    pub fn require_vpc_mut(&mut self, name: &str) -> Result<&mut Vpc> {
        self.vpcs
            .get_mut(name)
            .ok_or_else(|| Error::VpcNotFound(name.to_string()))
    }

    /// Look up a subnet that must exist
    pub fn require_subnet(&self, vpc: &str, subnet: &str) -> Result<&Subnet> {
        self.require_vpc(vpc)?
            .subnet(subnet)
            .ok_or_else(|| Error::SubnetNotFound {
                vpc: vpc.to_string(),
                subnet: subnet.to_string(),
            })
    }

    pub fn exists(&self, vpc: &str) -> bool {
        self.vpcs.contains_key(vpc)
    }

    pub fn subnet_exists(&self, vpc: &str, subnet: &str) -> bool {
        self.vpc(vpc).is_some_and(|v| v.subnet(subnet).is_some())
    }

    pub fn peering_exists(&self, a: &str, b: &str) -> bool {
        self.peerings.contains_key(&peering_key(a, b))
    }

    pub fn peering(&self, a: &str, b: &str) -> Option<&Peering> {
        self.peerings.get(&peering_key(a, b))
    }

    /// Peerings a VPC participates in
    pub fn peerings_of<'a>(&'a self, vpc: &'a str) -> impl Iterator<Item = &'a Peering> + 'a {
        self.peerings.values().filter(move |p| p.involves(vpc))
    }
}

/// Durable store for the state graph
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
    read_only: bool,
}

impl StateStore {
    /// Current state file format version
    pub const CURRENT_VERSION: u32 = 1;

    /// State file name
    pub const STATE_FILE: &'static str = "state.json";

    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            read_only: false,
        }
    }

    /// Store that loads normally but never writes (dry runs)
    pub fn read_only(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            read_only: true,
        }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(Self::STATE_FILE)
    }

    /// Load the graph; an absent file is an empty graph
    pub fn load(&self) -> Result<StateGraph> {
        let path = self.path();
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(StateGraph::default());
            }
            Err(e) => return Err(Error::StateRead { path, source: e }),
        };

        let graph: StateGraph = serde_json::from_str(&content).map_err(|e| Error::StateParse {
            path: path.clone(),
            source: e,
        })?;

        if graph.version > Self::CURRENT_VERSION {
            return Err(Error::StateVersion {
                path,
                found: graph.version,
                supported: Self::CURRENT_VERSION,
            });
        }

        Ok(graph)
    }

    /// Persist the graph atomically
    ///
    /// Writes a temporary file in the state directory, syncs it and renames
    /// it over `state.json`, so readers see either the old or the new graph.
    pub fn save(&self, graph: &StateGraph) -> Result<()> {
        let path = self.path();
        if self.read_only {
            debug!(path = %path.display(), "read-only store, not saving");
            return Ok(());
        }
        let write_err = |message: String| Error::StateWrite {
            path: path.clone(),
            message,
        };

        fs::create_dir_all(&self.dir).map_err(|e| write_err(e.to_string()))?;

        let content = serde_json::to_string_pretty(graph).map_err(|e| write_err(e.to_string()))?;

        let mut temp = tempfile::NamedTempFile::new_in(&self.dir).map_err(|e| write_err(e.to_string()))?;
        temp.write_all(content.as_bytes())
            .map_err(|e| write_err(e.to_string()))?;
        temp.as_file()
            .sync_all()
            .map_err(|e| write_err(e.to_string()))?;
        temp.persist(&path).map_err(|e| write_err(e.error.to_string()))?;

        debug!(path = %path.display(), "saved state");
        Ok(())
    }

    /// Remove the state file; absent is success
    pub fn destroy(&self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        match fs::remove_file(self.path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    pub fn exists(&self, vpc: &str) -> Result<bool> {
        Ok(self.load()?.exists(vpc))
    }

    pub fn subnet_exists(&self, vpc: &str, subnet: &str) -> Result<bool> {
        Ok(self.load()?.subnet_exists(vpc, subnet))
    }

    pub fn peering_exists(&self, a: &str, b: &str) -> Result<bool> {
        Ok(self.load()?.peering_exists(a, b))
    }
}
