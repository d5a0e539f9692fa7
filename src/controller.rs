//! Command facade
//!
//! Owns the settings, the state store and the kernel surfaces. Each command
//! loads the graph, hands it to an engine, saves it when the engine
//! succeeds and prints the result.

use crate::bulkhead::{self, FirewallPolicy};
use crate::console;
use crate::error::{Error, Result};
use crate::lifecycle;
use crate::manifest::Settings;
use crate::nat;
use crate::network::Kernel;
use crate::peering;
use crate::sickbay::{self, HealthReport};
use crate::state::{Outcome, StateGraph, StateStore, SubnetKind, Vpc};
use crate::topology;
use std::path::Path;
use std::process::ExitStatus;
use tracing::debug;

/// Runs one command against the host
pub struct Controller {
    settings: Settings,
    store: StateStore,
    kernel: Kernel,
    needs_root: bool,
}

impl Controller {
    /// Controller for the host, or a dry run that only prints kernel changes
    pub fn new(settings: Settings, dry_run: bool) -> Self {
        let dir = settings.config.state_dir.clone();
        if dry_run {
            Self::from_parts(settings, StateStore::read_only(dir), Kernel::dry_run(), false)
        } else {
            Self::from_parts(settings, StateStore::new(dir), Kernel::system(), true)
        }
    }

    pub fn from_parts(settings: Settings, store: StateStore, kernel: Kernel, needs_root: bool) -> Self {
        Self {
            settings,
            store,
            kernel,
            needs_root,
        }
    }

    fn require_root(&self, action: &str) -> Result<()> {
        if self.needs_root && !nix::unistd::Uid::effective().is_root() {
            return Err(Error::NotRoot(action.to_string()));
        }
        Ok(())
    }

    /// Load, mutate, save
    fn mutate<T>(&self, action: &str, f: impl FnOnce(&Kernel, &mut StateGraph) -> Result<T>) -> Result<T> {
        self.require_root(action)?;
        let mut graph = self.store.load()?;
        let value = f(&self.kernel, &mut graph)?;
        self.store.save(&graph)?;
        debug!(action = %action, "state saved");
        Ok(value)
    }

    pub fn create_vpc(&self, name: &str, cidr: &str) -> Result<()> {
        let outcome = self.mutate("create-vpc", |k, g| topology::create_vpc(k, g, name, cidr))?;
        match outcome {
            Outcome::Applied => println!("Created VPC '{}' ({})", name, cidr),
            Outcome::Unchanged => println!("VPC '{}' already exists", name),
        }
        Ok(())
    }

    pub fn delete_vpc(&self, name: &str) -> Result<()> {
        if !self.store.exists(name)? {
            println!("VPC '{}' does not exist", name);
            return Ok(());
        }
        self.require_root("delete-vpc")?;
        let mut graph = self.store.load()?;
        match lifecycle::delete_vpc(&self.kernel, &self.store, &mut graph, name)? {
            Outcome::Applied => println!("Deleted VPC '{}'", name),
            Outcome::Unchanged => println!("VPC '{}' does not exist", name),
        }
        Ok(())
    }

    pub fn add_subnet(&self, vpc: &str, name: &str, cidr: &str, kind: SubnetKind) -> Result<()> {
        let outcome = self.mutate("add-subnet", |k, g| topology::add_subnet(k, g, vpc, name, cidr, kind))?;
        match outcome {
            Outcome::Applied => {
                let graph = self.store.load()?;
                let subnet = graph.require_subnet(vpc, name).ok();
                println!("Added {} subnet '{}' to VPC '{}' ({})", kind, name, vpc, cidr);
                if let Some(subnet) = subnet {
                    println!("  Gateway:   {}", subnet.gateway);
                    println!("  Host:      {}", subnet.host);
                    println!("  Namespace: {}", subnet.namespace);
                }
            }
            Outcome::Unchanged => println!("Subnet '{}' already exists in VPC '{}'", name, vpc),
        }
        Ok(())
    }

    pub fn delete_subnet(&self, vpc: &str, name: &str) -> Result<()> {
        if !self.store.subnet_exists(vpc, name)? {
            println!("Subnet '{}' does not exist in VPC '{}'", name, vpc);
            return Ok(());
        }
        self.require_root("delete-subnet")?;
        let mut graph = self.store.load()?;
        match lifecycle::delete_subnet(&self.kernel, &self.store, &mut graph, vpc, name)? {
            Outcome::Applied => println!("Deleted subnet '{}' from VPC '{}'", name, vpc),
            Outcome::Unchanged => println!("Subnet '{}' does not exist in VPC '{}'", name, vpc),
        }
        Ok(())
    }

    pub fn enable_nat(&self, vpc: &str, interface: Option<&str>) -> Result<()> {
        let interface = interface.unwrap_or(self.settings.nat.default_interface.as_str());
        let outcome = self.mutate("enable-nat", |k, g| nat::enable(k, g, vpc, interface))?;
        match outcome {
            Outcome::Applied => println!("Enabled NAT for VPC '{}' via {}", vpc, interface),
            Outcome::Unchanged => println!("NAT for VPC '{}' already uses {}", vpc, interface),
        }
        Ok(())
    }

    pub fn disable_nat(&self, vpc: &str) -> Result<()> {
        match self.mutate("disable-nat", |k, g| nat::disable(k, g, vpc))? {
            Outcome::Applied => println!("Disabled NAT for VPC '{}'", vpc),
            Outcome::Unchanged => println!("NAT is not enabled for VPC '{}'", vpc),
        }
        Ok(())
    }

    pub fn create_peering(&self, a: &str, b: &str) -> Result<()> {
        let mode = self.settings.peering.route_mode;
        match self.mutate("create-peering", |k, g| peering::create(k, g, a, b, mode))? {
            Outcome::Applied => println!("Peered '{}' with '{}' ({} routes)", a, b, mode),
            Outcome::Unchanged => println!("'{}' and '{}' are already peered", a, b),
        }
        Ok(())
    }

    pub fn delete_peering(&self, a: &str, b: &str) -> Result<()> {
        if !self.store.peering_exists(a, b)? {
            println!("'{}' and '{}' are not peered", a, b);
            return Ok(());
        }
        match self.mutate("delete-peering", |k, g| peering::delete(k, g, a, b))? {
            Outcome::Applied => println!("Removed peering between '{}' and '{}'", a, b),
            Outcome::Unchanged => println!("'{}' and '{}' are not peered", a, b),
        }
        Ok(())
    }

    pub fn apply_firewall(&self, vpc: &str, rules: &Path) -> Result<()> {
        let policy = FirewallPolicy::load(rules)?;
        let subnet = policy.subnet;
        let count = policy.ingress.len();
        let default = self.settings.firewall.default_policy;

        match self.mutate("apply-firewall", |k, g| bulkhead::apply(k, g, vpc, policy, default))? {
            Outcome::Applied => println!("Applied {} ingress rules to {} in VPC '{}'", count, subnet, vpc),
            Outcome::Unchanged => println!("Policy for {} in VPC '{}' is unchanged", subnet, vpc),
        }
        Ok(())
    }

    pub fn list_vpcs(&self, json: bool) -> Result<()> {
        let graph = self.store.load()?;

        if json {
            let vpcs: Vec<serde_json::Value> = graph
                .vpcs
                .values()
                .map(|vpc| {
                    serde_json::json!({
                        "name": vpc.name,
                        "cidr": vpc.cidr,
                        "bridge": vpc.bridge,
                        "nat": vpc.nat.as_ref().map(|n| &n.interface),
                        "subnets": vpc.subnets.len(),
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&vpcs)?);
            return Ok(());
        }

        println!("{:<16} {:<18} {:<16} {:<8} {:<8}", "NAME", "CIDR", "BRIDGE", "NAT", "SUBNETS");
        println!("{}", "-".repeat(70));
        for vpc in graph.vpcs.values() {
            let nat = vpc.nat.as_ref().map(|n| n.interface.as_str()).unwrap_or("-");
            println!(
                "{:<16} {:<18} {:<16} {:<8} {:<8}",
                vpc.name,
                vpc.cidr.to_string(),
                vpc.bridge,
                nat,
                vpc.subnets.len()
            );
        }
        Ok(())
    }

    pub fn show_vpc(&self, name: &str, json: bool) -> Result<()> {
        let graph = self.store.load()?;
        let vpc = graph.require_vpc(name)?;
        let peers: Vec<&str> = graph.peerings_of(name).map(|p| p.other(name)).collect();

        if json {
            let value = serde_json::json!({
                "vpc": vpc,
                "peers": peers,
            });
            println!("{}", serde_json::to_string_pretty(&value)?);
            return Ok(());
        }

        print_vpc(vpc, &peers);
        Ok(())
    }

    pub fn list_peerings(&self, json: bool) -> Result<()> {
        let graph = self.store.load()?;

        if json {
            let peerings: Vec<_> = graph.peerings.values().collect();
            println!("{}", serde_json::to_string_pretty(&peerings)?);
            return Ok(());
        }

        println!("{:<16} {:<16} {:<10} {:<8}", "VPC A", "VPC B", "MODE", "ROUTES");
        println!("{}", "-".repeat(52));
        for p in graph.peerings.values() {
            println!(
                "{:<16} {:<16} {:<10} {:<8}",
                p.vpc_a,
                p.vpc_b,
                p.route_mode.to_string(),
                p.routes.len()
            );
        }
        Ok(())
    }

    /// Compare the store with the kernel; optionally repair
    pub fn check(&self, vpc: Option<&str>, repair: bool) -> Result<()> {
        let graph = self.store.load()?;
        let default = self.settings.firewall.default_policy;

        let report = if repair {
            self.require_root("check --repair")?;
            sickbay::repair(&self.kernel, &graph, vpc, default)?
        } else {
            sickbay::check(&self.kernel, &graph, vpc, default)?
        };

        print_report(&report);
        report.into_result()
    }

    pub fn cleanup(&self) -> Result<()> {
        self.require_root("cleanup")?;
        let mut graph = self.store.load()?;
        let removed = lifecycle::cleanup(&self.kernel, &self.store, &mut graph)?;
        println!("Removed {} VPCs", removed);
        Ok(())
    }

    pub fn exec(&self, vpc: &str, subnet: &str, command: &[String]) -> Result<ExitStatus> {
        self.require_root("exec")?;
        let graph = self.store.load()?;
        console::exec_in_subnet(&graph, vpc, subnet, command)
    }
}

fn print_vpc(vpc: &Vpc, peers: &[&str]) {
    println!("VPC:     {}", vpc.name);
    println!("CIDR:    {}", vpc.cidr);
    println!("Bridge:  {}", vpc.bridge);
    match &vpc.nat {
        Some(nat) => println!("NAT:     via {}", nat.interface),
        None => println!("NAT:     disabled"),
    }
    if !peers.is_empty() {
        println!("Peers:   {}", peers.join(", "));
    }

    if vpc.subnets.is_empty() {
        return;
    }
    println!();
    println!(
        "{:<12} {:<8} {:<18} {:<15} {:<15} {:<8}",
        "SUBNET", "TYPE", "CIDR", "GATEWAY", "HOST", "FIREWALL"
    );
    println!("{}", "-".repeat(80));
    for s in &vpc.subnets {
        let firewall = s
            .firewall
            .as_ref()
            .map(|p| format!("{} rules", p.ingress.len()))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<12} {:<8} {:<18} {:<15} {:<15} {:<8}",
            s.name,
            s.kind.to_string(),
            s.cidr.to_string(),
            s.gateway.to_string(),
            s.host.to_string(),
            firewall
        );
    }
}

fn print_report(report: &HealthReport) {
    for finding in &report.findings {
        println!("{}: diverged", finding.entity);
        for missing in &finding.missing {
            println!("  - {}", missing);
        }
    }
    println!("{}", report.summary());
}
