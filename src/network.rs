//! Kernel networking surfaces for VPC emulation
//!
//! Provides:
//! - CIDR parsing and subnet addressing
//! - Link, namespace and route management (iproute2)
//! - Packet filter management (iptables)
//! - Command execution with a dry-run mode

pub mod cidr;
pub mod exec;
pub mod filter;
pub mod link;
#[cfg(test)]
pub mod sim;

pub use cidr::SubnetAddressing;
pub use filter::{FilterOps, Policy, Rule, Table};
pub use link::{LinkOps, Route};

use exec::{DryRunRunner, SystemRunner};
use filter::Iptables;
use link::IpRoute2;

/// The kernel surfaces every engine programs against
pub struct Kernel {
    pub link: Box<dyn LinkOps>,
    pub filter: Box<dyn FilterOps>,
}

impl Kernel {
    pub fn new(link: Box<dyn LinkOps>, filter: Box<dyn FilterOps>) -> Self {
        Self { link, filter }
    }

    /// Kernel driven by `ip`, `iptables` and `sysctl` on the host
    pub fn system() -> Self {
        Self::new(
            Box::new(IpRoute2::new(SystemRunner)),
            Box::new(Iptables::new(SystemRunner)),
        )
    }

    /// Kernel that prints mutations instead of running them
    pub fn dry_run() -> Self {
        Self::new(
            Box::new(IpRoute2::new(DryRunRunner)),
            Box::new(Iptables::new(DryRunRunner)),
        )
    }

    /// Kernel backed by a shared in-memory simulation
    #[cfg(test)]
    pub fn simulated(sim: &sim::SimKernel) -> Self {
        Self::new(Box::new(sim.clone()), Box::new(sim.clone()))
    }
}
