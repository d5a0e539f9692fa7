//! Link, namespace and route management
//!
//! Provides:
//! - The [`LinkOps`] surface the topology engines program against
//! - An iproute2 backend ([`IpRoute2`]) driving `ip` and `sysctl`
//!
//! Delete operations treat an already-absent object as success so that
//! teardown converges after partial or manual cleanup.

use crate::error::Result;
use crate::network::exec::{checked, is_absent, is_present, CommandOutput, Runner};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use tracing::debug;

/// A static route, optionally scoped to a namespace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Namespace holding the route (None = host)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Destination block (None = default route)
    pub destination: Option<Ipv4Net>,
    /// Next hop
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub via: Option<Ipv4Addr>,
    /// Output device
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dev: Option<String>,
}

impl Route {
    /// Default route inside a namespace
    pub fn default_via(namespace: &str, gateway: Ipv4Addr) -> Self {
        Self {
            namespace: Some(namespace.to_string()),
            destination: None,
            via: Some(gateway),
            dev: None,
        }
    }

    /// Host route sending a block out of a device
    pub fn host_dev(destination: Ipv4Net, dev: &str) -> Self {
        Self {
            namespace: None,
            destination: Some(destination),
            via: None,
            dev: Some(dev.to_string()),
        }
    }

    /// Namespace route sending a block to a gateway
    pub fn namespace_via(namespace: &str, destination: Ipv4Net, gateway: Ipv4Addr) -> Self {
        Self {
            namespace: Some(namespace.to_string()),
            destination: Some(destination),
            via: Some(gateway),
            dev: None,
        }
    }

    fn destination_arg(&self) -> String {
        self.destination
            .map(|d| d.to_string())
            .unwrap_or_else(|| "default".to_string())
    }

    /// `ip route` selector arguments (destination, via, dev)
    fn selector(&self) -> Vec<String> {
        let mut args = vec![self.destination_arg()];
        if let Some(via) = self.via {
            args.push("via".to_string());
            args.push(via.to_string());
        }
        if let Some(dev) = &self.dev {
            args.push("dev".to_string());
            args.push(dev.clone());
        }
        args
    }

    /// True if a line of `ip route show` output describes this route
    pub fn matches_line(&self, line: &str) -> bool {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.first().copied() != Some(self.destination_arg().as_str()) {
            return false;
        }

        let has_pair = |key: &str, value: &str| {
            tokens
                .windows(2)
                .any(|w| w[0] == key && w[1] == value)
        };

        self.via.is_none_or(|via| has_pair("via", &via.to_string()))
            && self.dev.as_ref().is_none_or(|dev| has_pair("dev", dev))
    }
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.selector().join(" "))?;
        if let Some(ns) = &self.namespace {
            write!(f, " (netns {})", ns)?;
        }
        Ok(())
    }
}

/// Interface, namespace and routing operations
///
/// All operations are synchronous and fallible; errors carry the failing
/// command and its stderr.
pub trait LinkOps {
    fn link_exists(&self, name: &str, namespace: Option<&str>) -> Result<bool>;
    fn create_bridge(&self, name: &str) -> Result<()>;
    fn create_veth(&self, name: &str, peer: &str) -> Result<()>;
    /// Delete a link (destroying a veth end destroys its peer)
    fn delete_link(&self, name: &str, namespace: Option<&str>) -> Result<()>;
    fn set_master(&self, link: &str, bridge: &str) -> Result<()>;
    fn set_namespace(&self, link: &str, namespace: &str) -> Result<()>;
    fn set_up(&self, link: &str, namespace: Option<&str>) -> Result<()>;
    fn add_address(&self, link: &str, addr: Ipv4Net, namespace: Option<&str>) -> Result<()>;
    fn delete_address(&self, link: &str, addr: Ipv4Net, namespace: Option<&str>) -> Result<()>;

    fn namespace_exists(&self, name: &str) -> Result<bool>;
    fn create_namespace(&self, name: &str) -> Result<()>;
    fn delete_namespace(&self, name: &str) -> Result<()>;

    fn route_exists(&self, route: &Route) -> Result<bool>;
    fn add_route(&self, route: &Route) -> Result<()>;
    fn delete_route(&self, route: &Route) -> Result<()>;

    /// Toggle `net.ipv4.ip_forward`
    fn set_ip_forwarding(&self, enabled: bool) -> Result<()>;
}

/// iproute2 backend
pub struct IpRoute2<R: Runner> {
    runner: R,
}

fn strings(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

impl<R: Runner> IpRoute2<R> {
    pub fn new(runner: R) -> Self {
        Self { runner }
    }

    /// `ip [-n ns] <args>`
    fn ip_args(namespace: Option<&str>, args: Vec<String>) -> Vec<String> {
        let mut full = Vec::with_capacity(args.len() + 2);
        if let Some(ns) = namespace {
            full.push("-n".to_string());
            full.push(ns.to_string());
        }
        full.extend(args);
        full
    }

    fn ip(&self, namespace: Option<&str>, args: Vec<String>) -> Result<()> {
        let args = Self::ip_args(namespace, args);
        let output = self.runner.exec("ip", &args)?;
        checked("ip", &args, output).map(|_| ())
    }

    /// Run an `ip` mutation where "already exists" counts as success
    fn ip_create(&self, namespace: Option<&str>, args: Vec<String>) -> Result<()> {
        let args = Self::ip_args(namespace, args);
        let output = self.runner.exec("ip", &args)?;
        if !output.success && is_present(&output.stderr) {
            debug!(command = %args.join(" "), "already present");
            return Ok(());
        }
        checked("ip", &args, output).map(|_| ())
    }

    /// Run an `ip` mutation where "not found" counts as success
    fn ip_remove(&self, namespace: Option<&str>, args: Vec<String>) -> Result<()> {
        let args = Self::ip_args(namespace, args);
        let output = self.runner.exec("ip", &args)?;
        if !output.success && is_absent(&output.stderr) {
            debug!(command = %args.join(" "), "already absent");
            return Ok(());
        }
        checked("ip", &args, output).map(|_| ())
    }

    fn ip_query(&self, namespace: Option<&str>, args: Vec<String>) -> Result<CommandOutput> {
        let args = Self::ip_args(namespace, args);
        self.runner.query("ip", &args)
    }
}

impl<R: Runner> LinkOps for IpRoute2<R> {
    fn link_exists(&self, name: &str, namespace: Option<&str>) -> Result<bool> {
        let output = self.ip_query(namespace, strings(&["link", "show", "dev", name]))?;
        Ok(output.success)
    }

    fn create_bridge(&self, name: &str) -> Result<()> {
        self.ip(None, strings(&["link", "add", "name", name, "type", "bridge"]))
    }

    fn create_veth(&self, name: &str, peer: &str) -> Result<()> {
        self.ip(
            None,
            strings(&["link", "add", name, "type", "veth", "peer", "name", peer]),
        )
    }

    fn delete_link(&self, name: &str, namespace: Option<&str>) -> Result<()> {
        self.ip_remove(namespace, strings(&["link", "delete", "dev", name]))
    }

    fn set_master(&self, link: &str, bridge: &str) -> Result<()> {
        self.ip(None, strings(&["link", "set", "dev", link, "master", bridge]))
    }

    fn set_namespace(&self, link: &str, namespace: &str) -> Result<()> {
        self.ip(None, strings(&["link", "set", "dev", link, "netns", namespace]))
    }

    fn set_up(&self, link: &str, namespace: Option<&str>) -> Result<()> {
        self.ip(namespace, strings(&["link", "set", "dev", link, "up"]))
    }

    fn add_address(&self, link: &str, addr: Ipv4Net, namespace: Option<&str>) -> Result<()> {
        self.ip_create(
            namespace,
            strings(&["addr", "add", &addr.to_string(), "dev", link]),
        )
    }

    fn delete_address(&self, link: &str, addr: Ipv4Net, namespace: Option<&str>) -> Result<()> {
        self.ip_remove(
            namespace,
            strings(&["addr", "del", &addr.to_string(), "dev", link]),
        )
    }

    fn namespace_exists(&self, name: &str) -> Result<bool> {
        let output = self.ip_query(None, strings(&["netns", "list"]))?;
        if !output.success {
            return Ok(false);
        }
        // Lines look like "vcns-v1.pub (id: 3)"
        Ok(output
            .stdout
            .lines()
            .filter_map(|line| line.split_whitespace().next())
            .any(|ns| ns == name))
    }

    fn create_namespace(&self, name: &str) -> Result<()> {
        self.ip(None, strings(&["netns", "add", name]))
    }

    fn delete_namespace(&self, name: &str) -> Result<()> {
        self.ip_remove(None, strings(&["netns", "delete", name]))
    }

    fn route_exists(&self, route: &Route) -> Result<bool> {
        let mut args = strings(&["route", "show"]);
        args.push(route.destination_arg());
        let output = self.ip_query(route.namespace.as_deref(), args)?;
        if !output.success {
            return Ok(false);
        }
        Ok(output.stdout.lines().any(|line| route.matches_line(line)))
    }

    fn add_route(&self, route: &Route) -> Result<()> {
        let mut args = strings(&["route", "add"]);
        args.extend(route.selector());
        self.ip_create(route.namespace.as_deref(), args)
    }

    fn delete_route(&self, route: &Route) -> Result<()> {
        let mut args = strings(&["route", "del"]);
        args.extend(route.selector());
        self.ip_remove(route.namespace.as_deref(), args)
    }

    fn set_ip_forwarding(&self, enabled: bool) -> Result<()> {
        let value = if enabled { "1" } else { "0" };
        let args = vec!["-w".to_string(), format!("net.ipv4.ip_forward={}", value)];
        let output = self.runner.exec("sysctl", &args)?;
        checked("sysctl", &args, output).map(|_| ())
    }
}
