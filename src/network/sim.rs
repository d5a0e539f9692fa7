//! In-memory kernel for tests
//!
//! Models links, namespaces, routes and iptables state closely enough for the
//! engines to be exercised end to end: deleting a veth end removes its peer,
//! deleting a namespace destroys everything inside it, and a chain still
//! referenced by a jump cannot be deleted. Any operation can be made to fail.

use crate::error::{Error, Result};
use crate::network::filter::{FilterOps, Policy, Rule, Table};
use crate::network::link::{LinkOps, Route};
use ipnet::Ipv4Net;
use std::cell::{Ref, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

const BUILTIN_CHAINS: [&str; 5] = ["INPUT", "FORWARD", "OUTPUT", "PREROUTING", "POSTROUTING"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkKind {
    Loopback,
    Bridge,
    Veth { peer: String },
}

#[derive(Debug, Clone)]
pub struct SimLink {
    pub kind: LinkKind,
    pub master: Option<String>,
    pub up: bool,
    pub addrs: Vec<Ipv4Net>,
}

/// (namespace, name)
pub type LinkKey = (Option<String>, String);

#[derive(Debug, Default)]
pub struct SimState {
    pub links: BTreeMap<LinkKey, SimLink>,
    pub namespaces: BTreeSet<String>,
    pub routes: Vec<Route>,
    /// All rules in insertion order; order within a chain is preserved
    pub rules: Vec<Rule>,
    pub chains: BTreeSet<(Option<String>, Table, String)>,
    pub policies: BTreeMap<(Option<String>, String), Policy>,
    pub ip_forward: bool,
    /// Every successful mutation, in order
    pub ops: Vec<String>,
    failures: Vec<(String, String)>,
}

impl SimState {
    pub fn has_link(&self, name: &str) -> bool {
        self.links.keys().any(|(_, n)| n == name)
    }

    /// Rule specifications of a chain in order
    pub fn chain_rules(&self, namespace: Option<&str>, table: Table, chain: &str) -> Vec<String> {
        self.rules
            .iter()
            .filter(|r| r.namespace.as_deref() == namespace && r.table == table && r.chain == chain)
            .map(|r| r.spec_line())
            .collect()
    }

    /// True if any kernel object or rule mentions the needle
    pub fn mentions(&self, needle: &str) -> bool {
        self.links.keys().any(|(ns, n)| n.contains(needle) || ns.as_deref().is_some_and(|ns| ns.contains(needle)))
            || self.namespaces.iter().any(|ns| ns.contains(needle))
            || self.rules.iter().any(|r| r.to_string().contains(needle))
            || self.routes.iter().any(|r| r.to_string().contains(needle))
    }

    fn find_link(&self, name: &str) -> Option<LinkKey> {
        self.links.keys().find(|(_, n)| n == name).cloned()
    }

    fn remove_link(&mut self, key: &LinkKey) {
        let Some(link) = self.links.remove(key) else {
            return;
        };
        let (ns, name) = key;
        self.routes
            .retain(|r| !(r.namespace == *ns && r.dev.as_deref() == Some(name.as_str())));
        for other in self.links.values_mut() {
            if other.master.as_deref() == Some(name.as_str()) {
                other.master = None;
            }
        }
        if let LinkKind::Veth { peer } = link.kind
            && let Some(peer_key) = self.find_link(&peer)
        {
            self.remove_link(&peer_key);
        }
    }

    fn namespace_ready(&self, namespace: Option<&str>, command: &str) -> Result<()> {
        match namespace {
            Some(ns) if !self.namespaces.contains(ns) => Err(kernel_error(
                command,
                &format!("Cannot open network namespace \"{}\": No such file or directory", ns),
            )),
            _ => Ok(()),
        }
    }

    fn chain_exists(&self, namespace: Option<&str>, table: Table, chain: &str) -> bool {
        BUILTIN_CHAINS.contains(&chain)
            || self
                .chains
                .contains(&(namespace.map(str::to_string), table, chain.to_string()))
    }
}

fn kernel_error(command: &str, message: &str) -> Error {
    Error::Kernel {
        command: command.to_string(),
        message: message.to_string(),
    }
}

/// Shared handle to the simulated kernel
///
/// Clones share state, so one clone can serve as `LinkOps` and another as
/// `FilterOps` while the test inspects a third.
#[derive(Debug, Clone, Default)]
pub struct SimKernel {
    state: Rc<RefCell<SimState>>,
}

impl SimKernel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> Ref<'_, SimState> {
        self.state.borrow()
    }

    /// Make every operation whose rendering starts with `op` and contains
    /// `needle` fail until [`SimKernel::heal`] is called
    pub fn fail_on(&self, op: &str, needle: &str) {
        self.state
            .borrow_mut()
            .failures
            .push((op.to_string(), needle.to_string()));
    }

    pub fn heal(&self) {
        self.state.borrow_mut().failures.clear();
    }

    /// Run a mutation, honoring injected failures and recording it
    fn mutate<T>(&self, call: String, f: impl FnOnce(&mut SimState) -> Result<T>) -> Result<T> {
        let mut state = self.state.borrow_mut();
        if state
            .failures
            .iter()
            .any(|(op, needle)| call.starts_with(op.as_str()) && call.contains(needle.as_str()))
        {
            return Err(kernel_error(&call, "injected failure"));
        }
        let value = f(&mut state)?;
        state.ops.push(call);
        Ok(value)
    }

    fn link_key(namespace: Option<&str>, name: &str) -> LinkKey {
        (namespace.map(str::to_string), name.to_string())
    }

    fn link_mut<'a>(state: &'a mut SimState, key: &LinkKey, call: &str) -> Result<&'a mut SimLink> {
        state
            .links
            .get_mut(key)
            .ok_or_else(|| kernel_error(call, &format!("Cannot find device \"{}\"", key.1)))
    }
}

impl LinkOps for SimKernel {
    fn link_exists(&self, name: &str, namespace: Option<&str>) -> Result<bool> {
        Ok(self
            .state()
            .links
            .contains_key(&Self::link_key(namespace, name)))
    }

    fn create_bridge(&self, name: &str) -> Result<()> {
        let call = format!("create_bridge {}", name);
        self.mutate(call.clone(), |state| {
            if state.has_link(name) {
                return Err(kernel_error(&call, "RTNETLINK answers: File exists"));
            }
            state.links.insert(
                Self::link_key(None, name),
                SimLink {
                    kind: LinkKind::Bridge,
                    master: None,
                    up: false,
                    addrs: Vec::new(),
                },
            );
            Ok(())
        })
    }

    fn create_veth(&self, name: &str, peer: &str) -> Result<()> {
        let call = format!("create_veth {} {}", name, peer);
        self.mutate(call.clone(), |state| {
            if state.has_link(name) || state.has_link(peer) {
                return Err(kernel_error(&call, "RTNETLINK answers: File exists"));
            }
            for (end, other) in [(name, peer), (peer, name)] {
                state.links.insert(
                    Self::link_key(None, end),
                    SimLink {
                        kind: LinkKind::Veth {
                            peer: other.to_string(),
                        },
                        master: None,
                        up: false,
                        addrs: Vec::new(),
                    },
                );
            }
            Ok(())
        })
    }

    fn delete_link(&self, name: &str, namespace: Option<&str>) -> Result<()> {
        self.mutate(format!("delete_link {}", name), |state| {
            state.remove_link(&Self::link_key(namespace, name));
            Ok(())
        })
    }

    fn set_master(&self, link: &str, bridge: &str) -> Result<()> {
        let call = format!("set_master {} {}", link, bridge);
        self.mutate(call.clone(), |state| {
            let bridge_key = Self::link_key(None, bridge);
            if state.links.get(&bridge_key).map(|l| &l.kind) != Some(&LinkKind::Bridge) {
                return Err(kernel_error(&call, &format!("Cannot find device \"{}\"", bridge)));
            }
            Self::link_mut(state, &Self::link_key(None, link), &call)?.master = Some(bridge.to_string());
            Ok(())
        })
    }

    fn set_namespace(&self, link: &str, namespace: &str) -> Result<()> {
        let call = format!("set_namespace {} {}", link, namespace);
        self.mutate(call.clone(), |state| {
            state.namespace_ready(Some(namespace), &call)?;
            let key = Self::link_key(None, link);
            let mut moved = state
                .links
                .remove(&key)
                .ok_or_else(|| kernel_error(&call, &format!("Cannot find device \"{}\"", link)))?;
            moved.master = None;
            moved.up = false;
            moved.addrs.clear();
            state.links.insert(Self::link_key(Some(namespace), link), moved);
            Ok(())
        })
    }

    fn set_up(&self, link: &str, namespace: Option<&str>) -> Result<()> {
        let call = format!("set_up {}", link);
        self.mutate(call.clone(), |state| {
            Self::link_mut(state, &Self::link_key(namespace, link), &call)?.up = true;
            Ok(())
        })
    }

    fn add_address(&self, link: &str, addr: Ipv4Net, namespace: Option<&str>) -> Result<()> {
        let call = format!("add_address {} {}", link, addr);
        self.mutate(call.clone(), |state| {
            let entry = Self::link_mut(state, &Self::link_key(namespace, link), &call)?;
            if !entry.addrs.contains(&addr) {
                entry.addrs.push(addr);
            }
            Ok(())
        })
    }

    fn delete_address(&self, link: &str, addr: Ipv4Net, namespace: Option<&str>) -> Result<()> {
        self.mutate(format!("delete_address {} {}", link, addr), |state| {
            if let Some(entry) = state.links.get_mut(&Self::link_key(namespace, link)) {
                entry.addrs.retain(|a| *a != addr);
            }
            Ok(())
        })
    }

    fn namespace_exists(&self, name: &str) -> Result<bool> {
        Ok(self.state().namespaces.contains(name))
    }

    fn create_namespace(&self, name: &str) -> Result<()> {
        let call = format!("create_namespace {}", name);
        self.mutate(call.clone(), |state| {
            if !state.namespaces.insert(name.to_string()) {
                return Err(kernel_error(
                    &call,
                    &format!("Cannot create namespace file \"/run/netns/{}\": File exists", name),
                ));
            }
            state.links.insert(
                Self::link_key(Some(name), "lo"),
                SimLink {
                    kind: LinkKind::Loopback,
                    master: None,
                    up: false,
                    addrs: Vec::new(),
                },
            );
            Ok(())
        })
    }

    fn delete_namespace(&self, name: &str) -> Result<()> {
        self.mutate(format!("delete_namespace {}", name), |state| {
            if !state.namespaces.remove(name) {
                return Ok(());
            }
            let inside: Vec<LinkKey> = state
                .links
                .keys()
                .filter(|(ns, _)| ns.as_deref() == Some(name))
                .cloned()
                .collect();
            for key in inside {
                state.remove_link(&key);
            }
            state.routes.retain(|r| r.namespace.as_deref() != Some(name));
            state.rules.retain(|r| r.namespace.as_deref() != Some(name));
            state.chains.retain(|(ns, _, _)| ns.as_deref() != Some(name));
            state.policies.retain(|(ns, _), _| ns.as_deref() != Some(name));
            Ok(())
        })
    }

    fn route_exists(&self, route: &Route) -> Result<bool> {
        Ok(self.state().routes.contains(route))
    }

    fn add_route(&self, route: &Route) -> Result<()> {
        let call = format!("add_route {}", route);
        self.mutate(call.clone(), |state| {
            state.namespace_ready(route.namespace.as_deref(), &call)?;
            if let Some(dev) = &route.dev
                && !state
                    .links
                    .contains_key(&Self::link_key(route.namespace.as_deref(), dev))
            {
                return Err(kernel_error(&call, &format!("Cannot find device \"{}\"", dev)));
            }
            if !state.routes.contains(route) {
                state.routes.push(route.clone());
            }
            Ok(())
        })
    }

    fn delete_route(&self, route: &Route) -> Result<()> {
        self.mutate(format!("delete_route {}", route), |state| {
            state.routes.retain(|r| r != route);
            Ok(())
        })
    }

    fn set_ip_forwarding(&self, enabled: bool) -> Result<()> {
        self.mutate(format!("set_ip_forwarding {}", enabled), |state| {
            state.ip_forward = enabled;
            Ok(())
        })
    }
}

impl FilterOps for SimKernel {
    fn rule_exists(&self, rule: &Rule) -> Result<bool> {
        Ok(self.state().rules.contains(rule))
    }

    fn append_rule(&self, rule: &Rule) -> Result<()> {
        let call = format!("append_rule {}", rule);
        self.mutate(call.clone(), |state| {
            state.namespace_ready(rule.namespace.as_deref(), &call)?;
            if !state.chain_exists(rule.namespace.as_deref(), rule.table, &rule.chain) {
                return Err(kernel_error(&call, "iptables: No chain/target/match by that name."));
            }
            state.rules.push(rule.clone());
            Ok(())
        })
    }

    fn insert_rule(&self, rule: &Rule) -> Result<()> {
        let call = format!("insert_rule {}", rule);
        self.mutate(call.clone(), |state| {
            state.namespace_ready(rule.namespace.as_deref(), &call)?;
            if !state.chain_exists(rule.namespace.as_deref(), rule.table, &rule.chain) {
                return Err(kernel_error(&call, "iptables: No chain/target/match by that name."));
            }
            state.rules.insert(0, rule.clone());
            Ok(())
        })
    }

    fn delete_rule(&self, rule: &Rule) -> Result<()> {
        self.mutate(format!("delete_rule {}", rule), |state| {
            if let Some(pos) = state.rules.iter().position(|r| r == rule) {
                state.rules.remove(pos);
            }
            Ok(())
        })
    }

    fn ensure_chain(&self, namespace: Option<&str>, table: Table, chain: &str) -> Result<()> {
        let call = format!("ensure_chain {}", chain);
        self.mutate(call.clone(), |state| {
            state.namespace_ready(namespace, &call)?;
            state
                .chains
                .insert((namespace.map(str::to_string), table, chain.to_string()));
            Ok(())
        })
    }

    fn flush_chain(&self, namespace: Option<&str>, table: Table, chain: &str) -> Result<()> {
        let call = format!("flush_chain {}", chain);
        self.mutate(call.clone(), |state| {
            state.namespace_ready(namespace, &call)?;
            state.rules.retain(|r| {
                !(r.namespace.as_deref() == namespace && r.table == table && r.chain == chain)
            });
            Ok(())
        })
    }

    fn delete_chain(&self, namespace: Option<&str>, table: Table, chain: &str) -> Result<()> {
        let call = format!("delete_chain {}", chain);
        self.mutate(call.clone(), |state| {
            let referenced = state.rules.iter().any(|r| {
                r.namespace.as_deref() == namespace
                    && r.table == table
                    && (r.chain == chain || r.references(chain))
            });
            if referenced {
                return Err(kernel_error(&call, "iptables: Too many links."));
            }
            state
                .chains
                .remove(&(namespace.map(str::to_string), table, chain.to_string()));
            Ok(())
        })
    }

    fn list_rules(&self, namespace: Option<&str>, table: Table, chain: &str) -> Result<Vec<String>> {
        Ok(self.state().chain_rules(namespace, table, chain))
    }

    fn set_policy(&self, namespace: Option<&str>, chain: &str, policy: Policy) -> Result<()> {
        let call = format!("set_policy {} {}", chain, policy.target());
        self.mutate(call.clone(), |state| {
            state.namespace_ready(namespace, &call)?;
            state
                .policies
                .insert((namespace.map(str::to_string), chain.to_string()), policy);
            Ok(())
        })
    }
}
