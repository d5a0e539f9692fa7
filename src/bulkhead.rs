//! Security groups for subnets
//!
//! Ingress rules live in a dedicated `VC-INGRESS` chain inside the subnet
//! namespace, jumped to from `INPUT`. Applying a policy rebuilds the chain
//! from scratch, so repeated applies converge on the same rule set.

use crate::error::{Error, Result};
use crate::naming::INGRESS_CHAIN;
use crate::network::{Kernel, Policy, Rule, Table};
use crate::state::{Outcome, StateGraph};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

/// Transport protocol of an ingress rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

/// Verdict of an ingress rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    #[default]
    Allow,
    Deny,
}

impl Action {
    pub fn target(&self) -> &'static str {
        match self {
            Action::Allow => "ACCEPT",
            Action::Deny => "DROP",
        }
    }
}

/// Single ingress rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressRule {
    /// Destination port (None = every port of the protocol)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub action: Action,
}

impl IngressRule {
    /// Rule specification, in the form `iptables -S` prints it back
    pub fn to_spec(&self) -> Vec<String> {
        let proto = self.protocol.as_str();
        let mut spec = vec!["-p".to_string(), proto.to_string()];
        if let Some(port) = self.port {
            spec.extend([
                "-m".to_string(),
                proto.to_string(),
                "--dport".to_string(),
                port.to_string(),
            ]);
        }
        spec.extend(["-j".to_string(), self.action.target().to_string()]);
        spec
    }
}

/// Ingress policy for one subnet, as read from a JSON rules file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallPolicy {
    /// CIDR of the target subnet
    pub subnet: Ipv4Net,
    /// Rules in evaluation order
    #[serde(default)]
    pub ingress: Vec<IngressRule>,
}

impl FirewallPolicy {
    /// Load a policy file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| Error::PolicyRead {
            path: path.to_path_buf(),
            source: e,
        })?;

        let policy: FirewallPolicy =
            serde_json::from_str(&content).map_err(|e| Error::PolicyParse {
                path: path.to_path_buf(),
                source: e,
            })?;

        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<()> {
        if self.subnet != self.subnet.trunc() {
            return Err(Error::Validation(format!(
                "Policy subnet {} has host bits set, did you mean {}?",
                self.subnet,
                self.subnet.trunc()
            )));
        }

        if self.ingress.iter().any(|r| r.port == Some(0)) {
            return Err(Error::Validation("Port 0 is not a valid ingress port".into()));
        }

        Ok(())
    }

    /// Expected contents of the ingress chain
    pub fn chain_rules(&self, default_policy: Policy) -> Vec<Vec<String>> {
        let mut rules = Vec::new();
        if default_policy == Policy::Drop {
            rules.push(strings(&["-i", "lo", "-j", "ACCEPT"]));
            rules.push(strings(&[
                "-m",
                "state",
                "--state",
                "RELATED,ESTABLISHED",
                "-j",
                "ACCEPT",
            ]));
        }
        rules.extend(self.ingress.iter().map(IngressRule::to_spec));
        rules
    }
}

fn strings(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

/// Jump from `INPUT` into the ingress chain
pub fn ingress_jump(namespace: &str) -> Rule {
    Rule::new(Table::Filter, "INPUT", &["-j", INGRESS_CHAIN]).in_namespace(namespace)
}

/// Program the ingress chain of a namespace
pub fn install(kernel: &Kernel, namespace: &str, policy: &FirewallPolicy, default_policy: Policy) -> Result<()> {
    let filter = &kernel.filter;
    let ns = Some(namespace);

    filter.ensure_chain(ns, Table::Filter, INGRESS_CHAIN)?;
    filter.flush_chain(ns, Table::Filter, INGRESS_CHAIN)?;

    for spec in policy.chain_rules(default_policy) {
        let rule = Rule {
            namespace: Some(namespace.to_string()),
            table: Table::Filter,
            chain: INGRESS_CHAIN.to_string(),
            spec,
        };
        filter.append_rule(&rule)?;
    }

    filter.ensure_inserted(&ingress_jump(namespace))?;
    filter.set_policy(ns, "INPUT", default_policy)?;
    Ok(())
}

/// Remove the ingress chain of a namespace; absent is success
pub fn clear(kernel: &Kernel, namespace: &str) -> Result<()> {
    if !kernel.link.namespace_exists(namespace)? {
        return Ok(());
    }

    let filter = &kernel.filter;
    let ns = Some(namespace);
    filter.remove_all(&ingress_jump(namespace))?;
    filter.flush_chain(ns, Table::Filter, INGRESS_CHAIN)?;
    filter.delete_chain(ns, Table::Filter, INGRESS_CHAIN)?;
    filter.set_policy(ns, "INPUT", Policy::Accept)?;
    Ok(())
}

/// Apply a policy to the subnet of `vpc` whose CIDR it names
pub fn apply(
    kernel: &Kernel,
    graph: &mut StateGraph,
    vpc_name: &str,
    policy: FirewallPolicy,
    default_policy: Policy,
) -> Result<Outcome> {
    policy.validate()?;

    let vpc = graph.require_vpc(vpc_name)?;
    let subnet = vpc
        .subnet_by_cidr(&policy.subnet)
        .ok_or_else(|| Error::SubnetNotFound {
            vpc: vpc_name.to_string(),
            subnet: policy.subnet.to_string(),
        })?;
    let subnet_name = subnet.name.clone();
    let namespace = subnet.namespace.clone();
    let previous = subnet.firewall.clone();

    info!(vpc = %vpc_name, subnet = %subnet_name, rules = policy.ingress.len(), "applying firewall policy");

    if let Err(e) = install(kernel, &namespace, &policy, default_policy) {
        let restored = match &previous {
            Some(old) => install(kernel, &namespace, old, default_policy),
            None => clear(kernel, &namespace),
        };
        if let Err(rollback) = restored {
            warn!(namespace = %namespace, error = %rollback, "firewall rollback failed");
        }
        return Err(e);
    }

    let outcome = if previous.as_ref() == Some(&policy) {
        Outcome::Unchanged
    } else {
        Outcome::Applied
    };

    if let Some(subnet) = graph
        .vpc_mut(vpc_name)
        .and_then(|v| v.subnet_mut(&subnet_name))
    {
        subnet.firewall = Some(policy);
    }

    Ok(outcome)
}
