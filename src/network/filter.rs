//! Packet filter management
//!
//! Provides:
//! - The [`FilterOps`] surface used by the NAT, peering and firewall engines
//! - An iptables backend ([`Iptables`]), optionally scoped to a namespace
//!
//! Rules are identified by their specification, never by position, so
//! check-before-insert stays correct whatever else lives in the chain.

use crate::error::Result;
use crate::network::exec::{checked, is_absent, is_present, Runner};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// iptables table
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Table {
    Filter,
    Nat,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Filter => "filter",
            Table::Nat => "nat",
        }
    }
}

/// Built-in chain policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Policy {
    #[default]
    Accept,
    Drop,
}

impl Policy {
    pub fn target(&self) -> &'static str {
        match self {
            Policy::Accept => "ACCEPT",
            Policy::Drop => "DROP",
        }
    }
}

/// A single rule in a table/chain, optionally inside a namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub namespace: Option<String>,
    pub table: Table,
    pub chain: String,
    /// Match and target arguments, e.g. `-s 10.0.0.0/16 -j MASQUERADE`
    pub spec: Vec<String>,
}

impl Rule {
    pub fn new(table: Table, chain: &str, spec: &[&str]) -> Self {
        Self {
            namespace: None,
            table,
            chain: chain.to_string(),
            spec: spec.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Scope the rule to a namespace
    pub fn in_namespace(mut self, namespace: &str) -> Self {
        self.namespace = Some(namespace.to_string());
        self
    }

    /// Space-joined specification, as shown by `iptables -S`
    pub fn spec_line(&self) -> String {
        self.spec.join(" ")
    }

    /// True if any argument names the given interface or block
    #[cfg(test)]
    pub fn references(&self, needle: &str) -> bool {
        self.spec.iter().any(|arg| arg == needle)
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "-t {} {} {}", self.table.as_str(), self.chain, self.spec_line())?;
        if let Some(ns) = &self.namespace {
            write!(f, " (netns {})", ns)?;
        }
        Ok(())
    }
}

/// Packet filter operations
pub trait FilterOps {
    fn rule_exists(&self, rule: &Rule) -> Result<bool>;
    fn append_rule(&self, rule: &Rule) -> Result<()>;
    /// Insert at the head of the chain
    fn insert_rule(&self, rule: &Rule) -> Result<()>;
    /// Delete one instance of the rule; absent is success
    fn delete_rule(&self, rule: &Rule) -> Result<()>;

    fn ensure_chain(&self, namespace: Option<&str>, table: Table, chain: &str) -> Result<()>;
    /// Remove every rule of a chain; absent is success
    fn flush_chain(&self, namespace: Option<&str>, table: Table, chain: &str) -> Result<()>;
    /// Delete an (empty, unreferenced) chain; absent is success
    fn delete_chain(&self, namespace: Option<&str>, table: Table, chain: &str) -> Result<()>;
    /// Rule specifications of a chain in order (without the `-A <chain>` prefix)
    fn list_rules(&self, namespace: Option<&str>, table: Table, chain: &str) -> Result<Vec<String>>;
    fn set_policy(&self, namespace: Option<&str>, chain: &str, policy: Policy) -> Result<()>;

    /// Append unless an identical rule is present
    fn ensure_appended(&self, rule: &Rule) -> Result<bool> {
        if self.rule_exists(rule)? {
            return Ok(false);
        }
        self.append_rule(rule)?;
        Ok(true)
    }

    /// Insert at the head unless an identical rule is present
    fn ensure_inserted(&self, rule: &Rule) -> Result<bool> {
        if self.rule_exists(rule)? {
            return Ok(false);
        }
        self.insert_rule(rule)?;
        Ok(true)
    }

    /// Delete every instance of the rule
    fn remove_all(&self, rule: &Rule) -> Result<()> {
        while self.rule_exists(rule)? {
            self.delete_rule(rule)?;
        }
        Ok(())
    }
}

/// iptables backend
pub struct Iptables<R: Runner> {
    runner: R,
}

impl<R: Runner> Iptables<R> {
    pub fn new(runner: R) -> Self {
        Self { runner }
    }

    /// Build the program and arguments, wrapping in `ip netns exec` when scoped
    fn command(namespace: Option<&str>, table: Table, args: Vec<String>) -> (&'static str, Vec<String>) {
        let mut ipt = vec![
            "-w".to_string(),
            "-t".to_string(),
            table.as_str().to_string(),
        ];
        ipt.extend(args);

        match namespace {
            Some(ns) => {
                let mut full = vec![
                    "netns".to_string(),
                    "exec".to_string(),
                    ns.to_string(),
                    "iptables".to_string(),
                ];
                full.extend(ipt);
                ("ip", full)
            }
            None => ("iptables", ipt),
        }
    }

    fn rule_args(flag: &str, rule: &Rule) -> Vec<String> {
        let mut args = vec![flag.to_string(), rule.chain.clone()];
        args.extend(rule.spec.iter().cloned());
        args
    }

    fn run(&self, namespace: Option<&str>, table: Table, args: Vec<String>) -> Result<()> {
        let (program, args) = Self::command(namespace, table, args);
        let output = self.runner.exec(program, &args)?;
        checked(program, &args, output).map(|_| ())
    }
}

impl<R: Runner> FilterOps for Iptables<R> {
    fn rule_exists(&self, rule: &Rule) -> Result<bool> {
        let (program, args) = Self::command(
            rule.namespace.as_deref(),
            rule.table,
            Self::rule_args("-C", rule),
        );
        Ok(self.runner.query(program, &args)?.success)
    }

    fn append_rule(&self, rule: &Rule) -> Result<()> {
        debug!(rule = %rule, "append");
        self.run(rule.namespace.as_deref(), rule.table, Self::rule_args("-A", rule))
    }

    fn insert_rule(&self, rule: &Rule) -> Result<()> {
        debug!(rule = %rule, "insert");
        self.run(rule.namespace.as_deref(), rule.table, Self::rule_args("-I", rule))
    }

    fn delete_rule(&self, rule: &Rule) -> Result<()> {
        let (program, args) = Self::command(
            rule.namespace.as_deref(),
            rule.table,
            Self::rule_args("-D", rule),
        );
        let output = self.runner.exec(program, &args)?;
        if !output.success && is_absent(&output.stderr) {
            return Ok(());
        }
        checked(program, &args, output).map(|_| ())
    }

    fn ensure_chain(&self, namespace: Option<&str>, table: Table, chain: &str) -> Result<()> {
        let (program, args) = Self::command(namespace, table, vec!["-N".to_string(), chain.to_string()]);
        let output = self.runner.exec(program, &args)?;
        if !output.success && is_present(&output.stderr) {
            return Ok(());
        }
        checked(program, &args, output).map(|_| ())
    }

    fn flush_chain(&self, namespace: Option<&str>, table: Table, chain: &str) -> Result<()> {
        let (program, args) = Self::command(namespace, table, vec!["-F".to_string(), chain.to_string()]);
        let output = self.runner.exec(program, &args)?;
        if !output.success && is_absent(&output.stderr) {
            return Ok(());
        }
        checked(program, &args, output).map(|_| ())
    }

    fn delete_chain(&self, namespace: Option<&str>, table: Table, chain: &str) -> Result<()> {
        let (program, args) = Self::command(namespace, table, vec!["-X".to_string(), chain.to_string()]);
        let output = self.runner.exec(program, &args)?;
        if !output.success && is_absent(&output.stderr) {
            return Ok(());
        }
        checked(program, &args, output).map(|_| ())
    }

    fn list_rules(&self, namespace: Option<&str>, table: Table, chain: &str) -> Result<Vec<String>> {
        let (program, args) = Self::command(namespace, table, vec!["-S".to_string(), chain.to_string()]);
        let output = self.runner.query(program, &args)?;
        if !output.success {
            return Ok(Vec::new());
        }

        let prefix = format!("-A {} ", chain);
        Ok(output
            .stdout
            .lines()
            .filter_map(|line| line.strip_prefix(&prefix))
            .map(|spec| spec.trim().to_string())
            .collect())
    }

    fn set_policy(&self, namespace: Option<&str>, chain: &str, policy: Policy) -> Result<()> {
        self.run(
            namespace,
            Table::Filter,
            vec!["-P".to_string(), chain.to_string(), policy.target().to_string()],
        )
    }
}
