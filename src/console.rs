//! Run commands inside a subnet namespace

use crate::error::{Error, Result};
use crate::state::StateGraph;
use std::process::{Command, ExitStatus, Stdio};
use tracing::debug;

/// Argument vector for running `command` in `namespace`
pub fn exec_args(namespace: &str, command: &[String]) -> Vec<String> {
    let mut args = vec!["netns".to_string(), "exec".to_string(), namespace.to_string()];
    if command.is_empty() {
        args.push("/bin/sh".to_string());
    } else {
        args.extend(command.iter().cloned());
    }
    args
}

/// Execute a command in the namespace of `vpc/subnet` with inherited stdio
///
/// An empty command opens a shell.
pub fn exec_in_subnet(graph: &StateGraph, vpc: &str, subnet: &str, command: &[String]) -> Result<ExitStatus> {
    let namespace = graph.require_subnet(vpc, subnet)?.namespace.clone();
    let args = exec_args(&namespace, command);
    debug!(namespace = %namespace, command = ?command, "exec");

    Command::new("ip")
        .args(&args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .map_err(|e| Error::ExecFailed {
            namespace,
            message: format!("Failed to execute ip: {}", e),
        })
}
