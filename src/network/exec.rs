//! Process execution for kernel management commands
//!
//! Every kernel mutation goes through `ip`, `iptables` or `sysctl`. The
//! [`Runner`] trait separates read-only probes from mutations so a dry run can
//! print mutations without executing them.

use crate::error::{Error, Result};
use std::process::Command;
use tracing::debug;

/// Captured result of a command
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Executes kernel management commands
pub trait Runner {
    /// Run a command that changes kernel state
    fn exec(&self, program: &str, args: &[String]) -> Result<CommandOutput>;

    /// Run a command that only reads kernel state
    fn query(&self, program: &str, args: &[String]) -> Result<CommandOutput>;
}

/// Render a command line for logs and error messages
pub fn command_line(program: &str, args: &[String]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

/// Turn a failed command into a kernel error
pub fn checked(program: &str, args: &[String], output: CommandOutput) -> Result<CommandOutput> {
    if output.success {
        return Ok(output);
    }

    Err(Error::Kernel {
        command: command_line(program, args),
        message: output.stderr.trim().to_string(),
    })
}

/// stderr patterns meaning the object is already gone
pub fn is_absent(stderr: &str) -> bool {
    const PATTERNS: [&str; 8] = [
        "Cannot find device",
        "does not exist",
        "No such file or directory",
        "No such process",
        "Cannot assign requested address",
        "Bad rule",
        "No chain/target/match by that name",
        "doesn't exist",
    ];
    PATTERNS.iter().any(|p| stderr.contains(p))
}

/// stderr patterns meaning the object is already present
pub fn is_present(stderr: &str) -> bool {
    stderr.contains("File exists") || stderr.contains("Chain already exists")
}

/// Runs commands on the host
#[derive(Debug, Default)]
pub struct SystemRunner;

impl SystemRunner {
    fn run(program: &str, args: &[String]) -> Result<CommandOutput> {
        let output = Command::new(program).args(args).output().map_err(|e| Error::Kernel {
            command: command_line(program, args),
            message: format!("failed to spawn: {}", e),
        })?;

        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

impl Runner for SystemRunner {
    fn exec(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        debug!(command = %command_line(program, args), "exec");
        Self::run(program, args)
    }

    fn query(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        Self::run(program, args)
    }
}

/// Prints mutations instead of running them
///
/// Probes report failure with empty output, so every object looks absent
/// and the full provisioning sequence is shown.
#[derive(Debug, Default)]
pub struct DryRunRunner;

impl Runner for DryRunRunner {
    fn exec(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        println!("[dry-run] {}", command_line(program, args));
        Ok(CommandOutput {
            success: true,
            ..Default::default()
        })
    }

    fn query(&self, _program: &str, _args: &[String]) -> Result<CommandOutput> {
        Ok(CommandOutput::default())
    }
}

/// Records command lines and replays canned answers
#[cfg(test)]
#[derive(Default)]
pub struct RecordingRunner {
    pub calls: std::cell::RefCell<Vec<String>>,
    /// (substring, output) answers; first match wins, default is success
    pub answers: Vec<(String, CommandOutput)>,
}

#[cfg(test)]
impl RecordingRunner {
    pub fn answer(mut self, needle: &str, success: bool, stdout: &str, stderr: &str) -> Self {
        self.answers.push((
            needle.to_string(),
            CommandOutput {
                success,
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
            },
        ));
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    fn respond(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        let line = command_line(program, args);
        self.calls.borrow_mut().push(line.clone());
        Ok(self
            .answers
            .iter()
            .find(|(needle, _)| line.contains(needle.as_str()))
            .map(|(_, out)| out.clone())
            .unwrap_or(CommandOutput {
                success: true,
                ..Default::default()
            }))
    }
}

#[cfg(test)]
impl Runner for RecordingRunner {
    fn exec(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        self.respond(program, args)
    }

    fn query(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        self.respond(program, args)
    }
}
