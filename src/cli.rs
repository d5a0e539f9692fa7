//! Command-line interface for vpcctl
//!
//! Uses clap with derive for type-safe CLI parsing

use crate::manifest::DEFAULT_CONFIG_PATH;
use crate::state::SubnetKind;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

/// vpcctl - VPCs on a single Linux host
#[derive(Parser)]
#[command(name = "vpcctl")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// State directory (overrides the config file)
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Print kernel changes instead of applying them
    #[arg(long, global = true)]
    pub dry_run: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand)]
pub enum Commands {
    /// Create a VPC
    CreateVpc {
        /// VPC name
        name: String,

        /// Address block in CIDR notation (e.g., 10.0.0.0/16)
        cidr: String,
    },

    /// Delete a VPC with its subnets, NAT gateway and peerings
    DeleteVpc {
        /// VPC name
        name: String,
    },

    /// Add a subnet to a VPC
    AddSubnet {
        /// VPC name
        vpc: String,

        /// Subnet name
        name: String,

        /// Subnet block, contained in the VPC block
        cidr: String,

        /// Subnet type
        #[arg(long = "type", value_enum, default_value_t = SubnetKind::Private)]
        kind: SubnetKind,
    },

    /// Delete a subnet
    DeleteSubnet {
        /// VPC name
        vpc: String,

        /// Subnet name
        name: String,
    },

    /// Give public subnets outbound access through a host interface
    EnableNat {
        /// VPC name
        vpc: String,

        /// Uplink interface (defaults to [nat] default_interface)
        #[arg(short, long)]
        interface: Option<String>,
    },

    /// Remove the NAT gateway of a VPC
    DisableNat {
        /// VPC name
        vpc: String,
    },

    /// Peer two VPCs
    CreatePeering {
        vpc1: String,
        vpc2: String,
    },

    /// Remove the peering between two VPCs
    DeletePeering {
        vpc1: String,
        vpc2: String,
    },

    /// Apply a firewall policy file to a subnet
    ApplyFirewall {
        /// VPC name
        vpc: String,

        /// JSON policy file
        rules: PathBuf,
    },

    /// List VPCs
    ListVpcs {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Show one VPC in detail
    ShowVpc {
        /// VPC name
        name: String,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// List peerings
    ListPeerings {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Compare recorded state with the kernel
    Check {
        /// Restrict to one VPC and its peerings
        vpc: Option<String>,

        /// Re-provision missing objects
        #[arg(long)]
        repair: bool,
    },

    /// Tear down every VPC and remove the state file
    Cleanup,

    /// Execute a command inside a subnet namespace
    Exec {
        /// VPC name
        vpc: String,

        /// Subnet name
        subnet: String,

        /// Command to execute (defaults to a shell)
        #[arg(last = true)]
        command: Vec<String>,
    },

    /// Generate shell completion scripts
    Completion {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Config path and whether the user named it
    pub fn config_path(&self) -> (PathBuf, bool) {
        match &self.config {
            Some(path) => (path.clone(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
        }
    }

    /// Generate shell completion scripts
    pub fn generate_completion(shell: Shell) {
        let mut cmd = Self::command();
        clap_complete::generate(shell, &mut cmd, "vpcctl", &mut std::io::stdout());
    }
}
