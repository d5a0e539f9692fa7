//! vpcctl - VPC emulation on a single Linux host
//!
//! VPCs are bridges, subnets are network namespaces wired in with veth
//! pairs, and NAT, isolation, peering and security groups are iptables
//! rules. A JSON state store records what was built so every command is
//! idempotent and teardown can run in dependency order.

mod bulkhead;
mod cli;
mod console;
mod controller;
mod error;
mod lifecycle;
mod manifest;
mod naming;
mod nat;
mod network;
mod peering;
mod sickbay;
mod state;
mod topology;

use cli::{Cli, Commands};
use controller::Controller;
use error::Result;
use tracing_subscriber::EnvFilter;

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn run() -> Result<()> {
    let cli = Cli::parse_args();

    // Commands that don't require config
    if let Commands::Completion { shell } = cli.command {
        Cli::generate_completion(shell);
        return Ok(());
    }

    init_logging(cli.verbose);

    let (config_path, explicit) = cli.config_path();
    let settings = manifest::load(&config_path, explicit)?.with_state_dir(cli.state_dir.clone());
    let controller = Controller::new(settings, cli.dry_run);

    match cli.command {
        Commands::CreateVpc { name, cidr } => controller.create_vpc(&name, &cidr)?,
        Commands::DeleteVpc { name } => controller.delete_vpc(&name)?,
        Commands::AddSubnet { vpc, name, cidr, kind } => controller.add_subnet(&vpc, &name, &cidr, kind)?,
        Commands::DeleteSubnet { vpc, name } => controller.delete_subnet(&vpc, &name)?,
        Commands::EnableNat { vpc, interface } => controller.enable_nat(&vpc, interface.as_deref())?,
        Commands::DisableNat { vpc } => controller.disable_nat(&vpc)?,
        Commands::CreatePeering { vpc1, vpc2 } => controller.create_peering(&vpc1, &vpc2)?,
        Commands::DeletePeering { vpc1, vpc2 } => controller.delete_peering(&vpc1, &vpc2)?,
        Commands::ApplyFirewall { vpc, rules } => controller.apply_firewall(&vpc, &rules)?,
        Commands::ListVpcs { json } => controller.list_vpcs(json)?,
        Commands::ShowVpc { name, json } => controller.show_vpc(&name, json)?,
        Commands::ListPeerings { json } => controller.list_peerings(json)?,
        Commands::Check { vpc, repair } => controller.check(vpc.as_deref(), repair)?,
        Commands::Cleanup => controller.cleanup()?,
        Commands::Exec { vpc, subnet, command } => {
            let status = controller.exec(&vpc, &subnet, &command)?;
            std::process::exit(status.code().unwrap_or(1));
        }
        // Already handled above
        Commands::Completion { .. } => unreachable!(),
    }

    Ok(())
}
