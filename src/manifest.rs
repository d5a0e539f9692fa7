//! Configuration file parsing for vpcctl
//!
//! Parses `vpcctl.toml` using serde. Every section is optional; a missing
//! file at the default location yields the defaults.

use crate::error::{Error, Result};
use crate::network::Policy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/vpcctl/vpcctl.toml";

/// Load configuration from a file
///
/// When `explicit` is false (the path is the built-in default) a missing
/// file is not an error.
pub fn load(path: &Path, explicit: bool) -> Result<Settings> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && !explicit => {
            return Ok(Settings::default());
        }
        Err(e) => {
            return Err(Error::ConfigRead {
                path: path.to_path_buf(),
                source: e,
            });
        }
    };

    let settings: Settings = toml::from_str(&content)?;
    settings.validate()?;

    Ok(settings)
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub config: GlobalConfig,

    #[serde(default)]
    pub nat: NatConfig,

    #[serde(default)]
    pub peering: PeeringConfig,

    #[serde(default)]
    pub firewall: FirewallConfig,
}

impl Settings {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.config.state_dir.as_os_str().is_empty() {
            return Err(Error::ConfigValidation("state_dir must not be empty".into()));
        }

        let iface = &self.nat.default_interface;
        if iface.is_empty() || iface.len() > crate::naming::IFNAME_MAX {
            return Err(Error::ConfigValidation(format!(
                "nat.default_interface '{}' is not a valid interface name",
                iface
            )));
        }
        if iface.contains(char::is_whitespace) || iface.contains('/') {
            return Err(Error::ConfigValidation(format!(
                "nat.default_interface '{}' contains invalid characters",
                iface
            )));
        }

        Ok(())
    }

    /// Override the state directory (from `--state-dir`)
    pub fn with_state_dir(mut self, dir: Option<PathBuf>) -> Self {
        if let Some(dir) = dir {
            self.config.state_dir = dir;
        }
        self
    }
}

/// Global settings
#[derive(Debug, Clone, Deserialize)]
pub struct GlobalConfig {
    /// Directory holding `state.json`
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
        }
    }
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/vpcctl")
}

/// NAT gateway settings
#[derive(Debug, Clone, Deserialize)]
pub struct NatConfig {
    /// Outbound interface used when `enable-nat` gets no `--interface`
    #[serde(default = "default_interface")]
    pub default_interface: String,
}

impl Default for NatConfig {
    fn default() -> Self {
        Self {
            default_interface: default_interface(),
        }
    }
}

fn default_interface() -> String {
    "eth0".into()
}

/// Where peering routes are installed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteMode {
    /// Host routes pointing each peer CIDR at the local peering veth end
    #[default]
    Bridge,
    /// Routes inside every subnet namespace via that subnet's gateway
    Namespace,
}

impl std::fmt::Display for RouteMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouteMode::Bridge => write!(f, "bridge"),
            RouteMode::Namespace => write!(f, "namespace"),
        }
    }
}

/// Peering settings
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PeeringConfig {
    #[serde(default)]
    pub route_mode: RouteMode,
}

/// Firewall settings
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FirewallConfig {
    /// INPUT policy for traffic no ingress rule matches
    #[serde(default)]
    pub default_policy: Policy,
}
