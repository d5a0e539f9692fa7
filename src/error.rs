//! Unified error types for vpcctl

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for vpcctl operations
#[derive(Error, Debug)]
pub enum Error {
    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // Config errors
    #[error("Failed to read config file '{path}': {source}")]
    ConfigRead { path: PathBuf, source: io::Error },

    #[error("Failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Config validation failed: {0}")]
    ConfigValidation(String),

    // State store errors
    #[error("Failed to read state file '{path}': {source}")]
    StateRead { path: PathBuf, source: io::Error },

    #[error("State file '{path}' is corrupt: {source}")]
    StateParse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("State file '{path}' has version {found}, this build supports up to {supported}")]
    StateVersion {
        path: PathBuf,
        found: u32,
        supported: u32,
    },

    #[error("Failed to write state file '{path}': {message}")]
    StateWrite { path: PathBuf, message: String },

    // Firewall policy errors
    #[error("Failed to read firewall policy '{path}': {source}")]
    PolicyRead { path: PathBuf, source: io::Error },

    #[error("Invalid firewall policy '{path}': {source}")]
    PolicyParse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Failed to render JSON: {0}")]
    Json(#[from] serde_json::Error),

    // Model errors
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("VPC '{0}' not found")]
    VpcNotFound(String),

    #[error("Subnet '{subnet}' not found in VPC '{vpc}'")]
    SubnetNotFound { vpc: String, subnet: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    // Kernel errors
    #[error("Command '{command}' failed: {message}")]
    Kernel { command: String, message: String },

    #[error("{entity} has missing kernel objects: {}", missing.join(", "))]
    Divergence {
        entity: String,
        missing: Vec<String>,
    },

    #[error("Operation requires root privileges: {0}")]
    NotRoot(String),

    #[error("Command execution failed in namespace '{namespace}': {message}")]
    ExecFailed { namespace: String, message: String },
}

/// Result type alias for vpcctl operations
pub type Result<T> = std::result::Result<T, Error>;
