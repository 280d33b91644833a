//! Command-line argument parsing.

use clap::{Parser, ValueEnum};
use vmcreator_common::LogFormat;

/// What to do with the VMs described in the config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Action {
    /// Create missing volumes, networks and domains
    #[default]
    Install,
    /// Like install, but rebuild the cloud-init seed
    Update,
    /// Stop and undefine the domains
    Destroy,
}

/// vmcreator - declarative VM provisioning on libvirt
#[derive(Parser, Debug)]
#[command(name = "vmcreator")]
#[command(about = "Create and destroy libvirt VMs from a YAML description")]
#[command(version)]
pub struct Args {
    /// Path to the YAML config file
    #[arg(short, long)]
    pub config: String,

    /// Action to run
    #[arg(value_enum, default_value = "install")]
    pub action: Action,

    /// With destroy: also delete the VMs' volumes
    #[arg(long)]
    pub delete_storage: bool,

    /// With destroy: also delete the declared networks
    #[arg(long)]
    pub delete_network: bool,

    /// Enable debug logging, including full error chains
    #[arg(long)]
    pub debug: bool,

    /// Libvirt connection URI (overrides libvirt.uri from the config)
    #[arg(long, env = "VMCREATOR_URI")]
    pub uri: Option<String>,

    /// Log output format (pretty, json)
    #[arg(long, default_value = "pretty")]
    pub log_format: LogFormat,

    /// Print the run report as JSON on stdout
    #[arg(long)]
    pub json: bool,
}
