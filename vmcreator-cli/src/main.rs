//! # vmcreator
//!
//! Declarative VM provisioning on a libvirt host.
//!
//! ## Usage
//! ```bash
//! vmcreator --config vms.yaml [install|update|destroy]
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::{debug, error, info};

use vmcreator_cli::{run, Args, Config, Provisioner, EXIT_FATAL};
use vmcreator_hypervisor::{Hypervisor, SystemRunner};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(e) = vmcreator_common::init_cli_logging(args.log_format, args.debug) {
        eprintln!("{:#}", e);
        std::process::exit(EXIT_FATAL);
    }

    info!(version = env!("CARGO_PKG_VERSION"), action = ?args.action, "Starting vmcreator");

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %format!("{:#}", e), path = %args.config, "Failed to load configuration");
            std::process::exit(EXIT_FATAL);
        }
    };
    info!(
        path = %args.config,
        services = config.services.len(),
        networks = config.networks.len(),
        "Configuration loaded"
    );

    let uri = args.uri.clone().unwrap_or_else(|| config.libvirt.uri.clone());
    let hypervisor = match connect(&uri).await {
        Ok(hypervisor) => hypervisor,
        Err(e) => {
            error!(error = %format!("{:#}", e), uri = %uri, "Failed to connect to hypervisor");
            debug!(error = ?e, "Connection failure details");
            std::process::exit(EXIT_FATAL);
        }
    };

    let provisioner = Provisioner::new(config, hypervisor, Arc::new(SystemRunner));
    let (report, code) = run(&provisioner, &args).await;

    if args.json {
        match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{}", json),
            Err(e) => error!(error = %e, "Failed to serialize report"),
        }
    }

    info!(exit_code = code, failed = report.failures(), "vmcreator finished");
    std::process::exit(code);
}

#[cfg(feature = "libvirt")]
async fn connect(uri: &str) -> Result<Arc<dyn Hypervisor>> {
    let backend = vmcreator_hypervisor::LibvirtBackend::new(uri)
        .await
        .with_context(|| format!("cannot open libvirt connection {}", uri))?;
    Ok(Arc::new(backend))
}

#[cfg(not(feature = "libvirt"))]
async fn connect(uri: &str) -> Result<Arc<dyn Hypervisor>> {
    Err(anyhow::anyhow!("built without libvirt support"))
        .with_context(|| format!("cannot open libvirt connection {}", uri))
}
