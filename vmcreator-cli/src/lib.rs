//! # vmcreator
//!
//! Reads a YAML description of VMs, networks and volumes and reconciles it
//! against libvirt through [`vmcreator_hypervisor`].
//!
//! ```bash
//! vmcreator --config vms.yaml install
//! vmcreator --config vms.yaml destroy --delete-storage
//! ```

pub mod cli;
pub mod config;
pub mod provisioner;

pub use cli::{Action, Args};
pub use config::Config;
pub use provisioner::{Provisioner, RunReport, VmOutcome, VmReport, EXIT_FATAL, EXIT_PARTIAL};

/// Run `action` and return its report together with the process exit code.
pub async fn run(provisioner: &Provisioner, args: &Args) -> (RunReport, i32) {
    match args.action {
        Action::Install => {
            let report = provisioner.install(false).await;
            let code = provisioner::install_exit_code(&report);
            (report, code)
        }
        Action::Update => {
            let report = provisioner.install(true).await;
            let code = provisioner::install_exit_code(&report);
            (report, code)
        }
        Action::Destroy => {
            let report = provisioner.destroy(args.delete_storage, args.delete_network).await;
            let code = provisioner::destroy_exit_code(&report);
            (report, code)
        }
    }
}
