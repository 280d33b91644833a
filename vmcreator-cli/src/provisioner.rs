//! Top-level driver: walks the configured services and reconciles each
//! one through the engine.
//!
//! A VM that fails is logged and recorded in the [`RunReport`]; the
//! remaining VMs are still processed.

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

use vmcreator_hypervisor::{
    AttachedStorage, CloudInitBuilder, CloudinitStorage, CommandRunner, Hypervisor,
    HypervisorError, InstanceDescriptor, InstanceReconciler, MacAddress, NetworkHandle,
    NetworkReconciler, NicBinding, StorageDescriptor, StorageReconciler, TeardownReport,
};

use crate::config::{Config, ServiceConfig};

/// Exit code of a run that could not start or whose cleanup failed entirely.
pub const EXIT_FATAL: i32 = -10;

/// Exit code of an install batch where some VMs failed.
pub const EXIT_PARTIAL: i32 = 1;

/// What happened to one VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum VmOutcome {
    /// Domain defined and started by this run
    Created { uuid: String },
    /// Domain already existed and was left untouched
    Unchanged { uuid: String },
    /// Domain stopped and undefined
    Removed { teardown: TeardownReport },
    Failed { error: String },
}

impl VmOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// Per-VM result of a run.
#[derive(Debug, Clone, Serialize)]
pub struct VmReport {
    pub name: String,
    #[serde(flatten)]
    pub outcome: VmOutcome,
}

/// Result of a whole install/update/destroy run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub vms: Vec<VmReport>,
    /// Non-fatal problems outside any single VM
    pub warnings: Vec<String>,
}

impl RunReport {
    pub fn failures(&self) -> usize {
        self.vms.iter().filter(|vm| vm.outcome.is_failure()).count()
    }

    fn push(&mut self, name: &str, outcome: VmOutcome) {
        self.vms.push(VmReport { name: name.to_string(), outcome });
    }
}

/// Drives the reconcilers for every service of a [`Config`].
pub struct Provisioner {
    config: Config,
    hypervisor: Arc<dyn Hypervisor>,
    cloudinit: CloudInitBuilder,
    storage: StorageReconciler,
    networks: NetworkReconciler,
    instances: InstanceReconciler,
}

impl Provisioner {
    pub fn new(
        config: Config,
        hypervisor: Arc<dyn Hypervisor>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        let cloudinit = CloudInitBuilder::new();
        let storage = StorageReconciler::new(hypervisor.clone(), runner)
            .with_cloudinit(cloudinit.clone());
        let networks = NetworkReconciler::new(hypervisor.clone());
        let instances =
            InstanceReconciler::new(hypervisor.clone(), storage.clone(), networks.clone());

        Self { config, hypervisor, cloudinit, storage, networks, instances }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // =========================================================================
    // Install / update
    // =========================================================================

    /// Provision every service. With `force_seed` the cloud-init ISO is
    /// rebuilt even when it already exists.
    pub async fn install(&self, force_seed: bool) -> RunReport {
        let mut report = RunReport::default();

        for (name, service) in &self.config.services {
            let outcome = match self.install_vm(name, service, force_seed).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(vm = %name, error = %e, "Failed to provision VM");
                    debug!(vm = %name, error = ?e, "Failure details");
                    VmOutcome::Failed { error: e.to_string() }
                }
            };
            report.push(name, outcome);
        }

        info!(
            vms = report.vms.len(),
            failed = report.failures(),
            "Install finished"
        );
        report
    }

    #[instrument(skip(self, service))]
    async fn install_vm(
        &self,
        name: &str,
        service: &ServiceConfig,
        force_seed: bool,
    ) -> Result<VmOutcome, HypervisorError> {
        let libvirt = &self.config.libvirt;

        let seed = self.cloudinit.render(name, &service.seed_config())?;
        let seed_storage = StorageDescriptor::Cloudinit(
            CloudinitStorage::new(name, &libvirt.vm_pool)
                .with_seed(seed)
                .forced(force_seed),
        );
        let seed_volume = self.storage.ensure(&seed_storage).await?;

        let disks = service
            .storage_descriptors(name, libvirt)
            .map_err(|e| HypervisorError::InvalidConfig(format!("{:#}", e)))?;

        let mut storages = Vec::with_capacity(disks.len() + 1);
        for descriptor in disks {
            let volume = self.storage.ensure(&descriptor).await?;
            storages.push(AttachedStorage { descriptor, volume });
        }
        storages.push(AttachedStorage { descriptor: seed_storage, volume: seed_volume });

        let mut nics: Vec<NicBinding> = Vec::with_capacity(service.networks.len());
        for nic in &service.networks {
            let handle = self.ensure_network(&nic.name).await?;
            let reserved: Vec<MacAddress> = nics.iter().map(|n| n.mac).collect();
            let binding = self
                .networks
                .bind(&handle, name, nic.ip_addr.as_deref(), &reserved)
                .await?;
            nics.push(binding);
        }

        let instance = InstanceDescriptor {
            name: name.to_string(),
            vcpu: service.cpu,
            ram_mib: service.ram.size,
            shared_ram: service.ram.shared,
            storages,
            nics,
        };

        let outcome = self.instances.create(&instance).await?;
        Ok(if outcome.created {
            VmOutcome::Created { uuid: outcome.domain.uuid }
        } else {
            VmOutcome::Unchanged { uuid: outcome.domain.uuid }
        })
    }

    async fn ensure_network(&self, name: &str) -> Result<NetworkHandle, HypervisorError> {
        let network = self.config.networks.get(name).ok_or_else(|| {
            HypervisorError::InvalidConfig(format!("network {} is not declared", name))
        })?;
        self.networks.ensure(&network.descriptor(name)).await
    }

    // =========================================================================
    // Destroy
    // =========================================================================

    /// Tear down every service, then (optionally) the declared networks.
    pub async fn destroy(&self, delete_storage: bool, delete_network: bool) -> RunReport {
        let mut report = RunReport::default();

        for name in self.config.services.keys() {
            let outcome = match self.instances.delete(name, delete_storage).await {
                Ok(teardown) => VmOutcome::Removed { teardown },
                Err(e) => {
                    warn!(vm = %name, error = %e, "Failed to destroy VM");
                    debug!(vm = %name, error = ?e, "Failure details");
                    VmOutcome::Failed { error: e.to_string() }
                }
            };
            report.push(name, outcome);
        }

        if delete_network {
            for name in self.config.networks.keys() {
                let result = match self.hypervisor.lookup_network(name).await {
                    Ok(handle) => self.networks.delete(&handle).await,
                    Err(e) if e.is_not_found() => {
                        debug!(network = %name, "Network not defined; nothing to delete");
                        continue;
                    }
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    warn!(network = %name, error = %e, "Network not deleted");
                    report.warnings.push(format!("network {}: {}", name, e));
                }
            }
        }

        info!(
            vms = report.vms.len(),
            failed = report.failures(),
            "Destroy finished"
        );
        report
    }
}

/// Exit code for an install or update run.
pub fn install_exit_code(report: &RunReport) -> i32 {
    if report.failures() > 0 {
        EXIT_PARTIAL
    } else {
        0
    }
}

/// Exit code for a destroy run: fatal only when every VM failed.
pub fn destroy_exit_code(report: &RunReport) -> i32 {
    if !report.vms.is_empty() && report.failures() == report.vms.len() {
        EXIT_FATAL
    } else {
        0
    }
}
