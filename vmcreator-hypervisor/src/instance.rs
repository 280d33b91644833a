//! Domain reconciliation.
//!
//! ```text
//! create:  Absent ──define──► Defining ──start──► Running
//! delete:  Running ──destroy──► Destroying ──undefine──► Absent
//! ```
//!
//! An existing domain is never redefined; configuration drift is not
//! reconciled. A start failure leaves the domain defined but stopped.
//! Teardown works from the domain's own XML, so it needs nothing recorded
//! from the run that created it.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::error::{HypervisorError, Result};
use crate::network::{NetworkReconciler, NicBinding};
use crate::storage::{StorageDescriptor, StorageReconciler};
use crate::traits::Hypervisor;
use crate::types::{DomainHandle, VolumeHandle};
use crate::xml::{disk_sources, interface_bindings, DomainXmlBuilder};

/// A volume together with the descriptor it was ensured from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachedStorage {
    pub descriptor: StorageDescriptor,
    pub volume: VolumeHandle,
}

/// Desired state of a domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDescriptor {
    pub name: String,
    pub vcpu: u32,
    pub ram_mib: u64,
    /// Back guest RAM with shared memfd memory
    pub shared_ram: bool,
    /// Disks in bus order; the cloud-init seed becomes a SATA cdrom
    pub storages: Vec<AttachedStorage>,
    /// NICs in guest interface order
    pub nics: Vec<NicBinding>,
}

/// Lifecycle position of a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Absent,
    /// Defined but not running
    Defining,
    Running,
    Destroying,
}

/// Result of [`InstanceReconciler::create`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateOutcome {
    pub domain: DomainHandle,
    /// False when the domain already existed
    pub created: bool,
}

/// What [`InstanceReconciler::delete`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeardownReport {
    pub name: String,
    /// The domain was running and had to be stopped
    pub stopped: bool,
    pub volumes_deleted: Vec<String>,
    /// Networks a lease was released on
    pub leases_released: Vec<String>,
    /// Non-fatal problems hit after the domain was undefined
    pub warnings: Vec<String>,
}

/// Defines, starts and tears down domains.
pub struct InstanceReconciler {
    hypervisor: Arc<dyn Hypervisor>,
    storage: StorageReconciler,
    networks: NetworkReconciler,
}

impl InstanceReconciler {
    pub fn new(
        hypervisor: Arc<dyn Hypervisor>,
        storage: StorageReconciler,
        networks: NetworkReconciler,
    ) -> Self {
        Self { hypervisor, storage, networks }
    }

    /// Where the named domain currently is in its lifecycle.
    pub async fn state(&self, name: &str) -> Result<InstanceState> {
        let domain = match self.hypervisor.lookup_domain(name).await {
            Ok(domain) => domain,
            Err(e) if e.is_not_found() => return Ok(InstanceState::Absent),
            Err(e) => return Err(e),
        };

        if self.hypervisor.domain_is_active(&domain).await? {
            Ok(InstanceState::Running)
        } else {
            Ok(InstanceState::Defining)
        }
    }

    /// Define and start the domain unless one with this name exists.
    #[instrument(skip(self, instance), fields(vm = %instance.name))]
    pub async fn create(&self, instance: &InstanceDescriptor) -> Result<CreateOutcome> {
        match self.hypervisor.lookup_domain(&instance.name).await {
            Ok(domain) => {
                if !self.hypervisor.domain_is_active(&domain).await? {
                    warn!("Domain exists but is not running; leaving it as is");
                }
                info!(uuid = %domain.uuid, "Domain already defined");
                return Ok(CreateOutcome { domain, created: false });
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let xml = DomainXmlBuilder::new(instance).build();
        debug!(xml = %xml, "Defining domain");

        let domain = match self.hypervisor.define_domain(&xml).await {
            Ok(domain) => domain,
            Err(e) => {
                return Err(HypervisorError::DomainDefinitionFailed { reason: e.to_string(), xml });
            }
        };
        debug!(state = ?InstanceState::Defining, uuid = %domain.uuid, "Domain defined");

        self.hypervisor
            .start_domain(&domain)
            .await
            .map_err(|e| HypervisorError::DomainStartFailed(format!("{}: {}", instance.name, e)))?;

        info!(uuid = %domain.uuid, disks = instance.storages.len(), nics = instance.nics.len(), "Domain started");
        Ok(CreateOutcome { domain, created: true })
    }

    /// Stop and undefine the domain, then delete its volumes (when
    /// `with_storage`) and release the leases of its NICs.
    ///
    /// Failures after the undefine are collected in the report.
    #[instrument(skip(self))]
    pub async fn delete(&self, name: &str, with_storage: bool) -> Result<TeardownReport> {
        let domain = match self.hypervisor.lookup_domain(name).await {
            Ok(domain) => domain,
            Err(e) if e.is_not_found() => {
                return Err(HypervisorError::InstanceNotFound(name.to_string()));
            }
            Err(e) => return Err(e),
        };

        let xml = self.hypervisor.domain_xml(&domain).await?;
        let mut report = TeardownReport { name: name.to_string(), ..Default::default() };

        let storages = self.attached_storages(name, &xml, &mut report).await?;
        let nics = interface_bindings(&xml)?;

        debug!(state = ?InstanceState::Destroying, "Tearing down domain");
        if self.hypervisor.domain_is_active(&domain).await? {
            self.hypervisor.destroy_domain(&domain).await?;
            report.stopped = true;
        }
        self.hypervisor.undefine_domain(&domain).await?;
        info!(stopped = report.stopped, "Domain undefined");

        if with_storage {
            for attached in &storages {
                match self.storage.delete(&attached.volume).await {
                    Ok(()) => report.volumes_deleted.push(attached.volume.name.clone()),
                    Err(e) => {
                        warn!(volume = %attached.volume.name, error = %e, "Failed to delete volume");
                        report.warnings.push(format!("volume {}: {}", attached.volume.name, e));
                    }
                }
            }
        }

        for nic in &nics {
            let released = match self.hypervisor.lookup_network(&nic.network).await {
                Ok(handle) => self.networks.release_lease(&handle, &nic.mac).await,
                Err(e) => Err(e),
            };
            match released {
                Ok(true) => report.leases_released.push(nic.network.clone()),
                Ok(false) => debug!(network = %nic.network, mac = %nic.mac, "No lease held"),
                Err(e) => {
                    warn!(network = %nic.network, mac = %nic.mac, error = %e, "Failed to release lease");
                    report.warnings.push(format!("lease {} on {}: {}", nic.mac, nic.network, e));
                }
            }
        }

        info!(
            volumes = report.volumes_deleted.len(),
            leases = report.leases_released.len(),
            "Instance removed"
        );
        Ok(report)
    }

    /// Map the domain's disk sources back to typed storage descriptors.
    ///
    /// Sources outside any pool, with foreign names, or owned by another VM
    /// are skipped.
    async fn attached_storages(
        &self,
        name: &str,
        xml: &str,
        report: &mut TeardownReport,
    ) -> Result<Vec<AttachedStorage>> {
        let mut storages = Vec::new();

        for source in disk_sources(xml)? {
            match self.reconstruct(&source).await {
                Ok(attached) if attached.descriptor.vm_name() == name => storages.push(attached),
                Ok(attached) => {
                    warn!(volume = %attached.volume.name, "Disk belongs to another VM; skipping");
                    report.warnings.push(format!("skipped foreign disk {}", attached.volume.name));
                }
                Err(e) => {
                    warn!(path = %source.display(), error = %e, "Cannot map disk to a volume; skipping");
                    report.warnings.push(format!("skipped disk {}: {}", source.display(), e));
                }
            }
        }

        Ok(storages)
    }

    async fn reconstruct(&self, source: &Path) -> Result<AttachedStorage> {
        let volume = self.hypervisor.lookup_volume_by_path(source).await?;
        let descriptor = StorageDescriptor::reconstruct(&volume)?;
        Ok(AttachedStorage { descriptor, volume })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockBackend;
    use crate::naming::StorageKind;
    use crate::network::{ForwardMode, NetworkDescriptor};
    use crate::runner::MockRunner;
    use crate::storage::{BasicStorage, RootStorage};

    struct Fixture {
        _vms: tempfile::TempDir,
        _isos: tempfile::TempDir,
        backend: Arc<MockBackend>,
        storage: StorageReconciler,
        networks: NetworkReconciler,
        instances: InstanceReconciler,
    }

    fn fixture() -> Fixture {
        let vms = tempfile::tempdir().unwrap();
        let isos = tempfile::tempdir().unwrap();
        std::fs::write(isos.path().join("debian.qcow2"), b"").unwrap();

        let backend = Arc::new(MockBackend::new());
        backend.add_pool("vms", vms.path()).unwrap();
        backend.add_pool("isos", isos.path()).unwrap();

        let runner = Arc::new(MockRunner::new());
        let storage = StorageReconciler::new(backend.clone(), runner);
        let networks = NetworkReconciler::new(backend.clone());
        let instances = InstanceReconciler::new(backend.clone(), storage.clone(), networks.clone());

        Fixture { _vms: vms, _isos: isos, backend, storage, networks, instances }
    }

    async fn descriptor(fx: &Fixture) -> InstanceDescriptor {
        let root = StorageDescriptor::Root(
            RootStorage::new("web01", "vms", "vda".parse().unwrap())
                .with_size("10G")
                .with_image("debian.qcow2", "isos"),
        );
        let data = StorageDescriptor::Basic(
            BasicStorage::new("web01", "vms", "vdb".parse().unwrap()).with_size("5G"),
        );

        let mut storages = Vec::new();
        for descriptor in [root, data] {
            let volume = fx.storage.ensure(&descriptor).await.unwrap();
            storages.push(AttachedStorage { descriptor, volume });
        }

        let lan = NetworkDescriptor::new("lan", "10.0.0.1/24", ForwardMode::Nat)
            .with_dhcp(Some("10.0.0.10"), Some("10.0.0.100"));
        let handle = fx.networks.ensure(&lan).await.unwrap();
        let nic = fx.networks.bind(&handle, "web01", Some("10.0.0.20"), &[]).await.unwrap();

        InstanceDescriptor {
            name: "web01".to_string(),
            vcpu: 2,
            ram_mib: 1024,
            shared_ram: false,
            storages,
            nics: vec![nic],
        }
    }

    #[tokio::test]
    async fn test_create_then_create_again() {
        let fx = fixture();
        let desc = descriptor(&fx).await;

        assert_eq!(fx.instances.state("web01").await.unwrap(), InstanceState::Absent);

        let first = fx.instances.create(&desc).await.unwrap();
        assert!(first.created);
        assert_eq!(fx.instances.state("web01").await.unwrap(), InstanceState::Running);

        let mut changed = desc.clone();
        changed.vcpu = 8;
        let second = fx.instances.create(&changed).await.unwrap();
        assert!(!second.created);
        assert_eq!(second.domain.uuid, first.domain.uuid);

        let xml = fx.backend.domain_xml(&first.domain).await.unwrap();
        assert!(xml.contains("<vcpu placement='static'>2</vcpu>"));
    }

    #[tokio::test]
    async fn test_definition_failure_carries_xml() {
        let fx = fixture();
        let desc = descriptor(&fx).await;
        fx.backend.fail_define_domain("unsupported machine").unwrap();

        match fx.instances.create(&desc).await {
            Err(HypervisorError::DomainDefinitionFailed { reason, xml }) => {
                assert!(reason.contains("unsupported machine"));
                assert!(xml.contains("<name>web01</name>"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(fx.instances.state("web01").await.unwrap(), InstanceState::Absent);
    }

    #[tokio::test]
    async fn test_start_failure_leaves_domain_defined() {
        let fx = fixture();
        let desc = descriptor(&fx).await;
        fx.backend.fail_start_domain("no kvm").unwrap();

        let err = fx.instances.create(&desc).await.unwrap_err();
        assert!(matches!(err, HypervisorError::DomainStartFailed(_)));
        assert_eq!(fx.instances.state("web01").await.unwrap(), InstanceState::Defining);
    }

    #[tokio::test]
    async fn test_delete_with_storage() {
        let fx = fixture();
        let desc = descriptor(&fx).await;
        fx.instances.create(&desc).await.unwrap();

        let report = fx.instances.delete("web01", true).await.unwrap();
        assert!(report.stopped);
        assert_eq!(
            report.volumes_deleted,
            vec!["web01-root-vda.qcow2".to_string(), "web01-vdb.qcow2".to_string()]
        );
        assert_eq!(report.leases_released, vec!["lan".to_string()]);
        assert!(report.warnings.is_empty());

        assert_eq!(fx.instances.state("web01").await.unwrap(), InstanceState::Absent);
        for attached in &desc.storages {
            assert!(!attached.volume.path.exists());
        }
        let lan = fx.backend.lookup_network("lan").await.unwrap();
        assert!(fx.networks.leases(&lan).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_keeps_storage_by_default() {
        let fx = fixture();
        let desc = descriptor(&fx).await;
        fx.instances.create(&desc).await.unwrap();

        let report = fx.instances.delete("web01", false).await.unwrap();
        assert!(report.volumes_deleted.is_empty());
        for attached in &desc.storages {
            assert!(attached.volume.path.exists());
            let rebuilt = StorageDescriptor::reconstruct(&attached.volume).unwrap();
            assert_ne!(rebuilt.kind(), StorageKind::Cloudinit);
        }
    }

    #[tokio::test]
    async fn test_delete_missing_instance() {
        let fx = fixture();
        let err = fx.instances.delete("ghost", true).await.unwrap_err();
        assert!(matches!(err, HypervisorError::InstanceNotFound(ref n) if n == "ghost"));
    }
}
