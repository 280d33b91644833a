//! Hypervisor connection boundary.
//!
//! The engine treats the hypervisor as an address space of named objects.
//! Every reconciler receives one shared `Arc<dyn Hypervisor>` so tests can
//! swap in [`crate::MockBackend`].

use async_trait::async_trait;
use std::path::Path;

use crate::error::Result;
use crate::types::*;

/// Operations the reconcilers need from a hypervisor connection.
///
/// Lookups fail with [`crate::HypervisorError::NotFound`] on a miss so callers
/// can tell absence apart from a broken connection.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    // =========================================================================
    // Domains
    // =========================================================================

    /// Look up a domain by name.
    async fn lookup_domain(&self, name: &str) -> Result<DomainHandle>;

    /// Define a persistent domain from XML (does not start it).
    async fn define_domain(&self, xml: &str) -> Result<DomainHandle>;

    /// Boot a defined domain.
    async fn start_domain(&self, domain: &DomainHandle) -> Result<()>;

    /// Power off a running domain immediately.
    async fn destroy_domain(&self, domain: &DomainHandle) -> Result<()>;

    /// Remove a stopped domain's persistent definition.
    async fn undefine_domain(&self, domain: &DomainHandle) -> Result<()>;

    /// Whether the domain is currently running.
    async fn domain_is_active(&self, domain: &DomainHandle) -> Result<bool>;

    /// Current XML description of the domain.
    async fn domain_xml(&self, domain: &DomainHandle) -> Result<String>;

    // =========================================================================
    // Networks
    // =========================================================================

    /// Look up a virtual network by name.
    async fn lookup_network(&self, name: &str) -> Result<NetworkHandle>;

    /// Define a persistent network from XML (does not start it).
    async fn define_network(&self, xml: &str) -> Result<NetworkHandle>;

    /// Start a defined network.
    async fn start_network(&self, network: &NetworkHandle) -> Result<()>;

    /// Current XML description of the network, including DHCP hosts.
    async fn network_xml(&self, network: &NetworkHandle) -> Result<String>;

    /// Edit the DHCP host section, affecting both live and persistent config.
    async fn update_network(
        &self,
        network: &NetworkHandle,
        update: NetworkUpdate,
        xml: &str,
    ) -> Result<()>;

    // =========================================================================
    // Storage
    // =========================================================================

    /// Look up a storage pool by name.
    async fn lookup_pool(&self, name: &str) -> Result<PoolHandle>;

    /// XML description of the pool (carries `<target><path>`).
    async fn pool_xml(&self, pool: &PoolHandle) -> Result<String>;

    /// Rescan the pool so files written out of band become volumes.
    async fn refresh_pool(&self, pool: &PoolHandle) -> Result<()>;

    /// Look up a volume by name inside a pool.
    async fn lookup_volume(&self, pool: &PoolHandle, name: &str) -> Result<VolumeHandle>;

    /// Look up a volume by the absolute path of its file.
    async fn lookup_volume_by_path(&self, path: &Path) -> Result<VolumeHandle>;

    /// Wipe and remove a volume.
    async fn delete_volume(&self, volume: &VolumeHandle) -> Result<()>;

    // =========================================================================
    // Interfaces
    // =========================================================================

    /// Every MAC address currently known to the hypervisor.
    async fn list_interface_macs(&self) -> Result<Vec<String>>;
}
