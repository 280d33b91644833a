//! Libvirt backend implementation.

use async_trait::async_trait;
use std::path::Path;
use tracing::{debug, info, instrument};
use virt::connect::Connect;
use virt::domain::Domain;
use virt::error::ErrorNumber;
use virt::network::Network;
use virt::storage_pool::StoragePool;
use virt::storage_vol::StorageVol;
use virt::sys;

use crate::error::{HypervisorError, ResourceKind, Result};
use crate::traits::Hypervisor;
use crate::types::*;
use crate::xml;

/// Libvirt/QEMU hypervisor backend.
pub struct LibvirtBackend {
    uri: String,
    connection: Connect,
}

impl LibvirtBackend {
    /// Create a new libvirt backend connected to the specified URI.
    ///
    /// Common URIs:
    /// - `qemu:///system` - System-wide QEMU/KVM
    /// - `qemu:///session` - User session QEMU
    /// - `qemu+ssh://user@host/system` - Remote via SSH
    pub async fn new(uri: &str) -> Result<Self> {
        info!(uri = %uri, "Connecting to libvirt");

        let connection = Connect::open(Some(uri))
            .map_err(|e| HypervisorError::ConnectionFailed(e.to_string()))?;

        info!("Connected to libvirt");

        Ok(Self { uri: uri.to_string(), connection })
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    fn domain(&self, name: &str) -> Result<Domain> {
        Domain::lookup_by_name(&self.connection, name)
            .map_err(|e| lookup_error(ResourceKind::Domain, name, e))
    }

    fn network(&self, name: &str) -> Result<Network> {
        Network::lookup_by_name(&self.connection, name)
            .map_err(|e| lookup_error(ResourceKind::Network, name, e))
    }

    fn pool(&self, name: &str) -> Result<StoragePool> {
        StoragePool::lookup_by_name(&self.connection, name)
            .map_err(|e| lookup_error(ResourceKind::StoragePool, name, e))
    }

    fn volume_handle(pool: &str, vol: &StorageVol) -> Result<VolumeHandle> {
        Ok(VolumeHandle {
            pool: pool.to_string(),
            name: vol.get_name().map_err(internal)?,
            path: vol.get_path().map_err(internal)?.into(),
        })
    }
}

/// Tell "no such object" apart from every other libvirt failure.
fn lookup_error(kind: ResourceKind, name: &str, e: virt::error::Error) -> HypervisorError {
    match e.code() {
        ErrorNumber::NoDomain
        | ErrorNumber::NoNetwork
        | ErrorNumber::NoStoragePool
        | ErrorNumber::NoStorageVol => HypervisorError::not_found(kind, name),
        _ => HypervisorError::Internal(format!("{} lookup failed for {}: {}", kind, name, e)),
    }
}

fn internal(e: virt::error::Error) -> HypervisorError {
    HypervisorError::Internal(e.to_string())
}

#[async_trait]
impl Hypervisor for LibvirtBackend {
    // =========================================================================
    // Domains
    // =========================================================================

    async fn lookup_domain(&self, name: &str) -> Result<DomainHandle> {
        let domain = self.domain(name)?;
        let uuid = domain.get_uuid_string().map_err(internal)?;
        Ok(DomainHandle { name: name.to_string(), uuid })
    }

    #[instrument(skip(self, xml))]
    async fn define_domain(&self, xml: &str) -> Result<DomainHandle> {
        let domain = Domain::define_xml(&self.connection, xml).map_err(internal)?;
        let name = domain.get_name().map_err(internal)?;
        let uuid = domain.get_uuid_string().map_err(internal)?;

        info!(domain = %name, uuid = %uuid, "Domain defined");
        Ok(DomainHandle { name, uuid })
    }

    #[instrument(skip(self), fields(domain = %domain.name))]
    async fn start_domain(&self, domain: &DomainHandle) -> Result<()> {
        self.domain(&domain.name)?.create().map_err(internal)?;
        info!("Domain started");
        Ok(())
    }

    #[instrument(skip(self), fields(domain = %domain.name))]
    async fn destroy_domain(&self, domain: &DomainHandle) -> Result<()> {
        self.domain(&domain.name)?.destroy().map_err(internal)?;
        info!("Domain destroyed");
        Ok(())
    }

    #[instrument(skip(self), fields(domain = %domain.name))]
    async fn undefine_domain(&self, domain: &DomainHandle) -> Result<()> {
        self.domain(&domain.name)?.undefine().map_err(internal)?;
        info!("Domain undefined");
        Ok(())
    }

    async fn domain_is_active(&self, domain: &DomainHandle) -> Result<bool> {
        self.domain(&domain.name)?.is_active().map_err(internal)
    }

    async fn domain_xml(&self, domain: &DomainHandle) -> Result<String> {
        self.domain(&domain.name)?.get_xml_desc(0).map_err(internal)
    }

    // =========================================================================
    // Networks
    // =========================================================================

    async fn lookup_network(&self, name: &str) -> Result<NetworkHandle> {
        self.network(name)?;
        Ok(NetworkHandle { name: name.to_string() })
    }

    #[instrument(skip(self, xml))]
    async fn define_network(&self, xml: &str) -> Result<NetworkHandle> {
        let network = Network::define_xml(&self.connection, xml).map_err(internal)?;
        let name = network.get_name().map_err(internal)?;

        info!(network = %name, "Network defined");
        Ok(NetworkHandle { name })
    }

    #[instrument(skip(self), fields(network = %network.name))]
    async fn start_network(&self, network: &NetworkHandle) -> Result<()> {
        self.network(&network.name)?.create().map_err(internal)?;
        info!("Network started");
        Ok(())
    }

    async fn network_xml(&self, network: &NetworkHandle) -> Result<String> {
        self.network(&network.name)?.get_xml_desc(0).map_err(internal)
    }

    #[instrument(skip(self, xml), fields(network = %network.name))]
    async fn update_network(
        &self,
        network: &NetworkHandle,
        update: NetworkUpdate,
        xml: &str,
    ) -> Result<()> {
        let command = match update {
            NetworkUpdate::AddDhcpHost => sys::VIR_NETWORK_UPDATE_COMMAND_ADD_LAST,
            NetworkUpdate::DeleteDhcpHost => sys::VIR_NETWORK_UPDATE_COMMAND_DELETE,
        };
        let flags = sys::VIR_NETWORK_UPDATE_AFFECT_LIVE | sys::VIR_NETWORK_UPDATE_AFFECT_CONFIG;

        debug!(update = ?update, entry = %xml, "Updating network DHCP hosts");
        self.network(&network.name)?
            .update(command, sys::VIR_NETWORK_SECTION_IP_DHCP_HOST, -1, xml, flags)
            .map_err(internal)?;
        Ok(())
    }

    // =========================================================================
    // Storage
    // =========================================================================

    async fn lookup_pool(&self, name: &str) -> Result<PoolHandle> {
        self.pool(name)?;
        Ok(PoolHandle { name: name.to_string() })
    }

    async fn pool_xml(&self, pool: &PoolHandle) -> Result<String> {
        self.pool(&pool.name)?.get_xml_desc(0).map_err(internal)
    }

    #[instrument(skip(self), fields(pool = %pool.name))]
    async fn refresh_pool(&self, pool: &PoolHandle) -> Result<()> {
        self.pool(&pool.name)?.refresh(0).map_err(internal)?;
        debug!("Pool refreshed");
        Ok(())
    }

    async fn lookup_volume(&self, pool: &PoolHandle, name: &str) -> Result<VolumeHandle> {
        let storage_pool = self.pool(&pool.name)?;
        let vol = StorageVol::lookup_by_name(&storage_pool, name)
            .map_err(|e| lookup_error(ResourceKind::StorageVolume, name, e))?;
        Self::volume_handle(&pool.name, &vol)
    }

    async fn lookup_volume_by_path(&self, path: &Path) -> Result<VolumeHandle> {
        let display = path.to_string_lossy();
        let vol = StorageVol::lookup_by_path(&self.connection, &display)
            .map_err(|e| lookup_error(ResourceKind::StorageVolume, &display, e))?;
        let pool = StoragePool::lookup_by_volume(&vol)
            .map_err(|e| lookup_error(ResourceKind::StoragePool, &display, e))?;
        let pool_name = pool.get_name().map_err(internal)?;
        Self::volume_handle(&pool_name, &vol)
    }

    #[instrument(skip(self), fields(volume = %volume.name))]
    async fn delete_volume(&self, volume: &VolumeHandle) -> Result<()> {
        let storage_pool = self.pool(&volume.pool)?;
        let vol = StorageVol::lookup_by_name(&storage_pool, &volume.name)
            .map_err(|e| lookup_error(ResourceKind::StorageVolume, &volume.name, e))?;

        vol.wipe(0).map_err(internal)?;
        vol.delete(0).map_err(internal)?;

        info!("Volume deleted");
        Ok(())
    }

    // =========================================================================
    // Interfaces
    // =========================================================================

    async fn list_interface_macs(&self) -> Result<Vec<String>> {
        let mut macs = Vec::new();

        for iface in self.connection.list_all_interfaces(0).map_err(internal)? {
            macs.push(iface.get_mac_string().map_err(internal)?.to_ascii_lowercase());
        }

        // Guest NICs only show up in domain descriptions.
        for domain in self.connection.list_all_domains(0).map_err(internal)? {
            let desc = domain.get_xml_desc(0).map_err(internal)?;
            macs.extend(xml::interface_macs(&desc)?);
        }

        debug!(count = macs.len(), "Listed interface MACs");
        Ok(macs)
    }
}
