//! Virtual network and static DHCP lease reconciliation.
//!
//! The network's live XML description is the only lease store: every lookup
//! re-reads it, and every change is applied to both the live and persistent
//! configuration so it survives a daemon restart.

use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use super::types::{Lease, LeaseQuery, NetworkDescriptor, NicBinding};
use crate::address::{allocate_mac_excluding, MacAddress};
use crate::error::{HypervisorError, Result};
use crate::traits::Hypervisor;
use crate::types::{NetworkHandle, NetworkUpdate};
use crate::xml::{dhcp_host_xml, dhcp_hosts, NetworkXmlBuilder};

/// Ensures networks exist and manages their DHCP host entries.
#[derive(Clone)]
pub struct NetworkReconciler {
    hypervisor: Arc<dyn Hypervisor>,
}

impl NetworkReconciler {
    pub fn new(hypervisor: Arc<dyn Hypervisor>) -> Self {
        Self { hypervisor }
    }

    /// Return the network for `descriptor`, defining and starting it if absent.
    ///
    /// An existing network is returned as is, whatever its configuration.
    #[instrument(skip(self, descriptor), fields(network = %descriptor.name))]
    pub async fn ensure(&self, descriptor: &NetworkDescriptor) -> Result<NetworkHandle> {
        match self.hypervisor.lookup_network(&descriptor.name).await {
            Ok(handle) => {
                debug!("Network already defined");
                return Ok(handle);
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let xml = NetworkXmlBuilder::new(descriptor).build()?;
        debug!(xml = %xml, "Defining network");

        let handle = self.hypervisor.define_network(&xml).await?;
        self.hypervisor.start_network(&handle).await?;

        info!(mode = ?descriptor.mode, dhcp = descriptor.dhcp.is_some(), "Network created");
        Ok(handle)
    }

    /// Networks are shared infrastructure and are never removed here.
    pub async fn delete(&self, handle: &NetworkHandle) -> Result<()> {
        Err(HypervisorError::NotImplemented(format!(
            "deleting network {} is not supported",
            handle.name
        )))
    }

    /// Current static DHCP host entries of a network.
    pub async fn leases(&self, handle: &NetworkHandle) -> Result<Vec<Lease>> {
        let xml = self.hypervisor.network_xml(handle).await?;
        dhcp_hosts(&xml)
    }

    /// First lease matching the query's hostname, else its IP.
    pub async fn find_lease(
        &self,
        handle: &NetworkHandle,
        query: &LeaseQuery,
    ) -> Result<Option<Lease>> {
        let leases = self.leases(handle).await?;

        if let Some(ref hostname) = query.hostname {
            if let Some(lease) = leases.iter().find(|l| l.hostname.as_ref() == Some(hostname)) {
                return Ok(Some(lease.clone()));
            }
        }

        if let Some(ref ip) = query.ip {
            if let Some(lease) = leases.iter().find(|l| l.ip.as_ref() == Some(ip)) {
                return Ok(Some(lease.clone()));
            }
        }

        Ok(None)
    }

    /// Register `lease` unless an entry for its MAC already exists.
    ///
    /// Returns the entry that is in effect afterwards.
    #[instrument(skip(self, lease), fields(network = %handle.name, mac = %lease.mac))]
    pub async fn ensure_lease(&self, handle: &NetworkHandle, lease: &Lease) -> Result<Lease> {
        if let Some(existing) = self.lease_for(handle, &lease.mac).await? {
            debug!("Lease already exists");
            return Ok(existing);
        }

        self.hypervisor
            .update_network(handle, NetworkUpdate::AddDhcpHost, &dhcp_host_xml(lease))
            .await?;

        info!(hostname = ?lease.hostname, ip = ?lease.ip, "Lease added");
        Ok(lease.clone())
    }

    /// Remove the entry for `mac`. Returns whether one existed.
    #[instrument(skip(self), fields(network = %handle.name, mac = %mac))]
    pub async fn release_lease(&self, handle: &NetworkHandle, mac: &MacAddress) -> Result<bool> {
        let Some(existing) = self.lease_for(handle, mac).await? else {
            debug!("No lease to release");
            return Ok(false);
        };

        self.hypervisor
            .update_network(handle, NetworkUpdate::DeleteDhcpHost, &dhcp_host_xml(&existing))
            .await?;

        info!("Lease released");
        Ok(true)
    }

    /// Attach `vm_name` to a network.
    ///
    /// A previous lease of this VM is reused so repeated installs keep their
    /// MACs: with `ip`, the entry holding that address (named after the VM
    /// or unnamed); without, the entry named after the VM. Entries whose MAC
    /// is in `reserved` (NICs already bound in this run) are never reused.
    /// Otherwise a fresh MAC is allocated. A static lease is only registered
    /// when `ip` is given.
    #[instrument(skip(self, reserved), fields(network = %handle.name))]
    pub async fn bind(
        &self,
        handle: &NetworkHandle,
        vm_name: &str,
        ip: Option<&str>,
        reserved: &[MacAddress],
    ) -> Result<NicBinding> {
        let leases: Vec<Lease> = self
            .leases(handle)
            .await?
            .into_iter()
            .filter(|l| !reserved.contains(&l.mac))
            .collect();
        let named = |l: &&Lease| l.hostname.as_deref() == Some(vm_name);

        let previous = match ip {
            Some(ip) => match leases.iter().find(|l| l.ip.as_deref() == Some(ip)) {
                Some(lease) if lease.hostname.is_none() || named(&lease) => Some(lease.clone()),
                Some(lease) => {
                    return Err(HypervisorError::InvalidConfig(format!(
                        "{} on {} is already leased to {}",
                        ip,
                        handle.name,
                        lease.hostname.as_deref().unwrap_or_default()
                    )));
                }
                None => {
                    if let Some(stale) = leases.iter().find(named) {
                        warn!(
                            mac = %stale.mac,
                            leased = ?stale.ip,
                            requested = %ip,
                            "VM holds a lease for another address; allocating a new MAC"
                        );
                    }
                    None
                }
            },
            None => leases.iter().find(named).cloned(),
        };

        let mac = match previous {
            Some(ref lease) => {
                debug!(mac = %lease.mac, "Reusing MAC from existing lease");
                lease.mac
            }
            None => allocate_mac_excluding(self.hypervisor.as_ref(), reserved).await?,
        };

        let lease = match ip {
            Some(ip) => {
                let wanted = Lease {
                    mac,
                    hostname: Some(vm_name.to_string()),
                    ip: Some(ip.to_string()),
                };
                Some(self.ensure_lease(handle, &wanted).await?)
            }
            None => previous,
        };

        Ok(NicBinding { network: handle.name.clone(), mac, lease })
    }

    async fn lease_for(&self, handle: &NetworkHandle, mac: &MacAddress) -> Result<Option<Lease>> {
        Ok(self.leases(handle).await?.into_iter().find(|l| &l.mac == mac))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockBackend;
    use crate::network::ForwardMode;

    fn lan() -> NetworkDescriptor {
        NetworkDescriptor::new("lan", "10.0.0.1/24", ForwardMode::Nat)
            .with_dhcp(Some("10.0.0.10"), Some("10.0.0.100"))
    }

    fn setup() -> (Arc<MockBackend>, NetworkReconciler) {
        let backend = Arc::new(MockBackend::new());
        let networks = NetworkReconciler::new(backend.clone());
        (backend, networks)
    }

    fn lease(tail: u8, name: &str, ip: &str) -> Lease {
        Lease {
            mac: MacAddress::qemu([0, 0, tail]),
            hostname: Some(name.to_string()),
            ip: Some(ip.to_string()),
        }
    }

    #[tokio::test]
    async fn test_ensure_defines_once() {
        let (backend, networks) = setup();

        let first = networks.ensure(&lan()).await.unwrap();
        let second = networks.ensure(&lan()).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(backend.network_names(), vec!["lan".to_string()]);
        assert!(backend.network_is_active("lan"));
    }

    #[test]
    fn test_partial_dhcp_range_disables_dhcp() {
        let desc = NetworkDescriptor::new("lan", "10.0.0.1/24", ForwardMode::Nat)
            .with_dhcp(Some("10.0.0.10"), None);
        assert!(desc.dhcp.is_none());
    }

    #[tokio::test]
    async fn test_delete_is_not_implemented() {
        let (_, networks) = setup();
        let handle = networks.ensure(&lan()).await.unwrap();
        assert!(matches!(
            networks.delete(&handle).await,
            Err(HypervisorError::NotImplemented(_))
        ));
    }

    #[tokio::test]
    async fn test_lease_idempotency() {
        let (_, networks) = setup();
        let handle = networks.ensure(&lan()).await.unwrap();
        let entry = lease(1, "web01", "10.0.0.20");

        networks.ensure_lease(&handle, &entry).await.unwrap();
        networks.ensure_lease(&handle, &entry).await.unwrap();
        assert_eq!(networks.leases(&handle).await.unwrap().len(), 1);

        let query = LeaseQuery { hostname: Some("web01".into()), ip: None };
        assert_eq!(networks.find_lease(&handle, &query).await.unwrap(), Some(entry.clone()));

        assert!(networks.release_lease(&handle, &entry.mac).await.unwrap());
        assert!(!networks.release_lease(&handle, &entry.mac).await.unwrap());
        assert!(networks.leases(&handle).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_find_lease_prefers_hostname() {
        let (_, networks) = setup();
        let handle = networks.ensure(&lan()).await.unwrap();
        networks.ensure_lease(&handle, &lease(1, "web01", "10.0.0.20")).await.unwrap();
        networks.ensure_lease(&handle, &lease(2, "db01", "10.0.0.21")).await.unwrap();

        let by_both = LeaseQuery { hostname: Some("db01".into()), ip: Some("10.0.0.20".into()) };
        let found = networks.find_lease(&handle, &by_both).await.unwrap().unwrap();
        assert_eq!(found.hostname.as_deref(), Some("db01"));

        let by_ip = LeaseQuery { hostname: Some("nope".into()), ip: Some("10.0.0.20".into()) };
        let found = networks.find_lease(&handle, &by_ip).await.unwrap().unwrap();
        assert_eq!(found.hostname.as_deref(), Some("web01"));

        assert!(networks.find_lease(&handle, &LeaseQuery::default()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_bind_reuses_mac_across_runs() {
        let (_, networks) = setup();
        let handle = networks.ensure(&lan()).await.unwrap();

        let first = networks.bind(&handle, "web01", Some("10.0.0.20"), &[]).await.unwrap();
        assert!(first.mac.is_qemu());
        assert_eq!(first.network, "lan");

        let second = networks.bind(&handle, "web01", Some("10.0.0.20"), &[]).await.unwrap();
        assert_eq!(first.mac, second.mac);
        assert_eq!(networks.leases(&handle).await.unwrap().len(), 1);

        let dynamic = networks.bind(&handle, "web02", None, &[]).await.unwrap();
        assert_ne!(dynamic.mac, first.mac);
        assert!(dynamic.lease.is_none());
        assert_eq!(networks.leases(&handle).await.unwrap().len(), 1);

        // Without an address the MAC still follows the hostname lease.
        let again = networks.bind(&handle, "web01", None, &[]).await.unwrap();
        assert_eq!(again.mac, first.mac);
    }

    #[tokio::test]
    async fn test_two_nics_of_one_vm_get_distinct_macs() {
        let (_, networks) = setup();
        let handle = networks.ensure(&lan()).await.unwrap();

        let first = networks.bind(&handle, "web01", Some("10.0.0.20"), &[]).await.unwrap();
        let second = networks
            .bind(&handle, "web01", Some("10.0.0.21"), &[first.mac])
            .await
            .unwrap();
        assert_ne!(first.mac, second.mac);

        let leases = networks.leases(&handle).await.unwrap();
        assert_eq!(leases.len(), 2);
        assert!(leases.iter().any(|l| l.mac == second.mac && l.ip.as_deref() == Some("10.0.0.21")));

        // A rerun reuses both MACs by address.
        let again = networks.bind(&handle, "web01", Some("10.0.0.20"), &[]).await.unwrap();
        let again2 = networks
            .bind(&handle, "web01", Some("10.0.0.21"), &[again.mac])
            .await
            .unwrap();
        assert_eq!((again.mac, again2.mac), (first.mac, second.mac));
    }

    #[tokio::test]
    async fn test_bind_rejects_address_leased_to_another_vm() {
        let (_, networks) = setup();
        let handle = networks.ensure(&lan()).await.unwrap();
        networks.ensure_lease(&handle, &lease(1, "db01", "10.0.0.20")).await.unwrap();

        let err = networks.bind(&handle, "web01", Some("10.0.0.20"), &[]).await.unwrap_err();
        assert!(matches!(err, HypervisorError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_changed_address_gets_new_mac() {
        let (_, networks) = setup();
        let handle = networks.ensure(&lan()).await.unwrap();
        networks.ensure_lease(&handle, &lease(1, "web01", "10.0.0.20")).await.unwrap();

        let nic = networks.bind(&handle, "web01", Some("10.0.0.30"), &[]).await.unwrap();
        assert_ne!(nic.mac, MacAddress::qemu([0, 0, 1]));
        assert_eq!(nic.lease.unwrap().ip.as_deref(), Some("10.0.0.30"));
    }
}
