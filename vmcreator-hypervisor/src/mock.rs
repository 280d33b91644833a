//! Mock hypervisor backend for testing and development.

use async_trait::async_trait;
use quick_xml::escape::escape;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, info, instrument};

use crate::error::{HypervisorError, ResourceKind, Result};
use crate::network::Lease;
use crate::traits::Hypervisor;
use crate::types::*;
use crate::xml;

/// Mock hypervisor backend for testing.
///
/// Domains and networks live in memory. Storage pools are backed by real
/// directories so that `qemu-img`/`genisoimage` output (or the files a
/// [`crate::MockRunner`] materialises) shows up after [`Hypervisor::refresh_pool`],
/// the same way it does with a libvirt `dir` pool.
pub struct MockBackend {
    domains: RwLock<HashMap<String, MockDomain>>,
    networks: RwLock<HashMap<String, MockNetwork>>,
    pools: RwLock<HashMap<String, MockPool>>,
    host_macs: RwLock<Vec<String>>,
    failures: RwLock<MockFailures>,
}

struct MockDomain {
    uuid: String,
    xml: String,
    active: bool,
}

struct MockNetwork {
    xml: String,
    active: bool,
    hosts: Vec<Lease>,
}

struct MockPool {
    path: PathBuf,
    /// Volume names seen at the last refresh
    volumes: BTreeSet<String>,
}

#[derive(Default)]
struct MockFailures {
    define_domain: Option<String>,
    start_domain: Option<String>,
}

fn poisoned<T>(_: T) -> HypervisorError {
    HypervisorError::Internal("Lock poisoned".to_string())
}

impl MockBackend {
    /// Create a new mock backend.
    pub fn new() -> Self {
        info!("Creating mock hypervisor backend");
        Self {
            domains: RwLock::new(HashMap::new()),
            networks: RwLock::new(HashMap::new()),
            pools: RwLock::new(HashMap::new()),
            host_macs: RwLock::new(Vec::new()),
            failures: RwLock::new(MockFailures::default()),
        }
    }

    /// Register a directory-backed storage pool and scan it.
    pub fn add_pool(&self, name: &str, path: impl Into<PathBuf>) -> Result<()> {
        let path = path.into();
        let volumes = scan_dir(&path)?;
        self.pools
            .write()
            .map_err(poisoned)?
            .insert(name.to_string(), MockPool { path, volumes });
        Ok(())
    }

    /// Pretend a host interface with this MAC exists.
    pub fn add_host_mac(&self, mac: &str) -> Result<()> {
        self.host_macs.write().map_err(poisoned)?.push(mac.to_ascii_lowercase());
        Ok(())
    }

    /// Make the next domain definitions fail with `reason`.
    pub fn fail_define_domain(&self, reason: &str) -> Result<()> {
        self.failures.write().map_err(poisoned)?.define_domain = Some(reason.to_string());
        Ok(())
    }

    /// Make the next domain starts fail with `reason`.
    pub fn fail_start_domain(&self, reason: &str) -> Result<()> {
        self.failures.write().map_err(poisoned)?.start_domain = Some(reason.to_string());
        Ok(())
    }

    /// Names of all defined domains, sorted.
    pub fn domain_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .domains
            .read()
            .map(|d| d.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Names of all defined networks, sorted.
    pub fn network_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .networks
            .read()
            .map(|n| n.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    pub fn network_is_active(&self, name: &str) -> bool {
        self.networks
            .read()
            .map(|n| n.get(name).map(|n| n.active).unwrap_or(false))
            .unwrap_or(false)
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn scan_dir(path: &Path) -> Result<BTreeSet<String>> {
    let mut volumes = BTreeSet::new();
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            volumes.insert(entry.file_name().to_string_lossy().into_owned());
        }
    }
    Ok(volumes)
}

/// Splice DHCP host entries into a stored network description.
fn render_network(xml: &str, hosts: &[Lease]) -> String {
    if hosts.is_empty() {
        return xml.to_string();
    }

    let entries: String = hosts
        .iter()
        .map(|h| format!("      {}\n", xml::dhcp_host_xml(h)))
        .collect();

    if let Some(pos) = xml.find("    </dhcp>") {
        let mut out = xml.to_string();
        out.insert_str(pos, &entries);
        out
    } else if let Some(pos) = xml.find("  </ip>") {
        let mut out = xml.to_string();
        out.insert_str(pos, &format!("    <dhcp>\n{}    </dhcp>\n", entries));
        out
    } else {
        xml.to_string()
    }
}

#[async_trait]
impl Hypervisor for MockBackend {
    // =========================================================================
    // Domains
    // =========================================================================

    async fn lookup_domain(&self, name: &str) -> Result<DomainHandle> {
        let domains = self.domains.read().map_err(poisoned)?;
        let domain = domains
            .get(name)
            .ok_or_else(|| HypervisorError::not_found(ResourceKind::Domain, name))?;
        Ok(DomainHandle { name: name.to_string(), uuid: domain.uuid.clone() })
    }

    #[instrument(skip(self, xml))]
    async fn define_domain(&self, xml: &str) -> Result<DomainHandle> {
        if let Some(reason) = self.failures.read().map_err(poisoned)?.define_domain.clone() {
            return Err(HypervisorError::Internal(reason));
        }

        let name = xml::object_name(xml)?;
        let mut domains = self.domains.write().map_err(poisoned)?;
        let domain = domains.entry(name.clone()).or_insert_with(|| MockDomain {
            uuid: uuid::Uuid::new_v4().to_string(),
            xml: String::new(),
            active: false,
        });
        domain.xml = xml.to_string();

        info!(domain = %name, uuid = %domain.uuid, "Mock domain defined");
        Ok(DomainHandle { name, uuid: domain.uuid.clone() })
    }

    #[instrument(skip(self), fields(domain = %domain.name))]
    async fn start_domain(&self, domain: &DomainHandle) -> Result<()> {
        if let Some(reason) = self.failures.read().map_err(poisoned)?.start_domain.clone() {
            return Err(HypervisorError::Internal(reason));
        }

        let mut domains = self.domains.write().map_err(poisoned)?;
        let entry = domains
            .get_mut(&domain.name)
            .ok_or_else(|| HypervisorError::not_found(ResourceKind::Domain, &domain.name))?;
        if entry.active {
            return Err(HypervisorError::Internal("domain is already running".to_string()));
        }
        entry.active = true;

        info!("Mock domain started");
        Ok(())
    }

    #[instrument(skip(self), fields(domain = %domain.name))]
    async fn destroy_domain(&self, domain: &DomainHandle) -> Result<()> {
        let mut domains = self.domains.write().map_err(poisoned)?;
        let entry = domains
            .get_mut(&domain.name)
            .ok_or_else(|| HypervisorError::not_found(ResourceKind::Domain, &domain.name))?;
        if !entry.active {
            return Err(HypervisorError::Internal("domain is not running".to_string()));
        }
        entry.active = false;

        info!("Mock domain destroyed");
        Ok(())
    }

    #[instrument(skip(self), fields(domain = %domain.name))]
    async fn undefine_domain(&self, domain: &DomainHandle) -> Result<()> {
        let mut domains = self.domains.write().map_err(poisoned)?;
        domains
            .remove(&domain.name)
            .ok_or_else(|| HypervisorError::not_found(ResourceKind::Domain, &domain.name))?;

        info!("Mock domain undefined");
        Ok(())
    }

    async fn domain_is_active(&self, domain: &DomainHandle) -> Result<bool> {
        let domains = self.domains.read().map_err(poisoned)?;
        domains
            .get(&domain.name)
            .map(|d| d.active)
            .ok_or_else(|| HypervisorError::not_found(ResourceKind::Domain, &domain.name))
    }

    async fn domain_xml(&self, domain: &DomainHandle) -> Result<String> {
        let domains = self.domains.read().map_err(poisoned)?;
        domains
            .get(&domain.name)
            .map(|d| d.xml.clone())
            .ok_or_else(|| HypervisorError::not_found(ResourceKind::Domain, &domain.name))
    }

    // =========================================================================
    // Networks
    // =========================================================================

    async fn lookup_network(&self, name: &str) -> Result<NetworkHandle> {
        let networks = self.networks.read().map_err(poisoned)?;
        if networks.contains_key(name) {
            Ok(NetworkHandle { name: name.to_string() })
        } else {
            Err(HypervisorError::not_found(ResourceKind::Network, name))
        }
    }

    #[instrument(skip(self, xml))]
    async fn define_network(&self, xml: &str) -> Result<NetworkHandle> {
        let name = xml::object_name(xml)?;
        // Reject anything the real daemon would choke on.
        xml::dhcp_hosts(xml)?;

        let mut networks = self.networks.write().map_err(poisoned)?;
        networks.insert(
            name.clone(),
            MockNetwork { xml: xml.to_string(), active: false, hosts: Vec::new() },
        );

        info!(network = %name, "Mock network defined");
        Ok(NetworkHandle { name })
    }

    #[instrument(skip(self), fields(network = %network.name))]
    async fn start_network(&self, network: &NetworkHandle) -> Result<()> {
        let mut networks = self.networks.write().map_err(poisoned)?;
        let entry = networks
            .get_mut(&network.name)
            .ok_or_else(|| HypervisorError::not_found(ResourceKind::Network, &network.name))?;
        if entry.active {
            return Err(HypervisorError::Internal("network is already active".to_string()));
        }
        entry.active = true;

        info!("Mock network started");
        Ok(())
    }

    async fn network_xml(&self, network: &NetworkHandle) -> Result<String> {
        let networks = self.networks.read().map_err(poisoned)?;
        networks
            .get(&network.name)
            .map(|n| render_network(&n.xml, &n.hosts))
            .ok_or_else(|| HypervisorError::not_found(ResourceKind::Network, &network.name))
    }

    #[instrument(skip(self, xml), fields(network = %network.name))]
    async fn update_network(
        &self,
        network: &NetworkHandle,
        update: NetworkUpdate,
        xml: &str,
    ) -> Result<()> {
        let parsed = xml::dhcp_hosts(&format!("<dhcp>{}</dhcp>", xml))?;
        let host = parsed
            .into_iter()
            .next()
            .ok_or_else(|| HypervisorError::XmlError(format!("not a DHCP host entry: {}", xml)))?;

        let mut networks = self.networks.write().map_err(poisoned)?;
        let entry = networks
            .get_mut(&network.name)
            .ok_or_else(|| HypervisorError::not_found(ResourceKind::Network, &network.name))?;

        match update {
            NetworkUpdate::AddDhcpHost => {
                if entry.hosts.iter().any(|h| h.mac == host.mac) {
                    return Err(HypervisorError::Internal(format!(
                        "there is an existing dhcp host entry for MAC {}",
                        host.mac
                    )));
                }
                debug!(mac = %host.mac, "Mock DHCP host added");
                entry.hosts.push(host);
            }
            NetworkUpdate::DeleteDhcpHost => {
                let before = entry.hosts.len();
                entry.hosts.retain(|h| h.mac != host.mac);
                if entry.hosts.len() == before {
                    return Err(HypervisorError::Internal(format!(
                        "couldn't locate a matching dhcp host entry for MAC {}",
                        host.mac
                    )));
                }
                debug!(mac = %host.mac, "Mock DHCP host removed");
            }
        }

        Ok(())
    }

    // =========================================================================
    // Storage
    // =========================================================================

    async fn lookup_pool(&self, name: &str) -> Result<PoolHandle> {
        let pools = self.pools.read().map_err(poisoned)?;
        if pools.contains_key(name) {
            Ok(PoolHandle { name: name.to_string() })
        } else {
            Err(HypervisorError::not_found(ResourceKind::StoragePool, name))
        }
    }

    async fn pool_xml(&self, pool: &PoolHandle) -> Result<String> {
        let pools = self.pools.read().map_err(poisoned)?;
        let entry = pools
            .get(&pool.name)
            .ok_or_else(|| HypervisorError::not_found(ResourceKind::StoragePool, &pool.name))?;
        Ok(format!(
            "<pool type='dir'>\n  <name>{}</name>\n  <target>\n    <path>{}</path>\n  </target>\n</pool>\n",
            escape(&pool.name),
            escape(&entry.path.to_string_lossy())
        ))
    }

    #[instrument(skip(self), fields(pool = %pool.name))]
    async fn refresh_pool(&self, pool: &PoolHandle) -> Result<()> {
        let mut pools = self.pools.write().map_err(poisoned)?;
        let entry = pools
            .get_mut(&pool.name)
            .ok_or_else(|| HypervisorError::not_found(ResourceKind::StoragePool, &pool.name))?;
        entry.volumes = scan_dir(&entry.path)?;
        debug!(volumes = entry.volumes.len(), "Mock pool refreshed");
        Ok(())
    }

    async fn lookup_volume(&self, pool: &PoolHandle, name: &str) -> Result<VolumeHandle> {
        let pools = self.pools.read().map_err(poisoned)?;
        let entry = pools
            .get(&pool.name)
            .ok_or_else(|| HypervisorError::not_found(ResourceKind::StoragePool, &pool.name))?;
        if !entry.volumes.contains(name) {
            return Err(HypervisorError::not_found(ResourceKind::StorageVolume, name));
        }
        Ok(VolumeHandle {
            pool: pool.name.clone(),
            name: name.to_string(),
            path: entry.path.join(name),
        })
    }

    async fn lookup_volume_by_path(&self, path: &Path) -> Result<VolumeHandle> {
        let pools = self.pools.read().map_err(poisoned)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        pools
            .iter()
            .find(|(_, p)| Some(p.path.as_path()) == path.parent() && p.volumes.contains(&name))
            .map(|(pool, p)| VolumeHandle {
                pool: pool.clone(),
                name: name.clone(),
                path: p.path.join(&name),
            })
            .ok_or_else(|| {
                HypervisorError::not_found(ResourceKind::StorageVolume, path.to_string_lossy())
            })
    }

    #[instrument(skip(self), fields(volume = %volume.name))]
    async fn delete_volume(&self, volume: &VolumeHandle) -> Result<()> {
        let mut pools = self.pools.write().map_err(poisoned)?;
        let entry = pools
            .get_mut(&volume.pool)
            .ok_or_else(|| HypervisorError::not_found(ResourceKind::StoragePool, &volume.pool))?;
        if !entry.volumes.remove(&volume.name) {
            return Err(HypervisorError::not_found(ResourceKind::StorageVolume, &volume.name));
        }

        let path = entry.path.join(&volume.name);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }

        info!("Mock volume deleted");
        Ok(())
    }

    // =========================================================================
    // Interfaces
    // =========================================================================

    async fn list_interface_macs(&self) -> Result<Vec<String>> {
        let mut macs = self.host_macs.read().map_err(poisoned)?.clone();
        let domains = self.domains.read().map_err(poisoned)?;
        for domain in domains.values() {
            macs.extend(xml::interface_macs(&domain.xml)?);
        }
        Ok(macs)
    }
}
