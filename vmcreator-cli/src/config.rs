//! YAML description of the VMs to provision.
//!
//! ```yaml
//! libvirt:
//!   vm-pool: vms
//!   iso-pool: isos
//! networks:
//!   lan:
//!     ipCidr: 10.0.0.1/24
//!     mode: NAT
//!     dhcp: { enabled: true, start: 10.0.0.10, end: 10.0.0.100 }
//! services:
//!   web01:
//!     cpu: 2
//!     ram: { size: 2048 }
//!     image: debian.qcow2
//!     volumes:
//!       - { type: root, size: 10G }
//!     networks:
//!       - { name: lan, ipAddr: 10.0.0.20 }
//!     users:
//!       - { name: admin, ssh_key: ["ssh-ed25519 AAAA..."] }
//! ```
//!
//! `networks` and `services` keep file order: VMs are provisioned in the
//! order they are declared.

use anyhow::{bail, Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

use vmcreator_hypervisor::{
    BasicStorage, ForwardMode, MountPoint, NetworkDescriptor, RootStorage, SeedConfig,
    StorageDescriptor, UserSpec,
};

/// Default libvirt connection URI.
pub const DEFAULT_URI: &str = "qemu:///system";

/// Most virtio disks a VM can get (`vda` to `vdz`).
pub const MAX_VOLUMES: usize = 26;

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub libvirt: LibvirtConfig,
    #[serde(default)]
    pub networks: IndexMap<String, NetworkConfig>,
    #[serde(default)]
    pub services: IndexMap<String, ServiceConfig>,
}

/// Hypervisor connection and storage pools.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibvirtConfig {
    #[serde(default = "default_uri")]
    pub uri: String,
    /// Pool that receives VM disks and seeds
    #[serde(rename = "vm-pool")]
    pub vm_pool: String,
    /// Pool holding base images
    #[serde(rename = "iso-pool")]
    pub iso_pool: String,
}

fn default_uri() -> String {
    DEFAULT_URI.to_string()
}

/// A virtual network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Host address and prefix, e.g. `10.0.0.1/24`
    #[serde(rename = "ipCidr")]
    pub ip_cidr: String,
    #[serde(default = "default_mode")]
    pub mode: ForwardMode,
    pub domain: Option<String>,
    #[serde(default)]
    pub dhcp: DhcpConfig,
}

fn default_mode() -> ForwardMode {
    ForwardMode::Route
}

/// DHCP settings of a network.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DhcpConfig {
    pub enabled: bool,
    pub start: Option<String>,
    pub end: Option<String>,
}

/// One VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_cpu")]
    pub cpu: u32,
    #[serde(default)]
    pub ram: RamConfig,
    /// Base image (volume in the iso pool) for the root disk
    pub image: Option<String>,
    pub fqdn: Option<String>,
    pub timezone: Option<String>,
    #[serde(default)]
    pub volumes: Vec<VolumeConfig>,
    #[serde(default)]
    pub networks: Vec<NicConfig>,
    #[serde(default)]
    pub users: Vec<UserConfig>,
}

fn default_cpu() -> u32 {
    1
}

/// Guest memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RamConfig {
    /// MiB
    pub size: u64,
    pub shared: bool,
}

impl Default for RamConfig {
    fn default() -> Self {
        Self { size: 512, shared: true }
    }
}

/// Volume flavour as written in the config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeType {
    Root,
    #[default]
    Basic,
}

/// One disk of a VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeConfig {
    #[serde(rename = "type", default)]
    pub kind: VolumeType,
    #[serde(default = "default_volume_size")]
    pub size: String,
}

fn default_volume_size() -> String {
    "1G".to_string()
}

/// One NIC of a VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NicConfig {
    /// Network name, a key of the top-level `networks` map
    pub name: String,
    /// Static address; without one the NIC gets a dynamic lease
    #[serde(rename = "ipAddr")]
    pub ip_addr: Option<String>,
}

/// A guest user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    pub name: String,
    pub password: Option<String>,
    #[serde(default)]
    pub ssh_key: Vec<String>,
}

impl Config {
    /// Load and validate configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_yaml(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    /// Parse and validate configuration from YAML text.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Config =
            serde_yaml::from_str(content).with_context(|| "Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross references the YAML schema cannot express.
    pub fn validate(&self) -> Result<()> {
        for (vm, service) in &self.services {
            validate_service_name(vm)?;

            for nic in &service.networks {
                if !self.networks.contains_key(&nic.name) {
                    bail!("service {} references undeclared network {}", vm, nic.name);
                }
            }

            let roots = service.volumes.iter().filter(|v| v.kind == VolumeType::Root).count();
            if roots > 1 {
                bail!("service {} declares {} root volumes; at most one is allowed", vm, roots);
            }
            if roots == 1 && service.image.is_none() {
                bail!("service {} has a root volume but no image", vm);
            }

            if service.volumes.len() > MAX_VOLUMES {
                bail!(
                    "service {} declares {} volumes; at most {} are supported",
                    vm,
                    service.volumes.len(),
                    MAX_VOLUMES
                );
            }

            if service.cpu == 0 {
                bail!("service {} needs at least one vCPU", vm);
            }
        }

        Ok(())
    }
}

const ROOT_SUFFIX: &str = "-root";

/// Service names become domain names and volume file names in the pool
/// directory, so they are limited to `[A-Za-z0-9._-]`, may not start with
/// `.` or `-`, and may not end in `-root` (`<vm>-root` with a data disk on
/// `vda` would format like `<vm>`'s root disk).
fn validate_service_name(vm: &str) -> Result<()> {
    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-');

    if vm.is_empty() || !vm.chars().all(allowed) {
        bail!("service name {:?} may only contain letters, digits, '.', '_' and '-'", vm);
    }
    if vm.starts_with('.') || vm.starts_with('-') {
        bail!("service name {:?} may not start with '.' or '-'", vm);
    }
    if vm.ends_with(ROOT_SUFFIX) {
        bail!("service name {:?} may not end in {:?}", vm, ROOT_SUFFIX);
    }
    Ok(())
}

impl NetworkConfig {
    /// Engine descriptor for the network called `name`.
    pub fn descriptor(&self, name: &str) -> NetworkDescriptor {
        let mut desc = NetworkDescriptor::new(name, &self.ip_cidr, self.mode);

        if self.dhcp.enabled {
            desc = desc.with_dhcp(self.dhcp.start.as_deref(), self.dhcp.end.as_deref());
            if desc.dhcp.is_none() {
                warn!(network = %name, "DHCP enabled without a start and end address; disabling it");
            }
        }

        if let Some(ref domain) = self.domain {
            desc = desc.with_domain(domain);
        }

        desc
    }
}

impl ServiceConfig {
    /// Disk descriptors in bus order: the n-th volume is mounted on `vd<n>`.
    pub fn storage_descriptors(&self, vm: &str, libvirt: &LibvirtConfig) -> Result<Vec<StorageDescriptor>> {
        let mut storages = Vec::with_capacity(self.volumes.len());

        for (index, volume) in self.volumes.iter().enumerate() {
            let mount = MountPoint::from_index(index)?;
            let desc = match volume.kind {
                VolumeType::Root => {
                    let image = self
                        .image
                        .as_deref()
                        .with_context(|| format!("service {} has a root volume but no image", vm))?;
                    StorageDescriptor::Root(
                        RootStorage::new(vm, &libvirt.vm_pool, mount)
                            .with_size(&volume.size)
                            .with_image(image, &libvirt.iso_pool),
                    )
                }
                VolumeType::Basic => StorageDescriptor::Basic(
                    BasicStorage::new(vm, &libvirt.vm_pool, mount).with_size(&volume.size),
                ),
            };
            storages.push(desc);
        }

        Ok(storages)
    }

    /// Cloud-init inputs for this VM.
    pub fn seed_config(&self) -> SeedConfig {
        let mut seed = SeedConfig::new(self.networks.len());
        seed.fqdn = self.fqdn.clone();
        seed.timezone = self.timezone.clone();
        seed.users = self
            .users
            .iter()
            .map(|u| UserSpec {
                name: u.name.clone(),
                password: u.password.clone(),
                ssh_keys: u.ssh_key.clone(),
            })
            .collect();
        seed
    }
}
