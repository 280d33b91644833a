//! Volume naming grammar.
//!
//! Volume names are the only metadata that survives in the hypervisor, so the
//! storage kind and mount point must be recoverable from the name alone:
//!
//! ```text
//! root       <vm>-root-<mount>.qcow2     web01-root-vda.qcow2
//! basic      <vm>-<mount>.qcow2          web01-vdb.qcow2
//! cloud-init <vm>.cloudinit.iso          web01.cloudinit.iso
//! ```
//!
//! [`VolumeName::format`] and [`VolumeName::parse`] are the only places that
//! know this grammar; creation and reconstruction both go through them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{HypervisorError, Result};

const QCOW2_SUFFIX: &str = ".qcow2";
const CLOUDINIT_SUFFIX: &str = ".cloudinit.iso";
const ROOT_MARKER: &str = "root";

/// Storage flavour encoded in a volume name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Root,
    Basic,
    Cloudinit,
}

/// A virtio block device name such as `vda`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MountPoint(char);

impl MountPoint {
    /// Mount for the n-th virtio disk (0 → `vda`).
    pub fn from_index(index: usize) -> Result<Self> {
        if index >= 26 {
            return Err(HypervisorError::InvalidConfig(format!(
                "no virtio device letter for disk index {}",
                index
            )));
        }
        Ok(Self((b'a' + index as u8) as char))
    }

    pub fn letter(&self) -> char {
        self.0
    }

    /// Device name, e.g. `vdb`.
    pub fn device(&self) -> String {
        format!("vd{}", self.0)
    }
}

impl fmt::Display for MountPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vd{}", self.0)
    }
}

impl FromStr for MountPoint {
    type Err = HypervisorError;

    fn from_str(s: &str) -> Result<Self> {
        let mut chars = s.strip_prefix("vd").map(str::chars).ok_or_else(|| {
            HypervisorError::InvalidConfig(format!("not a virtio device name: {}", s))
        })?;
        match (chars.next(), chars.next()) {
            (Some(c), None) if c.is_ascii_lowercase() => Ok(Self(c)),
            _ => Err(HypervisorError::InvalidConfig(format!("not a virtio device name: {}", s))),
        }
    }
}

impl TryFrom<String> for MountPoint {
    type Error = HypervisorError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<MountPoint> for String {
    fn from(mount: MountPoint) -> Self {
        mount.device()
    }
}

/// A parsed volume name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeName {
    pub vm_name: String,
    pub kind: StorageKind,
    /// `None` only for the cloud-init seed.
    pub mount: Option<MountPoint>,
}

impl VolumeName {
    pub fn root(vm_name: impl Into<String>, mount: MountPoint) -> Self {
        Self { vm_name: vm_name.into(), kind: StorageKind::Root, mount: Some(mount) }
    }

    pub fn basic(vm_name: impl Into<String>, mount: MountPoint) -> Self {
        Self { vm_name: vm_name.into(), kind: StorageKind::Basic, mount: Some(mount) }
    }

    pub fn cloudinit(vm_name: impl Into<String>) -> Self {
        Self { vm_name: vm_name.into(), kind: StorageKind::Cloudinit, mount: None }
    }

    /// Render the on-disk volume name.
    pub fn format(&self) -> String {
        match (self.kind, self.mount) {
            (StorageKind::Root, Some(mount)) => {
                format!("{}-{}-{}{}", self.vm_name, ROOT_MARKER, mount, QCOW2_SUFFIX)
            }
            (StorageKind::Basic, Some(mount)) => {
                format!("{}-{}{}", self.vm_name, mount, QCOW2_SUFFIX)
            }
            _ => format!("{}{}", self.vm_name, CLOUDINIT_SUFFIX),
        }
    }

    /// Recover VM name, kind and mount from a volume name.
    ///
    /// VM names may themselves contain `-`; the mount is always the last
    /// dash-separated field and `root` the one before it. Anything that is
    /// not a root or cloud-init name is treated as a basic volume.
    pub fn parse(name: &str) -> Result<Self> {
        if let Some(vm) = name.strip_suffix(CLOUDINIT_SUFFIX) {
            if vm.is_empty() {
                return Err(unparseable(name));
            }
            return Ok(Self::cloudinit(vm));
        }

        let stem = name.strip_suffix(QCOW2_SUFFIX).unwrap_or(name);
        let (rest, mount) = stem.rsplit_once('-').ok_or_else(|| unparseable(name))?;
        let mount: MountPoint = mount.parse().map_err(|_| unparseable(name))?;

        match rest.rsplit_once('-') {
            Some((vm, ROOT_MARKER)) if !vm.is_empty() => Ok(Self::root(vm, mount)),
            _ if !rest.is_empty() => Ok(Self::basic(rest, mount)),
            _ => Err(unparseable(name)),
        }
    }
}

impl fmt::Display for VolumeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format())
    }
}

fn unparseable(name: &str) -> HypervisorError {
    HypervisorError::InvalidConfig(format!("volume name does not follow the naming scheme: {}", name))
}
