//! Storage volume reconciliation.
//!
//! Three volume flavours exist, each bound to one VM:
//!
//! - **root**: qcow2 overlay on a base image from another pool
//! - **basic**: blank qcow2 data disk
//! - **cloud-init**: ISO seed attached as a read-only cdrom
//!
//! Volumes are looked up by name in their pool first; creation happens only
//! on a miss. Files are produced out of band (`qemu-img`, `genisoimage`) and
//! the pool is refreshed so the hypervisor picks them up.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::cloudinit::{CloudInitBuilder, CloudInitSeed};
use crate::error::{HypervisorError, Result};
use crate::naming::{MountPoint, StorageKind, VolumeName};
use crate::runner::{command_line, CommandRunner};
use crate::traits::Hypervisor;
use crate::types::{PoolHandle, VolumeHandle};
use crate::xml;

// =============================================================================
// DESCRIPTORS
// =============================================================================

/// Base image a root volume is layered on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseImage {
    /// Volume name inside `pool`, e.g. `debian.qcow2`
    pub name: String,
    pub pool: String,
}

/// Boot disk: a copy-on-write overlay of a base image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootStorage {
    pub vm_name: String,
    pub pool: String,
    pub mount: MountPoint,
    /// qemu-img size literal (`10G`); the base image size when absent
    pub size: Option<String>,
    /// Unknown for descriptors rebuilt from a live volume
    pub image: Option<BaseImage>,
}

impl RootStorage {
    pub fn new(vm_name: impl Into<String>, pool: impl Into<String>, mount: MountPoint) -> Self {
        Self { vm_name: vm_name.into(), pool: pool.into(), mount, size: None, image: None }
    }

    pub fn with_size(mut self, size: impl Into<String>) -> Self {
        self.size = Some(size.into());
        self
    }

    pub fn with_image(mut self, name: impl Into<String>, pool: impl Into<String>) -> Self {
        self.image = Some(BaseImage { name: name.into(), pool: pool.into() });
        self
    }
}

/// Blank data disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicStorage {
    pub vm_name: String,
    pub pool: String,
    pub mount: MountPoint,
    pub size: Option<String>,
}

impl BasicStorage {
    pub fn new(vm_name: impl Into<String>, pool: impl Into<String>, mount: MountPoint) -> Self {
        Self { vm_name: vm_name.into(), pool: pool.into(), mount, size: None }
    }

    pub fn with_size(mut self, size: impl Into<String>) -> Self {
        self.size = Some(size.into());
        self
    }
}

/// Cloud-init seed ISO.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudinitStorage {
    pub vm_name: String,
    pub pool: String,
    /// Rendered documents; absent for descriptors rebuilt from a live volume
    pub seed: Option<CloudInitSeed>,
    /// Repackage even if the ISO already exists
    pub force: bool,
}

impl CloudinitStorage {
    pub fn new(vm_name: impl Into<String>, pool: impl Into<String>) -> Self {
        Self { vm_name: vm_name.into(), pool: pool.into(), seed: None, force: false }
    }

    pub fn with_seed(mut self, seed: CloudInitSeed) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn forced(mut self, force: bool) -> Self {
        self.force = force;
        self
    }
}

/// Desired state of one volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StorageDescriptor {
    Root(RootStorage),
    Basic(BasicStorage),
    Cloudinit(CloudinitStorage),
}

impl StorageDescriptor {
    pub fn vm_name(&self) -> &str {
        match self {
            Self::Root(s) => &s.vm_name,
            Self::Basic(s) => &s.vm_name,
            Self::Cloudinit(s) => &s.vm_name,
        }
    }

    pub fn pool(&self) -> &str {
        match self {
            Self::Root(s) => &s.pool,
            Self::Basic(s) => &s.pool,
            Self::Cloudinit(s) => &s.pool,
        }
    }

    pub fn kind(&self) -> StorageKind {
        match self {
            Self::Root(_) => StorageKind::Root,
            Self::Basic(_) => StorageKind::Basic,
            Self::Cloudinit(_) => StorageKind::Cloudinit,
        }
    }

    /// Guest block device, `None` for the cloud-init cdrom.
    pub fn mount(&self) -> Option<MountPoint> {
        match self {
            Self::Root(s) => Some(s.mount),
            Self::Basic(s) => Some(s.mount),
            Self::Cloudinit(_) => None,
        }
    }

    pub fn volume_name(&self) -> VolumeName {
        match self {
            Self::Root(s) => VolumeName::root(&s.vm_name, s.mount),
            Self::Basic(s) => VolumeName::basic(&s.vm_name, s.mount),
            Self::Cloudinit(s) => VolumeName::cloudinit(&s.vm_name),
        }
    }

    /// Rebuild a descriptor from a live volume's name and pool.
    ///
    /// Only what the name encodes comes back: sizes, base images and seed
    /// contents are lost.
    pub fn reconstruct(volume: &VolumeHandle) -> Result<Self> {
        let parsed = VolumeName::parse(&volume.name)?;
        let descriptor = match (parsed.kind, parsed.mount) {
            (StorageKind::Root, Some(mount)) => {
                Self::Root(RootStorage::new(parsed.vm_name, &volume.pool, mount))
            }
            (StorageKind::Basic, Some(mount)) => {
                Self::Basic(BasicStorage::new(parsed.vm_name, &volume.pool, mount))
            }
            _ => Self::Cloudinit(CloudinitStorage::new(parsed.vm_name, &volume.pool)),
        };
        Ok(descriptor)
    }
}

// =============================================================================
// RECONCILER
// =============================================================================

/// Ensures volumes exist in their pools.
#[derive(Clone)]
pub struct StorageReconciler {
    hypervisor: Arc<dyn Hypervisor>,
    runner: Arc<dyn CommandRunner>,
    cloudinit: CloudInitBuilder,
    /// qemu-img binary path
    qemu_img_path: String,
}

impl StorageReconciler {
    pub fn new(hypervisor: Arc<dyn Hypervisor>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            hypervisor,
            runner,
            cloudinit: CloudInitBuilder::new(),
            qemu_img_path: "qemu-img".to_string(),
        }
    }

    /// Set the qemu-img binary path.
    pub fn with_qemu_img(mut self, path: impl Into<String>) -> Self {
        self.qemu_img_path = path.into();
        self
    }

    /// Use a custom cloud-init packager.
    pub fn with_cloudinit(mut self, cloudinit: CloudInitBuilder) -> Self {
        self.cloudinit = cloudinit;
        self
    }

    /// Filesystem directory backing a pool.
    pub async fn pool_path(&self, pool: &str) -> Result<PathBuf> {
        let handle = self.hypervisor.lookup_pool(pool).await?;
        let desc = self.hypervisor.pool_xml(&handle).await?;
        xml::pool_target_path(&desc)
    }

    /// Return the volume for `descriptor`, creating it if missing.
    #[instrument(skip(self, descriptor), fields(vm = %descriptor.vm_name(), pool = %descriptor.pool()))]
    pub async fn ensure(&self, descriptor: &StorageDescriptor) -> Result<VolumeHandle> {
        let name = descriptor.volume_name().format();
        let pool = self.hypervisor.lookup_pool(descriptor.pool()).await?;

        let force = matches!(descriptor, StorageDescriptor::Cloudinit(s) if s.force);
        if let Some(existing) = self.find(&pool, &name).await? {
            if !force {
                debug!(volume = %name, "Volume already exists");
                return Ok(existing);
            }
            info!(volume = %name, "Regenerating cloud-init seed");
        }

        let target = self.pool_path(descriptor.pool()).await?.join(&name);

        match descriptor {
            StorageDescriptor::Root(root) => self.create_root(root, &target).await?,
            StorageDescriptor::Basic(basic) => self.create_basic(basic, &target)?,
            StorageDescriptor::Cloudinit(seed) => self.create_cloudinit(seed, &target)?,
        }

        self.hypervisor.refresh_pool(&pool).await?;
        let volume = self.hypervisor.lookup_volume(&pool, &name).await?;

        info!(volume = %volume.name, path = %volume.path.display(), "Volume created");
        Ok(volume)
    }

    /// Wipe and remove a volume, then refresh its pool.
    #[instrument(skip(self), fields(volume = %volume.name))]
    pub async fn delete(&self, volume: &VolumeHandle) -> Result<()> {
        match self.hypervisor.delete_volume(volume).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                return Err(HypervisorError::VolumeNotFound(volume.name.clone()));
            }
            Err(e) => return Err(e),
        }

        if let Err(e) = self.hypervisor.refresh_pool(&volume.pool_handle()).await {
            warn!(error = %e, pool = %volume.pool, "Pool refresh after delete failed");
        }

        info!("Volume deleted");
        Ok(())
    }

    async fn find(&self, pool: &PoolHandle, name: &str) -> Result<Option<VolumeHandle>> {
        match self.hypervisor.lookup_volume(pool, name).await {
            Ok(volume) => Ok(Some(volume)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create_root(&self, root: &RootStorage, target: &std::path::Path) -> Result<()> {
        let image = root.image.as_ref().ok_or_else(|| {
            HypervisorError::InvalidConfig(format!(
                "root volume for {} has no base image",
                root.vm_name
            ))
        })?;

        let image_pool = self.hypervisor.lookup_pool(&image.pool).await?;
        let backing = self.hypervisor.lookup_volume(&image_pool, &image.name).await?;

        let mut args = vec![
            "create".to_string(),
            "-f".to_string(),
            "qcow2".to_string(),
            "-F".to_string(),
            "qcow2".to_string(),
            "-b".to_string(),
            backing.path.to_string_lossy().into_owned(),
            target.to_string_lossy().into_owned(),
        ];
        if let Some(ref size) = root.size {
            args.push(size.clone());
        }

        self.qemu_img(&args)
    }

    fn create_basic(&self, basic: &BasicStorage, target: &std::path::Path) -> Result<()> {
        let size = basic.size.as_ref().ok_or_else(|| {
            HypervisorError::InvalidConfig(format!(
                "data volume {} for {} has no size",
                basic.mount, basic.vm_name
            ))
        })?;

        let args = vec![
            "create".to_string(),
            "-f".to_string(),
            "qcow2".to_string(),
            target.to_string_lossy().into_owned(),
            size.clone(),
        ];

        self.qemu_img(&args)
    }

    fn create_cloudinit(&self, storage: &CloudinitStorage, target: &std::path::Path) -> Result<()> {
        let seed = storage.seed.as_ref().ok_or_else(|| {
            HypervisorError::InvalidConfig(format!(
                "no cloud-init documents to package for {}",
                storage.vm_name
            ))
        })?;

        self.cloudinit
            .package(self.runner.as_ref(), &storage.vm_name, seed, target)
    }

    fn qemu_img(&self, args: &[String]) -> Result<()> {
        let command = command_line(&self.qemu_img_path, args);
        debug!(command = %command, "Creating disk image");

        let output = self.runner.run(&self.qemu_img_path, args)?;
        if !output.success() {
            warn!(status = output.status, stderr = %output.stderr.trim(), "qemu-img failed");
            return Err(HypervisorError::VolumeCreationFailed { command, status: output.status });
        }
        Ok(())
    }
}
