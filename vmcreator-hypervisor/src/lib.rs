//! # vmcreator Hypervisor
//!
//! Reconciliation engine mapping a declarative VM description onto
//! idempotent create/destroy operations against libvirt.
//!
//! Resources are reconciled in dependency order:
//!
//! ```text
//!  NetworkReconciler ──► NicBinding (MAC + static lease) ─┐
//!                                                         ├─► InstanceReconciler ──► domain
//!  StorageReconciler ──► VolumeHandle (root/basic/seed) ──┘
//! ```
//!
//! Destroy runs the other way: the domain is undefined before its volumes
//! and leases are released. The hypervisor is the only record of what
//! exists; every reconciler starts with a lookup by name.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │          Hypervisor Trait               │
//! │  (lookup/define/start, pools, leases)   │
//! └─────────────────────┬───────────────────┘
//!                       │
//!         ┌─────────────┴─────────────┐
//!         ▼                           ▼
//! ┌───────────────────┐     ┌───────────────────┐
//! │  LibvirtBackend   │     │    MockBackend    │
//! │   (via libvirt)   │     │    (in memory)    │
//! └───────────────────┘     └───────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use vmcreator_hypervisor::*;
//!
//! let backend: Arc<dyn Hypervisor> = Arc::new(MockBackend::new());
//! let networks = NetworkReconciler::new(backend.clone());
//! let lan = networks
//!     .ensure(&NetworkDescriptor::new("lan", "10.0.0.1/24", ForwardMode::Nat))
//!     .await?;
//! let nic = networks.bind(&lan, "web01", Some("10.0.0.20"), &[]).await?;
//! ```

pub mod address;
pub mod cloudinit;
pub mod error;
pub mod instance;
pub mod libvirt;
pub mod mock;
pub mod naming;
pub mod network;
pub mod runner;
pub mod storage;
pub mod traits;
pub mod types;
pub mod xml;

pub use address::{
    allocate_mac, allocate_mac_excluding, generate_mac, live_macs, parse_cidr, MacAddress,
};
pub use cloudinit::{CloudInitBuilder, CloudInitSeed, SeedConfig, UserSpec};
pub use error::{HypervisorError, ResourceKind, Result};
pub use instance::{
    AttachedStorage, CreateOutcome, InstanceDescriptor, InstanceReconciler, InstanceState,
    TeardownReport,
};
pub use mock::MockBackend;
pub use naming::{MountPoint, StorageKind, VolumeName};
pub use network::{
    DhcpRange, ForwardMode, Lease, LeaseQuery, NetworkDescriptor, NetworkReconciler, NicBinding,
};
pub use runner::{CommandOutput, CommandRunner, MockRunner, SystemRunner};
pub use storage::{
    BaseImage, BasicStorage, CloudinitStorage, RootStorage, StorageDescriptor, StorageReconciler,
};
pub use traits::Hypervisor;
pub use types::*;

// Re-export libvirt backend when available
#[cfg(feature = "libvirt")]
pub use libvirt::LibvirtBackend;
