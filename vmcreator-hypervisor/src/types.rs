//! Opaque references to hypervisor-side objects.
//!
//! Handles are obtained by name lookup or by creation and carry only what is
//! needed to address the object again. The hypervisor stays the system of
//! record; nothing here is cached across runs.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// =============================================================================
// HANDLES
// =============================================================================

/// A defined domain (virtual machine).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainHandle {
    /// Domain name, equal to the VM name in the config
    pub name: String,
    /// UUID assigned by the hypervisor
    pub uuid: String,
}

/// A defined virtual network.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetworkHandle {
    pub name: String,
}

/// A storage pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PoolHandle {
    pub name: String,
}

/// A storage volume inside a pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VolumeHandle {
    /// Owning pool name
    pub pool: String,
    /// Volume name as reported by the hypervisor
    pub name: String,
    /// Absolute path of the backing file
    pub path: PathBuf,
}

impl VolumeHandle {
    pub fn pool_handle(&self) -> PoolHandle {
        PoolHandle { name: self.pool.clone() }
    }
}

// =============================================================================
// NETWORK UPDATES
// =============================================================================

/// Live+persistent edits of a network's DHCP host section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkUpdate {
    /// Append a `<host>` entry at the end of the DHCP section.
    AddDhcpHost,
    /// Remove the matching `<host>` entry.
    DeleteDhcpHost,
}
