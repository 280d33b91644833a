//! Network module for libvirt virtual networks.
//!
//! This module provides:
//! - Network descriptors (forward mode, CIDR, DHCP range, DNS domain)
//! - Idempotent network definition
//! - Static DHCP lease management and MAC binding for VM NICs

mod reconciler;
mod types;

pub use reconciler::NetworkReconciler;
pub use types::*;
