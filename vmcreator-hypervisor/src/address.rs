//! MAC address allocation and CIDR resolution.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use tracing::{debug, instrument};

use crate::error::{HypervisorError, Result};
use crate::traits::Hypervisor;

/// QEMU/KVM reserved OUI.
pub const QEMU_OUI: [u8; 3] = [0x52, 0x54, 0x00];

/// Upper bound on regeneration attempts before giving up.
pub const MAX_MAC_ATTEMPTS: usize = 4096;

/// A 48-bit MAC address, rendered as lowercase colon-separated hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    /// Address inside the QEMU OUI with the given host part.
    pub fn qemu(tail: [u8; 3]) -> Self {
        Self([QEMU_OUI[0], QEMU_OUI[1], QEMU_OUI[2], tail[0], tail[1], tail[2]])
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    pub fn is_qemu(&self) -> bool {
        self.0[..3] == QEMU_OUI
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

impl FromStr for MacAddress {
    type Err = HypervisorError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        if parts.len() != 6 {
            return Err(HypervisorError::InvalidAddress(format!("not a MAC address: {}", s)));
        }
        let mut octets = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            octets[i] = u8::from_str_radix(part, 16)
                .map_err(|_| HypervisorError::InvalidAddress(format!("not a MAC address: {}", s)))?;
        }
        Ok(Self(octets))
    }
}

impl TryFrom<String> for MacAddress {
    type Error = HypervisorError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<MacAddress> for String {
    fn from(mac: MacAddress) -> Self {
        mac.to_string()
    }
}

/// Generate a MAC in the QEMU range that is not in `existing`.
///
/// `existing` holds lowercase colon-separated strings. Gives up with
/// [`HypervisorError::AllocationExhausted`] after [`MAX_MAC_ATTEMPTS`] draws.
pub fn generate_mac<R: Rng + ?Sized>(rng: &mut R, existing: &HashSet<String>) -> Result<MacAddress> {
    for attempt in 0..MAX_MAC_ATTEMPTS {
        let mac = MacAddress::qemu([rng.gen::<u8>(), rng.gen::<u8>(), rng.gen::<u8>()]);
        if !existing.contains(&mac.to_string()) {
            return Ok(mac);
        }
        debug!(mac = %mac, attempt, "Generated MAC collides, retrying");
    }

    Err(HypervisorError::AllocationExhausted { attempts: MAX_MAC_ATTEMPTS })
}

/// Every MAC the hypervisor knows about right now, lowercased.
pub async fn live_macs(hypervisor: &dyn Hypervisor) -> Result<HashSet<String>> {
    Ok(hypervisor
        .list_interface_macs()
        .await?
        .into_iter()
        .map(|m| m.to_ascii_lowercase())
        .collect())
}

/// Allocate a MAC against the interface set the hypervisor reports right now.
pub async fn allocate_mac(hypervisor: &dyn Hypervisor) -> Result<MacAddress> {
    allocate_mac_excluding(hypervisor, &[]).await
}

/// Like [`allocate_mac`], also avoiding `reserved` (MACs handed out in this
/// run that no domain carries yet).
#[instrument(skip(hypervisor, reserved))]
pub async fn allocate_mac_excluding(
    hypervisor: &dyn Hypervisor,
    reserved: &[MacAddress],
) -> Result<MacAddress> {
    let mut existing = live_macs(hypervisor).await?;
    existing.extend(reserved.iter().map(MacAddress::to_string));

    let mac = generate_mac(&mut rand::thread_rng(), &existing)?;
    debug!(mac = %mac, known = existing.len(), "Allocated MAC address");
    Ok(mac)
}

/// Split an interface CIDR (`10.0.0.1/24`, `fd00::1/64`) into address and netmask.
pub fn parse_cidr(cidr: &str) -> Result<(IpAddr, IpAddr)> {
    let invalid = || HypervisorError::InvalidAddress(format!("not a CIDR literal: {}", cidr));

    let (addr, prefix) = cidr.trim().split_once('/').ok_or_else(invalid)?;
    let addr: IpAddr = addr.parse().map_err(|_| invalid())?;
    let prefix: u32 = prefix.parse().map_err(|_| invalid())?;

    let netmask = match addr {
        IpAddr::V4(_) => {
            if prefix > 32 {
                return Err(invalid());
            }
            let bits = u32::MAX.checked_shl(32 - prefix).unwrap_or(0);
            IpAddr::V4(Ipv4Addr::from(bits))
        }
        IpAddr::V6(_) => {
            if prefix > 128 {
                return Err(invalid());
            }
            let bits = u128::MAX.checked_shl(128 - prefix).unwrap_or(0);
            IpAddr::V6(Ipv6Addr::from(bits))
        }
    };

    Ok((addr, netmask))
}
