//! Network descriptors and DHCP lease types.

use serde::{Deserialize, Serialize};

use crate::address::MacAddress;

/// How traffic leaves the virtual network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum ForwardMode {
    /// Routed to the host without NAT
    Route,
    /// Masqueraded behind the host address
    #[default]
    Nat,
    /// No forwarding; guests only reach each other and the host
    Isolated,
}

/// Dynamic DHCP address range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhcpRange {
    pub start: String,
    pub end: String,
}

/// Desired state of a virtual network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkDescriptor {
    pub name: String,
    /// Host-side interface address in CIDR form, e.g. `10.0.0.1/24`
    pub cidr: String,
    pub mode: ForwardMode,
    /// `None` disables DHCP
    pub dhcp: Option<DhcpRange>,
    /// DNS domain served to guests
    pub domain: Option<String>,
}

impl NetworkDescriptor {
    pub fn new(name: impl Into<String>, cidr: impl Into<String>, mode: ForwardMode) -> Self {
        Self { name: name.into(), cidr: cidr.into(), mode, dhcp: None, domain: None }
    }

    /// Enable DHCP. Both bounds are needed; a missing one leaves DHCP off.
    pub fn with_dhcp(mut self, start: Option<&str>, end: Option<&str>) -> Self {
        self.dhcp = match (start, end) {
            (Some(start), Some(end)) => {
                Some(DhcpRange { start: start.to_string(), end: end.to_string() })
            }
            _ => None,
        };
        self
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }
}

/// A static DHCP host entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub mac: MacAddress,
    pub hostname: Option<String>,
    pub ip: Option<String>,
}

/// Criteria for [`crate::NetworkReconciler::find_lease`]. Hostname wins over IP.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeaseQuery {
    pub hostname: Option<String>,
    pub ip: Option<String>,
}

/// A NIC of one VM attached to one network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NicBinding {
    /// Network name
    pub network: String,
    pub mac: MacAddress,
    /// Static lease registered for this NIC, if any
    pub lease: Option<Lease>,
}
