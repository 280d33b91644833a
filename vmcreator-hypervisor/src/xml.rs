//! libvirt XML generation and read-back.
//!
//! Builders render only the fields the engine controls. Parsers pull the few
//! facts the engine reads back from live descriptions: pool target paths,
//! DHCP host entries, disk sources and NIC bindings.

use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;

use crate::address::{parse_cidr, MacAddress};
use crate::error::{HypervisorError, Result};
use crate::instance::InstanceDescriptor;
use crate::network::{ForwardMode, Lease, NetworkDescriptor};
use crate::storage::StorageDescriptor;

// =============================================================================
// DOMAIN
// =============================================================================

/// Builder for libvirt domain XML.
pub struct DomainXmlBuilder<'a> {
    instance: &'a InstanceDescriptor,
}

impl<'a> DomainXmlBuilder<'a> {
    pub fn new(instance: &'a InstanceDescriptor) -> Self {
        Self { instance }
    }

    /// Build the domain XML string.
    pub fn build(&self) -> String {
        let mut xml = String::new();

        xml.push_str(&format!(
            r#"<domain type='kvm'>
  <name>{}</name>
  <memory unit='MiB'>{}</memory>
  <vcpu placement='static'>{}</vcpu>
"#,
            escape(&self.instance.name),
            self.instance.ram_mib,
            self.instance.vcpu
        ));

        if self.instance.shared_ram {
            xml.push_str(
                r#"  <memoryBacking>
    <source type='memfd'/>
    <access mode='shared'/>
  </memoryBacking>
"#,
            );
        }

        xml.push_str(
            r#"  <os>
    <type arch='x86_64' machine='q35'>hvm</type>
    <boot dev='hd'/>
  </os>
  <features>
    <acpi/>
    <apic/>
    <vmport state='off'/>
  </features>
  <on_poweroff>destroy</on_poweroff>
  <on_reboot>restart</on_reboot>
  <on_crash>destroy</on_crash>
"#,
        );

        // One counter for every PCI-addressed device. NICs come first so the
        // n-th NIC sits on bus n and the guest names it enp<n>s0.
        let mut pci = PciAllocator::new();

        xml.push_str("  <devices>\n");
        xml.push_str(&self.build_nics(&mut pci));
        xml.push_str(&self.build_memballoon(&mut pci));
        xml.push_str(&self.build_disks(&mut pci));
        xml.push_str(&self.build_cdroms());
        xml.push_str(&self.build_console());
        xml.push_str(&self.build_spice());
        xml.push_str("  </devices>\n");
        xml.push_str("</domain>\n");

        xml
    }

    fn build_nics(&self, pci: &mut PciAllocator) -> String {
        let mut xml = String::new();

        for nic in &self.instance.nics {
            xml.push_str(&format!(
                r#"    <interface type='network'>
      <mac address='{}'/>
      <source network='{}'/>
      <model type='virtio'/>
{}    </interface>
"#,
                nic.mac,
                escape(&nic.network),
                pci.next_address()
            ));
        }

        xml
    }

    fn build_memballoon(&self, pci: &mut PciAllocator) -> String {
        format!(
            "    <memballoon model='virtio'>\n{}    </memballoon>\n",
            pci.next_address()
        )
    }

    fn build_disks(&self, pci: &mut PciAllocator) -> String {
        let mut xml = String::new();

        for attached in &self.instance.storages {
            let Some(mount) = attached.descriptor.mount() else {
                continue;
            };
            xml.push_str(&format!(
                r#"    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2'/>
      <source file='{}'/>
      <target dev='{}' bus='virtio'/>
{}    </disk>
"#,
                escape(&attached.volume.path.to_string_lossy()),
                mount.device(),
                pci.next_address()
            ));
        }

        xml
    }

    fn build_cdroms(&self) -> String {
        let mut xml = String::new();

        let seeds = self
            .instance
            .storages
            .iter()
            .filter(|s| matches!(s.descriptor, StorageDescriptor::Cloudinit(_)));

        for (unit, attached) in seeds.enumerate() {
            xml.push_str(&format!(
                r#"    <disk type='file' device='cdrom'>
      <driver name='qemu' type='raw'/>
      <source file='{}'/>
      <target dev='sd{}' bus='sata'/>
      <readonly/>
      <address type='drive' controller='0' bus='0' target='0' unit='{}'/>
    </disk>
"#,
                escape(&attached.volume.path.to_string_lossy()),
                (b'a' + unit as u8) as char,
                unit
            ));
        }

        xml
    }

    fn build_console(&self) -> String {
        r#"    <serial type='pty'>
      <target type='isa-serial' port='0'>
        <model name='isa-serial'/>
      </target>
    </serial>
    <console type='pty'>
      <target type='serial' port='0'/>
    </console>
"#
        .to_string()
    }

    fn build_spice(&self) -> String {
        r#"    <channel type='spicevmc'>
      <target type='virtio' name='com.redhat.spice.0'/>
      <address type='virtio-serial' controller='0' bus='0' port='1'/>
    </channel>
    <input type='tablet' bus='usb'>
      <address type='usb' bus='0' port='1'/>
    </input>
    <input type='mouse' bus='ps2'/>
    <input type='keyboard' bus='ps2'/>
    <graphics type='spice' autoport='yes'>
      <listen type='address'/>
      <image compression='off'/>
    </graphics>
    <sound model='ich6'>
      <address type='pci' domain='0x0000' bus='0x00' slot='0x04' function='0x0'/>
    </sound>
    <audio id='1' type='spice'/>
    <video>
      <model type='qxl' ram='65536' vram='65536' vgamem='16384' heads='1' primary='yes'/>
      <address type='pci' domain='0x0000' bus='0x00' slot='0x02' function='0x0'/>
    </video>
    <redirdev bus='usb' type='spicevmc'>
      <address type='usb' bus='0' port='2'/>
    </redirdev>
    <redirdev bus='usb' type='spicevmc'>
      <address type='usb' bus='0' port='3'/>
    </redirdev>
"#
        .to_string()
    }
}

/// Monotonic PCI bus counter shared by all addressed devices.
struct PciAllocator {
    next_bus: u32,
}

impl PciAllocator {
    fn new() -> Self {
        Self { next_bus: 1 }
    }

    fn next_address(&mut self) -> String {
        let bus = self.next_bus;
        self.next_bus += 1;
        format!(
            "      <address type='pci' domain='0x0000' bus='0x{:02x}' slot='0x00' function='0x0'/>\n",
            bus
        )
    }
}

// =============================================================================
// NETWORK
// =============================================================================

/// Builder for libvirt network XML.
pub struct NetworkXmlBuilder<'a> {
    network: &'a NetworkDescriptor,
}

impl<'a> NetworkXmlBuilder<'a> {
    pub fn new(network: &'a NetworkDescriptor) -> Self {
        Self { network }
    }

    pub fn build(&self) -> Result<String> {
        let net = self.network;
        let mut xml = format!("<network>\n  <name>{}</name>\n", escape(&net.name));

        // Isolated networks carry no <forward> element at all.
        match net.mode {
            ForwardMode::Route => xml.push_str("  <forward mode='route'/>\n"),
            ForwardMode::Nat => xml.push_str("  <forward mode='nat'/>\n"),
            ForwardMode::Isolated => {}
        }

        if let Some(ref domain) = net.domain {
            xml.push_str(&format!("  <domain name='{}'/>\n", escape(domain)));
        }

        let (address, netmask) = parse_cidr(&net.cidr)?;
        let ip_open = match netmask {
            IpAddr::V4(_) => format!("  <ip address='{}' netmask='{}'>\n", address, netmask),
            IpAddr::V6(mask) => format!(
                "  <ip family='ipv6' address='{}' prefix='{}'>\n",
                address,
                u128::from(mask).count_ones()
            ),
        };
        xml.push_str(&ip_open);

        if let Some(ref dhcp) = net.dhcp {
            xml.push_str(&format!(
                "    <dhcp>\n      <range start='{}' end='{}'/>\n    </dhcp>\n",
                escape(&dhcp.start),
                escape(&dhcp.end)
            ));
        }

        xml.push_str("  </ip>\n</network>\n");
        Ok(xml)
    }
}

/// `<host>` element for a DHCP static lease.
pub fn dhcp_host_xml(lease: &Lease) -> String {
    let mut xml = format!("<host mac='{}'", lease.mac);
    if let Some(ref name) = lease.hostname {
        xml.push_str(&format!(" name='{}'", escape(name)));
    }
    if let Some(ref ip) = lease.ip {
        xml.push_str(&format!(" ip='{}'", escape(ip)));
    }
    xml.push_str("/>");
    xml
}

// =============================================================================
// READ-BACK
// =============================================================================

/// A NIC as reported in a live domain description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceBinding {
    /// Source network name
    pub network: String,
    pub mac: MacAddress,
}

/// `<target><path>` of a storage pool description.
pub fn pool_target_path(xml: &str) -> Result<PathBuf> {
    let mut found = None;
    visit(xml, |node| {
        if let Node::Text { path, text } = node {
            if found.is_none() && ends_with(path, &["pool", "target", "path"]) {
                found = Some(PathBuf::from(text));
            }
        }
    })?;
    found.ok_or_else(|| HypervisorError::XmlError("storage pool has no target path".to_string()))
}

/// Text of the `<name>` element directly under the document root.
pub fn object_name(xml: &str) -> Result<String> {
    let mut found = None;
    visit(xml, |node| {
        if let Node::Text { path, text } = node {
            if found.is_none() && path.len() == 2 && path[1] == "name" {
                found = Some(text.to_string());
            }
        }
    })?;
    found.ok_or_else(|| HypervisorError::XmlError("document has no <name> element".to_string()))
}

/// DHCP `<host>` entries of a network description.
pub fn dhcp_hosts(xml: &str) -> Result<Vec<Lease>> {
    let mut hosts = Vec::new();
    let mut bad_mac = None;
    visit(xml, |node| {
        if let Node::Open { path, attrs } = node {
            if ends_with(path, &["dhcp", "host"]) {
                let Some(mac) = attrs.get("mac") else {
                    return;
                };
                match mac.parse::<MacAddress>() {
                    Ok(mac) => hosts.push(Lease {
                        mac,
                        hostname: attrs.get("name").cloned(),
                        ip: attrs.get("ip").cloned(),
                    }),
                    Err(e) => bad_mac = Some(e),
                }
            }
        }
    })?;
    match bad_mac {
        Some(e) => Err(e),
        None => Ok(hosts),
    }
}

/// File-backed disk sources of a domain description, in device order.
pub fn disk_sources(xml: &str) -> Result<Vec<PathBuf>> {
    let mut sources = Vec::new();
    visit(xml, |node| {
        if let Node::Open { path, attrs } = node {
            if ends_with(path, &["devices", "disk", "source"]) {
                if let Some(file) = attrs.get("file") {
                    sources.push(PathBuf::from(file));
                }
            }
        }
    })?;
    Ok(sources)
}

/// Network-backed NICs of a domain description, in device order.
pub fn interface_bindings(xml: &str) -> Result<Vec<InterfaceBinding>> {
    let mut bindings = Vec::new();
    let mut network: Option<String> = None;
    let mut mac: Option<String> = None;
    let mut bad_mac = None;

    visit(xml, |node| match node {
        Node::Open { path, attrs } => {
            if ends_with(path, &["devices", "interface"]) {
                network = None;
                mac = None;
            } else if ends_with(path, &["interface", "source"]) {
                network = attrs.get("network").cloned();
            } else if ends_with(path, &["interface", "mac"]) {
                mac = attrs.get("address").cloned();
            }
        }
        Node::Close { path } if ends_with(path, &["devices", "interface"]) => {
            if let (Some(net), Some(addr)) = (network.take(), mac.take()) {
                match addr.parse::<MacAddress>() {
                    Ok(mac) => bindings.push(InterfaceBinding { network: net, mac }),
                    Err(e) => bad_mac = Some(e),
                }
            }
        }
        _ => {}
    })?;

    match bad_mac {
        Some(e) => Err(e),
        None => Ok(bindings),
    }
}

/// MAC addresses of every `<interface>` in a domain description.
pub fn interface_macs(xml: &str) -> Result<Vec<String>> {
    let mut macs = Vec::new();
    visit(xml, |node| {
        if let Node::Open { path, attrs } = node {
            if ends_with(path, &["interface", "mac"]) {
                if let Some(addr) = attrs.get("address") {
                    macs.push(addr.to_ascii_lowercase());
                }
            }
        }
    })?;
    Ok(macs)
}

enum Node<'a> {
    Open { path: &'a [String], attrs: &'a HashMap<String, String> },
    Text { path: &'a [String], text: &'a str },
    Close { path: &'a [String] },
}

fn xml_err(e: impl std::fmt::Display) -> HypervisorError {
    HypervisorError::XmlError(e.to_string())
}

fn ends_with(path: &[String], suffix: &[&str]) -> bool {
    path.len() >= suffix.len()
        && path[path.len() - suffix.len()..]
            .iter()
            .zip(suffix)
            .all(|(a, b)| a == b)
}

fn element_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.name().as_ref()).into_owned()
}

fn attributes(e: &BytesStart<'_>) -> Result<HashMap<String, String>> {
    let mut attrs = HashMap::new();
    for attr in e.attributes() {
        let attr = attr.map_err(xml_err)?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value().map_err(xml_err)?.into_owned();
        attrs.insert(key, value);
    }
    Ok(attrs)
}

/// Walk an XML document, reporting element opens, texts and closes together
/// with the element path from the root.
fn visit<F>(xml: &str, mut f: F) -> Result<()>
where
    F: FnMut(Node<'_>),
{
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);
    let mut path: Vec<String> = Vec::new();

    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(e) => {
                path.push(element_name(&e));
                let attrs = attributes(&e)?;
                f(Node::Open { path: path.as_slice(), attrs: &attrs });
            }
            Event::Empty(e) => {
                path.push(element_name(&e));
                let attrs = attributes(&e)?;
                f(Node::Open { path: path.as_slice(), attrs: &attrs });
                f(Node::Close { path: path.as_slice() });
                path.pop();
            }
            Event::Text(t) => {
                let text = t.unescape().map_err(xml_err)?;
                f(Node::Text { path: path.as_slice(), text: &text });
            }
            Event::End(_) => {
                f(Node::Close { path: path.as_slice() });
                path.pop();
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::AttachedStorage;
    use crate::naming::MountPoint;
    use crate::network::{DhcpRange, NicBinding};
    use crate::storage::{BasicStorage, CloudinitStorage, RootStorage};
    use crate::types::VolumeHandle;
    use std::collections::HashSet;

    fn volume(name: &str) -> VolumeHandle {
        VolumeHandle {
            pool: "vms".to_string(),
            name: name.to_string(),
            path: PathBuf::from(format!("/pools/vms/{}", name)),
        }
    }

    fn instance(disks: usize, nics: usize) -> InstanceDescriptor {
        let mut storages = vec![AttachedStorage {
            descriptor: StorageDescriptor::Cloudinit(CloudinitStorage::new("web01", "vms")),
            volume: volume("web01.cloudinit.iso"),
        }];
        for i in 0..disks {
            let mount = MountPoint::from_index(i).unwrap();
            let descriptor = if i == 0 {
                StorageDescriptor::Root(RootStorage::new("web01", "vms", mount))
            } else {
                StorageDescriptor::Basic(BasicStorage::new("web01", "vms", mount))
            };
            let name = descriptor.volume_name().format();
            storages.push(AttachedStorage { descriptor, volume: volume(&name) });
        }

        let nics = (0..nics)
            .map(|i| NicBinding {
                network: format!("net{}", i),
                mac: MacAddress::qemu([0, 0, i as u8]),
                lease: None,
            })
            .collect();

        InstanceDescriptor {
            name: "web01".to_string(),
            vcpu: 2,
            ram_mib: 2048,
            shared_ram: true,
            storages,
            nics,
        }
    }

    fn pci_addresses(xml: &str) -> Vec<(String, String)> {
        let mut out = Vec::new();
        visit(xml, |node| {
            if let Node::Open { path, attrs } = node {
                if path.last().map(String::as_str) == Some("address")
                    && attrs.get("type").map(String::as_str) == Some("pci")
                {
                    out.push((attrs["bus"].clone(), attrs["slot"].clone()));
                }
            }
        })
        .unwrap();
        out
    }

    #[test]
    fn test_basic_domain_xml() {
        let xml = DomainXmlBuilder::new(&instance(1, 1)).build();

        assert!(xml.contains("<name>web01</name>"));
        assert!(xml.contains("<memory unit='MiB'>2048</memory>"));
        assert!(xml.contains("<vcpu placement='static'>2</vcpu>"));
        assert!(xml.contains("<access mode='shared'/>"));
        assert!(xml.contains("/pools/vms/web01-root-vda.qcow2"));
        assert!(xml.contains("<target dev='vda' bus='virtio'/>"));
        assert!(xml.contains("<target dev='sda' bus='sata'/>"));
        assert!(xml.contains("<readonly/>"));
        assert!(xml.contains("<source network='net0'/>"));
        assert!(xml.contains("<mac address='52:54:00:00:00:00'/>"));
        assert!(xml.contains("<graphics type='spice' autoport='yes'>"));
    }

    #[test]
    fn test_no_memory_backing_without_shared_ram() {
        let mut inst = instance(1, 0);
        inst.shared_ram = false;
        let xml = DomainXmlBuilder::new(&inst).build();
        assert!(!xml.contains("memoryBacking"));
        assert!(xml.contains("<memballoon model='virtio'>"));
    }

    #[test]
    fn test_pci_addresses_are_distinct() {
        for (disks, nics) in [(0, 0), (1, 1), (3, 2), (5, 7)] {
            let xml = DomainXmlBuilder::new(&instance(disks, nics)).build();
            let addrs = pci_addresses(&xml);
            let unique: HashSet<_> = addrs.iter().cloned().collect();
            assert_eq!(unique.len(), addrs.len());
            // disks + nics + memballoon, plus the fixed sound and video slots
            assert_eq!(addrs.len(), disks + nics + 1 + 2);
        }
    }

    #[test]
    fn test_nics_take_first_buses() {
        let xml = DomainXmlBuilder::new(&instance(2, 2)).build();
        let nics = interface_bindings(&xml).unwrap();
        assert_eq!(nics.len(), 2);
        let addrs = pci_addresses(&xml);
        assert_eq!(addrs[0].0, "0x01");
        assert_eq!(addrs[1].0, "0x02");
    }

    #[test]
    fn test_network_xml_modes() {
        let mut net = NetworkDescriptor::new("lan", "10.0.0.1/24", ForwardMode::Nat);
        let xml = NetworkXmlBuilder::new(&net).build().unwrap();
        assert!(xml.contains("<forward mode='nat'/>"));
        assert!(xml.contains("<ip address='10.0.0.1' netmask='255.255.255.0'>"));
        assert!(!xml.contains("<dhcp>"));

        net.mode = ForwardMode::Isolated;
        let xml = NetworkXmlBuilder::new(&net).build().unwrap();
        assert!(!xml.contains("<forward"));

        net.mode = ForwardMode::Route;
        net.domain = Some("lab.local".to_string());
        net.dhcp = Some(DhcpRange { start: "10.0.0.10".into(), end: "10.0.0.100".into() });
        let xml = NetworkXmlBuilder::new(&net).build().unwrap();
        assert!(xml.contains("<forward mode='route'/>"));
        assert!(xml.contains("<domain name='lab.local'/>"));
        assert!(xml.contains("<range start='10.0.0.10' end='10.0.0.100'/>"));
    }

    #[test]
    fn test_network_xml_rejects_bad_cidr() {
        let net = NetworkDescriptor::new("lan", "10.0.0.1", ForwardMode::Nat);
        assert!(matches!(
            NetworkXmlBuilder::new(&net).build(),
            Err(HypervisorError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_pool_target_path() {
        let xml = r#"<pool type='dir'>
  <name>vms</name>
  <source>
  </source>
  <target>
    <path>/var/lib/libvirt/images</path>
    <permissions><mode>0711</mode></permissions>
  </target>
</pool>"#;
        assert_eq!(pool_target_path(xml).unwrap(), PathBuf::from("/var/lib/libvirt/images"));
        assert!(pool_target_path("<pool><name>x</name></pool>").is_err());
    }

    #[test]
    fn test_dhcp_hosts_ignores_dns_hosts() {
        let xml = r#"<network>
  <name>lan</name>
  <dns><host ip='10.0.0.5'><hostname>dns-only</hostname></host></dns>
  <ip address='10.0.0.1' netmask='255.255.255.0'>
    <dhcp>
      <range start='10.0.0.10' end='10.0.0.100'/>
      <host mac='52:54:00:AA:BB:CC' name='web01' ip='10.0.0.20'/>
      <host mac='52:54:00:00:00:01' ip='10.0.0.21'/>
    </dhcp>
  </ip>
</network>"#;
        let hosts = dhcp_hosts(xml).unwrap();
        assert_eq!(hosts.len(), 2);
        assert_eq!(hosts[0].mac.to_string(), "52:54:00:aa:bb:cc");
        assert_eq!(hosts[0].hostname.as_deref(), Some("web01"));
        assert_eq!(hosts[1].hostname, None);
    }

    #[test]
    fn test_disk_sources_skip_backing_store() {
        let xml = r#"<domain>
  <devices>
    <disk type='file' device='disk'>
      <source file='/pools/vms/web01-root-vda.qcow2'/>
      <backingStore type='file'><source file='/pools/isos/debian.qcow2'/></backingStore>
    </disk>
    <disk type='file' device='cdrom'>
      <source file='/pools/vms/web01.cloudinit.iso'/>
    </disk>
  </devices>
</domain>"#;
        let sources = disk_sources(xml).unwrap();
        assert_eq!(
            sources,
            vec![
                PathBuf::from("/pools/vms/web01-root-vda.qcow2"),
                PathBuf::from("/pools/vms/web01.cloudinit.iso"),
            ]
        );
    }

    #[test]
    fn test_dhcp_host_xml() {
        let lease = Lease {
            mac: MacAddress::qemu([1, 2, 3]),
            hostname: Some("web01".to_string()),
            ip: Some("10.0.0.20".to_string()),
        };
        assert_eq!(
            dhcp_host_xml(&lease),
            "<host mac='52:54:00:01:02:03' name='web01' ip='10.0.0.20'/>"
        );
    }
}
