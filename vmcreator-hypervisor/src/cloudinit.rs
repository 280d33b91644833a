//! Cloud-init NoCloud seed generation.
//!
//! A seed is three YAML documents packed into an ISO labelled `cidata`:
//!
//! - `user-data` - `#cloud-config` with users, fqdn and timezone
//! - `meta-data` - instance id and local hostname
//! - `network-config` - netplan v2, DHCPv4 on every NIC
//!
//! Rendering is a pure function of the VM name and [`SeedConfig`]; packaging
//! shells out to `genisoimage` in a scratch directory that is removed on every
//! exit path.
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! let config = SeedConfig::new(1).with_user(UserSpec::new("admin").with_ssh_key("ssh-ed25519 AAAA..."));
//! let seed = CloudInitBuilder::new().render("web01", &config)?;
//! ```

use serde::{Deserialize, Serialize};
use sha_crypt::{sha512_simple, Sha512Params, ROUNDS_DEFAULT};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, instrument, warn};

use crate::error::{HypervisorError, Result};
use crate::runner::{command_line, CommandRunner};

/// Password used for users that do not configure one.
pub const DEFAULT_PASSWORD: &str = "student";
/// `fqdn` written when the config has none.
pub const DEFAULT_FQDN: &str = "local";
/// `timezone` written when the config has none.
pub const DEFAULT_TIMEZONE: &str = "UTC";

/// A guest user to create on first boot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSpec {
    pub name: String,
    /// Plain-text password, hashed before it reaches the seed
    pub password: Option<String>,
    /// SSH public keys, copied verbatim
    pub ssh_keys: Vec<String>,
}

impl UserSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Default::default() }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_ssh_key(mut self, key: impl Into<String>) -> Self {
        self.ssh_keys.push(key.into());
        self
    }
}

/// Inputs of a seed beyond the VM name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedConfig {
    pub fqdn: Option<String>,
    pub timezone: Option<String>,
    pub users: Vec<UserSpec>,
    /// Number of NICs, in attachment order
    pub interfaces: usize,
}

impl SeedConfig {
    pub fn new(interfaces: usize) -> Self {
        Self { interfaces, ..Default::default() }
    }

    pub fn with_user(mut self, user: UserSpec) -> Self {
        self.users.push(user);
        self
    }
}

/// The three rendered seed documents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudInitSeed {
    pub user_data: String,
    pub meta_data: String,
    pub network_config: String,
}

// Field order is the YAML key order; keep it alphabetical.

#[derive(Serialize)]
struct MetaData<'a> {
    #[serde(rename = "instance-id")]
    instance_id: String,
    #[serde(rename = "local-hostname")]
    local_hostname: &'a str,
}

#[derive(Serialize)]
struct UserData<'a> {
    fqdn: &'a str,
    timezone: &'a str,
    users: Vec<UserEntry<'a>>,
}

#[derive(Serialize)]
struct UserEntry<'a> {
    groups: &'static str,
    lock_passwd: bool,
    name: &'a str,
    passwd: String,
    shell: &'static str,
    ssh_authorized_keys: &'a [String],
    sudo: &'static str,
}

#[derive(Serialize)]
struct NetworkConfig {
    ethernets: BTreeMap<String, Ethernet>,
    version: u8,
}

#[derive(Serialize)]
struct Ethernet {
    dhcp4: bool,
    dhcp6: bool,
}

/// Guest NIC name for the 1-based attachment slot.
///
/// The guest derives the name from the PCI bus, and the domain builder puts
/// the n-th NIC on bus n, so the two agree by position only.
pub fn interface_name(slot: usize) -> String {
    format!("enp{}s0", slot)
}

/// Salted SHA-512 crypt hash suitable for `/etc/shadow`.
pub fn hash_password(password: &str) -> Result<String> {
    let params = Sha512Params::new(ROUNDS_DEFAULT)
        .map_err(|e| HypervisorError::Internal(format!("invalid sha512 parameters: {:?}", e)))?;
    sha512_simple(password, &params)
        .map_err(|e| HypervisorError::Internal(format!("password hashing failed: {:?}", e)))
}

fn to_yaml<T: Serialize>(value: &T) -> Result<String> {
    serde_yaml::to_string(value)
        .map_err(|e| HypervisorError::Internal(format!("failed to render YAML: {}", e)))
}

/// Renders and packages cloud-init seeds.
#[derive(Debug, Clone)]
pub struct CloudInitBuilder {
    /// Path to the genisoimage binary
    iso_tool: String,
}

impl Default for CloudInitBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CloudInitBuilder {
    pub fn new() -> Self {
        Self { iso_tool: "genisoimage".to_string() }
    }

    /// Use a different ISO authoring binary with genisoimage-compatible flags.
    pub fn with_iso_tool(mut self, tool: impl Into<String>) -> Self {
        self.iso_tool = tool.into();
        self
    }

    /// Render the seed documents for `vm_name`.
    pub fn render(&self, vm_name: &str, config: &SeedConfig) -> Result<CloudInitSeed> {
        let meta_data = to_yaml(&MetaData {
            instance_id: format!("iid-{}", vm_name),
            local_hostname: vm_name,
        })?;

        let mut users = Vec::with_capacity(config.users.len());
        for user in &config.users {
            let password = user.password.as_deref().unwrap_or(DEFAULT_PASSWORD);
            users.push(UserEntry {
                groups: "sudo",
                lock_passwd: false,
                name: &user.name,
                passwd: hash_password(password)?,
                shell: "/bin/bash",
                ssh_authorized_keys: &user.ssh_keys,
                sudo: "ALL=(ALL) NOPASSWD:ALL",
            });
        }
        let user_data = format!(
            "#cloud-config\n{}",
            to_yaml(&UserData {
                fqdn: config.fqdn.as_deref().unwrap_or(DEFAULT_FQDN),
                timezone: config.timezone.as_deref().unwrap_or(DEFAULT_TIMEZONE),
                users,
            })?
        );

        let ethernets = (1..=config.interfaces)
            .map(|slot| (interface_name(slot), Ethernet { dhcp4: true, dhcp6: false }))
            .collect();
        let network_config = to_yaml(&NetworkConfig { ethernets, version: 2 })?;

        debug!(vm = %vm_name, users = config.users.len(), nics = config.interfaces, "Rendered cloud-init seed");

        Ok(CloudInitSeed { user_data, meta_data, network_config })
    }

    /// Pack `seed` into an ISO and copy it to `target`.
    #[instrument(skip(self, runner, seed), fields(target = %target.display()))]
    pub fn package(
        &self,
        runner: &dyn CommandRunner,
        vm_name: &str,
        seed: &CloudInitSeed,
        target: &Path,
    ) -> Result<()> {
        info!("Packaging cloud-init seed");

        // Removed on drop, whichever way this function returns.
        let temp_dir = tempfile::tempdir()?;
        let temp_path = temp_dir.path();

        let user_data = temp_path.join("user-data");
        let meta_data = temp_path.join("meta-data");
        let network_config = temp_path.join("network-config");
        std::fs::write(&user_data, &seed.user_data)?;
        std::fs::write(&meta_data, &seed.meta_data)?;
        std::fs::write(&network_config, &seed.network_config)?;

        let iso_path = temp_path.join(format!("{}.cloudinit.iso", vm_name));
        let args: Vec<String> = vec![
            "-output".to_string(),
            iso_path.to_string_lossy().into_owned(),
            "-V".to_string(),
            "cidata".to_string(),
            "-r".to_string(),
            "-J".to_string(),
            user_data.to_string_lossy().into_owned(),
            meta_data.to_string_lossy().into_owned(),
            network_config.to_string_lossy().into_owned(),
        ];

        let output = runner.run(&self.iso_tool, &args)?;
        if !output.success() {
            warn!(status = output.status, stderr = %output.stderr.trim(), "ISO generation failed");
            return Err(HypervisorError::PackagingFailed {
                command: command_line(&self.iso_tool, &args),
                status: output.status,
            });
        }

        std::fs::copy(&iso_path, target)?;

        info!("Cloud-init seed packaged");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::MockRunner;

    fn config() -> SeedConfig {
        SeedConfig::new(2).with_user(UserSpec::new("admin").with_ssh_key("ssh-ed25519 AAAAC3 admin@host"))
    }

    fn yaml(doc: &str) -> serde_yaml::Value {
        serde_yaml::from_str(doc).unwrap()
    }

    #[test]
    fn test_meta_data() {
        let seed = CloudInitBuilder::new().render("web01", &config()).unwrap();
        let meta = yaml(&seed.meta_data);
        assert_eq!(meta["instance-id"].as_str(), Some("iid-web01"));
        assert_eq!(meta["local-hostname"].as_str(), Some("web01"));
    }

    #[test]
    fn test_user_data() {
        let seed = CloudInitBuilder::new().render("web01", &config()).unwrap();
        assert!(seed.user_data.starts_with("#cloud-config\n"));

        let user = yaml(&seed.user_data);
        assert_eq!(user["fqdn"].as_str(), Some(DEFAULT_FQDN));
        assert_eq!(user["timezone"].as_str(), Some(DEFAULT_TIMEZONE));

        let users = user["users"].as_sequence().unwrap();
        assert_eq!(users.len(), 1);
        let admin = &users[0];
        assert_eq!(admin["name"].as_str(), Some("admin"));
        assert_eq!(admin["lock_passwd"].as_bool(), Some(false));
        assert_eq!(admin["shell"].as_str(), Some("/bin/bash"));
        assert_eq!(admin["sudo"].as_str(), Some("ALL=(ALL) NOPASSWD:ALL"));
        assert_eq!(admin["groups"].as_str(), Some("sudo"));
        assert_eq!(admin["ssh_authorized_keys"][0].as_str(), Some("ssh-ed25519 AAAAC3 admin@host"));

        let hash = admin["passwd"].as_str().unwrap();
        assert!(hash.starts_with("$6$"));
        assert!(sha_crypt::sha512_check(DEFAULT_PASSWORD, hash).is_ok());
    }

    #[test]
    fn test_configured_password_and_defaults_override() {
        let mut cfg = SeedConfig::new(0).with_user(UserSpec::new("ops").with_password("s3cret"));
        cfg.fqdn = Some("web01.lab.local".to_string());
        cfg.timezone = Some("Asia/Jakarta".to_string());

        let seed = CloudInitBuilder::new().render("web01", &cfg).unwrap();
        let user = yaml(&seed.user_data);
        assert_eq!(user["fqdn"].as_str(), Some("web01.lab.local"));
        assert_eq!(user["timezone"].as_str(), Some("Asia/Jakarta"));

        let hash = user["users"][0]["passwd"].as_str().unwrap();
        assert!(sha_crypt::sha512_check("s3cret", hash).is_ok());
        assert!(sha_crypt::sha512_check(DEFAULT_PASSWORD, hash).is_err());
    }

    #[test]
    fn test_network_config() {
        let seed = CloudInitBuilder::new().render("web01", &config()).unwrap();
        let net = yaml(&seed.network_config);
        assert_eq!(net["version"].as_u64(), Some(2));

        let ethernets = net["ethernets"].as_mapping().unwrap();
        assert_eq!(ethernets.len(), 2);
        for name in ["enp1s0", "enp2s0"] {
            assert_eq!(net["ethernets"][name]["dhcp4"].as_bool(), Some(true));
            assert_eq!(net["ethernets"][name]["dhcp6"].as_bool(), Some(false));
        }
    }

    #[test]
    fn test_render_is_deterministic_apart_from_salt() {
        let builder = CloudInitBuilder::new();
        let a = builder.render("web01", &config()).unwrap();
        let b = builder.render("web01", &config()).unwrap();
        assert_eq!(a.meta_data, b.meta_data);
        assert_eq!(a.network_config, b.network_config);
    }

    #[test]
    fn test_package_invokes_iso_tool() {
        let out = tempfile::tempdir().unwrap();
        let target = out.path().join("web01.cloudinit.iso");
        let runner = MockRunner::new();
        let seed = CloudInitBuilder::new().render("web01", &config()).unwrap();

        CloudInitBuilder::new().package(&runner, "web01", &seed, &target).unwrap();
        assert!(target.exists());

        let call = &runner.calls_to("genisoimage")[0];
        let label = call.iter().position(|a| a == "-V").unwrap();
        assert_eq!(call[label + 1], "cidata");
        assert!(call.contains(&"-r".to_string()));
        assert!(call.contains(&"-J".to_string()));
        let files: Vec<&String> = call.iter().rev().take(3).collect();
        assert!(files[0].ends_with("network-config"));
        assert!(files[1].ends_with("meta-data"));
        assert!(files[2].ends_with("user-data"));

        // Scratch directory is gone.
        let scratch = std::path::Path::new(&call[2]).parent().unwrap().to_path_buf();
        assert!(!scratch.exists());
    }

    #[test]
    fn test_package_failure_cleans_up() {
        let out = tempfile::tempdir().unwrap();
        let target = out.path().join("web01.cloudinit.iso");
        let runner = MockRunner::new();
        runner.fail_with(2);
        let seed = CloudInitBuilder::new().render("web01", &config()).unwrap();

        let err = CloudInitBuilder::new().package(&runner, "web01", &seed, &target).unwrap_err();
        assert!(matches!(err, HypervisorError::PackagingFailed { status: 2, .. }));
        assert!(!target.exists());

        let call = &runner.calls_to("genisoimage")[0];
        let scratch = std::path::Path::new(&call[2]).parent().unwrap().to_path_buf();
        assert!(!scratch.exists());
    }
}
