//! Process-wide configuration, loaded once at startup.
//!
//! Everything the saga and lifecycle components need (template image, artifact
//! directories, address pools, bridge) comes from one `Config` value passed by
//! reference. Nothing reads ambient global state, so tests can run against
//! isolated temporary roots.

use std::net::{Ipv4Addr, Ipv6Addr};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::ProvisionError;

/// Default location of the configuration file written by the installer wizard.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/blockhost/config.yaml";

fn default_artifact_root() -> Utf8PathBuf {
    Utf8PathBuf::from("/var/lib/blockhost")
}

fn default_guest_username() -> String {
    "blockhost".to_string()
}

fn default_expiry_days() -> i64 {
    30
}

fn default_gc_grace_days() -> i64 {
    7
}

/// IPv4 pool definition: addresses are handed out from `start..=end`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpPoolConfig {
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
    pub gateway: Ipv4Addr,
}

/// Optional IPv6 address broker. When absent, VMs come up IPv4-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ipv6Config {
    /// Base address; allocations are formed by offsetting into this prefix.
    pub prefix: Ipv6Addr,
    pub gateway: Option<Ipv6Addr>,
    /// Host interface that routes for allocated addresses attach to.
    pub route_dev: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Immutable base qcow2 image that per-VM overlays are backed by.
    pub template_image: Utf8PathBuf,

    /// Root for all per-VM artifacts (disks, cloud-init seeds, domain XML).
    /// The action gateway confines filesystem parameters to this prefix.
    #[serde(default = "default_artifact_root")]
    pub artifact_root: Utf8PathBuf,

    /// VM database file. Defaults to `<artifact_root>/db.yaml`.
    #[serde(default)]
    pub state_file: Option<Utf8PathBuf>,

    /// Linux bridge VMs attach to. The wizard-written config is the single
    /// source of truth for this; there is no runtime auto-discovery.
    pub bridge_interface: String,

    pub ip_pool: IpPoolConfig,

    #[serde(default)]
    pub ipv6: Option<Ipv6Config>,

    #[serde(default = "default_guest_username")]
    pub guest_username: String,

    /// Credential-signing endpoint handed to the guest via cloud-init.
    pub signing_endpoint: String,

    #[serde(default = "default_expiry_days")]
    pub expiry_days: i64,

    #[serde(default = "default_gc_grace_days")]
    pub gc_grace_days: i64,

    /// Optional user-data template; a built-in default is used when unset.
    #[serde(default)]
    pub user_data_template: Option<Utf8PathBuf>,
}

impl Config {
    pub fn load(path: &Utf8Path) -> Result<Self, ProvisionError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ProvisionError::Configuration(format!("cannot read config {path}: {e}"))
        })?;
        serde_yaml::from_str(&raw)
            .map_err(|e| ProvisionError::Configuration(format!("cannot parse config {path}: {e}")))
    }

    pub fn state_file(&self) -> Utf8PathBuf {
        self.state_file
            .clone()
            .unwrap_or_else(|| self.artifact_root.join("db.yaml"))
    }

    pub fn vm_disk_dir(&self) -> Utf8PathBuf {
        self.artifact_root.join("vms")
    }

    pub fn cloud_init_dir(&self) -> Utf8PathBuf {
        self.artifact_root.join("cloud-init")
    }

    pub fn domain_xml_dir(&self) -> Utf8PathBuf {
        self.artifact_root.join("domains")
    }

    /// Path of the qcow2 overlay for a VM. Also the collision guard: an
    /// existing file here means the name is taken.
    pub fn disk_path(&self, name: &str) -> Utf8PathBuf {
        self.vm_disk_dir().join(format!("{name}.qcow2"))
    }

    pub fn domain_xml_path(&self, name: &str) -> Utf8PathBuf {
        self.domain_xml_dir().join(format!("{name}.xml"))
    }
}

/// Config pointing every path at an isolated root, for tests.
#[cfg(test)]
pub(crate) fn test_config(root: &Utf8Path) -> Config {
    Config {
        template_image: root.join("template.qcow2"),
        artifact_root: root.to_owned(),
        state_file: None,
        bridge_interface: "br0".to_string(),
        ip_pool: IpPoolConfig {
            start: Ipv4Addr::new(10, 0, 0, 5),
            end: Ipv4Addr::new(10, 0, 0, 20),
            gateway: Ipv4Addr::new(10, 0, 0, 1),
        },
        ipv6: None,
        guest_username: "blockhost".to_string(),
        signing_endpoint: "https://sign.example/api".to_string(),
        expiry_days: 30,
        gc_grace_days: 7,
        user_data_template: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let yaml = r#"
template_image: /var/lib/blockhost/template.qcow2
bridge_interface: br0
signing_endpoint: https://sign.example/api
ip_pool:
  start: 10.0.0.5
  end: 10.0.0.50
  gateway: 10.0.0.1
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.artifact_root, Utf8PathBuf::from("/var/lib/blockhost"));
        assert_eq!(cfg.expiry_days, 30);
        assert_eq!(cfg.gc_grace_days, 7);
        assert!(cfg.ipv6.is_none());
        assert_eq!(cfg.state_file(), Utf8PathBuf::from("/var/lib/blockhost/db.yaml"));
        assert_eq!(
            cfg.disk_path("web01"),
            Utf8PathBuf::from("/var/lib/blockhost/vms/web01.qcow2")
        );
    }

    #[test]
    fn parses_ipv6_section() {
        let yaml = r#"
template_image: /t.qcow2
bridge_interface: br0
signing_endpoint: https://sign.example/api
ip_pool:
  start: 10.0.0.5
  end: 10.0.0.50
  gateway: 10.0.0.1
ipv6:
  prefix: "2001:db8:100::"
  route_dev: br0
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        let v6 = cfg.ipv6.unwrap();
        assert_eq!(v6.route_dev, "br0");
        assert!(v6.gateway.is_none());
    }
}
