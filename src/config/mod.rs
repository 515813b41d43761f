use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Longest interface name the kernel accepts (IFNAMSIZ - 1)
pub const MAX_IFNAME_LEN: usize = 15;

/// Plugin type name as it appears in network configurations
pub const PLUGIN_TYPE: &str = "ib-sriov";

/// Configuration for the IB SR-IOV plugin installation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginConfig {
    /// Path to the CNI bin directory
    pub cni_bin_dir: PathBuf,
    /// Path to the CNI config directory
    pub cni_conf_dir: PathBuf,
    /// Default PF (master) interface name
    pub default_master: String,
    /// Host VF interface written into the default network list
    pub default_host_if: String,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            cni_bin_dir: PathBuf::from("/opt/cni/bin"),
            cni_conf_dir: PathBuf::from("/etc/cni/net.d"),
            default_master: "ib0".to_string(),
            default_host_if: "ib1".to_string(),
        }
    }
}

impl PluginConfig {
    /// Load from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read(path)
            .with_context(|| format!("Failed to read plugin config {}", path.display()))?;
        serde_json::from_slice(&data)
            .with_context(|| format!("Failed to parse plugin config {}", path.display()))
    }
}

/// Network configuration for one VF attachment.
///
/// `host_if_names` is the VF netdev name on the host. `cont_if_names` is the
/// name it carries inside the container; ADD records `CNI_IFNAME` there.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetConf {
    /// CNI specification version
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    /// Name of the network
    pub name: String,
    /// Type of CNI plugin
    #[serde(rename = "type")]
    pub plugin_type: String,
    /// PF interface the VF belongs to
    pub master: String,
    /// PCI address of the VF
    #[serde(rename = "deviceID", default)]
    pub device_id: String,
    /// VF index on the PF
    #[serde(rename = "vf", default)]
    pub vf_id: u32,
    /// VF interface name on the host
    #[serde(rename = "hostIFNames")]
    pub host_if_names: String,
    /// VF interface name inside the container
    #[serde(rename = "contIFNames", default)]
    pub cont_if_names: String,
}

/// Check an interface name against the kernel's rules
pub fn validate_ifname(name: &str) -> Result<()> {
    if name.is_empty() {
        anyhow::bail!("Interface name is empty");
    }
    if name.len() > MAX_IFNAME_LEN {
        anyhow::bail!(
            "Interface name {} is longer than {} bytes",
            name,
            MAX_IFNAME_LEN
        );
    }
    if name == "." || name == ".." || name.contains('/') || name.contains(char::is_whitespace) {
        anyhow::bail!("Interface name {:?} is not valid", name);
    }
    Ok(())
}

impl NetConf {
    /// Parse NetConf from bytes
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let conf: NetConf = serde_json::from_slice(bytes)
            .context("Failed to parse network configuration")?;

        validate_ifname(&conf.host_if_names).context("Invalid hostIFNames")?;
        if !conf.cont_if_names.is_empty() {
            validate_ifname(&conf.cont_if_names).context("Invalid contIFNames")?;
        }

        Ok(conf)
    }

    /// Create a configuration for a single VF
    pub fn new_default(name: &str, master: &str, device_id: &str, vf_id: u32, host_if: &str) -> Self {
        Self {
            cni_version: "1.0.0".to_string(),
            name: name.to_string(),
            plugin_type: PLUGIN_TYPE.to_string(),
            master: master.to_string(),
            device_id: device_id.to_string(),
            vf_id,
            host_if_names: host_if.to_string(),
            cont_if_names: String::new(),
        }
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)
            .with_context(|| format!("Failed to write network config {}", path.display()))?;
        Ok(())
    }
}

/// Installer for the IB SR-IOV CNI plugin
pub struct Installer {
    config: PluginConfig,
}

impl Installer {
    /// Create a new installer
    pub fn new(config: PluginConfig) -> Self {
        Self { config }
    }

    /// Create the CNI directories and write a default network list.
    ///
    /// Returns the path of the written conflist.
    pub fn install(&self) -> Result<PathBuf> {
        validate_ifname(&self.config.default_host_if).context("Invalid default host interface")?;

        for dir in [&self.config.cni_bin_dir, &self.config.cni_conf_dir] {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        }

        let config_path = self.config.cni_conf_dir.join("10-ib-sriov.conflist");
        let config = serde_json::json!({
            "cniVersion": "1.0.0",
            "name": "ib-sriov-network",
            "plugins": [
                {
                    "type": PLUGIN_TYPE,
                    "master": self.config.default_master,
                    "hostIFNames": self.config.default_host_if,
                }
            ]
        });

        fs::write(&config_path, serde_json::to_string_pretty(&config)?)
            .with_context(|| format!("Failed to write CNI config to {}", config_path.display()))?;

        Ok(config_path)
    }
}
