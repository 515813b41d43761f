use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// CNI versions this plugin can speak
pub const SUPPORTED_VERSIONS: &[&str] = &["0.3.0", "0.3.1", "0.4.0", "1.0.0"];

/// Generic CNI error code used for plugin failures
pub const ERR_GENERIC: u32 = 100;

/// CNI command arguments
#[derive(Debug, Clone)]
pub struct CmdArgs {
    /// Container ID
    pub container_id: String,
    /// Network namespace path
    pub netns: String,
    /// Interface name
    pub ifname: String,
    /// Arguments
    pub args: HashMap<String, String>,
    /// Path
    pub path: String,
    /// Standard input data
    pub stdin_data: Vec<u8>,
}

/// Current result format (CNI 1.0.0)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Result {
    /// CNI specification version
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    /// Interfaces created
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interfaces: Option<Vec<Interface>>,
}

/// Interface information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interface {
    /// Interface name
    pub name: String,
    /// MAC address
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    /// Sandbox path (network namespace)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<String>,
}

/// Error reported to the runtime on failure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Error {
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    pub code: u32,
    pub msg: String,
    #[serde(default)]
    pub details: String,
}

/// Answer to the VERSION command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionInfo {
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    #[serde(rename = "supportedVersions")]
    pub supported_versions: Vec<String>,
}

impl Result {
    /// Create a new empty result
    pub fn new(cni_version: &str) -> Self {
        Self {
            cni_version: cni_version.to_string(),
            interfaces: None,
        }
    }

    /// Add an interface to the result
    pub fn add_interface(&mut self, interface: Interface) {
        self.interfaces.get_or_insert_with(Vec::new).push(interface);
    }

    /// Print result as JSON
    pub fn print(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        println!("{}", json);
        Ok(())
    }
}

impl Error {
    /// Build a generic plugin error from any failure, keeping its cause chain
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        let details = err
            .chain()
            .skip(1)
            .map(|cause| cause.to_string())
            .collect::<Vec<_>>()
            .join(": ");

        Self {
            cni_version: "1.0.0".to_string(),
            code: ERR_GENERIC,
            msg: err.to_string(),
            details,
        }
    }
}

impl VersionInfo {
    pub fn current() -> Self {
        Self {
            cni_version: "1.0.0".to_string(),
            supported_versions: SUPPORTED_VERSIONS.iter().map(|v| v.to_string()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_omits_empty_fields() {
        let mut result = Result::new("1.0.0");
        result.add_interface(Interface {
            name: "net1".to_string(),
            mac: None,
            sandbox: Some("/var/run/netns/pod".to_string()),
        });

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["interfaces"][0]["name"], "net1");
        assert!(json["interfaces"][0].get("mac").is_none());
    }

    #[test]
    fn test_error_keeps_cause_chain() {
        let err = anyhow::anyhow!("File exists").context("Failed to set up VF");
        let cni_err = Error::from_anyhow(&err);
        assert_eq!(cni_err.code, ERR_GENERIC);
        assert_eq!(cni_err.msg, "Failed to set up VF");
        assert_eq!(cni_err.details, "File exists");
    }
}
