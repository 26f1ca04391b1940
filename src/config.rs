use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::cipher::XorTable;
use crate::services::{SERVICE_PORT_RANGE, ServiceRegistry};

/// Top-level sniffer configuration, loaded from a TOML file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub network: NetworkConfig,
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub ui: UiConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    /// Capture interface name.
    pub interface: String,
    /// libpcap snap length.
    #[serde(default = "default_snaplen")]
    pub snaplen: i32,
    /// Game server address for the BPF filter; may be a network prefix.
    #[serde(rename = "serverIP")]
    pub server_ip: String,
    #[serde(rename = "portRange")]
    pub port_range: PortRange,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolConfig {
    /// Overrides the stock service map when non-empty.
    #[serde(default)]
    pub services: Vec<ServiceEntry>,
    /// XOR keystream table as a hex string.
    pub xor_key: String,
    /// Keystream period; must not exceed the decoded key length.
    pub xor_limit: u16,
    /// Message schema file mapping operation codes to command names.
    #[serde(default)]
    pub commands: Option<PathBuf>,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceEntry {
    pub port: u16,
    pub name: String,
}

/// Per-direction verbose message logging.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct LogConfig {
    #[serde(default)]
    pub client: bool,
    #[serde(default)]
    pub server: bool,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct UiConfig {
    /// Port for the demo UI; recognized for config compatibility.
    pub port: Option<u16>,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        Self::from_toml(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Collect every configuration problem; empty means valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.network.interface.is_empty() {
            errors.push("network.interface must not be empty".to_string());
        }
        if self.network.snaplen < 1 {
            errors.push(format!(
                "network.snaplen must be positive, got {}",
                self.network.snaplen
            ));
        }
        if self.network.server_ip.is_empty() {
            errors.push("network.serverIP must not be empty".to_string());
        }
        if self.network.port_range.start > self.network.port_range.end {
            errors.push(format!(
                "network.portRange start {} exceeds end {}",
                self.network.port_range.start, self.network.port_range.end
            ));
        }

        for entry in &self.protocol.services {
            if !SERVICE_PORT_RANGE.contains(&entry.port) {
                errors.push(format!(
                    "service {:?} port {} outside known range {}-{}",
                    entry.name,
                    entry.port,
                    SERVICE_PORT_RANGE.start(),
                    SERVICE_PORT_RANGE.end()
                ));
            }
        }

        match hex::decode(&self.protocol.xor_key) {
            Ok(key) => {
                if let Err(err) = XorTable::new(key, self.protocol.xor_limit) {
                    errors.push(err.to_string());
                }
            }
            Err(err) => errors.push(format!("protocol.xorKey is not valid hex: {err}")),
        }

        errors
    }

    /// Like [`Config::validate`] but as a hard failure for boot.
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            bail!("invalid configuration:\n  - {}", errors.join("\n  - "));
        }
    }

    /// The service registry this config describes: the explicit list when
    /// given, the stock map otherwise.
    pub fn service_registry(&self) -> ServiceRegistry {
        if self.protocol.services.is_empty() {
            ServiceRegistry::defaults()
        } else {
            ServiceRegistry::new(
                self.protocol
                    .services
                    .iter()
                    .map(|s| (s.port, s.name.clone())),
            )
        }
    }

    /// Build the keystream table from the configured hex key and period.
    pub fn xor_table(&self) -> Result<XorTable> {
        let key = hex::decode(&self.protocol.xor_key).context("protocol.xorKey is not valid hex")?;
        XorTable::new(key, self.protocol.xor_limit).context("invalid XOR keystream parameters")
    }
}

fn default_snaplen() -> i32 {
    65535
}
