use std::collections::HashMap;
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use log::LevelFilter;
use serde::Deserialize;

/// Environment variable overriding `netbox.token`.
pub(crate) const TOKEN_ENV: &str = "NETBOX_TOKEN";

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_PAGE_SIZE: u32 = 1000;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("netbox.address must not be empty")]
    MissingAddress,
    #[error("NetBox token is not set (netbox.token or NETBOX_TOKEN)")]
    MissingToken,
    #[error("invalid log level '{0}'")]
    LogLevel(String),
    #[error("unsupported connector '{kind}' for IP {ip}, check the inventory file")]
    UnknownConnector { kind: String, ip: IpAddr },
}

#[derive(Deserialize, Debug)]
#[cfg_attr(test, derive(PartialEq))]
pub struct Config {
    pub(crate) netbox: NetboxConfig,
    #[serde(default)]
    pub(crate) log_level: Option<String>,
    /// Skip devices that cannot be collected or looked up instead of aborting the run.
    #[serde(default)]
    pub(crate) continue_on_error: bool,
    #[serde(default)]
    pub(crate) connectors: HashMap<String, ConnectorSettings>,
}

#[derive(Deserialize, Debug)]
#[cfg_attr(test, derive(PartialEq))]
pub struct NetboxConfig {
    pub(crate) address: String,
    #[serde(default)]
    pub(crate) token: String,
    #[serde(default)]
    pub(crate) verify_tls: bool,
    #[serde(default = "default_timeout_secs")]
    pub(crate) timeout_secs: u64,
    #[serde(default = "default_page_size")]
    pub(crate) page_size: u32,
}

impl NetboxConfig {
    pub(crate) fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Per connector kind overrides; unset values fall back to the vendor defaults.
#[derive(Deserialize, Debug, Default, Clone, PartialEq)]
pub struct ConnectorSettings {
    #[serde(default)]
    pub(crate) port: Option<u16>,
    #[serde(default)]
    pub(crate) timeout_secs: Option<u64>,
    #[serde(default)]
    pub(crate) drop_disabled_undescribed: Option<bool>,
}

impl ConnectorSettings {
    pub(crate) fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS))
    }
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_page_size() -> u32 {
    DEFAULT_PAGE_SIZE
}

impl Config {
    pub(crate) fn load(path: &str) -> Result<Config, anyhow::Error> {
        let data = fs::read_to_string(path).with_context(|| format!("Reading config {path}"))?;
        let token = std::env::var(TOKEN_ENV).ok().filter(|t| !t.is_empty());

        Config::from_yaml(&data, token).with_context(|| format!("Parsing config {path}"))
    }

    pub(crate) fn from_yaml(data: &str, token: Option<String>) -> Result<Config, anyhow::Error> {
        let mut config: Config = serde_yaml::from_str(data)?;
        if let Some(token) = token {
            config.netbox.token = token;
        }

        config.connectors = config
            .connectors
            .into_iter()
            .map(|(kind, settings)| (kind.trim().to_lowercase(), settings))
            .collect();

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.netbox.address.trim().is_empty() {
            return Err(ConfigError::MissingAddress);
        }
        if self.netbox.token.trim().is_empty() {
            return Err(ConfigError::MissingToken);
        }
        if let Some(level) = &self.log_level {
            level
                .parse::<LevelFilter>()
                .map_err(|_| ConfigError::LogLevel(level.clone()))?;
        }

        Ok(())
    }

    pub(crate) fn log_level(&self) -> Option<LevelFilter> {
        self.log_level.as_deref().and_then(|l| l.parse().ok())
    }

    pub(crate) fn connector_settings(&self, kind: &str) -> ConnectorSettings {
        self.connectors.get(kind).cloned().unwrap_or_default()
    }
}

/// One row of the inventory file.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct InventoryEntry {
    pub(crate) ip: IpAddr,
    pub(crate) connector: String,
}

pub(crate) fn read_inventory(path: &str) -> Result<Vec<InventoryEntry>, anyhow::Error> {
    if !Path::new(path).is_file() {
        anyhow::bail!("Inventory file {path} doesn't exist");
    }

    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("Opening inventory {path}"))?;

    reader
        .deserialize::<InventoryEntry>()
        .enumerate()
        .map(|(index, row)| {
            let mut entry = row.with_context(|| format!("Inventory {path}, row {}", index + 1))?;
            entry.connector = entry.connector.trim().to_lowercase();
            Ok(entry)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
    use std::time::Duration;

    use log::LevelFilter;

    use crate::config::{read_inventory, Config, ConfigError, ConnectorSettings, InventoryEntry};

    #[test]
    fn load_config_successfully() -> Result<(), anyhow::Error> {
        let config = Config::load("testdata/config/nbi.yaml")?;

        assert_eq!(config.netbox.address, "https://netbox.example.com");
        assert_eq!(config.netbox.timeout(), Duration::from_secs(10));
        assert_eq!(config.netbox.page_size, 1000);
        assert!(!config.netbox.verify_tls);
        assert_eq!(config.log_level(), Some(LevelFilter::Info));
        assert!(!config.continue_on_error);
        assert_eq!(
            config.connector_settings("juniper"),
            ConnectorSettings {
                port: Some(22),
                timeout_secs: None,
                drop_disabled_undescribed: Some(true),
            }
        );
        assert_eq!(config.connector_settings("eltex"), ConnectorSettings::default());

        Ok(())
    }

    #[test]
    fn token_override_wins() -> Result<(), anyhow::Error> {
        let config = Config::from_yaml(
            "netbox:\n  address: http://nb\n  token: from-file\n",
            Some("from-env".to_string()),
        )?;
        assert_eq!(config.netbox.token, "from-env");

        Ok(())
    }

    #[test]
    fn missing_token_is_rejected() {
        let err = Config::from_yaml("netbox:\n  address: http://nb\n", None).unwrap_err();
        assert_eq!(
            err.downcast_ref::<ConfigError>(),
            Some(&ConfigError::MissingToken)
        );
    }

    #[test]
    fn invalid_log_level_is_rejected() {
        let err = Config::from_yaml(
            "netbox:\n  address: http://nb\n  token: t\nlog_level: loud\n",
            None,
        )
        .unwrap_err();
        assert_eq!(
            err.downcast_ref::<ConfigError>(),
            Some(&ConfigError::LogLevel("loud".to_string()))
        );
    }

    #[test]
    fn load_config_fails_due_to_missing_file() {
        let err = Config::load("<missing>").unwrap_err();
        assert!(format!("{err:#}").contains("No such file or directory"));
    }

    #[test]
    fn read_inventory_successfully() -> Result<(), anyhow::Error> {
        let inventory = read_inventory("testdata/config/inventory.csv")?;

        assert_eq!(
            inventory,
            vec![
                InventoryEntry {
                    ip: IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)),
                    connector: "eltex".to_string(),
                },
                InventoryEntry {
                    ip: IpAddr::V4(Ipv4Addr::new(192, 0, 2, 2)),
                    connector: "juniper".to_string(),
                },
                InventoryEntry {
                    ip: IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 3)),
                    connector: "eltex".to_string(),
                },
            ]
        );

        Ok(())
    }

    #[test]
    fn read_inventory_fails_due_to_bad_address() {
        let err = read_inventory("testdata/config/inventory_invalid.csv").unwrap_err();
        assert!(format!("{err:#}").contains("row 2"));
    }

    #[test]
    fn read_inventory_fails_due_to_missing_file() {
        let err = read_inventory("<missing>").unwrap_err();
        assert!(err.to_string().contains("doesn't exist"));
    }
}
