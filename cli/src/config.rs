// Configuration management for the blesc CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/blesc/config.json
// - Linux: ~/.config/blesc/config.json
// - Windows: %APPDATA%\blesc\config.json

use anyhow::{Context, Result};
use blesc_core::store::MacAddress;
use blesc_core::ScannerSettings;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Radio address of the simulated node, `AA:BB:CC:DD:EE:FF`
    pub node_mac: String,

    /// Storage path for the node records
    pub storage_path: Option<String>,

    /// Default log filter when `RUST_LOG` is unset
    pub log_level: String,

    /// Emit JSON log lines
    pub log_json: bool,

    /// Also write logs to a daily rolling file in this directory
    pub log_dir: Option<String>,

    /// Scanner timing
    pub scanner: ScannerSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_mac: "C0:01:02:03:04:05".to_string(),
            storage_path: None,
            log_level: "warn".to_string(),
            log_json: false,
            log_dir: None,
            scanner: ScannerSettings::default(),
        }
    }
}

/// Parse `AA:BB:CC:DD:EE:FF`, most significant octet first.
/// The stack wants least significant first, so the bytes are reversed.
pub fn parse_mac(text: &str) -> Result<MacAddress> {
    let octets: Vec<&str> = text.split(':').collect();
    if octets.len() != 6 {
        anyhow::bail!("Invalid MAC address: {}", text);
    }
    let mut mac = [0u8; 6];
    for (byte, octet) in mac.iter_mut().rev().zip(octets) {
        *byte = u8::from_str_radix(octet, 16)
            .with_context(|| format!("Invalid MAC octet: {}", octet))?;
    }
    Ok(mac)
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("blesc");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the data directory path (cross-platform)
    pub fn data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .context("Failed to determine data directory")?
            .join("blesc");

        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        Ok(data_dir)
    }

    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from file, or the defaults if there is none yet
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }
        let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
        let config: Config =
            serde_json::from_str(&contents).context("Failed to parse config file")?;
        config
            .scanner
            .validate()
            .context("Invalid scanner settings in config file")?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Where the sled database lives
    pub fn store_path(&self) -> Result<PathBuf> {
        match &self.storage_path {
            Some(path) => Ok(PathBuf::from(path)),
            None => Ok(Self::data_dir()?.join("records")),
        }
    }

    pub fn node_mac(&self) -> Result<MacAddress> {
        parse_mac(&self.node_mac)
    }

    /// Set a config value. Scanner settings that fail validation are
    /// left unchanged.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let previous = self.scanner.clone();
        match key {
            "node_mac" => {
                parse_mac(value)?;
                self.node_mac = value.to_string();
            }
            "storage_path" => {
                self.storage_path = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            "log_level" => self.log_level = value.to_string(),
            "log_json" => {
                self.log_json = value.parse().context("Invalid boolean value")?;
            }
            "log_dir" => {
                self.log_dir = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            "sample_threshold" => {
                self.scanner.sample_threshold = value.parse().context("Invalid number")?;
            }
            "scan_connect_interval_ms" => {
                self.scanner.scan_connect_interval_ms =
                    value.parse().context("Invalid number")?;
            }
            "inactivity_timeout_ms" => {
                self.scanner.inactivity_timeout_ms = value.parse().context("Invalid number")?;
            }
            "list_timeout_ms" => {
                self.scanner.list_timeout_ms = value.parse().context("Invalid number")?;
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        if let Err(e) = self.scanner.validate() {
            self.scanner = previous;
            return Err(e).context("Rejected scanner setting");
        }
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.list()
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        let s = &self.scanner;
        vec![
            ("node_mac".to_string(), self.node_mac.clone()),
            (
                "storage_path".to_string(),
                self.storage_path.clone().unwrap_or_else(|| "(auto)".to_string()),
            ),
            ("log_level".to_string(), self.log_level.clone()),
            ("log_json".to_string(), self.log_json.to_string()),
            (
                "log_dir".to_string(),
                self.log_dir.clone().unwrap_or_else(|| "(none)".to_string()),
            ),
            ("sample_threshold".to_string(), s.sample_threshold.to_string()),
            (
                "scan_connect_interval_ms".to_string(),
                s.scan_connect_interval_ms.to_string(),
            ),
            (
                "inactivity_timeout_ms".to_string(),
                s.inactivity_timeout_ms.to_string(),
            ),
            ("list_timeout_ms".to_string(), s.list_timeout_ms.to_string()),
            ("day_period".to_string(), format!("{}s", s.day_period_secs())),
            ("night_period".to_string(), format!("{}s", s.night_period_secs())),
        ]
    }
}
