// Configuration management for the gattkit CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/gattkit/config.json
// - Linux: ~/.config/gattkit/config.json
// - Windows: %APPDATA%\gattkit\config.json

use anyhow::{Context, Result};
use gattkit_core::config::parse_uuid;
use gattkit_core::{FailureAction, NodeConfig, ScanConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Platform backend: "virtual" or "bluez"
    pub backend: String,

    /// Log filter used when RUST_LOG is unset
    pub log_level: String,

    /// Peripheral identity, payloads and failure policy
    pub node: NodeConfig,

    /// Defaults for `gattkit scan` and `gattkit run`
    pub scan: ScanConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: "virtual".to_string(),
            log_level: "info".to_string(),
            node: NodeConfig::default(),
            scan: ScanConfig::default(),
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("gattkit");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from the default location, creating it if missing
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Set a config value in memory; call `save` to persist
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "backend" => {
                if value != "virtual" && value != "bluez" {
                    anyhow::bail!("Unknown backend '{}' (expected virtual or bluez)", value);
                }
                self.backend = value.to_string();
            }
            "log_level" => self.log_level = value.to_string(),
            "device_name" => self.node.device_name = value.to_string(),
            "service_uuid" => self.node.service_uuid = parse_uuid(value)?,
            "characteristic_uuid" => self.node.characteristic_uuid = parse_uuid(value)?,
            "greeting" => self.node.greeting = value.to_string(),
            "welcome_message" => self.node.welcome_message = value.to_string(),
            "notify_interval_secs" => {
                self.node.notify_interval_secs = if value.is_empty() || value == "off" {
                    None
                } else {
                    Some(value.parse().context("Invalid number of seconds")?)
                };
            }
            "on_registration_failure" => {
                self.node.failure_policy.on_registration_failure = value.parse::<FailureAction>()?;
            }
            "on_advertise_failure" => {
                self.node.failure_policy.on_advertise_failure = value.parse::<FailureAction>()?;
            }
            "virtual_queue_capacity" => {
                self.node.virtual_queue_capacity = value.parse().context("Invalid number")?;
            }
            "scan_duration_secs" => {
                self.scan.duration_secs = value.parse().context("Invalid number of seconds")?;
            }
            "allow_duplicates" => {
                self.scan.allow_duplicates = value.parse().context("Invalid boolean value")?;
            }
            "scan_service_uuid" => {
                self.scan.filter.service_uuid = if value.is_empty() {
                    None
                } else {
                    Some(parse_uuid(value)?)
                };
            }
            "name_marker" => {
                self.scan.filter.name_marker = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        self.node.validate().context("Rejected configuration value")?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.list()
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    pub fn list(&self) -> Vec<(String, String)> {
        let optional = |value: Option<String>| value.unwrap_or_else(|| "(none)".to_string());
        vec![
            ("backend".to_string(), self.backend.clone()),
            ("log_level".to_string(), self.log_level.clone()),
            ("device_name".to_string(), self.node.device_name.clone()),
            ("service_uuid".to_string(), self.node.service_uuid.to_string()),
            (
                "characteristic_uuid".to_string(),
                self.node.characteristic_uuid.to_string(),
            ),
            ("greeting".to_string(), self.node.greeting.clone()),
            ("welcome_message".to_string(), self.node.welcome_message.clone()),
            (
                "notify_interval_secs".to_string(),
                optional(self.node.notify_interval_secs.map(|s| s.to_string())),
            ),
            (
                "on_registration_failure".to_string(),
                self.node.failure_policy.on_registration_failure.to_string(),
            ),
            (
                "on_advertise_failure".to_string(),
                self.node.failure_policy.on_advertise_failure.to_string(),
            ),
            (
                "virtual_queue_capacity".to_string(),
                self.node.virtual_queue_capacity.to_string(),
            ),
            (
                "scan_duration_secs".to_string(),
                self.scan.duration_secs.to_string(),
            ),
            (
                "allow_duplicates".to_string(),
                self.scan.allow_duplicates.to_string(),
            ),
            (
                "scan_service_uuid".to_string(),
                optional(self.scan.filter.service_uuid.map(|u| u.to_string())),
            ),
            (
                "name_marker".to_string(),
                optional(self.scan.filter.name_marker.clone()),
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.backend, "virtual");
        assert_eq!(config.node.device_name, "gattkit");
        assert_eq!(config.scan.duration_secs, 15);
    }

    #[test]
    fn test_load_creates_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let config = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_set_persists_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = Config::load_from(&path).unwrap();
        config.set("device_name", "bench-rig").unwrap();
        config.set("allow_duplicates", "true").unwrap();
        config.set("on_advertise_failure", "degrade").unwrap();
        config.save_to(&path).unwrap();

        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded.get("device_name").unwrap(), "bench-rig");
        assert!(reloaded.scan.allow_duplicates);
        assert_eq!(
            reloaded.node.failure_policy.on_advertise_failure,
            FailureAction::Degrade
        );
    }

    #[test]
    fn test_set_rejects_malformed_uuid() {
        let mut config = Config::default();
        assert!(config.set("service_uuid", "1234").is_err());
        assert!(config.set("nope", "x").is_err());
    }

    #[test]
    fn test_set_rejects_invalid_node_config() {
        let mut config = Config::default();
        assert!(config.set("device_name", "").is_err());
    }

    #[test]
    fn test_list_covers_every_gettable_key() {
        let config = Config::default();
        for (key, value) in config.list() {
            assert_eq!(config.get(&key), Some(value));
        }
        assert_eq!(config.get("name_marker").unwrap(), "(none)");
    }
}
