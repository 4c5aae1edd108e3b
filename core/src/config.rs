//! Node configuration

use crate::ble::scanner::ScanConfig;
use crate::ble::types::{Characteristic, Permission, Property, Service};
use crate::platform::{AdvertisementData, DEFAULT_QUEUE_CAPACITY};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

pub const DEFAULT_DEVICE_NAME: &str = "gattkit";
pub const DEFAULT_SERVICE_UUID: Uuid = Uuid::from_u128(0x7a3c0001_9f2d_4e61_b8a4_2c5e1d0f6b93);
pub const DEFAULT_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x7a3c0002_9f2d_4e61_b8a4_2c5e1d0f6b93);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Device name must not be empty")]
    EmptyDeviceName,
    #[error("Invalid UUID '{0}'")]
    InvalidUuid(String),
    #[error("{0} UUID must not be nil")]
    NilUuid(&'static str),
    #[error("Service and characteristic share UUID {0}")]
    SharedUuid(Uuid),
    #[error("Notify interval must be at least one second")]
    InvalidNotifyInterval,
    #[error("Invalid scan settings: {0}")]
    InvalidScan(String),
    #[error("Unknown failure action '{0}' (expected exit or degrade)")]
    InvalidFailureAction(String),
}

/// Parse a 128-bit UUID from user input
pub fn parse_uuid(input: &str) -> Result<Uuid, ConfigError> {
    Uuid::parse_str(input.trim()).map_err(|_| ConfigError::InvalidUuid(input.to_string()))
}

/// What to do when a setup step fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureAction {
    /// Terminate with a fatal exit status
    Exit,
    /// Keep running without advertising
    Degrade,
}

impl fmt::Display for FailureAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureAction::Exit => write!(f, "exit"),
            FailureAction::Degrade => write!(f, "degrade"),
        }
    }
}

impl FromStr for FailureAction {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "exit" => Ok(FailureAction::Exit),
            "degrade" => Ok(FailureAction::Degrade),
            other => Err(ConfigError::InvalidFailureAction(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailurePolicy {
    pub on_registration_failure: FailureAction,
    pub on_advertise_failure: FailureAction,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self {
            on_registration_failure: FailureAction::Degrade,
            on_advertise_failure: FailureAction::Exit,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Local name put in the advertisement
    pub device_name: String,
    pub service_uuid: Uuid,
    pub characteristic_uuid: Uuid,
    /// Prefix of every read response; a timestamp is appended
    pub greeting: String,
    /// Notification pushed to a peer when it subscribes
    pub welcome_message: String,
    /// Push a timestamped notification to all subscribers this often
    pub notify_interval_secs: Option<u64>,
    /// Run the GATT server and advertise
    pub peripheral: bool,
    /// Run one scan session at startup
    pub scan: Option<ScanConfig>,
    pub failure_policy: FailurePolicy,
    /// Notification queue depth of the virtual adapter
    pub virtual_queue_capacity: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            device_name: DEFAULT_DEVICE_NAME.to_string(),
            service_uuid: DEFAULT_SERVICE_UUID,
            characteristic_uuid: DEFAULT_CHARACTERISTIC_UUID,
            greeting: "Hello from gattkit".to_string(),
            welcome_message: "Welcome to gattkit".to_string(),
            notify_interval_secs: None,
            peripheral: true,
            scan: None,
            failure_policy: FailurePolicy::default(),
            virtual_queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl NodeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device_name.trim().is_empty() {
            return Err(ConfigError::EmptyDeviceName);
        }
        if self.service_uuid.is_nil() {
            return Err(ConfigError::NilUuid("Service"));
        }
        if self.characteristic_uuid.is_nil() {
            return Err(ConfigError::NilUuid("Characteristic"));
        }
        if self.service_uuid == self.characteristic_uuid {
            return Err(ConfigError::SharedUuid(self.service_uuid));
        }
        if self.notify_interval_secs == Some(0) {
            return Err(ConfigError::InvalidNotifyInterval);
        }
        if let Some(scan) = &self.scan {
            scan.validate()
                .map_err(|e| ConfigError::InvalidScan(e.to_string()))?;
        }
        Ok(())
    }

    /// The single-characteristic service this node publishes
    pub fn service(&self) -> Service {
        Service::new(self.service_uuid).with_characteristic(
            Characteristic::new(self.characteristic_uuid)
                .with_properties([Property::Read, Property::Write, Property::Notify])
                .with_permissions([Permission::Readable, Permission::Writeable]),
        )
    }

    pub fn advertisement(&self) -> AdvertisementData {
        AdvertisementData::new(&self.device_name, vec![self.service_uuid])
    }

    pub fn notify_interval(&self) -> Option<Duration> {
        self.notify_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = NodeConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.peripheral);
        assert!(config.scan.is_none());
    }

    #[test]
    fn test_service_table_shape() {
        let service = NodeConfig::default().service();
        assert!(service.primary);
        assert_eq!(service.characteristics.len(), 1);

        let characteristic = &service.characteristics[0];
        assert_eq!(characteristic.uuid, DEFAULT_CHARACTERISTIC_UUID);
        assert!(characteristic.has_property(Property::Read));
        assert!(characteristic.has_property(Property::Write));
        assert!(characteristic.has_property(Property::Notify));
        assert!(characteristic.permissions.contains(&Permission::Writeable));
    }

    #[test]
    fn test_advertisement_carries_service_uuid() {
        let data = NodeConfig::default().advertisement();
        assert_eq!(data.local_name, "gattkit");
        assert_eq!(data.service_uuids, vec![DEFAULT_SERVICE_UUID]);
    }

    #[test]
    fn test_parse_uuid() {
        assert_eq!(
            parse_uuid("7a3c0001-9f2d-4e61-b8a4-2c5e1d0f6b93"),
            Ok(DEFAULT_SERVICE_UUID)
        );
        assert_eq!(
            parse_uuid("not-a-uuid"),
            Err(ConfigError::InvalidUuid("not-a-uuid".to_string()))
        );
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = NodeConfig {
            device_name: " ".to_string(),
            ..NodeConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::EmptyDeviceName));

        config.device_name = "n".to_string();
        config.characteristic_uuid = config.service_uuid;
        assert_eq!(
            config.validate(),
            Err(ConfigError::SharedUuid(DEFAULT_SERVICE_UUID))
        );

        config.characteristic_uuid = DEFAULT_CHARACTERISTIC_UUID;
        config.scan = Some(ScanConfig {
            duration_secs: 0,
            ..ScanConfig::default()
        });
        assert!(matches!(config.validate(), Err(ConfigError::InvalidScan(_))));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: NodeConfig =
            serde_json::from_str(r#"{"device_name":"lab","scan":{"duration_secs":5}}"#)
                .expect("parse");
        assert_eq!(config.device_name, "lab");
        assert_eq!(config.service_uuid, DEFAULT_SERVICE_UUID);
        let scan = config.scan.expect("scan");
        assert_eq!(scan.duration_secs, 5);
        assert!(!scan.allow_duplicates);
    }

    #[test]
    fn test_failure_policy_serde() {
        let policy: FailurePolicy =
            serde_json::from_str(r#"{"on_registration_failure":"exit"}"#).expect("parse");
        assert_eq!(policy.on_registration_failure, FailureAction::Exit);
        assert_eq!(policy.on_advertise_failure, FailureAction::Exit);
        assert_eq!("Degrade".parse::<FailureAction>(), Ok(FailureAction::Degrade));
    }
}
