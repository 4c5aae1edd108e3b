//! Data model shared by the peripheral and central roles.
//!
//! Services and characteristics are plain values; the subscriber sets that the
//! data model attaches to a characteristic are held by
//! [`SubscriptionManager`](crate::ble::SubscriptionManager) so the service table
//! can be cloned and handed to the platform without carrying connection state.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use uuid::Uuid;

// ============================================================================
// ADAPTER STATE
// ============================================================================

/// Power/availability state reported by the host adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AdapterState {
    /// State not yet discovered (startup, or after a platform restart)
    #[default]
    Unknown,
    /// Platform Bluetooth service is restarting
    Resetting,
    /// Host has no BLE capable radio
    Unsupported,
    /// Process is not allowed to use Bluetooth
    Unauthorized,
    /// Radio present but switched off
    PoweredOff,
    /// Radio on and usable
    PoweredOn,
}

/// How dependents should react to an adapter state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Waiting,
    Fatal,
}

impl AdapterState {
    pub fn is_powered_on(&self) -> bool {
        *self == AdapterState::PoweredOn
    }

    /// `Unsupported` and `Unauthorized` never recover within the process lifetime
    pub fn is_fatal(&self) -> bool {
        matches!(self, AdapterState::Unsupported | AdapterState::Unauthorized)
    }

    /// States that are expected to resolve on their own through re-discovery
    pub fn is_transient(&self) -> bool {
        matches!(self, AdapterState::Unknown | AdapterState::Resetting)
    }

    pub fn readiness(&self) -> Readiness {
        if self.is_powered_on() {
            Readiness::Ready
        } else if self.is_fatal() {
            Readiness::Fatal
        } else {
            Readiness::Waiting
        }
    }
}

impl fmt::Display for AdapterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdapterState::Unknown => write!(f, "Unknown"),
            AdapterState::Resetting => write!(f, "Resetting"),
            AdapterState::Unsupported => write!(f, "Unsupported"),
            AdapterState::Unauthorized => write!(f, "Unauthorized"),
            AdapterState::PoweredOff => write!(f, "PoweredOff"),
            AdapterState::PoweredOn => write!(f, "PoweredOn"),
        }
    }
}

// ============================================================================
// PEERS & REQUESTS
// ============================================================================

/// Opaque identifier for a remote connection or subscription context.
///
/// Only equality is meaningful; identifiers are not stable across platform
/// restarts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Platform token correlating a request with its response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Remote read of a characteristic value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRequest {
    pub id: RequestId,
    pub peer: PeerId,
    pub characteristic: Uuid,
    /// Byte offset into the value (long reads)
    pub offset: usize,
}

/// Remote write of a characteristic value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRequest {
    pub id: RequestId,
    pub peer: PeerId,
    pub characteristic: Uuid,
    pub payload: Vec<u8>,
}

/// ATT outcome of a read or write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttStatus {
    Success,
    AttributeNotFound,
    ReadNotPermitted,
    WriteNotPermitted,
    InvalidOffset,
}

impl fmt::Display for AttStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttStatus::Success => write!(f, "Success"),
            AttStatus::AttributeNotFound => write!(f, "AttributeNotFound"),
            AttStatus::ReadNotPermitted => write!(f, "ReadNotPermitted"),
            AttStatus::WriteNotPermitted => write!(f, "WriteNotPermitted"),
            AttStatus::InvalidOffset => write!(f, "InvalidOffset"),
        }
    }
}

/// The single response owed to every inbound request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttResponse {
    pub request: RequestId,
    pub status: AttStatus,
    pub value: Option<Vec<u8>>,
}

impl AttResponse {
    pub fn success(request: RequestId, value: Option<Vec<u8>>) -> Self {
        Self {
            request,
            status: AttStatus::Success,
            value,
        }
    }

    pub fn failure(request: RequestId, status: AttStatus) -> Self {
        Self {
            request,
            status,
            value: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == AttStatus::Success
    }
}

// ============================================================================
// GATT TABLE
// ============================================================================

/// Characteristic property flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Property {
    Read,
    Write,
    Notify,
}

/// Attribute permission flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Permission {
    Readable,
    Writeable,
}

/// A single attribute within a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Characteristic {
    pub uuid: Uuid,
    pub properties: HashSet<Property>,
    pub permissions: HashSet<Permission>,
    /// Static value; `None` means the value is produced per read
    pub value: Option<Vec<u8>>,
}

impl Characteristic {
    pub fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            properties: HashSet::new(),
            permissions: HashSet::new(),
            value: None,
        }
    }

    pub fn with_properties(mut self, properties: impl IntoIterator<Item = Property>) -> Self {
        self.properties.extend(properties);
        self
    }

    pub fn with_permissions(mut self, permissions: impl IntoIterator<Item = Permission>) -> Self {
        self.permissions.extend(permissions);
        self
    }

    pub fn with_value(mut self, value: Vec<u8>) -> Self {
        self.value = Some(value);
        self
    }

    pub fn has_property(&self, property: Property) -> bool {
        self.properties.contains(&property)
    }
}

/// A GATT service with its ordered characteristics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub uuid: Uuid,
    pub primary: bool,
    pub characteristics: Vec<Characteristic>,
}

impl Service {
    /// Create an empty primary service
    pub fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            primary: true,
            characteristics: Vec::new(),
        }
    }

    pub fn with_characteristic(mut self, characteristic: Characteristic) -> Self {
        self.characteristics.push(characteristic);
        self
    }

    pub fn characteristic(&self, uuid: &Uuid) -> Option<&Characteristic> {
        self.characteristics.iter().find(|c| c.uuid == *uuid)
    }
}

// ============================================================================
// SCANNING
// ============================================================================

/// One advertisement report from a discovery event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanResult {
    pub peer_address: String,
    pub local_name: Option<String>,
    pub advertised_service_uuids: HashSet<Uuid>,
    /// Signal strength in dBm
    pub rssi: i16,
}

impl ScanResult {
    pub fn new(peer_address: impl Into<String>, rssi: i16) -> Self {
        Self {
            peer_address: peer_address.into(),
            local_name: None,
            advertised_service_uuids: HashSet::new(),
            rssi,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.local_name = Some(name.into());
        self
    }

    pub fn with_service(mut self, uuid: Uuid) -> Self {
        self.advertised_service_uuids.insert(uuid);
        self
    }
}
