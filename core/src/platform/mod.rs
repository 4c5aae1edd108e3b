//! Platform abstraction for the host Bluetooth stack
//!
//! Implementers drive the real radio (BlueZ, CoreBluetooth, ...) or simulate
//! one. Calls never block: results of registration, advertising and every
//! remote interaction are posted back as [`BleEvent`](crate::node::BleEvent)s
//! through the [`EventSender`](crate::node::EventSender) the platform was
//! built with.

pub mod virtual_adapter;

pub use virtual_adapter::{
    PlatformCall, SentNotification, VirtualAdapter, VirtualAdapterHandle, DEFAULT_QUEUE_CAPACITY,
};

use crate::ble::types::{AttResponse, PeerId, Service};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

/// Typical BLE limit for the local name in a legacy advertisement
pub const MAX_LOCAL_NAME_LEN: usize = 26;

/// The notification transmit queue has no room; the value was not sent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Notification transmit queue full")]
pub struct QueueFull;

/// Payload broadcast while advertising
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvertisementData {
    pub local_name: String,
    pub service_uuids: Vec<Uuid>,
}

impl AdvertisementData {
    /// Build an advertisement, truncating the name to [`MAX_LOCAL_NAME_LEN`] bytes
    pub fn new(local_name: &str, service_uuids: Vec<Uuid>) -> Self {
        Self {
            local_name: truncate_name(local_name),
            service_uuids,
        }
    }
}

fn truncate_name(name: &str) -> String {
    if name.len() <= MAX_LOCAL_NAME_LEN {
        return name.to_string();
    }

    let mut end = MAX_LOCAL_NAME_LEN;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    warn!(
        "Local name '{}' exceeds {} bytes; advertising '{}'",
        name,
        MAX_LOCAL_NAME_LEN,
        &name[..end]
    );
    name[..end].to_string()
}

/// Options for a scan session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanOptions {
    /// When false the platform suppresses repeat reports for a peer within the session
    pub allow_duplicates: bool,
}

/// Host Bluetooth stack operations used by the node
pub trait BlePlatform: Send {
    /// Enable the radio; the platform answers with `StateChanged` events
    fn power_on(&mut self);

    /// Deregister every service this process published (no-op when none)
    fn remove_all_services(&mut self);

    /// Publish a service table; answered by a `ServiceAdded` carrying the
    /// same `generation`
    fn add_service(&mut self, service: &Service, generation: u64);

    /// Begin advertising; answered by `AdvertisingStarted`
    fn start_advertising(&mut self, data: &AdvertisementData);

    fn stop_advertising(&mut self);

    /// Complete a pending read or write request
    fn respond(&mut self, response: &AttResponse);

    /// Queue a notification for the given peers. All or nothing: on
    /// `QueueFull` no peer receives the value.
    fn update_value(
        &mut self,
        characteristic: Uuid,
        value: &[u8],
        peers: &[PeerId],
    ) -> Result<(), QueueFull>;

    /// Begin reporting advertisements as `Discovered` events
    fn start_scan(&mut self, options: &ScanOptions);

    fn stop_scan(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_name_is_kept() {
        let data = AdvertisementData::new("gattkit", vec![Uuid::from_u128(1)]);
        assert_eq!(data.local_name, "gattkit");
        assert_eq!(data.service_uuids.len(), 1);
    }

    #[test]
    fn test_long_name_is_truncated_to_limit() {
        let name = "a-rather-long-peripheral-device-name";
        let data = AdvertisementData::new(name, vec![]);
        assert_eq!(data.local_name.len(), MAX_LOCAL_NAME_LEN);
        assert!(name.starts_with(&data.local_name));
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        // 'é' is two bytes; 25 ASCII bytes + 'é' straddles the limit
        let name = format!("{}é", "x".repeat(25));
        let data = AdvertisementData::new(&name, vec![]);
        assert_eq!(data.local_name, "x".repeat(25));
    }
}
