// gattkit core: BLE peripheral (GATT server + advertiser) and central scanner
//
// Every component is driven from one serialized event loop. The host
// Bluetooth stack sits behind `platform::BlePlatform`.

pub mod ble;
pub mod config;
pub mod node;
pub mod platform;

pub use ble::{
    AdapterState, AdvertiseError, AdvertisingState, AttResponse, AttStatus, Characteristic,
    NotifyError, PeerId, Permission, Property, ReadRequest, RequestId, ScanConfig, ScanFilter,
    ScanReport, ScanResult, ScannerError, Service, ServiceError, StateError, WriteRequest,
};
pub use config::{ConfigError, FailureAction, FailurePolicy, NodeConfig};
pub use node::{
    event_channel, BleEvent, Control, EventReceiver, EventSender, ExitStatus, Node, NodeError,
    NodeHandle, Runtime,
};
pub use platform::{AdvertisementData, BlePlatform, QueueFull, ScanOptions};
