//! BLE peripheral and central components
//!
//! Each component is a plain state holder driven by [`Node`](crate::node::Node);
//! platform calls go through [`BlePlatform`](crate::platform::BlePlatform).

pub mod adapter;
pub mod advertising;
pub mod gatt;
pub mod requests;
pub mod scanner;
pub mod subscriptions;
pub mod types;

pub use adapter::{AdapterStateMachine, StateError, StateListener, Transition};
pub use advertising::{AdvertiseError, AdvertisingController, AdvertisingState};
pub use gatt::{validate_service, GattServiceManager, RegistrationState, ServiceError};
pub use requests::{RequestHandler, WritePayload};
pub use scanner::{
    CentralScanner, ScanConfig, ScanFilter, ScanReport, ScannerError, ScannerState,
    DEFAULT_SCAN_DURATION_SECS,
};
pub use subscriptions::{NotifyError, NotifyTargets, SubscriptionManager};
pub use types::*;
