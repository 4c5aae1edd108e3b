//! Events consumed by the node's dispatch loop

use crate::ble::scanner::ScanConfig;
use crate::ble::types::{AdapterState, PeerId, ReadRequest, ScanResult, WriteRequest};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Everything the node reacts to, from the platform or from its own runtime
#[derive(Debug, Clone)]
pub enum BleEvent {
    StateChanged(AdapterState),
    /// Answer to `add_service`, echoing the generation it was issued with
    ServiceAdded {
        service: Uuid,
        generation: u64,
        result: Result<(), String>,
    },
    /// Answer to `start_advertising`
    AdvertisingStarted(Result<(), String>),
    ReadRequested(ReadRequest),
    /// One or more writes delivered together
    WriteRequested(Vec<WriteRequest>),
    Subscribed {
        peer: PeerId,
        characteristic: Uuid,
    },
    Unsubscribed {
        peer: PeerId,
        characteristic: Uuid,
    },
    PeerDisconnected(PeerId),
    Discovered(ScanResult),
    /// Scan session `session` reached its duration
    ScanTimeout { session: u64 },
    Control(Control),
}

/// Requests from the application side, see [`NodeHandle`](super::NodeHandle)
#[derive(Debug, Clone)]
pub enum Control {
    RequestStart,
    Stop,
    StartScan(ScanConfig),
    Notify { payload: Vec<u8> },
    Shutdown,
}

pub type EventSender = mpsc::UnboundedSender<BleEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<BleEvent>;

pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}
