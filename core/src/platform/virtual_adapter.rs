//! In-process adapter
//!
//! `VirtualAdapter` is the platform half: the node drives it and it answers
//! with events, the way a real stack would. `VirtualAdapterHandle` is the
//! outside world: remote peers, the radio switch and an inspector over what
//! the node asked the platform to do.

use super::{AdvertisementData, BlePlatform, QueueFull, ScanOptions};
use crate::ble::types::{
    AdapterState, AttResponse, PeerId, ReadRequest, RequestId, ScanResult, Service, WriteRequest,
};
use crate::node::{BleEvent, EventSender};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

pub const DEFAULT_QUEUE_CAPACITY: usize = 8;

/// A call the node made on the platform, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformCall {
    PowerOn,
    RemoveAllServices,
    AddService(Uuid),
    StartAdvertising(AdvertisementData),
    StopAdvertising,
    Respond(RequestId),
    UpdateValue {
        characteristic: Uuid,
        peers: Vec<PeerId>,
    },
    StartScan(ScanOptions),
    StopScan,
}

/// A notification accepted into the transmit queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentNotification {
    pub characteristic: Uuid,
    pub value: Vec<u8>,
    pub peers: Vec<PeerId>,
}

struct VirtualState {
    adapter_state: AdapterState,
    power_on_state: AdapterState,
    services: Vec<Uuid>,
    reject_next_service: Option<String>,
    hold_service_answers: bool,
    held_service_answers: Vec<BleEvent>,
    reject_advertising: Option<String>,
    advertisement: Option<AdvertisementData>,
    advertise_starts: u64,
    responses: Vec<AttResponse>,
    notifications: Vec<SentNotification>,
    queue_capacity: usize,
    queue_depth: usize,
    scanning: Option<ScanOptions>,
    seen: HashSet<String>,
    next_request: u64,
    calls: Vec<PlatformCall>,
}

impl VirtualState {
    fn new() -> Self {
        Self {
            adapter_state: AdapterState::Unknown,
            power_on_state: AdapterState::PoweredOn,
            services: Vec::new(),
            reject_next_service: None,
            hold_service_answers: false,
            held_service_answers: Vec::new(),
            reject_advertising: None,
            advertisement: None,
            advertise_starts: 0,
            responses: Vec::new(),
            notifications: Vec::new(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            queue_depth: 0,
            scanning: None,
            seen: HashSet::new(),
            next_request: 1,
            calls: Vec::new(),
        }
    }

    /// Everything the radio holds goes away with power
    fn drop_radio_state(&mut self) {
        self.services.clear();
        self.advertisement = None;
        self.scanning = None;
        self.seen.clear();
        self.queue_depth = 0;

        // Registrations not yet answered never reached the radio
        let reason = format!("adapter is {}", self.adapter_state);
        for answer in &mut self.held_service_answers {
            if let BleEvent::ServiceAdded { result, .. } = answer {
                if result.is_ok() {
                    *result = Err(reason.clone());
                }
            }
        }
    }

    fn next_id(&mut self) -> RequestId {
        let id = RequestId(self.next_request);
        self.next_request += 1;
        id
    }
}

fn post(events: &EventSender, event: BleEvent) {
    if let Err(e) = events.send(event) {
        debug!("Virtual adapter event dropped, node not listening: {:?}", e.0);
    }
}

pub struct VirtualAdapter {
    shared: Arc<Mutex<VirtualState>>,
    events: EventSender,
}

impl VirtualAdapter {
    pub fn new(events: EventSender) -> Self {
        Self {
            shared: Arc::new(Mutex::new(VirtualState::new())),
            events,
        }
    }

    /// Notifications the transmit queue holds before reporting [`QueueFull`]
    pub fn with_queue_capacity(self, capacity: usize) -> Self {
        self.shared.lock().queue_capacity = capacity;
        self
    }

    /// State reported in answer to `power_on`
    pub fn with_power_on_state(self, state: AdapterState) -> Self {
        self.shared.lock().power_on_state = state;
        self
    }

    pub fn handle(&self) -> VirtualAdapterHandle {
        VirtualAdapterHandle {
            shared: self.shared.clone(),
            events: self.events.clone(),
        }
    }
}

impl BlePlatform for VirtualAdapter {
    fn power_on(&mut self) {
        let state = {
            let mut s = self.shared.lock();
            s.calls.push(PlatformCall::PowerOn);
            s.adapter_state = s.power_on_state;
            s.adapter_state
        };
        post(&self.events, BleEvent::StateChanged(state));
    }

    fn remove_all_services(&mut self) {
        let mut s = self.shared.lock();
        s.calls.push(PlatformCall::RemoveAllServices);
        s.services.clear();
    }

    fn add_service(&mut self, service: &Service, generation: u64) {
        let mut s = self.shared.lock();
        s.calls.push(PlatformCall::AddService(service.uuid));
        let result = if let Some(reason) = s.reject_next_service.take() {
            Err(reason)
        } else if !s.adapter_state.is_powered_on() {
            Err(format!("adapter is {}", s.adapter_state))
        } else if s.services.contains(&service.uuid) {
            Err(format!("duplicate service {}", service.uuid))
        } else {
            s.services.push(service.uuid);
            Ok(())
        };
        let answer = BleEvent::ServiceAdded {
            service: service.uuid,
            generation,
            result,
        };
        if s.hold_service_answers {
            s.held_service_answers.push(answer);
        } else {
            drop(s);
            post(&self.events, answer);
        }
    }

    fn start_advertising(&mut self, data: &AdvertisementData) {
        let result = {
            let mut s = self.shared.lock();
            s.calls.push(PlatformCall::StartAdvertising(data.clone()));
            if let Some(reason) = s.reject_advertising.take() {
                Err(reason)
            } else if !s.adapter_state.is_powered_on() {
                Err(format!("adapter is {}", s.adapter_state))
            } else {
                s.advertisement = Some(data.clone());
                s.advertise_starts += 1;
                Ok(())
            }
        };
        post(&self.events, BleEvent::AdvertisingStarted(result));
    }

    fn stop_advertising(&mut self) {
        let mut s = self.shared.lock();
        s.calls.push(PlatformCall::StopAdvertising);
        s.advertisement = None;
    }

    fn respond(&mut self, response: &AttResponse) {
        let mut s = self.shared.lock();
        s.calls.push(PlatformCall::Respond(response.request));
        s.responses.push(response.clone());
    }

    fn update_value(
        &mut self,
        characteristic: Uuid,
        value: &[u8],
        peers: &[PeerId],
    ) -> Result<(), QueueFull> {
        let mut s = self.shared.lock();
        s.calls.push(PlatformCall::UpdateValue {
            characteristic,
            peers: peers.to_vec(),
        });
        if s.queue_depth >= s.queue_capacity {
            return Err(QueueFull);
        }
        s.queue_depth += 1;
        s.notifications.push(SentNotification {
            characteristic,
            value: value.to_vec(),
            peers: peers.to_vec(),
        });
        Ok(())
    }

    fn start_scan(&mut self, options: &ScanOptions) {
        let mut s = self.shared.lock();
        s.calls.push(PlatformCall::StartScan(*options));
        s.scanning = Some(*options);
        s.seen.clear();
    }

    fn stop_scan(&mut self) {
        let mut s = self.shared.lock();
        s.calls.push(PlatformCall::StopScan);
        s.scanning = None;
    }
}

/// Simulates the radio and remote peers around a [`VirtualAdapter`]
#[derive(Clone)]
pub struct VirtualAdapterHandle {
    shared: Arc<Mutex<VirtualState>>,
    events: EventSender,
}

impl VirtualAdapterHandle {
    /// Report a new adapter state, as if the user or the OS toggled the radio
    pub fn set_state(&self, state: AdapterState) {
        {
            let mut s = self.shared.lock();
            s.adapter_state = state;
            if !state.is_powered_on() {
                s.drop_radio_state();
            }
        }
        post(&self.events, BleEvent::StateChanged(state));
    }

    pub fn read(&self, peer: &str, characteristic: Uuid, offset: usize) -> RequestId {
        let id = self.shared.lock().next_id();
        post(
            &self.events,
            BleEvent::ReadRequested(ReadRequest {
                id,
                peer: PeerId::new(peer),
                characteristic,
                offset,
            }),
        );
        id
    }

    pub fn write(&self, peer: &str, characteristic: Uuid, payload: &[u8]) -> RequestId {
        self.write_batch(peer, &[(characteristic, payload.to_vec())])[0]
    }

    /// Deliver several writes in one event
    pub fn write_batch(&self, peer: &str, writes: &[(Uuid, Vec<u8>)]) -> Vec<RequestId> {
        let requests: Vec<WriteRequest> = {
            let mut s = self.shared.lock();
            writes
                .iter()
                .map(|(characteristic, payload)| WriteRequest {
                    id: s.next_id(),
                    peer: PeerId::new(peer),
                    characteristic: *characteristic,
                    payload: payload.clone(),
                })
                .collect()
        };
        let ids = requests.iter().map(|r| r.id).collect();
        post(&self.events, BleEvent::WriteRequested(requests));
        ids
    }

    pub fn subscribe(&self, peer: &str, characteristic: Uuid) {
        post(
            &self.events,
            BleEvent::Subscribed {
                peer: PeerId::new(peer),
                characteristic,
            },
        );
    }

    pub fn unsubscribe(&self, peer: &str, characteristic: Uuid) {
        post(
            &self.events,
            BleEvent::Unsubscribed {
                peer: PeerId::new(peer),
                characteristic,
            },
        );
    }

    pub fn disconnect(&self, peer: &str) {
        post(&self.events, BleEvent::PeerDisconnected(PeerId::new(peer)));
    }

    /// An advertisement heard by the radio. Returns false when the platform
    /// swallowed it: no scan running, or a repeat the session suppresses.
    pub fn discover(&self, result: ScanResult) -> bool {
        {
            let mut s = self.shared.lock();
            let Some(options) = s.scanning else {
                return false;
            };
            if !options.allow_duplicates && !s.seen.insert(result.peer_address.clone()) {
                return false;
            }
        }
        post(&self.events, BleEvent::Discovered(result));
        true
    }

    /// Post an arbitrary event, e.g. a late or out-of-order platform answer
    pub fn inject(&self, event: BleEvent) {
        post(&self.events, event);
    }

    /// Fail the next `add_service` with `reason`
    pub fn reject_next_service(&self, reason: &str) {
        self.shared.lock().reject_next_service = Some(reason.to_string());
    }

    /// While set, answers to `add_service` are kept back until
    /// [`release_service_answers`](Self::release_service_answers)
    pub fn hold_service_answers(&self, hold: bool) {
        self.shared.lock().hold_service_answers = hold;
    }

    /// Deliver held `add_service` answers in the order they were issued.
    /// Returns how many were delivered.
    pub fn release_service_answers(&self) -> usize {
        let held = std::mem::take(&mut self.shared.lock().held_service_answers);
        let count = held.len();
        for answer in held {
            post(&self.events, answer);
        }
        count
    }

    /// Fail the next `start_advertising` with `reason`
    pub fn reject_advertising(&self, reason: &str) {
        self.shared.lock().reject_advertising = Some(reason.to_string());
    }

    /// Empty the notification transmit queue
    pub fn drain_queue(&self) {
        self.shared.lock().queue_depth = 0;
    }

    pub fn state(&self) -> AdapterState {
        self.shared.lock().adapter_state
    }

    pub fn is_advertising(&self) -> bool {
        self.shared.lock().advertisement.is_some()
    }

    pub fn advertisement(&self) -> Option<AdvertisementData> {
        self.shared.lock().advertisement.clone()
    }

    pub fn advertise_starts(&self) -> u64 {
        self.shared.lock().advertise_starts
    }

    pub fn services(&self) -> Vec<Uuid> {
        self.shared.lock().services.clone()
    }

    pub fn responses(&self) -> Vec<AttResponse> {
        self.shared.lock().responses.clone()
    }

    pub fn response_for(&self, id: RequestId) -> Option<AttResponse> {
        self.shared
            .lock()
            .responses
            .iter()
            .find(|r| r.request == id)
            .cloned()
    }

    pub fn notifications(&self) -> Vec<SentNotification> {
        self.shared.lock().notifications.clone()
    }

    pub fn is_scanning(&self) -> bool {
        self.shared.lock().scanning.is_some()
    }

    pub fn calls(&self) -> Vec<PlatformCall> {
        self.shared.lock().calls.clone()
    }
}
