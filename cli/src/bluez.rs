// BlueZ backend
//
// `BluezPlatform` is the sync half the node calls. Every call becomes an
// `Op` for a worker task that owns the bluer session and posts outcomes
// back as `BleEvent`s. GATT callbacks run on bluer's tasks: they post a
// request event and wait on a oneshot that `respond` completes.

use anyhow::{Context, Result};
use bluer::adv::{Advertisement, AdvertisementHandle, Type as AdvertisementType};
use bluer::gatt::local::{
    Application, ApplicationHandle, Characteristic as LocalCharacteristic, CharacteristicNotifier,
    CharacteristicNotify, CharacteristicNotifyMethod, CharacteristicRead,
    CharacteristicReadRequest, CharacteristicWrite, CharacteristicWriteMethod,
    CharacteristicWriteRequest, ReqError, Service as LocalService,
};
use bluer::{Adapter, AdapterEvent, AdapterProperty, Address, DiscoveryFilter, DiscoveryTransport};
use futures::{Stream, StreamExt};
use gattkit_core::{
    AdapterState, AdvertisementData, AttResponse, AttStatus, BleEvent, BlePlatform, Characteristic,
    EventSender, PeerId, Property, QueueFull, ReadRequest, RequestId, ScanOptions, ScanResult,
    Service, WriteRequest,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How often an idle notify session checks whether the central left
const SESSION_POLL: Duration = Duration::from_secs(1);

type Sessions = HashMap<(Uuid, PeerId), mpsc::Sender<Vec<u8>>>;

enum Op {
    PowerOn,
    RemoveAllServices,
    AddService(Service, u64),
    StartAdvertising(AdvertisementData),
    StopAdvertising,
    StartScan(ScanOptions),
    StopScan,
}

/// State shared between the platform, the worker and GATT callbacks
struct Shared {
    events: EventSender,
    pending: Mutex<HashMap<RequestId, oneshot::Sender<AttResponse>>>,
    sessions: Mutex<Sessions>,
    next_id: AtomicU64,
    queue_capacity: usize,
}

impl Shared {
    fn post(&self, event: BleEvent) {
        if self.events.send(event).is_err() {
            debug!("BlueZ event dropped, node not listening");
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn open_request(&self) -> (RequestId, oneshot::Receiver<AttResponse>) {
        let id = RequestId(self.next_id());
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        (id, rx)
    }
}

pub struct BluezPlatform {
    ops: mpsc::UnboundedSender<Op>,
    shared: Arc<Shared>,
}

impl BluezPlatform {
    /// Open the default adapter and start the worker task
    pub async fn connect(events: EventSender, queue_capacity: usize) -> Result<Self> {
        let session = bluer::Session::new()
            .await
            .context("Failed to connect to bluetoothd")?;
        let adapter = session
            .default_adapter()
            .await
            .context("No Bluetooth adapter found")?;
        info!("Using Bluetooth adapter {}", adapter.name());

        let shared = Arc::new(Shared {
            events,
            pending: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            queue_capacity: queue_capacity.max(1),
        });

        let (ops, rx) = mpsc::unbounded_channel();
        let worker = Worker {
            _session: session,
            adapter,
            shared: shared.clone(),
            apps: Vec::new(),
            advertisement: None,
            discovery: None,
        };
        tokio::spawn(worker.run(rx));

        Ok(Self { ops, shared })
    }

    fn submit(&self, op: Op) {
        if self.ops.send(op).is_err() {
            warn!("BlueZ worker stopped; request ignored");
        }
    }
}

impl BlePlatform for BluezPlatform {
    fn power_on(&mut self) {
        self.submit(Op::PowerOn);
    }

    fn remove_all_services(&mut self) {
        self.submit(Op::RemoveAllServices);
    }

    fn add_service(&mut self, service: &Service, generation: u64) {
        self.submit(Op::AddService(service.clone(), generation));
    }

    fn start_advertising(&mut self, data: &AdvertisementData) {
        self.submit(Op::StartAdvertising(data.clone()));
    }

    fn stop_advertising(&mut self) {
        self.submit(Op::StopAdvertising);
    }

    fn respond(&mut self, response: &AttResponse) {
        match self.shared.pending.lock().remove(&response.request) {
            Some(reply) => {
                if reply.send(response.clone()).is_err() {
                    debug!("Central gave up on request {}", response.request.0);
                }
            }
            None => warn!("No pending request {}", response.request.0),
        }
    }

    fn update_value(
        &mut self,
        characteristic: Uuid,
        value: &[u8],
        peers: &[PeerId],
    ) -> Result<(), QueueFull> {
        queue_notification(&self.shared.sessions.lock(), characteristic, value, peers)
    }

    fn start_scan(&mut self, options: &ScanOptions) {
        self.submit(Op::StartScan(*options));
    }

    fn stop_scan(&mut self) {
        self.submit(Op::StopScan);
    }
}

struct Worker {
    _session: bluer::Session,
    adapter: Adapter,
    shared: Arc<Shared>,
    apps: Vec<ApplicationHandle>,
    advertisement: Option<AdvertisementHandle>,
    discovery: Option<JoinHandle<()>>,
}

impl Worker {
    async fn run(mut self, mut ops: mpsc::UnboundedReceiver<Op>) {
        self.watch_power();
        while let Some(op) = ops.recv().await {
            self.apply(op).await;
        }
        self.stop_discovery();
        debug!("BlueZ worker exiting");
    }

    async fn apply(&mut self, op: Op) {
        match op {
            Op::PowerOn => {
                let state = match self.adapter.set_powered(true).await {
                    Ok(()) => AdapterState::PoweredOn,
                    Err(e) if matches!(e.kind, bluer::ErrorKind::NotAuthorized) => {
                        warn!("Not authorized to use the adapter: {}", e);
                        AdapterState::Unauthorized
                    }
                    Err(e) => {
                        warn!("Failed to power on adapter: {}", e);
                        AdapterState::PoweredOff
                    }
                };
                self.shared.post(BleEvent::StateChanged(state));
            }

            Op::RemoveAllServices => {
                if !self.apps.is_empty() {
                    debug!("Unregistering {} GATT application(s)", self.apps.len());
                }
                self.apps.clear();
            }

            Op::AddService(service, generation) => {
                let app = Application {
                    services: vec![local_service(&service, &self.shared)],
                    ..Default::default()
                };
                let result = match self.adapter.serve_gatt_application(app).await {
                    Ok(handle) => {
                        self.apps.push(handle);
                        Ok(())
                    }
                    Err(e) => Err(e.to_string()),
                };
                self.shared.post(BleEvent::ServiceAdded {
                    service: service.uuid,
                    generation,
                    result,
                });
            }

            Op::StartAdvertising(data) => {
                let advertisement = Advertisement {
                    advertisement_type: AdvertisementType::Peripheral,
                    service_uuids: data.service_uuids.iter().copied().collect(),
                    local_name: Some(data.local_name.clone()),
                    discoverable: Some(true),
                    ..Default::default()
                };
                let result = match self.adapter.advertise(advertisement).await {
                    Ok(handle) => {
                        self.advertisement = Some(handle);
                        Ok(())
                    }
                    Err(e) => Err(e.to_string()),
                };
                self.shared.post(BleEvent::AdvertisingStarted(result));
            }

            Op::StopAdvertising => {
                self.advertisement = None;
            }

            Op::StartScan(options) => {
                self.stop_discovery();
                let filter = DiscoveryFilter {
                    transport: DiscoveryTransport::Le,
                    duplicate_data: options.allow_duplicates,
                    ..Default::default()
                };
                if let Err(e) = self.adapter.set_discovery_filter(filter).await {
                    warn!("Failed to set discovery filter: {}", e);
                }
                let adapter = self.adapter.clone();
                let shared = self.shared.clone();
                self.discovery = Some(tokio::spawn(async move {
                    if let Err(e) = discover(adapter, shared, options).await {
                        warn!("Discovery ended: {}", e);
                    }
                }));
            }

            Op::StopScan => self.stop_discovery(),
        }
    }

    fn stop_discovery(&mut self) {
        // Dropping the discovery stream ends the BlueZ discovery session
        if let Some(task) = self.discovery.take() {
            task.abort();
        }
    }

    fn watch_power(&self) {
        let adapter = self.adapter.clone();
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let events = match adapter.events().await {
                Ok(events) => events,
                Err(e) => {
                    warn!("Cannot watch adapter power: {}", e);
                    return;
                }
            };
            let mut events = Box::pin(events);
            while let Some(event) = events.next().await {
                if let AdapterEvent::PropertyChanged(AdapterProperty::Powered(powered)) = event {
                    let state = if powered {
                        AdapterState::PoweredOn
                    } else {
                        AdapterState::PoweredOff
                    };
                    shared.post(BleEvent::StateChanged(state));
                }
            }
        });
    }
}

fn local_service(service: &Service, shared: &Arc<Shared>) -> LocalService {
    LocalService {
        uuid: service.uuid,
        primary: service.primary,
        characteristics: service
            .characteristics
            .iter()
            .map(|c| local_characteristic(c, shared))
            .collect(),
        ..Default::default()
    }
}

fn local_characteristic(characteristic: &Characteristic, shared: &Arc<Shared>) -> LocalCharacteristic {
    let uuid = characteristic.uuid;
    LocalCharacteristic {
        uuid,
        read: characteristic
            .has_property(Property::Read)
            .then(|| read_handler(uuid, shared.clone())),
        write: characteristic
            .has_property(Property::Write)
            .then(|| write_handler(uuid, shared.clone())),
        notify: characteristic
            .has_property(Property::Notify)
            .then(|| notify_handler(uuid, shared.clone())),
        ..Default::default()
    }
}

fn read_handler(characteristic: Uuid, shared: Arc<Shared>) -> CharacteristicRead {
    CharacteristicRead {
        read: true,
        fun: Box::new(move |req: CharacteristicReadRequest| {
            let shared = shared.clone();
            Box::pin(async move {
                let (id, reply) = shared.open_request();
                shared.post(BleEvent::ReadRequested(ReadRequest {
                    id,
                    peer: PeerId::new(req.device_address.to_string()),
                    characteristic,
                    offset: usize::from(req.offset),
                }));
                let response = reply.await.map_err(|_| ReqError::Failed)?;
                into_req_result(&response).map(|()| response.value.unwrap_or_default())
            })
        }),
        ..Default::default()
    }
}

fn write_handler(characteristic: Uuid, shared: Arc<Shared>) -> CharacteristicWrite {
    CharacteristicWrite {
        write: true,
        method: CharacteristicWriteMethod::Fun(Box::new(
            move |payload: Vec<u8>, req: CharacteristicWriteRequest| {
                let shared = shared.clone();
                Box::pin(async move {
                    let (id, reply) = shared.open_request();
                    shared.post(BleEvent::WriteRequested(vec![WriteRequest {
                        id,
                        peer: PeerId::new(req.device_address.to_string()),
                        characteristic,
                        payload,
                    }]));
                    let response = reply.await.map_err(|_| ReqError::Failed)?;
                    into_req_result(&response)
                })
            },
        )),
        ..Default::default()
    }
}

fn notify_handler(characteristic: Uuid, shared: Arc<Shared>) -> CharacteristicNotify {
    CharacteristicNotify {
        notify: true,
        method: CharacteristicNotifyMethod::Fun(Box::new(move |notifier| {
            let shared = shared.clone();
            Box::pin(async move { notify_session(characteristic, shared, notifier).await })
        })),
        ..Default::default()
    }
}

/// Queue `value` on every target's notify session, or on none of them.
///
/// Only this function sends on session channels and the caller holds the
/// sessions lock, so capacity checked up front cannot shrink before the send.
fn queue_notification(
    sessions: &Sessions,
    characteristic: Uuid,
    value: &[u8],
    peers: &[PeerId],
) -> Result<(), QueueFull> {
    let mut targets = Vec::with_capacity(peers.len());
    for peer in peers {
        match sessions.get(&(characteristic, peer.clone())) {
            Some(session) if session.is_closed() => {
                debug!("Notify session for {} already closed", peer);
            }
            Some(session) => targets.push((peer, session)),
            None => debug!("No notify session for {}", peer),
        }
    }

    if let Some((peer, _)) = targets.iter().find(|(_, session)| session.capacity() == 0) {
        debug!("Notify session for {} is full; value not queued", peer);
        return Err(QueueFull);
    }

    for (peer, session) in targets {
        if let Err(e) = session.try_send(value.to_vec()) {
            debug!("Notify session for {} refused value: {}", peer, e);
        }
    }
    Ok(())
}

/// One central's notification subscription, from StartNotify until it stops
async fn notify_session(characteristic: Uuid, shared: Arc<Shared>, mut notifier: CharacteristicNotifier) {
    // BlueZ does not name the subscribing device
    let peer = PeerId::new(format!("notify-session-{}", shared.next_id()));
    let (tx, mut rx) = mpsc::channel(shared.queue_capacity);
    shared
        .sessions
        .lock()
        .insert((characteristic, peer.clone()), tx);
    shared.post(BleEvent::Subscribed {
        peer: peer.clone(),
        characteristic,
    });

    while !notifier.is_stopped() {
        match tokio::time::timeout(SESSION_POLL, rx.recv()).await {
            Ok(Some(value)) => {
                if let Err(e) = notifier.notify(value).await {
                    debug!("Notify session {} ended: {}", peer, e);
                    break;
                }
            }
            Ok(None) => break,
            Err(_) => {}
        }
    }

    shared.sessions.lock().remove(&(characteristic, peer.clone()));
    shared.post(BleEvent::Unsubscribed {
        peer,
        characteristic,
    });
}

fn into_req_result(response: &AttResponse) -> Result<(), ReqError> {
    match response.status {
        AttStatus::Success => Ok(()),
        AttStatus::AttributeNotFound => Err(ReqError::NotSupported),
        AttStatus::ReadNotPermitted | AttStatus::WriteNotPermitted => Err(ReqError::NotPermitted),
        AttStatus::InvalidOffset => Err(ReqError::InvalidOffset),
    }
}

type DeviceEvents = Pin<Box<dyn Stream<Item = AdapterEvent> + Send>>;

async fn discover(adapter: Adapter, shared: Arc<Shared>, options: ScanOptions) -> bluer::Result<()> {
    // With duplicates allowed, property changes re-announce a device
    let mut events: DeviceEvents = if options.allow_duplicates {
        Box::pin(adapter.discover_devices_with_changes().await?)
    } else {
        Box::pin(adapter.discover_devices().await?)
    };

    while let Some(event) = events.next().await {
        if let AdapterEvent::DeviceAdded(address) = event {
            match scan_result(&adapter, address).await {
                Ok(Some(result)) => shared.post(BleEvent::Discovered(result)),
                Ok(None) => debug!("Skipping cached device {}", address),
                Err(e) => debug!("Cannot read device {}: {}", address, e),
            }
        }
    }
    Ok(())
}

/// `None` for devices BlueZ remembers but has not heard in this session
async fn scan_result(adapter: &Adapter, address: Address) -> bluer::Result<Option<ScanResult>> {
    let device = adapter.device(address)?;
    let Some(rssi) = device.rssi().await? else {
        return Ok(None);
    };

    let mut result = ScanResult::new(address.to_string(), rssi);
    if let Some(name) = device.name().await? {
        result = result.with_name(name);
    }
    for uuid in device.uuids().await?.unwrap_or_default() {
        result = result.with_service(uuid);
    }
    Ok(Some(result))
}
