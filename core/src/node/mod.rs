//! The node: one context object owning every component and the platform
//!
//! All state is mutated from [`Node::dispatch`], which the runtime calls for
//! one event at a time. Nothing here blocks; platform answers come back as
//! later events.

pub mod event;
pub mod runtime;

pub use event::{event_channel, BleEvent, Control, EventReceiver, EventSender};
pub use runtime::{NodeHandle, Runtime};

use crate::ble::adapter::{AdapterStateMachine, StateListener};
use crate::ble::advertising::{AdvertiseError, AdvertisingController, AdvertisingState};
use crate::ble::gatt::{GattServiceManager, RegistrationState, ServiceError};
use crate::ble::requests::RequestHandler;
use crate::ble::scanner::{CentralScanner, ScanConfig, ScanReport, ScannerError};
use crate::ble::subscriptions::{NotifyError, NotifyTargets, SubscriptionManager};
use crate::ble::types::{AdapterState, Service};
use crate::config::{ConfigError, FailureAction, NodeConfig};
use crate::platform::BlePlatform;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// How the node's run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitStatus {
    Graceful,
    Fatal(String),
}

impl ExitStatus {
    /// Process exit code: 0 graceful, 1 fatal
    pub fn code(&self) -> i32 {
        match self {
            ExitStatus::Graceful => 0,
            ExitStatus::Fatal(_) => 1,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, ExitStatus::Fatal(_))
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Graceful => write!(f, "graceful shutdown"),
            ExitStatus::Fatal(reason) => write!(f, "fatal: {}", reason),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum NodeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Service error: {0}")]
    Service(#[from] ServiceError),
    #[error("Scanner error: {0}")]
    Scanner(#[from] ScannerError),
    #[error("Notification error: {0}")]
    Notify(#[from] NotifyError),
    #[error("Node event loop is not running")]
    EventLoopClosed,
}

pub struct Node<P: BlePlatform> {
    platform: P,
    config: NodeConfig,
    service: Service,
    adapter: AdapterStateMachine,
    gatt: GattServiceManager,
    advertising: AdvertisingController,
    requests: RequestHandler,
    subscriptions: SubscriptionManager,
    scanner: CentralScanner,
    /// Peripheral role requested and not stopped
    serving: bool,
    started: bool,
    exit: Option<ExitStatus>,
    scan_sink: Option<mpsc::UnboundedSender<ScanReport>>,
}

impl<P: BlePlatform> Node<P> {
    pub fn new(platform: P, config: NodeConfig) -> Result<Self, NodeError> {
        config.validate()?;

        Ok(Self {
            service: config.service(),
            advertising: AdvertisingController::new(config.advertisement()),
            requests: RequestHandler::new(config.greeting.clone()),
            subscriptions: SubscriptionManager::new(config.welcome_message.clone()),
            adapter: AdapterStateMachine::new(),
            gatt: GattServiceManager::new(),
            scanner: CentralScanner::new(),
            platform,
            config,
            serving: false,
            started: false,
            exit: None,
            scan_sink: None,
        })
    }

    /// Forward every surfaced scan result to `sink`
    pub fn with_scan_sink(mut self, sink: mpsc::UnboundedSender<ScanReport>) -> Self {
        self.scan_sink = Some(sink);
        self
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn platform_mut(&mut self) -> &mut P {
        &mut self.platform
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn adapter_state(&self) -> AdapterState {
        self.adapter.state()
    }

    pub fn add_state_listener(&mut self, listener: StateListener) {
        self.adapter.add_listener(listener);
    }

    pub fn advertising_state(&self) -> AdvertisingState {
        self.advertising.state()
    }

    pub fn is_advertising(&self) -> bool {
        self.advertising.is_advertising()
    }

    pub fn registration(&self) -> &RegistrationState {
        self.gatt.state()
    }

    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.subscriptions
    }

    pub fn scanner(&self) -> &CentralScanner {
        &self.scanner
    }

    /// Requests answered so far as (reads, writes)
    pub fn request_counts(&self) -> (u64, u64) {
        self.requests.counts()
    }

    pub fn scan_deadline(&self) -> Option<(u64, Instant)> {
        self.scanner.deadline()
    }

    /// Set once the node has decided to terminate
    pub fn exit_status(&self) -> Option<&ExitStatus> {
        self.exit.as_ref()
    }

    // ------------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------------

    /// Enable the radio and kick off the configured roles
    pub fn start(&mut self) {
        if self.started {
            debug!("Node already started");
            return;
        }
        self.started = true;

        info!(
            "Starting '{}' (peripheral: {}, scan: {})",
            self.config.device_name,
            self.config.peripheral,
            self.config.scan.is_some()
        );
        self.platform.power_on();

        if self.config.peripheral {
            self.request_start();
        }

        if let Some(scan) = self.config.scan.clone() {
            if let Err(e) = self.start_scan(scan) {
                self.fail(format!("scan setup failed: {}", e));
            }
        } else if !self.config.peripheral {
            warn!("Neither peripheral nor scan role enabled; nothing to do");
            self.finish(ExitStatus::Graceful);
        }
    }

    /// Ask for the peripheral role: register the service and advertise once
    /// the adapter allows it
    pub fn request_start(&mut self) {
        self.serving = true;
        self.ensure_registered(true);
        self.advertising.request_start(
            self.adapter.is_powered_on(),
            self.gatt.is_registered(),
            &mut self.platform,
        );
    }

    /// Stop advertising and deregister services. Idempotent.
    pub fn stop(&mut self) {
        if self.serving {
            info!("Stopping peripheral role");
        }
        self.serving = false;
        self.advertising.stop(&mut self.platform);
        self.gatt.clear(&mut self.platform);
        self.subscriptions.clear();
    }

    /// Tear everything down and finish gracefully
    pub fn shutdown(&mut self) {
        info!("Shutting down");
        self.teardown();
        self.finish(ExitStatus::Graceful);
    }

    pub fn start_scan(&mut self, config: ScanConfig) -> Result<(), ScannerError> {
        self.scanner
            .start(config, self.adapter.state(), &mut self.platform)
    }

    /// Notify every subscriber of the node's characteristic
    pub fn notify(&mut self, payload: &[u8]) -> Result<usize, NotifyError> {
        self.subscriptions.notify(
            self.gatt.registered_service(),
            self.config.characteristic_uuid,
            payload,
            &NotifyTargets::AllSubscribers,
            &mut self.platform,
        )
    }

    /// Handle one event. The only entry point for platform callbacks.
    pub fn dispatch(&mut self, event: BleEvent) {
        match event {
            BleEvent::StateChanged(state) => self.on_state_changed(state),
            BleEvent::ServiceAdded {
                service,
                generation,
                result,
            } => {
                match self
                    .gatt
                    .on_service_added(service, generation, result, &mut self.platform)
                {
                    Some(Ok(())) => self.advertising.on_conditions_changed(
                        self.adapter.is_powered_on(),
                        true,
                        &mut self.platform,
                    ),
                    Some(Err(e)) => self.on_registration_failed(e),
                    None => {}
                }
            }
            BleEvent::AdvertisingStarted(result) => {
                if let Err(e) = self.advertising.on_started(result) {
                    self.on_advertise_failed(e);
                }
            }
            BleEvent::ReadRequested(request) => {
                let response = self
                    .requests
                    .on_read(self.gatt.registered_service(), &request);
                self.platform.respond(&response);
            }
            BleEvent::WriteRequested(batch) => {
                let responses = self
                    .requests
                    .on_write_batch(self.gatt.registered_service(), &batch);
                for response in &responses {
                    self.platform.respond(response);
                }
            }
            BleEvent::Subscribed {
                peer,
                characteristic,
            } => {
                if let Err(e) = self.subscriptions.on_subscribe(
                    self.gatt.registered_service(),
                    peer.clone(),
                    characteristic,
                    &mut self.platform,
                ) {
                    warn!("Subscription from {} refused: {}", peer, e);
                }
            }
            BleEvent::Unsubscribed {
                peer,
                characteristic,
            } => {
                self.subscriptions.on_unsubscribe(&peer, &characteristic);
            }
            BleEvent::PeerDisconnected(peer) => self.subscriptions.on_disconnect(&peer),
            BleEvent::Discovered(result) => {
                if let Some(report) = self.scanner.on_discovered(result) {
                    self.publish(report);
                }
            }
            BleEvent::ScanTimeout { session } => {
                if self.scanner.on_timeout(session, &mut self.platform) {
                    self.check_scan_complete();
                }
            }
            BleEvent::Control(control) => self.on_control(control),
        }
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn on_control(&mut self, control: Control) {
        match control {
            Control::RequestStart => self.request_start(),
            Control::Stop => self.stop(),
            Control::StartScan(config) => {
                if let Err(e) = self.start_scan(config) {
                    warn!("Scan not started: {}", e);
                }
            }
            Control::Notify { payload } => match self.notify(&payload) {
                Ok(sent) => debug!("Notification queued for {} peer(s)", sent),
                Err(NotifyError::QueueFull) => {
                    warn!("Notification dropped: transmit queue full")
                }
                Err(e) => warn!("Notification not sent: {}", e),
            },
            Control::Shutdown => self.shutdown(),
        }
    }

    fn on_state_changed(&mut self, state: AdapterState) {
        let transition = self.adapter.apply(state);

        if transition.lost_power() {
            self.subscriptions.clear();
            self.gatt.on_power_lost();
        }

        if state.is_fatal() {
            self.fail(format!("Bluetooth adapter is {}", state));
            return;
        }
        if state == AdapterState::PoweredOff && self.serving {
            info!("Waiting for the adapter to be powered on");
        }

        match self.scanner.on_adapter_state(state, &mut self.platform) {
            Ok(()) => {}
            // The peripheral role outlives an interrupted scan
            Err(ScannerError::Interrupted(_)) if self.config.peripheral => {}
            Err(e @ ScannerError::Interrupted(_)) => {
                self.fail(e.to_string());
                return;
            }
            Err(e) => {
                self.fail(format!("scan setup failed: {}", e));
                return;
            }
        }

        self.ensure_registered(false);
        self.advertising.on_conditions_changed(
            self.adapter.is_powered_on(),
            self.gatt.is_registered(),
            &mut self.platform,
        );
        self.check_scan_complete();
    }

    /// Register the service table when the role and adapter allow it.
    /// A failed registration is only retried on an explicit start request.
    fn ensure_registered(&mut self, retry_failed: bool) {
        if !self.serving || !self.adapter.is_powered_on() {
            return;
        }
        let needed = match self.gatt.state() {
            RegistrationState::Unregistered => true,
            RegistrationState::Failed(_) => retry_failed,
            RegistrationState::Registering { .. } | RegistrationState::Registered => false,
        };
        if !needed {
            return;
        }

        if let Err(e) =
            self.gatt
                .configure(self.service.clone(), self.adapter.state(), &mut self.platform)
        {
            self.on_registration_failed(e);
        }
    }

    fn on_registration_failed(&mut self, e: ServiceError) {
        error!("Service registration failed: {}", e);
        match self.config.failure_policy.on_registration_failure {
            FailureAction::Exit => self.fail(format!("service registration failed: {}", e)),
            FailureAction::Degrade => {
                warn!("Continuing without advertising");
                self.serving = false;
                self.advertising.stop(&mut self.platform);
            }
        }
    }

    fn on_advertise_failed(&mut self, e: AdvertiseError) {
        match self.config.failure_policy.on_advertise_failure {
            FailureAction::Exit => self.fail(e.to_string()),
            FailureAction::Degrade => warn!("Continuing without advertising: {}", e),
        }
    }

    fn publish(&mut self, report: ScanReport) {
        if let Some(sink) = &self.scan_sink {
            if sink.send(report).is_err() {
                debug!("Scan report receiver gone; no longer forwarding");
                self.scan_sink = None;
            }
        }
    }

    /// A central-only run ends with its scan session
    fn check_scan_complete(&mut self) {
        if !self.config.peripheral && !self.serving && self.scanner.is_finished() {
            info!("Scan session complete");
            self.finish(ExitStatus::Graceful);
        }
    }

    fn teardown(&mut self) {
        self.stop();
        self.scanner.stop(&mut self.platform);
    }

    fn fail(&mut self, reason: String) {
        error!("Fatal: {}", reason);
        self.teardown();
        self.finish(ExitStatus::Fatal(reason));
    }

    fn finish(&mut self, status: ExitStatus) {
        if self.exit.is_none() {
            self.exit = Some(status);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::types::{AttStatus, ScanResult};
    use crate::platform::{VirtualAdapter, VirtualAdapterHandle};

    struct Harness {
        node: Node<VirtualAdapter>,
        handle: VirtualAdapterHandle,
        rx: EventReceiver,
    }

    impl Harness {
        fn new(config: NodeConfig) -> Self {
            let (tx, rx) = event_channel();
            let platform = VirtualAdapter::new(tx);
            let handle = platform.handle();
            let node = Node::new(platform, config).expect("node");
            Self { node, handle, rx }
        }

        fn pump(&mut self) {
            while let Ok(event) = self.rx.try_recv() {
                self.node.dispatch(event);
            }
        }

        fn started(config: NodeConfig) -> Self {
            let mut h = Self::new(config);
            h.node.start();
            h.pump();
            h
        }
    }

    #[test]
    fn test_start_registers_and_advertises() {
        let h = Harness::started(NodeConfig::default());

        assert!(h.node.is_advertising());
        assert_eq!(*h.node.registration(), RegistrationState::Registered);
        assert!(h.handle.is_advertising());
        assert_eq!(h.handle.advertise_starts(), 1);
        assert!(h.node.exit_status().is_none());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let (tx, _rx) = event_channel();
        let config = NodeConfig {
            device_name: String::new(),
            ..NodeConfig::default()
        };
        assert!(matches!(
            Node::new(VirtualAdapter::new(tx), config),
            Err(NodeError::Config(ConfigError::EmptyDeviceName))
        ));
    }

    #[test]
    fn test_power_cycle_reregisters() {
        let mut h = Harness::started(NodeConfig::default());

        h.handle.set_state(AdapterState::PoweredOff);
        h.pump();
        assert!(!h.node.is_advertising());
        assert_eq!(h.node.advertising_state(), AdvertisingState::AwaitingPower);

        h.handle.set_state(AdapterState::PoweredOn);
        h.pump();
        assert!(h.node.is_advertising());
        assert_eq!(h.handle.advertise_starts(), 2);
        assert_eq!(h.handle.services().len(), 1);
    }

    #[test]
    fn test_unsupported_adapter_is_fatal() {
        let (tx, mut rx) = event_channel();
        let platform = VirtualAdapter::new(tx).with_power_on_state(AdapterState::Unsupported);
        let mut node = Node::new(platform, NodeConfig::default()).expect("node");
        node.start();
        while let Ok(event) = rx.try_recv() {
            node.dispatch(event);
        }

        let status = node.exit_status().expect("exit");
        assert!(status.is_fatal());
        assert_eq!(status.code(), 1);
    }

    #[test]
    fn test_registration_failure_degrades_by_default() {
        let mut h = Harness::new(NodeConfig::default());
        h.handle.reject_next_service("resource limit");
        h.node.start();
        h.pump();

        assert!(h.node.exit_status().is_none());
        assert!(!h.handle.is_advertising());
        assert_eq!(h.node.advertising_state(), AdvertisingState::Stopped);
    }

    #[test]
    fn test_registration_failure_with_exit_policy() {
        let mut config = NodeConfig::default();
        config.failure_policy.on_registration_failure = FailureAction::Exit;
        let mut h = Harness::new(config);
        h.handle.reject_next_service("resource limit");
        h.node.start();
        h.pump();

        assert!(h.node.exit_status().expect("exit").is_fatal());
    }

    #[test]
    fn test_advertise_failure_exits_by_default() {
        let mut h = Harness::new(NodeConfig::default());
        h.handle.reject_advertising("too many advertisers");
        h.node.start();
        h.pump();

        assert!(h.node.exit_status().expect("exit").is_fatal());
        assert!(h.handle.services().is_empty());
    }

    #[test]
    fn test_requests_answered_once_each() {
        let mut h = Harness::started(NodeConfig::default());
        let ch = h.node.config().characteristic_uuid;

        let read = h.handle.read("c1", ch, 0);
        let writes = h
            .handle
            .write_batch("c1", &[(ch, b"a".to_vec()), (ch, b"b".to_vec())]);
        h.pump();

        assert_eq!(h.handle.responses().len(), 3);
        assert_eq!(
            h.handle.response_for(read).expect("read").status,
            AttStatus::Success
        );
        let order: Vec<_> = h.handle.responses().iter().skip(1).map(|r| r.request).collect();
        assert_eq!(order, writes);
    }

    #[test]
    fn test_power_loss_clears_subscriptions() {
        let mut h = Harness::started(NodeConfig::default());
        let ch = h.node.config().characteristic_uuid;
        h.handle.subscribe("c1", ch);
        h.pump();
        assert_eq!(h.node.subscriptions().subscribers(&ch).len(), 1);

        h.handle.set_state(AdapterState::PoweredOff);
        h.pump();
        assert!(h.node.subscriptions().subscribers(&ch).is_empty());
    }

    #[test]
    fn test_control_notify_reaches_subscribers() {
        let mut h = Harness::started(NodeConfig::default());
        let ch = h.node.config().characteristic_uuid;
        h.handle.subscribe("c1", ch);
        h.pump();

        h.node.dispatch(BleEvent::Control(Control::Notify {
            payload: b"tick".to_vec(),
        }));
        let last = h.handle.notifications().pop().expect("notification");
        assert_eq!(last.value, b"tick".to_vec());
    }

    #[test]
    fn test_shutdown_is_graceful_and_deregisters() {
        let mut h = Harness::started(NodeConfig::default());
        h.node.dispatch(BleEvent::Control(Control::Shutdown));

        assert_eq!(h.node.exit_status(), Some(&ExitStatus::Graceful));
        assert!(!h.handle.is_advertising());
        assert!(h.handle.services().is_empty());
    }

    #[test]
    fn test_central_only_finishes_after_scan() {
        let config = NodeConfig {
            peripheral: false,
            scan: Some(ScanConfig::default()),
            ..NodeConfig::default()
        };
        let mut h = Harness::started(config);
        let (sink, mut reports) = mpsc::unbounded_channel();
        h.node.scan_sink = Some(sink);

        assert!(h.handle.discover(ScanResult::new("aa", -40)));
        h.pump();
        assert!(reports.try_recv().is_ok());

        let (session, _) = h.node.scan_deadline().expect("deadline");
        h.node.dispatch(BleEvent::ScanTimeout { session });
        assert_eq!(h.node.exit_status(), Some(&ExitStatus::Graceful));
    }

    #[test]
    fn test_power_loss_mid_scan_is_fatal_for_central_only() {
        let config = NodeConfig {
            peripheral: false,
            scan: Some(ScanConfig::default()),
            ..NodeConfig::default()
        };
        let mut h = Harness::started(config);
        assert!(h.handle.is_scanning());

        h.handle.set_state(AdapterState::PoweredOff);
        h.pump();

        let status = h.node.exit_status().expect("exit");
        assert_eq!(status.code(), 1);
        assert!(!h.handle.is_scanning());
    }

    #[test]
    fn test_power_loss_mid_scan_keeps_peripheral_running() {
        let config = NodeConfig {
            scan: Some(ScanConfig::default()),
            ..NodeConfig::default()
        };
        let mut h = Harness::started(config);

        h.handle.set_state(AdapterState::PoweredOff);
        h.pump();
        assert!(h.node.exit_status().is_none());
        assert!(h.node.scanner().is_finished());

        h.handle.set_state(AdapterState::PoweredOn);
        h.pump();
        assert!(h.handle.is_advertising());
    }

    #[test]
    fn test_scan_with_adapter_off_is_fatal() {
        let (tx, mut rx) = event_channel();
        let platform = VirtualAdapter::new(tx).with_power_on_state(AdapterState::PoweredOff);
        let config = NodeConfig {
            peripheral: false,
            scan: Some(ScanConfig::default()),
            ..NodeConfig::default()
        };
        let mut node = Node::new(platform, config).expect("node");
        node.start();
        while let Ok(event) = rx.try_recv() {
            node.dispatch(event);
        }
        assert!(node.exit_status().expect("exit").is_fatal());
    }
}
