//! Serialized run loop
//!
//! [`Runtime::run`] is the only consumer of the event channel. Timers (scan
//! expiry, periodic notifications) fire inside the same loop, so every
//! handler runs on one logical context.

use super::event::{BleEvent, Control, EventReceiver, EventSender};
use super::{ExitStatus, Node, NodeError};
use crate::ble::scanner::ScanConfig;
use crate::platform::BlePlatform;
use chrono::Local;
use tokio::time::{self, Interval, MissedTickBehavior};
use tracing::{info, warn};

/// Cloneable control surface for a running node
#[derive(Clone)]
pub struct NodeHandle {
    events: EventSender,
}

impl NodeHandle {
    pub fn new(events: EventSender) -> Self {
        Self { events }
    }

    fn send(&self, control: Control) -> Result<(), NodeError> {
        self.events
            .send(BleEvent::Control(control))
            .map_err(|_| NodeError::EventLoopClosed)
    }

    pub fn request_start(&self) -> Result<(), NodeError> {
        self.send(Control::RequestStart)
    }

    pub fn stop(&self) -> Result<(), NodeError> {
        self.send(Control::Stop)
    }

    pub fn start_scan(&self, config: ScanConfig) -> Result<(), NodeError> {
        self.send(Control::StartScan(config))
    }

    pub fn notify(&self, payload: impl Into<Vec<u8>>) -> Result<(), NodeError> {
        self.send(Control::Notify {
            payload: payload.into(),
        })
    }

    /// Graceful shutdown: stop advertising, deregister, exit 0
    pub fn shutdown(&self) -> Result<(), NodeError> {
        self.send(Control::Shutdown)
    }
}

pub struct Runtime<P: BlePlatform> {
    node: Node<P>,
    events: EventReceiver,
    sender: EventSender,
}

impl<P: BlePlatform> Runtime<P> {
    /// `sender` must feed `events`; the platform inside `node` holds another clone
    pub fn new(node: Node<P>, sender: EventSender, events: EventReceiver) -> Self {
        Self {
            node,
            events,
            sender,
        }
    }

    pub fn handle(&self) -> NodeHandle {
        NodeHandle::new(self.sender.clone())
    }

    pub fn node(&self) -> &Node<P> {
        &self.node
    }

    pub fn into_node(self) -> Node<P> {
        self.node
    }

    /// Start the node and process events until it decides to exit
    pub async fn run(&mut self) -> ExitStatus {
        self.node.start();

        let mut ticker = self.node.config().notify_interval().map(|period| {
            let mut interval = time::interval_at(time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        loop {
            if let Some(status) = self.node.exit_status() {
                info!("Node finished: {}", status);
                return status.clone();
            }

            let deadline = self.node.scan_deadline();
            let scan_timer = async move {
                match deadline {
                    Some((session, at)) => {
                        time::sleep_until(at).await;
                        session
                    }
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                event = self.events.recv() => match event {
                    Some(event) => self.node.dispatch(event),
                    None => {
                        warn!("Event channel closed");
                        self.node.shutdown();
                    }
                },
                session = scan_timer => {
                    self.node.dispatch(BleEvent::ScanTimeout { session });
                }
                _ = tick(&mut ticker) => {
                    let payload = format!(
                        "{} {}",
                        self.node.config().greeting,
                        Local::now().format("%H:%M:%S")
                    );
                    self.node.dispatch(BleEvent::Control(Control::Notify {
                        payload: payload.into_bytes(),
                    }));
                }
            }
        }
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
