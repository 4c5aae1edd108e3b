//! Notification subscriptions
//!
//! Delivery is best effort: a full transmit queue is reported to the caller as
//! [`NotifyError::QueueFull`] and never retried here.

use super::types::{PeerId, Property, Service};
use crate::platform::{BlePlatform, QueueFull};
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotifyError {
    #[error("Notification transmit queue full")]
    QueueFull,
    #[error("Unknown characteristic {0}")]
    UnknownCharacteristic(Uuid),
    #[error("Characteristic {0} does not support notifications")]
    NotNotifiable(Uuid),
}

impl From<QueueFull> for NotifyError {
    fn from(_: QueueFull) -> Self {
        NotifyError::QueueFull
    }
}

/// Recipients of a notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyTargets {
    AllSubscribers,
    /// Only these peers, and only those currently subscribed
    Peers(HashSet<PeerId>),
}

pub struct SubscriptionManager {
    subscribers: HashMap<Uuid, HashSet<PeerId>>,
    welcome: String,
    dropped: u64,
}

impl SubscriptionManager {
    pub fn new(welcome: impl Into<String>) -> Self {
        Self {
            subscribers: HashMap::new(),
            welcome: welcome.into(),
            dropped: 0,
        }
    }

    pub fn subscribers(&self, characteristic: &Uuid) -> HashSet<PeerId> {
        self.subscribers
            .get(characteristic)
            .cloned()
            .unwrap_or_default()
    }

    pub fn is_subscribed(&self, peer: &PeerId, characteristic: &Uuid) -> bool {
        self.subscribers
            .get(characteristic)
            .is_some_and(|peers| peers.contains(peer))
    }

    /// Notifications dropped because the transmit queue was full
    pub fn dropped_count(&self) -> u64 {
        self.dropped
    }

    /// Add `peer` to the characteristic's subscribers and push one welcome
    /// notification to that peer only.
    pub fn on_subscribe(
        &mut self,
        table: Option<&Service>,
        peer: PeerId,
        characteristic: Uuid,
        platform: &mut dyn BlePlatform,
    ) -> Result<(), NotifyError> {
        check_notifiable(table, characteristic)?;

        let inserted = self
            .subscribers
            .entry(characteristic)
            .or_default()
            .insert(peer.clone());
        if inserted {
            info!("{} subscribed to {}", peer, characteristic);
        } else {
            debug!("{} re-subscribed to {}", peer, characteristic);
        }

        let target = [peer];
        if platform
            .update_value(characteristic, self.welcome.as_bytes(), &target)
            .is_err()
        {
            self.dropped += 1;
            warn!("Welcome notification to {} dropped: transmit queue full", target[0]);
        }
        Ok(())
    }

    /// Remove `peer`; returns whether it was subscribed
    pub fn on_unsubscribe(&mut self, peer: &PeerId, characteristic: &Uuid) -> bool {
        let Some(peers) = self.subscribers.get_mut(characteristic) else {
            return false;
        };
        let removed = peers.remove(peer);
        if peers.is_empty() {
            self.subscribers.remove(characteristic);
        }
        if removed {
            info!("{} unsubscribed from {}", peer, characteristic);
        }
        removed
    }

    /// Drop `peer` from every subscriber set
    pub fn on_disconnect(&mut self, peer: &PeerId) {
        let mut removed = 0;
        self.subscribers.retain(|_, peers| {
            if peers.remove(peer) {
                removed += 1;
            }
            !peers.is_empty()
        });
        if removed > 0 {
            info!("{} disconnected; removed from {} subscription(s)", peer, removed);
        }
    }

    pub fn clear(&mut self) {
        if !self.subscribers.is_empty() {
            debug!("Clearing {} subscriber set(s)", self.subscribers.len());
            self.subscribers.clear();
        }
    }

    /// Send `payload` to subscribed targets. Returns how many peers it was
    /// queued for (zero when nobody matched).
    pub fn notify(
        &mut self,
        table: Option<&Service>,
        characteristic: Uuid,
        payload: &[u8],
        targets: &NotifyTargets,
        platform: &mut dyn BlePlatform,
    ) -> Result<usize, NotifyError> {
        check_notifiable(table, characteristic)?;

        let recipients: Vec<PeerId> = match (self.subscribers.get(&characteristic), targets) {
            (None, _) => Vec::new(),
            (Some(subscribed), NotifyTargets::AllSubscribers) => {
                subscribed.iter().cloned().collect()
            }
            (Some(subscribed), NotifyTargets::Peers(peers)) => {
                peers.intersection(subscribed).cloned().collect()
            }
        };

        if recipients.is_empty() {
            debug!("No subscribers to notify on {}", characteristic);
            return Ok(0);
        }

        if let Err(full) = platform.update_value(characteristic, payload, &recipients) {
            self.dropped += 1;
            return Err(full.into());
        }
        Ok(recipients.len())
    }
}

fn check_notifiable(table: Option<&Service>, characteristic: Uuid) -> Result<(), NotifyError> {
    match table.and_then(|s| s.characteristic(&characteristic)) {
        None => Err(NotifyError::UnknownCharacteristic(characteristic)),
        Some(c) if !c.has_property(Property::Notify) => Err(NotifyError::NotNotifiable(characteristic)),
        Some(_) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::types::Characteristic;
    use crate::node::event_channel;
    use crate::platform::{VirtualAdapter, VirtualAdapterHandle};

    const CHAR: Uuid = Uuid::from_u128(0x31);

    fn table() -> Service {
        Service::new(Uuid::from_u128(0x30)).with_characteristic(
            Characteristic::new(CHAR).with_properties([Property::Read, Property::Notify]),
        )
    }

    fn setup(capacity: usize) -> (SubscriptionManager, VirtualAdapter, VirtualAdapterHandle) {
        let (tx, _rx) = event_channel();
        let platform = VirtualAdapter::new(tx).with_queue_capacity(capacity);
        let handle = platform.handle();
        (SubscriptionManager::new("welcome"), platform, handle)
    }

    #[test]
    fn test_subscribe_sends_one_welcome_to_that_peer_only() {
        let (mut subs, mut platform, handle) = setup(8);
        let service = table();
        let a = PeerId::new("a");
        let b = PeerId::new("b");

        subs.on_subscribe(Some(&service), a.clone(), CHAR, &mut platform)
            .expect("subscribe a");
        subs.on_subscribe(Some(&service), b.clone(), CHAR, &mut platform)
            .expect("subscribe b");

        let sent = handle.notifications();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].peers, vec![a]);
        assert_eq!(sent[1].peers, vec![b]);
        assert_eq!(sent[1].value, b"welcome".to_vec());
    }

    #[test]
    fn test_double_subscribe_is_idempotent_but_welcomes_twice() {
        let (mut subs, mut platform, handle) = setup(8);
        let service = table();
        let p = PeerId::new("p");

        subs.on_subscribe(Some(&service), p.clone(), CHAR, &mut platform)
            .expect("first");
        subs.on_subscribe(Some(&service), p.clone(), CHAR, &mut platform)
            .expect("second");

        assert_eq!(subs.subscribers(&CHAR).len(), 1);
        assert_eq!(handle.notifications().len(), 2);
    }

    #[test]
    fn test_subscribe_requires_notify_property() {
        let (mut subs, mut platform, handle) = setup(8);
        let service = Service::new(Uuid::from_u128(0x30)).with_characteristic(
            Characteristic::new(CHAR).with_properties([Property::Read]),
        );

        let err = subs
            .on_subscribe(Some(&service), PeerId::new("p"), CHAR, &mut platform)
            .unwrap_err();
        assert_eq!(err, NotifyError::NotNotifiable(CHAR));
        assert!(subs.subscribers(&CHAR).is_empty());
        assert!(handle.notifications().is_empty());
    }

    #[test]
    fn test_subscribe_unknown_characteristic() {
        let (mut subs, mut platform, _handle) = setup(8);
        let err = subs
            .on_subscribe(None, PeerId::new("p"), CHAR, &mut platform)
            .unwrap_err();
        assert_eq!(err, NotifyError::UnknownCharacteristic(CHAR));
    }

    #[test]
    fn test_unsubscribe_absent_peer_is_noop() {
        let (mut subs, mut platform, _handle) = setup(8);
        let service = table();
        subs.on_subscribe(Some(&service), PeerId::new("a"), CHAR, &mut platform)
            .expect("subscribe");

        let before = subs.subscribers(&CHAR);
        assert!(!subs.on_unsubscribe(&PeerId::new("ghost"), &CHAR));
        assert!(!subs.on_unsubscribe(&PeerId::new("a"), &Uuid::from_u128(0x99)));
        assert_eq!(subs.subscribers(&CHAR), before);
    }

    #[test]
    fn test_disconnect_removes_peer_everywhere() {
        let (mut subs, mut platform, _handle) = setup(8);
        let service = table();
        let a = PeerId::new("a");
        subs.on_subscribe(Some(&service), a.clone(), CHAR, &mut platform)
            .expect("subscribe");

        subs.on_disconnect(&a);
        assert!(!subs.is_subscribed(&a, &CHAR));
    }

    #[test]
    fn test_notify_all_subscribers() {
        let (mut subs, mut platform, handle) = setup(8);
        let service = table();
        subs.on_subscribe(Some(&service), PeerId::new("a"), CHAR, &mut platform)
            .expect("a");
        subs.on_subscribe(Some(&service), PeerId::new("b"), CHAR, &mut platform)
            .expect("b");

        let sent = subs
            .notify(Some(&service), CHAR, b"tick", &NotifyTargets::AllSubscribers, &mut platform)
            .expect("notify");
        assert_eq!(sent, 2);

        let last = handle.notifications().pop().expect("notification");
        assert_eq!(last.value, b"tick".to_vec());
        assert_eq!(last.peers.len(), 2);
    }

    #[test]
    fn test_notify_targets_only_subscribed_peers() {
        let (mut subs, mut platform, handle) = setup(8);
        let service = table();
        let a = PeerId::new("a");
        subs.on_subscribe(Some(&service), a.clone(), CHAR, &mut platform)
            .expect("a");

        let targets =
            NotifyTargets::Peers([a.clone(), PeerId::new("stranger")].into_iter().collect());
        let sent = subs
            .notify(Some(&service), CHAR, b"x", &targets, &mut platform)
            .expect("notify");
        assert_eq!(sent, 1);
        assert_eq!(handle.notifications().pop().expect("sent").peers, vec![a]);
    }

    #[test]
    fn test_notify_without_subscribers_sends_nothing() {
        let (mut subs, mut platform, handle) = setup(8);
        let service = table();
        let sent = subs
            .notify(Some(&service), CHAR, b"x", &NotifyTargets::AllSubscribers, &mut platform)
            .expect("notify");
        assert_eq!(sent, 0);
        assert!(handle.notifications().is_empty());
    }

    #[test]
    fn test_queue_full_is_reported_not_retried() {
        let (mut subs, mut platform, handle) = setup(1);
        let service = table();
        subs.on_subscribe(Some(&service), PeerId::new("a"), CHAR, &mut platform)
            .expect("subscribe fills the queue");

        let err = subs
            .notify(Some(&service), CHAR, b"x", &NotifyTargets::AllSubscribers, &mut platform)
            .unwrap_err();
        assert_eq!(err, NotifyError::QueueFull);
        assert_eq!(subs.dropped_count(), 1);
        assert_eq!(handle.notifications().len(), 1);
    }

    #[test]
    fn test_welcome_dropped_when_queue_full_still_subscribes() {
        let (mut subs, mut platform, handle) = setup(0);
        let service = table();
        let p = PeerId::new("p");

        subs.on_subscribe(Some(&service), p.clone(), CHAR, &mut platform)
            .expect("subscribe");

        assert!(subs.is_subscribed(&p, &CHAR));
        assert!(handle.notifications().is_empty());
        assert_eq!(subs.dropped_count(), 1);
    }
}
