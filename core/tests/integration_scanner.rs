//! Central role against the virtual adapter

use gattkit_core::platform::{PlatformCall, VirtualAdapter, VirtualAdapterHandle};
use gattkit_core::*;
use tokio::sync::mpsc;
use uuid::Uuid;

const TARGET: Uuid = Uuid::from_u128(0xfeed);

struct Central {
    node: Node<VirtualAdapter>,
    handle: VirtualAdapterHandle,
    rx: EventReceiver,
    reports: mpsc::UnboundedReceiver<ScanReport>,
}

impl Central {
    fn new(scan: ScanConfig) -> Self {
        let (tx, rx) = event_channel();
        let platform = VirtualAdapter::new(tx);
        let handle = platform.handle();
        let (sink, reports) = mpsc::unbounded_channel();
        let config = NodeConfig {
            peripheral: false,
            scan: Some(scan),
            ..NodeConfig::default()
        };
        let mut node = Node::new(platform, config).unwrap().with_scan_sink(sink);
        node.start();
        let mut central = Self {
            node,
            handle,
            rx,
            reports,
        };
        central.pump();
        central
    }

    fn pump(&mut self) {
        while let Ok(event) = self.rx.try_recv() {
            self.node.dispatch(event);
        }
    }

    fn drain_reports(&mut self) -> Vec<ScanReport> {
        let mut out = Vec::new();
        while let Ok(report) = self.reports.try_recv() {
            out.push(report);
        }
        out
    }

    fn expire(&mut self) {
        let (session, _) = self.node.scan_deadline().unwrap();
        self.node.dispatch(BleEvent::ScanTimeout { session });
    }
}

fn scan(allow_duplicates: bool) -> ScanConfig {
    ScanConfig {
        duration_secs: 15,
        filter: ScanFilter {
            service_uuid: Some(TARGET),
            name_marker: Some("sensor".to_string()),
        },
        allow_duplicates,
    }
}

#[test]
fn test_duplicates_suppressed_within_session() {
    let mut c = Central::new(scan(false));
    assert!(c.handle.is_scanning());

    c.handle.discover(ScanResult::new("11:22", -40));
    c.handle.discover(ScanResult::new("11:22", -38));
    c.pump();

    let reports = c.drain_reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].result.peer_address, "11:22");
}

#[test]
fn test_duplicates_allowed_when_configured() {
    let mut c = Central::new(scan(true));
    c.handle.discover(ScanResult::new("11:22", -40));
    c.handle.discover(ScanResult::new("11:22", -38));
    c.pump();

    assert_eq!(c.drain_reports().len(), 2);
    assert!(c
        .handle
        .calls()
        .contains(&PlatformCall::StartScan(ScanOptions {
            allow_duplicates: true
        })));
}

#[test]
fn test_matches_are_flagged() {
    let mut c = Central::new(scan(false));
    c.handle
        .discover(ScanResult::new("aa", -40).with_service(TARGET));
    c.handle
        .discover(ScanResult::new("bb", -50).with_name("kitchen-sensor"));
    c.handle.discover(ScanResult::new("cc", -60).with_name("phone"));
    c.pump();

    let flags: Vec<(String, bool)> = c
        .drain_reports()
        .into_iter()
        .map(|r| (r.result.peer_address, r.matched))
        .collect();
    assert_eq!(
        flags,
        vec![
            ("aa".to_string(), true),
            ("bb".to_string(), true),
            ("cc".to_string(), false),
        ]
    );
}

#[test]
fn test_no_results_after_timeout() {
    let mut c = Central::new(scan(false));
    c.handle.discover(ScanResult::new("aa", -40));
    c.pump();
    c.expire();

    // Late reports straight from the platform are still refused
    c.handle
        .inject(BleEvent::Discovered(ScanResult::new("bb", -40)));
    c.pump();

    assert_eq!(c.drain_reports().len(), 1);
    assert!(!c.handle.is_scanning());
    assert_eq!(c.node.exit_status(), Some(&ExitStatus::Graceful));
}

#[test]
fn test_stop_scan_issued_exactly_once() {
    let mut c = Central::new(scan(false));
    let (session, _) = c.node.scan_deadline().unwrap();
    c.node.dispatch(BleEvent::ScanTimeout { session });
    c.node.dispatch(BleEvent::ScanTimeout { session });

    let stops = c
        .handle
        .calls()
        .iter()
        .filter(|call| **call == PlatformCall::StopScan)
        .count();
    assert_eq!(stops, 1);
}

#[test]
fn test_scan_and_peripheral_run_together() {
    let (tx, mut rx) = event_channel();
    let platform = VirtualAdapter::new(tx);
    let handle = platform.handle();
    let mut node = Node::new(
        platform,
        NodeConfig {
            scan: Some(scan(false)),
            ..NodeConfig::default()
        },
    )
    .unwrap();
    node.start();
    while let Ok(event) = rx.try_recv() {
        node.dispatch(event);
    }

    assert!(handle.is_advertising());
    assert!(handle.is_scanning());

    let (session, _) = node.scan_deadline().unwrap();
    node.dispatch(BleEvent::ScanTimeout { session });
    // The peripheral keeps the node alive after the scan
    assert!(node.exit_status().is_none());
    assert!(handle.is_advertising());
}
