// Scripted remote peers for the virtual backend
//
// Plays the part of nearby centrals and advertisers so every node
// behavior shows up in the terminal without a radio.

use colored::*;
use gattkit_core::platform::VirtualAdapterHandle;
use gattkit_core::{AttResponse, NodeConfig, ScanResult};
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;
use uuid::Uuid;

const CENTRAL: &str = "central-1";
const VISITOR: &str = "central-2";
const STEP: Duration = Duration::from_millis(400);

/// Which roles the demo exercises
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    Peripheral,
    Central,
    Both,
}

pub async fn run(peer: VirtualAdapterHandle, config: NodeConfig, script: Script) {
    match script {
        Script::Peripheral => peripheral(&peer, &config).await,
        Script::Central => central(&peer, &config).await,
        Script::Both => {
            tokio::join!(peripheral(&peer, &config), central(&peer, &config));
        }
    }
}

async fn peripheral(peer: &VirtualAdapterHandle, config: &NodeConfig) {
    let characteristic = config.characteristic_uuid;
    sleep(STEP).await;

    println!("{} {} subscribes", "→".bright_blue(), CENTRAL.bright_cyan());
    peer.subscribe(CENTRAL, characteristic);
    sleep(STEP).await;
    let mut seen = show_notifications(peer, 0);

    println!("{} {} reads", "→".bright_blue(), CENTRAL.bright_cyan());
    let id = peer.read(CENTRAL, characteristic, 0);
    sleep(STEP).await;
    show_response("read", peer.response_for(id));

    println!("{} {} writes \"hello\"", "→".bright_blue(), CENTRAL.bright_cyan());
    let id = peer.write(CENTRAL, characteristic, b"hello");
    sleep(STEP).await;
    show_response("write", peer.response_for(id));

    println!("{} {} writes 4 binary bytes", "→".bright_blue(), CENTRAL.bright_cyan());
    let id = peer.write(CENTRAL, characteristic, &[0xde, 0xad, 0xbe, 0xef]);
    sleep(STEP).await;
    show_response("write", peer.response_for(id));

    let unknown = Uuid::from_u128(0xdead_0000_0000_0000_0000_0000_0000_0001);
    println!(
        "{} {} reads unknown characteristic {}",
        "→".bright_blue(),
        CENTRAL.bright_cyan(),
        unknown
    );
    let id = peer.read(CENTRAL, unknown, 0);
    sleep(STEP).await;
    show_response("read", peer.response_for(id));

    println!("{} {} subscribes, then leaves", "→".bright_blue(), VISITOR.bright_cyan());
    peer.subscribe(VISITOR, characteristic);
    sleep(STEP).await;
    peer.unsubscribe(VISITOR, characteristic);
    peer.disconnect(VISITOR);
    sleep(STEP).await;
    seen = show_notifications(peer, seen);

    println!();
    println!("{}", "Demo script finished; still serving".dimmed());

    // The virtual radio transmits whatever is queued once a second
    loop {
        peer.drain_queue();
        sleep(Duration::from_secs(1)).await;
        seen = show_notifications(peer, seen);
    }
}

async fn central(peer: &VirtualAdapterHandle, config: &NodeConfig) {
    let scan = config.scan.clone().unwrap_or_default();
    let marker = scan
        .filter
        .name_marker
        .clone()
        .unwrap_or_else(|| "sensor".to_string());
    let wanted = scan.filter.service_uuid.unwrap_or(config.service_uuid);

    let devices = [
        ScanResult::new("C4:7C:8D:6A:12:01", -48)
            .with_name("gattkit-peer")
            .with_service(wanted),
        ScanResult::new("F0:99:B6:21:0A:7E", -71).with_name(format!("kitchen-{}", marker)),
        ScanResult::new("5E:11:02:AF:33:90", -88),
        ScanResult::new("C4:7C:8D:6A:12:01", -52)
            .with_name("gattkit-peer")
            .with_service(wanted),
        ScanResult::new("A8:03:2A:E4:5C:11", -63).with_name("headphones"),
    ];

    sleep(STEP).await;
    for device in devices {
        if !peer.discover(device) {
            debug!("Demo advertisement suppressed as duplicate or outside a scan");
        }
        sleep(STEP).await;
    }
}

fn show_response(kind: &str, response: Option<AttResponse>) {
    match response {
        Some(response) if response.is_success() => {
            let value = response
                .value
                .map(|v| format!(" \"{}\"", String::from_utf8_lossy(&v)))
                .unwrap_or_default();
            println!("  {} {} accepted{}", "←".bright_blue(), kind, value);
        }
        Some(response) => {
            println!("  {} {} refused: {}", "←".bright_blue(), kind, response.status);
        }
        None => println!("  {} {} got no response", "✗".red(), kind),
    }
}

/// Print notifications past `seen` and return the new total
fn show_notifications(peer: &VirtualAdapterHandle, seen: usize) -> usize {
    let notifications = peer.notifications();
    for notification in notifications.iter().skip(seen) {
        let peers: Vec<&str> = notification.peers.iter().map(|p| p.as_str()).collect();
        println!(
            "  {} notify {}: \"{}\"",
            "←".bright_blue(),
            peers.join(", ").bright_cyan(),
            String::from_utf8_lossy(&notification.value)
        );
    }
    notifications.len()
}
