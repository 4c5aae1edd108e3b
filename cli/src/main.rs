// gattkit: BLE peripheral and central from the command line
//
// Runs against the in-process virtual adapter by default. Build with
// `--features bluez` to drive a real Linux adapter.

mod config;
mod demo;

#[cfg(feature = "bluez")]
mod bluez;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use colored::*;
use gattkit_core::config::parse_uuid;
use gattkit_core::platform::VirtualAdapter;
use gattkit_core::{
    event_channel, BlePlatform, EventReceiver, EventSender, ExitStatus, Node, NodeConfig, Runtime,
    ScanConfig, ScanReport,
};
use std::fmt;
use tokio::sync::mpsc;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gattkit")]
#[command(about = "BLE GATT peripheral and central scanner", long_about = None)]
#[command(version)]
struct Cli {
    /// Platform backend (defaults to the configured one)
    #[arg(long, global = true, value_enum)]
    backend: Option<Backend>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// In-process adapter with a scripted demo peer
    Virtual,
    /// Linux BlueZ over D-Bus
    Bluez,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Virtual => write!(f, "virtual"),
            Backend::Bluez => write!(f, "bluez"),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Publish the GATT service and advertise it
    Advertise {
        /// Local name to advertise
        #[arg(short, long)]
        name: Option<String>,
        /// Push a timestamped notification to subscribers every N seconds
        #[arg(long)]
        notify_interval: Option<u64>,
    },
    /// Scan for nearby peripherals for a fixed duration
    Scan(ScanArgs),
    /// Advertise and scan at the same time
    Run {
        #[arg(short, long)]
        name: Option<String>,
        #[arg(long)]
        notify_interval: Option<u64>,
        #[command(flatten)]
        scan: ScanArgs,
    },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Args)]
struct ScanArgs {
    /// Scan duration in seconds
    #[arg(short, long)]
    duration: Option<u64>,
    /// Report every advertisement, not just the first per device
    #[arg(long)]
    allow_duplicates: bool,
    /// Flag devices advertising this service UUID
    #[arg(long)]
    service: Option<String>,
    /// Flag devices whose name contains this text
    #[arg(long)]
    name_marker: Option<String>,
}

impl ScanArgs {
    /// Flags override the configured scan defaults
    fn apply(&self, base: &ScanConfig) -> Result<ScanConfig> {
        let mut scan = base.clone();
        if let Some(duration) = self.duration {
            scan.duration_secs = duration;
        }
        if self.allow_duplicates {
            scan.allow_duplicates = true;
        }
        if let Some(service) = &self.service {
            scan.filter.service_uuid = Some(parse_uuid(service)?);
        }
        if let Some(marker) = &self.name_marker {
            scan.filter.name_marker = Some(marker.clone());
        }
        scan.validate().context("Invalid scan settings")?;
        Ok(scan)
    }
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = config::Config::load()?;

    init_logging(
        cli.log_level.as_deref().unwrap_or(&config.log_level),
        cli.json_logs,
    );

    let backend = match cli.backend {
        Some(backend) => backend,
        None => <Backend as ValueEnum>::from_str(&config.backend, true)
            .map_err(|e| anyhow::anyhow!("Invalid configured backend: {}", e))?,
    };

    match cli.command {
        Commands::Advertise {
            name,
            notify_interval,
        } => {
            let mut node = peripheral_config(config.node, name, notify_interval);
            node.scan = None;
            cmd_run(backend, node, demo::Script::Peripheral).await
        }
        Commands::Scan(args) => {
            let mut node = config.node;
            node.peripheral = false;
            node.scan = Some(args.apply(&config.scan)?);
            cmd_run(backend, node, demo::Script::Central).await
        }
        Commands::Run {
            name,
            notify_interval,
            scan,
        } => {
            let scan = scan.apply(&config.scan)?;
            let mut node = peripheral_config(config.node, name, notify_interval);
            node.scan = Some(scan);
            cmd_run(backend, node, demo::Script::Both).await
        }
        Commands::Config { action } => cmd_config(&mut config, action),
    }
}

fn init_logging(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn peripheral_config(
    mut node: NodeConfig,
    name: Option<String>,
    notify_interval: Option<u64>,
) -> NodeConfig {
    node.peripheral = true;
    if let Some(name) = name {
        node.device_name = name;
    }
    if notify_interval.is_some() {
        node.notify_interval_secs = notify_interval;
    }
    node
}

async fn cmd_run(backend: Backend, node_config: NodeConfig, script: demo::Script) -> Result<()> {
    node_config
        .validate()
        .context("Invalid node configuration")?;

    println!("{}", "gattkit: starting...".bold());
    println!();
    println!("  {} Backend: {}", "✓".green(), backend.to_string().bright_cyan());
    if node_config.peripheral {
        println!(
            "  {} Peripheral: {} ({})",
            "✓".green(),
            node_config.device_name.bright_cyan(),
            node_config.service_uuid
        );
    }
    if let Some(scan) = &node_config.scan {
        println!("  {} Scanning for {}s", "✓".green(), scan.duration_secs);
    }
    println!();
    println!("Press {} to stop", "Ctrl-C".bright_green());
    println!();

    let (tx, rx) = event_channel();
    let status = match backend {
        Backend::Virtual => run_virtual(node_config, script, tx, rx).await?,
        Backend::Bluez => run_bluez(node_config, tx, rx).await?,
    };

    match &status {
        ExitStatus::Graceful => println!("{} Stopped", "✓".green()),
        ExitStatus::Fatal(reason) => eprintln!("{} {}", "✗".red(), reason),
    }
    std::process::exit(status.code());
}

async fn run_virtual(
    node_config: NodeConfig,
    script: demo::Script,
    tx: EventSender,
    rx: EventReceiver,
) -> Result<ExitStatus> {
    let platform =
        VirtualAdapter::new(tx.clone()).with_queue_capacity(node_config.virtual_queue_capacity);
    let peer = platform.handle();
    let (sink, reports) = mpsc::unbounded_channel();
    let node = Node::new(platform, node_config.clone())?.with_scan_sink(sink);
    let runtime = Runtime::new(node, tx, rx);

    let demo_task = tokio::spawn(demo::run(peer, node_config, script));
    let status = drive(runtime, reports).await;
    demo_task.abort();
    Ok(status)
}

#[cfg(feature = "bluez")]
async fn run_bluez(node_config: NodeConfig, tx: EventSender, rx: EventReceiver) -> Result<ExitStatus> {
    let platform = bluez::BluezPlatform::connect(tx.clone(), node_config.virtual_queue_capacity)
        .await
        .context("Failed to open Bluetooth adapter")?;
    let (sink, reports) = mpsc::unbounded_channel();
    let node = Node::new(platform, node_config)?.with_scan_sink(sink);
    Ok(drive(Runtime::new(node, tx, rx), reports).await)
}

#[cfg(not(feature = "bluez"))]
async fn run_bluez(
    _node_config: NodeConfig,
    _tx: EventSender,
    _rx: EventReceiver,
) -> Result<ExitStatus> {
    anyhow::bail!("gattkit was built without BlueZ support (rebuild with --features bluez)")
}

/// Run the node to completion, rendering scan reports and handling Ctrl-C
async fn drive<P: BlePlatform + 'static>(
    mut runtime: Runtime<P>,
    mut reports: mpsc::UnboundedReceiver<ScanReport>,
) -> ExitStatus {
    let printer = tokio::spawn(async move {
        while let Some(report) = reports.recv().await {
            print_report(&report);
        }
    });

    let handle = runtime.handle();
    let interrupt = tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                println!();
                println!("Shutting down...");
                if let Err(e) = handle.shutdown() {
                    warn!("Shutdown request not delivered: {}", e);
                }
            }
            Err(e) => warn!("Cannot listen for Ctrl-C: {}", e),
        }
    });

    let status = runtime.run().await;
    interrupt.abort();

    // Dropping the node closes the report channel
    drop(runtime);
    if let Err(e) = printer.await {
        warn!("Report printer failed: {}", e);
    }
    status
}

fn print_report(report: &ScanReport) {
    let result = &report.result;
    let marker = if report.matched {
        "★".bright_yellow()
    } else {
        "·".dimmed()
    };
    let name = result.local_name.as_deref().unwrap_or("(unnamed)");
    println!(
        "{} {} {:>4} dBm  {}",
        marker,
        result.peer_address.bright_cyan(),
        result.rssi,
        name
    );
}

fn cmd_config(config: &mut config::Config, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            config.save()?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Get { key } => {
            if let Some(value) = config.get(&key) {
                println!("{} = {}", key.bright_cyan(), value);
            } else {
                anyhow::bail!("Unknown config key: {}", key);
            }
        }

        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            println!();

            for (key, value) in config.list() {
                println!("  {:<24} {}", key.bright_cyan(), value);
            }

            println!();
            println!(
                "  {} {}",
                "file:".dimmed(),
                config::Config::config_file()?.display()
            );
        }
    }

    Ok(())
}
