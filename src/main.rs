// Copyright 2026 Gattlink Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Gattlink command line tool

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use gattlink::bluetooth::Central;
use gattlink::config::Config;
use gattlink::firmware::FirmwareFetcher;
use gattlink::{DeviceEvent, DeviceIdentity, DeviceSession, LinkState, ScanEvent, Status};

#[derive(Parser)]
#[command(name = "gattlink")]
#[command(about = "Talk to BLE devices over the chunked command/event protocol")]
#[command(version)]
struct Cli {
    /// Config file (defaults to the user config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan for devices
    Scan {
        /// Scan duration in seconds
        #[arg(short, long)]
        duration: Option<u64>,
    },
    /// Send one message to a device
    Send {
        /// Device id printed by `scan`
        #[arg(short, long)]
        device: Uuid,
        /// Message type (0-127)
        #[arg(short = 't', long = "type")]
        message_type: u8,
        /// Payload as hex
        payload: String,
    },
    /// Read the remote RSSI
    Rssi {
        #[arg(short, long)]
        device: Uuid,
    },
    /// Switch a device into firmware update mode
    OtaMode {
        #[arg(short, long)]
        device: Uuid,
    },
    /// Push a firmware image (http(s) URL, file:// URL or path)
    Update {
        #[arg(short, long)]
        device: Uuid,
        #[arg(short, long)]
        url: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(config.logging.default_directive.parse()?),
        )
        .init();

    info!("Gattlink v{} (SDK {})", env!("CARGO_PKG_VERSION"), gattlink::SDK_VERSION);

    let firmware = Arc::new(FirmwareFetcher::new(config.firmware.request_timeout())?);
    let (scan_tx, mut scan_rx) = mpsc::channel(32);
    let central = Central::new(scan_tx, firmware, config.bluetooth.session_options())
        .await?
        .with_name_filter(config.bluetooth.scan_name_filter.clone());

    if !central.is_enabled() {
        info!("Powering on Bluetooth adapter...");
        central.enable().await?;
    }

    let scan_time = Duration::from_secs(config.bluetooth.scan_seconds);

    match cli.command {
        Commands::Scan { duration } => {
            let duration = duration.map(Duration::from_secs).unwrap_or(scan_time);
            scan(&central, &mut scan_rx, duration).await?;
        }
        Commands::Send {
            device,
            message_type,
            payload,
        } => {
            let payload = hex::decode(payload.trim()).context("payload must be hex")?;
            let (session, mut events) = open(&central, &mut scan_rx, device, scan_time).await?;
            session.send(message_type, payload).await?;
            let event = wait_for(&mut events, |e| matches!(e, DeviceEvent::SendCompleted { .. })).await?;
            report(&event);
            close(&session, &mut events).await?;
        }
        Commands::Rssi { device } => {
            let (session, mut events) = open(&central, &mut scan_rx, device, scan_time).await?;
            session.read_remote_rssi().await?;
            let event = wait_for(&mut events, |e| matches!(e, DeviceEvent::RemoteRssi { .. })).await?;
            report(&event);
            close(&session, &mut events).await?;
        }
        Commands::OtaMode { device } => {
            let (session, mut events) = open(&central, &mut scan_rx, device, scan_time).await?;
            session.set_ota_mode().await?;
            let event = wait_for(&mut events, |e| matches!(e, DeviceEvent::SendCompleted { .. })).await?;
            report(&event);
            close(&session, &mut events).await?;
        }
        Commands::Update { device, url } => {
            let (session, mut events) = open(&central, &mut scan_rx, device, scan_time).await?;
            session.update_firmware(url).await?;
            let event = wait_for(&mut events, |e| matches!(e, DeviceEvent::FirmwareUpdate { .. })).await?;
            report(&event);
            if session.is_connected() {
                close(&session, &mut events).await?;
            }
        }
    }

    Ok(())
}

async fn scan(central: &Central, scan_rx: &mut mpsc::Receiver<ScanEvent>, duration: Duration) -> Result<()> {
    println!("Scanning for devices ({} seconds)...", duration.as_secs());
    central.start_scan().await?;

    let deadline = tokio::time::sleep(duration);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            Some(event) = scan_rx.recv() => {
                if let ScanEvent::Discovered { identity, rssi } = event {
                    let rssi = rssi.map(|r| format!("{} dBm", r)).unwrap_or_else(|| "N/A".to_string());
                    println!("  {}  {}  RSSI: {}", identity.id, identity.display_name(), rssi);
                }
            }
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    central.stop_scan();
    Ok(())
}

/// Scan until `device` shows up, then connect to it.
async fn open(
    central: &Central,
    scan_rx: &mut mpsc::Receiver<ScanEvent>,
    device: Uuid,
    duration: Duration,
) -> Result<(DeviceSession, mpsc::Receiver<DeviceEvent>)> {
    central.start_scan().await?;
    let found = tokio::time::timeout(duration, async {
        while let Some(event) = scan_rx.recv().await {
            if let ScanEvent::Discovered { identity, .. } = event {
                if identity.id == device {
                    return Some(identity);
                }
            }
        }
        None
    })
    .await
    .ok()
    .flatten();

    let identity = match found {
        Some(identity) => identity,
        None => {
            central.stop_scan();
            warn!("Device {} not seen while scanning, trying anyway", device);
            DeviceIdentity::new(None, device)
        }
    };

    let (event_tx, mut events) = mpsc::channel(32);
    let session = central.session(identity, event_tx);
    session.connect().await?;

    match wait_for(&mut events, |e| matches!(e, DeviceEvent::ConnectionStateChanged { .. })).await? {
        DeviceEvent::ConnectionStateChanged {
            status: Status::Success,
            state: LinkState::Connected,
            ..
        } => {
            println!("Connected to {}", session.identity().display_name());
            Ok((session, events))
        }
        other => bail!("connection failed: {:?}", other),
    }
}

async fn close(session: &DeviceSession, events: &mut mpsc::Receiver<DeviceEvent>) -> Result<()> {
    session.disconnect().await?;
    wait_for(events, |e| matches!(e, DeviceEvent::ConnectionStateChanged { .. })).await?;
    println!("Disconnected");
    Ok(())
}

async fn wait_for(
    events: &mut mpsc::Receiver<DeviceEvent>,
    wanted: impl Fn(&DeviceEvent) -> bool,
) -> Result<DeviceEvent> {
    while let Some(event) = events.recv().await {
        if let DeviceEvent::Error { error, .. } = &event {
            warn!("Device error: {}", error);
        }
        if wanted(&event) {
            return Ok(event);
        }
    }
    Err(anyhow!("device session closed"))
}

fn report(event: &DeviceEvent) {
    match event {
        DeviceEvent::SendCompleted { status, .. } => println!("Send: {:?}", status),
        DeviceEvent::RemoteRssi { status, rssi, .. } => println!("RSSI: {} dBm ({:?})", rssi, status),
        DeviceEvent::FirmwareUpdate { status, .. } => println!("Firmware update: {:?}", status),
        other => println!("{:?}", other),
    }
}
