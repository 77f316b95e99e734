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

//! BLE central: adapter control, scanning and session creation.

use anyhow::Result;
use bluer::{Adapter, AdapterEvent, AdapterProperty, Address};
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::ble_constants::ADVERTISED_SERVICE_UUID;
use super::gatt_client::BluezTransport;
use super::session::{DeviceSession, SessionOptions};
use super::transport::AdapterControl;
use crate::crypto::AddressCodec;
use crate::events::{DeviceEvent, ScanEvent, ScanState};
use crate::firmware::FirmwareSource;
use crate::identity::{DeviceIdentity, HardwareAddress};

/// Pause after stopping discovery before reporting it stopped.
const SCAN_STOP_SETTLE: Duration = Duration::from_millis(100);

/// [`AdapterControl`] over a BlueZ adapter.
pub struct BluezAdapter {
    local: HardwareAddress,
    powered: AtomicBool,
    scan: Mutex<Option<JoinHandle<()>>>,
    scan_events: mpsc::Sender<ScanEvent>,
}

impl BluezAdapter {
    fn set_scan(&self, task: JoinHandle<()>) {
        if let Some(previous) = self.scan.lock().replace(task) {
            previous.abort();
        }
    }
}

impl AdapterControl for BluezAdapter {
    fn is_powered(&self) -> bool {
        self.powered.load(Ordering::SeqCst)
    }

    fn is_scanning(&self) -> bool {
        self.scan
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    fn stop_scan(&self) -> bool {
        let Some(task) = self.scan.lock().take() else {
            return true;
        };

        // Dropping the discovery stream ends the BlueZ discovery session
        task.abort();
        info!("Scan stopped");

        let events = self.scan_events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(SCAN_STOP_SETTLE).await;
            let _ = events.send(ScanEvent::StateChanged(ScanState::Stopped)).await;
        });
        true
    }

    fn local_address(&self) -> HardwareAddress {
        self.local
    }
}

/// Entry point for applications: owns the adapter and hands out sessions.
pub struct Central {
    adapter: Adapter,
    control: Arc<BluezAdapter>,
    codec: AddressCodec,
    name_filter: Option<String>,
    firmware: Arc<dyn FirmwareSource>,
    options: SessionOptions,
    _session: bluer::Session,
    _power_watch: JoinHandle<()>,
}

impl Central {
    /// Open the default adapter. Scan events are delivered on `scan_events`.
    pub async fn new(
        scan_events: mpsc::Sender<ScanEvent>,
        firmware: Arc<dyn FirmwareSource>,
        options: SessionOptions,
    ) -> Result<Self> {
        let session = bluer::Session::new().await?;
        info!("BlueZ session created");

        let adapter = session.default_adapter().await?;
        info!("Using Bluetooth adapter: {}", adapter.name());

        let local = HardwareAddress::new(adapter.address().await?.0);
        let control = Arc::new(BluezAdapter {
            local,
            powered: AtomicBool::new(adapter.is_powered().await?),
            scan: Mutex::new(None),
            scan_events,
        });

        let power_watch = Self::watch_power(&adapter, control.clone()).await?;

        Ok(Self {
            adapter,
            control,
            codec: AddressCodec::new(&local),
            name_filter: None,
            firmware,
            options,
            _session: session,
            _power_watch: power_watch,
        })
    }

    /// Only report devices whose name contains `filter`.
    pub fn with_name_filter(mut self, filter: Option<String>) -> Self {
        self.name_filter = filter;
        self
    }

    async fn watch_power(adapter: &Adapter, control: Arc<BluezAdapter>) -> Result<JoinHandle<()>> {
        let mut changes = Box::pin(adapter.events().await?);
        Ok(tokio::spawn(async move {
            while let Some(change) = changes.next().await {
                if let AdapterEvent::PropertyChanged(AdapterProperty::Powered(powered)) = change {
                    info!("Adapter powered: {}", powered);
                    control.powered.store(powered, Ordering::SeqCst);
                }
            }
        }))
    }

    pub fn adapter_control(&self) -> Arc<dyn AdapterControl> {
        self.control.clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.control.is_powered()
    }

    pub async fn enable(&self) -> Result<()> {
        self.adapter.set_powered(true).await?;
        self.control.powered.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub async fn disable(&self) -> Result<()> {
        self.control.stop_scan();
        self.adapter.set_powered(false).await?;
        self.control.powered.store(false, Ordering::SeqCst);
        Ok(())
    }

    pub fn is_scanning(&self) -> bool {
        self.control.is_scanning()
    }

    /// Start discovering devices that advertise the device service.
    pub async fn start_scan(&self) -> Result<()> {
        if !self.control.is_powered() {
            return Err(anyhow::anyhow!("bluetooth adapter is powered off"));
        }

        let mut discovery = Box::pin(self.adapter.discover_devices().await?);
        let adapter = self.adapter.clone();
        let codec = self.codec.clone();
        let filter = self.name_filter.clone();
        let events = self.control.scan_events.clone();

        let task = tokio::spawn(async move {
            while let Some(event) = discovery.next().await {
                let AdapterEvent::DeviceAdded(address) = event else {
                    continue;
                };

                match inspect(&adapter, address, &codec, filter.as_deref()).await {
                    Ok(Some((identity, rssi))) => {
                        debug!("Discovered {} ({})", identity.display_name(), identity.id);
                        if events
                            .send(ScanEvent::Discovered { identity, rssi })
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => debug!("Skipping {}: {}", address, e),
                }
            }
        });

        self.control.set_scan(task);
        info!("Scan started");
        let _ = self
            .control
            .scan_events
            .send(ScanEvent::StateChanged(ScanState::Started))
            .await;
        Ok(())
    }

    pub fn stop_scan(&self) -> bool {
        self.control.stop_scan()
    }

    /// Create a session for a discovered device.
    pub fn session(&self, identity: DeviceIdentity, events: mpsc::Sender<DeviceEvent>) -> DeviceSession {
        let (transport, gatt_events) = BluezTransport::spawn(self.adapter.clone());
        DeviceSession::spawn(
            identity,
            transport,
            gatt_events,
            self.adapter_control(),
            self.firmware.clone(),
            events,
            self.options.clone(),
        )
    }
}

/// Build the identity of an advertising device, if it is one of ours.
async fn inspect(
    adapter: &Adapter,
    address: Address,
    codec: &AddressCodec,
    name_filter: Option<&str>,
) -> Result<Option<(DeviceIdentity, Option<i16>)>> {
    let device = adapter.device(address)?;

    let advertised = device.uuids().await?.unwrap_or_default();
    if !advertised.contains(&ADVERTISED_SERVICE_UUID) {
        return Ok(None);
    }

    let name = device.name().await?;
    if let Some(filter) = name_filter {
        if !name.as_deref().is_some_and(|n| n.contains(filter)) {
            return Ok(None);
        }
    }

    let rssi = device.rssi().await?;
    let id = codec.encode(&HardwareAddress::new(address.0));
    Ok(Some((DeviceIdentity::new(name, id), rssi)))
}
