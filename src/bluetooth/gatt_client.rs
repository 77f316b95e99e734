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

//! BlueZ GATT client transport.
//!
//! Requests are queued to a worker task that executes them one at a time
//! against BlueZ and reports each result as a [`GattEvent`].

use anyhow::{anyhow, Result};
use bluer::gatt::remote::Characteristic;
use bluer::{Adapter, Address, Device, DeviceEvent, DeviceProperty};
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::ble_constants::CLIENT_CONFIG_UUID;
use super::transport::{
    CharacteristicRole, DiscoveredCharacteristic, DiscoveredService, GattEvent, GattStatus,
    GattTransport,
};
use crate::identity::HardwareAddress;

/// How often and how long to wait for BlueZ to resolve services.
const RESOLVE_POLL: Duration = Duration::from_millis(100);
const RESOLVE_ATTEMPTS: u32 = 100;

#[derive(Debug)]
enum GattOp {
    Connect(HardwareAddress),
    Disconnect,
    Close,
    Discover,
    EnableNotifications(CharacteristicRole),
    Write(CharacteristicRole, Vec<u8>),
    ReadRssi,
}

/// [`GattTransport`] backed by a BlueZ device.
pub struct BluezTransport {
    ops: mpsc::UnboundedSender<GattOp>,
}

impl BluezTransport {
    /// Start a worker for one device link. Returns the transport and the
    /// receiver its events are delivered on.
    pub fn spawn(adapter: Adapter) -> (Self, mpsc::Receiver<GattEvent>) {
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(64);

        let worker = LinkWorker {
            adapter,
            device: None,
            characteristics: HashMap::new(),
            watchers: Vec::new(),
            events: event_tx,
        };
        tokio::spawn(worker.run(ops_rx));

        (Self { ops: ops_tx }, event_rx)
    }

    fn submit(&self, op: GattOp) -> bool {
        match self.ops.send(op) {
            Ok(()) => true,
            Err(e) => {
                error!("GATT worker gone, dropping {:?}", e.0);
                false
            }
        }
    }
}

impl GattTransport for BluezTransport {
    fn connect(&mut self, address: HardwareAddress) -> bool {
        self.submit(GattOp::Connect(address))
    }

    fn disconnect(&mut self) {
        self.submit(GattOp::Disconnect);
    }

    fn close(&mut self) {
        self.submit(GattOp::Close);
    }

    fn discover_services(&mut self) -> bool {
        self.submit(GattOp::Discover)
    }

    fn enable_notifications(&mut self, characteristic: CharacteristicRole) -> bool {
        self.submit(GattOp::EnableNotifications(characteristic))
    }

    fn write_characteristic(&mut self, characteristic: CharacteristicRole, value: &[u8]) -> bool {
        self.submit(GattOp::Write(characteristic, value.to_vec()))
    }

    fn read_remote_rssi(&mut self) -> bool {
        self.submit(GattOp::ReadRssi)
    }
}

struct LinkWorker {
    adapter: Adapter,
    device: Option<Device>,
    characteristics: HashMap<CharacteristicRole, Characteristic>,
    watchers: Vec<JoinHandle<()>>,
    events: mpsc::Sender<GattEvent>,
}

impl LinkWorker {
    async fn run(mut self, mut ops: mpsc::UnboundedReceiver<GattOp>) {
        while let Some(op) = ops.recv().await {
            debug!("GATT op: {:?}", op);
            match op {
                GattOp::Connect(address) => self.connect(address).await,
                GattOp::Disconnect => self.disconnect().await,
                GattOp::Close => self.close(),
                GattOp::Discover => self.discover().await,
                GattOp::EnableNotifications(role) => self.enable_notifications(role).await,
                GattOp::Write(role, value) => self.write(role, &value).await,
                GattOp::ReadRssi => self.read_rssi().await,
            }
        }

        self.close();
        debug!("GATT worker stopped");
    }

    async fn emit(&self, event: GattEvent) {
        if self.events.send(event).await.is_err() {
            debug!("GATT event receiver dropped");
        }
    }

    /// Classify a failed operation by whether the link survived it.
    async fn failure_status(&self) -> GattStatus {
        match &self.device {
            Some(device) => match device.is_connected().await {
                Ok(true) => GattStatus::Failure,
                _ => GattStatus::LinkLost,
            },
            None => GattStatus::LinkLost,
        }
    }

    async fn connect(&mut self, address: HardwareAddress) {
        let device = match self.adapter.device(Address::new(*address.as_bytes())) {
            Ok(device) => device,
            Err(e) => {
                error!("Unknown device {}: {}", address, e);
                self.emit(GattEvent::ConnectionStateChanged {
                    status: GattStatus::Failure,
                    connected: false,
                })
                .await;
                return;
            }
        };

        if let Err(e) = device.connect().await {
            warn!("Connect to {} failed: {}", address, e);
            self.emit(GattEvent::ConnectionStateChanged {
                status: GattStatus::Failure,
                connected: false,
            })
            .await;
            return;
        }

        match self.watch_link(&device).await {
            Ok(watcher) => self.watchers.push(watcher),
            Err(e) => warn!("Cannot watch link state: {}", e),
        }

        info!("Link up to {}", address);
        self.device = Some(device);
        self.emit(GattEvent::ConnectionStateChanged {
            status: GattStatus::Success,
            connected: true,
        })
        .await;
    }

    /// Forward the device dropping its link as a disconnected event.
    async fn watch_link(&self, device: &Device) -> Result<JoinHandle<()>> {
        let mut changes = Box::pin(device.events().await?);
        let events = self.events.clone();

        Ok(tokio::spawn(async move {
            while let Some(change) = changes.next().await {
                if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = change {
                    let _ = events
                        .send(GattEvent::ConnectionStateChanged {
                            status: GattStatus::Success,
                            connected: false,
                        })
                        .await;
                    break;
                }
            }
        }))
    }

    async fn disconnect(&mut self) {
        let Some(device) = &self.device else {
            self.emit(GattEvent::ConnectionStateChanged {
                status: GattStatus::Success,
                connected: false,
            })
            .await;
            return;
        };

        // Success is reported by the link watcher
        if let Err(e) = device.disconnect().await {
            warn!("Disconnect failed: {}", e);
            self.emit(GattEvent::ConnectionStateChanged {
                status: GattStatus::Failure,
                connected: false,
            })
            .await;
        }
    }

    fn close(&mut self) {
        for watcher in self.watchers.drain(..) {
            watcher.abort();
        }
        self.characteristics.clear();
        self.device = None;
    }

    async fn discover(&mut self) {
        let result = match &self.device {
            Some(device) => self.resolve_services(device).await,
            None => Err(anyhow!("no link")),
        };

        match result {
            Ok((services, characteristics)) => {
                self.characteristics = characteristics;
                self.emit(GattEvent::ServicesDiscovered {
                    status: GattStatus::Success,
                    services,
                })
                .await;
            }
            Err(e) => {
                warn!("Service discovery failed: {}", e);
                let status = self.failure_status().await;
                self.emit(GattEvent::ServicesDiscovered {
                    status,
                    services: Vec::new(),
                })
                .await;
            }
        }
    }

    async fn resolve_services(
        &self,
        device: &Device,
    ) -> Result<(Vec<DiscoveredService>, HashMap<CharacteristicRole, Characteristic>)> {
        let mut attempts = 0;
        while !device.is_services_resolved().await? {
            attempts += 1;
            if attempts > RESOLVE_ATTEMPTS {
                return Err(anyhow!("services not resolved"));
            }
            tokio::time::sleep(RESOLVE_POLL).await;
        }

        let mut services = Vec::new();
        let mut handles = HashMap::new();

        for service in device.services().await? {
            let mut discovered = DiscoveredService {
                uuid: service.uuid().await?,
                characteristics: Vec::new(),
            };

            for characteristic in service.characteristics().await? {
                let uuid = characteristic.uuid().await?;

                let mut descriptors = Vec::new();
                for descriptor in characteristic.descriptors().await? {
                    descriptors.push(descriptor.uuid().await?);
                }
                // BlueZ manages the CCCD itself and may not list it
                if characteristic.flags().await?.notify && !descriptors.contains(&CLIENT_CONFIG_UUID)
                {
                    descriptors.push(CLIENT_CONFIG_UUID);
                }

                if let Some(role) = CharacteristicRole::from_uuid(&uuid) {
                    handles.insert(role, characteristic);
                }
                discovered
                    .characteristics
                    .push(DiscoveredCharacteristic { uuid, descriptors });
            }

            services.push(discovered);
        }

        debug!("Discovered {} services", services.len());
        Ok((services, handles))
    }

    async fn enable_notifications(&mut self, role: CharacteristicRole) {
        let status = match self.characteristics.get(&role) {
            Some(characteristic) => match characteristic.notify().await {
                Ok(stream) => {
                    let mut stream = Box::pin(stream);
                    let events = self.events.clone();
                    self.watchers.push(tokio::spawn(async move {
                        while let Some(value) = stream.next().await {
                            let event = GattEvent::CharacteristicChanged {
                                characteristic: role,
                                value,
                            };
                            if events.send(event).await.is_err() {
                                break;
                            }
                        }
                    }));
                    GattStatus::Success
                }
                Err(e) => {
                    warn!("Enabling notifications on {:?} failed: {}", role, e);
                    self.failure_status().await
                }
            },
            None => GattStatus::Failure,
        };

        self.emit(GattEvent::DescriptorWritten {
            characteristic: role,
            status,
        })
        .await;
    }

    async fn write(&mut self, role: CharacteristicRole, value: &[u8]) {
        let status = match self.characteristics.get(&role) {
            Some(characteristic) => match characteristic.write(value).await {
                Ok(()) => GattStatus::Success,
                Err(e) => {
                    warn!("Write to {:?} failed: {}", role, e);
                    self.failure_status().await
                }
            },
            None => GattStatus::Failure,
        };

        self.emit(GattEvent::CharacteristicWritten {
            characteristic: role,
            status,
        })
        .await;
    }

    async fn read_rssi(&mut self) {
        let result = match &self.device {
            Some(device) => device.rssi().await.ok().flatten(),
            None => None,
        };

        let event = match result {
            Some(rssi) => GattEvent::RemoteRssi {
                rssi,
                status: GattStatus::Success,
            },
            None => GattEvent::RemoteRssi {
                rssi: 0,
                status: self.failure_status().await,
            },
        };
        self.emit(event).await;
    }
}
