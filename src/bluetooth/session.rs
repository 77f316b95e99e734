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

//! Device session actor and its public handle.
//!
//! One task per device owns the [`SessionMachine`]. It serves public calls
//! from any number of [`DeviceSession`] clones, the transport's event stream
//! and background download completions, one at a time.
//!
//! Application events leave the actor in the order they were produced. A
//! disconnect waiting out its settle delay holds back everything queued
//! after it. Events wait in the actor while the receiver is full, so a
//! caller that never drains its channel still gets replies to its calls.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::ble_constants::config;
use super::connection::{SessionMachine, SessionOutput, SessionState};
use super::transport::{AdapterControl, GattEvent, GattTransport};
use crate::error::{SessionError, SessionResult};
use crate::events::{DeviceEvent, Status};
use crate::firmware::FirmwareSource;
use crate::identity::DeviceIdentity;
use crate::state::SessionStatus;

/// Delay before a completed disconnect is reported.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(100);

/// Tuning for a session actor.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Pause between the link going down and the disconnected event.
    pub settle_delay: Duration,
    /// Link packet size used when chunking outbound messages.
    pub chunk_size: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            settle_delay: DEFAULT_SETTLE_DELAY,
            chunk_size: config::DEFAULT_CHUNK_SIZE,
        }
    }
}

/// Public calls forwarded to the actor.
#[derive(Debug)]
enum Request {
    Connect,
    Disconnect,
    Send { message_type: u8, payload: Vec<u8> },
    SetOtaMode,
    UpdateFirmware { url: String },
    ReadRemoteRssi,
}

struct Command {
    request: Request,
    reply: oneshot::Sender<SessionResult<()>>,
}

/// Handle to one device. Cheap to clone; the actor stops once every clone
/// is dropped.
#[derive(Clone)]
pub struct DeviceSession {
    identity: DeviceIdentity,
    commands: mpsc::Sender<Command>,
    status: Arc<SessionStatus>,
}

impl DeviceSession {
    /// Spawn the actor for `identity` on the current tokio runtime.
    ///
    /// `gatt_events` must carry every event produced by `transport`, in order.
    /// Application events are delivered on `events`.
    pub fn spawn<T>(
        identity: DeviceIdentity,
        transport: T,
        gatt_events: mpsc::Receiver<GattEvent>,
        adapter: Arc<dyn AdapterControl>,
        firmware: Arc<dyn FirmwareSource>,
        events: mpsc::Sender<DeviceEvent>,
        options: SessionOptions,
    ) -> Self
    where
        T: GattTransport + 'static,
    {
        let (command_tx, command_rx) = mpsc::channel(32);
        let (download_tx, download_rx) = mpsc::channel(4);
        let status = SessionStatus::new();

        let machine =
            SessionMachine::new(identity.clone(), transport, adapter).with_chunk_size(options.chunk_size);

        let actor = SessionActor {
            machine,
            commands: command_rx,
            gatt_events,
            download_tx,
            download_rx,
            firmware,
            events,
            status: status.clone(),
            settle_delay: options.settle_delay,
            outbox: VecDeque::new(),
        };
        tokio::spawn(actor.run());

        Self {
            identity,
            commands: command_tx,
            status,
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Start connecting; the outcome arrives as `ConnectionStateChanged`.
    pub async fn connect(&self) -> SessionResult<()> {
        self.request(Request::Connect).await
    }

    /// Start disconnecting; the outcome arrives as `ConnectionStateChanged`.
    pub async fn disconnect(&self) -> SessionResult<()> {
        self.request(Request::Disconnect).await
    }

    /// Send an application message (type < 0x80, payload up to 198 bytes).
    pub async fn send(&self, message_type: u8, payload: impl Into<Vec<u8>>) -> SessionResult<()> {
        self.request(Request::Send {
            message_type,
            payload: payload.into(),
        })
        .await
    }

    /// Switch the device into its firmware update mode.
    pub async fn set_ota_mode(&self) -> SessionResult<()> {
        self.request(Request::SetOtaMode).await
    }

    /// Download the image at `url` and push it to the device.
    pub async fn update_firmware(&self, url: impl Into<String>) -> SessionResult<()> {
        self.request(Request::UpdateFirmware { url: url.into() })
            .await
    }

    pub async fn read_remote_rssi(&self) -> SessionResult<()> {
        self.request(Request::ReadRemoteRssi).await
    }

    pub fn state(&self) -> SessionState {
        self.status.get_state()
    }

    pub fn is_connected(&self) -> bool {
        self.status.is_connected()
    }

    pub fn is_firmware_updating(&self) -> bool {
        self.status.is_firmware_updating()
    }

    /// Last RSSI the device reported, if any.
    pub fn last_rssi(&self) -> Option<i16> {
        self.status.get_rssi()
    }

    async fn request(&self, request: Request) -> SessionResult<()> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command { request, reply })
            .await
            .map_err(|_| SessionError::SessionClosed)?;
        response.await.map_err(|_| SessionError::SessionClosed)?
    }
}

/// An event waiting for delivery, optionally not before a deadline.
struct Outgoing {
    event: DeviceEvent,
    not_before: Option<Instant>,
}

struct SessionActor<T: GattTransport> {
    machine: SessionMachine<T>,
    commands: mpsc::Receiver<Command>,
    gatt_events: mpsc::Receiver<GattEvent>,
    download_tx: mpsc::Sender<Result<Vec<u8>, String>>,
    download_rx: mpsc::Receiver<Result<Vec<u8>, String>>,
    firmware: Arc<dyn FirmwareSource>,
    events: mpsc::Sender<DeviceEvent>,
    status: Arc<SessionStatus>,
    settle_delay: Duration,
    outbox: VecDeque<Outgoing>,
}

impl<T: GattTransport + 'static> SessionActor<T> {
    async fn run(mut self) {
        debug!("Session actor started for {}", self.machine.identity().id);

        loop {
            let now = Instant::now();
            let (deliverable, wake_at) = match self.outbox.front().map(|o| o.not_before) {
                Some(Some(at)) if at > now => (false, Some(at)),
                Some(_) => (true, None),
                None => (false, None),
            };

            let events = self.events.clone();
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(event) = self.gatt_events.recv() => {
                    debug!("GATT event: {:?}", event);
                    self.machine.handle_gatt_event(event);
                }
                Some(result) = self.download_rx.recv() => {
                    self.machine.firmware_downloaded(result);
                }
                permit = events.reserve(), if deliverable => match permit {
                    Ok(permit) => {
                        if let Some(outgoing) = self.outbox.pop_front() {
                            permit.send(outgoing.event);
                        }
                    }
                    Err(_) => {
                        debug!("Event receiver dropped, discarding {} events", self.outbox.len());
                        self.outbox.clear();
                    }
                },
                _ = tokio::time::sleep_until(wake_at.unwrap_or(now)), if wake_at.is_some() => {}
            }

            self.sync_status();
            self.queue_outputs();
        }

        info!("Session for {} closed", self.machine.identity().display_name());
        self.machine.transport_mut().close();
        self.drain().await;
    }

    fn handle_command(&mut self, command: Command) {
        let Command { request, reply } = command;
        debug!("Request: {:?}", request);

        let result = match request {
            Request::Connect => self.machine.connect(),
            Request::Disconnect => self.machine.disconnect(),
            Request::Send {
                message_type,
                payload,
            } => self.machine.send(message_type, &payload),
            Request::SetOtaMode => self.machine.set_ota_mode(),
            Request::ReadRemoteRssi => self.machine.read_remote_rssi(),
            Request::UpdateFirmware { url } => {
                let result = self.machine.begin_firmware_update();
                if result.is_ok() {
                    self.start_download(url);
                }
                result
            }
        };

        if let Err(e) = &result {
            warn!("Request rejected: {}", e);
        }

        // Snapshot must reflect the call before the caller resumes
        self.sync_status();
        let _ = reply.send(result);
    }

    fn start_download(&self, url: String) {
        let source = self.firmware.clone();
        let done = self.download_tx.clone();

        tokio::spawn(async move {
            let result = source.fetch(&url).await.map_err(|e| format!("{:#}", e));
            if done.send(result).await.is_err() {
                debug!("Session closed before the firmware download finished");
            }
        });
    }

    fn sync_status(&self) {
        self.status
            .update(self.machine.state(), self.machine.is_firmware_updating());
    }

    fn queue_outputs(&mut self) {
        for output in self.machine.take_outputs() {
            let (event, not_before) = match output {
                SessionOutput::Notify(event) => (event, None),
                SessionOutput::NotifyAfterSettle(event) => {
                    (event, Some(Instant::now() + self.settle_delay))
                }
            };

            if let DeviceEvent::RemoteRssi {
                status: Status::Success,
                rssi,
                ..
            } = event
            {
                self.status.set_rssi(rssi);
            }

            self.outbox.push_back(Outgoing { event, not_before });
        }
    }

    /// Deliver what is still queued once every handle is gone.
    async fn drain(&mut self) {
        while let Some(outgoing) = self.outbox.pop_front() {
            if let Some(at) = outgoing.not_before {
                tokio::time::sleep_until(at).await;
            }
            if self.events.send(outgoing.event).await.is_err() {
                debug!("Event receiver dropped");
                break;
            }
        }
    }
}
