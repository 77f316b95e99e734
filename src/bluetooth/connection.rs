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

//! GATT connection state machine for a single device.
//!
//! [`SessionMachine`] owns all per-device state. Public operations and
//! transport events are plain method calls that update the state, issue
//! requests on the [`GattTransport`] and queue [`SessionOutput`]s for the
//! application. Nothing here is async; the actor in `session.rs` feeds it.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::ble_constants::{config, message_type, CLIENT_CONFIG_UUID, SERVICE_UUID};
use super::ota::{OtaStep, OtaTransfer};
use super::protocol::Message;
use super::reassembler::{chunk_message, MessageReassembler};
use super::transport::{
    AdapterControl, CharacteristicRole, DiscoveredCharacteristic, DiscoveredService, GattEvent,
    GattStatus, GattTransport,
};
use crate::crypto::AddressCodec;
use crate::error::{Operation, SessionError, SessionResult};
use crate::events::{DeviceEvent, LinkState, Status};
use crate::identity::DeviceIdentity;

/// State of the link to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Negotiating,
    Ready,
    Disconnecting,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "Disconnected",
            SessionState::Connecting => "Connecting...",
            SessionState::Negotiating => "Negotiating...",
            SessionState::Ready => "Ready",
            SessionState::Disconnecting => "Disconnecting...",
        }
    }
}

/// Something the driver must hand to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutput {
    /// Deliver now.
    Notify(DeviceEvent),
    /// Deliver once the link has had time to settle.
    NotifyAfterSettle(DeviceEvent),
}

/// Characteristics resolved from the device's primary service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceLayout {
    characteristics: HashMap<CharacteristicRole, DiscoveredCharacteristic>,
}

impl ServiceLayout {
    /// Resolve the four characteristics and both notification descriptors.
    pub fn resolve(services: &[DiscoveredService]) -> SessionResult<Self> {
        let service = services
            .iter()
            .find(|s| s.uuid == SERVICE_UUID)
            .ok_or_else(|| SessionError::CapabilityMismatch(format!("service {} missing", SERVICE_UUID)))?;

        let mut characteristics = HashMap::new();
        for role in CharacteristicRole::ALL {
            let characteristic = service
                .characteristics
                .iter()
                .find(|c| c.uuid == role.uuid())
                .ok_or_else(|| {
                    SessionError::CapabilityMismatch(format!("{:?} characteristic missing", role))
                })?;

            if role.is_notify() && !characteristic.descriptors.contains(&CLIENT_CONFIG_UUID) {
                return Err(SessionError::CapabilityMismatch(format!(
                    "{:?} characteristic has no client configuration descriptor",
                    role
                )));
            }

            characteristics.insert(role, characteristic.clone());
        }

        Ok(Self { characteristics })
    }

    pub fn characteristic(&self, role: CharacteristicRole) -> Option<&DiscoveredCharacteristic> {
        self.characteristics.get(&role)
    }
}

/// Who started an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendOrigin {
    Application,
    Firmware,
}

/// An outbound message whose first chunk awaits the command write ack.
#[derive(Debug)]
struct PendingSend {
    remaining: VecDeque<Vec<u8>>,
    payload: Vec<u8>,
    origin: SendOrigin,
}

/// Connection, negotiation and transfer state of one device.
pub struct SessionMachine<T: GattTransport> {
    identity: DeviceIdentity,
    transport: T,
    adapter: Arc<dyn AdapterControl>,
    state: SessionState,
    layout: Option<ServiceLayout>,
    /// Oldest first. At most one entry still holds bulk-out chunks.
    in_flight: VecDeque<PendingSend>,
    ota: Option<OtaTransfer>,
    reassembler: MessageReassembler,
    chunk_size: usize,
    outputs: Vec<SessionOutput>,
}

impl<T: GattTransport> SessionMachine<T> {
    /// Create a machine for a discovered device.
    pub fn new(identity: DeviceIdentity, transport: T, adapter: Arc<dyn AdapterControl>) -> Self {
        Self {
            identity,
            transport,
            adapter,
            state: SessionState::Disconnected,
            layout: None,
            in_flight: VecDeque::new(),
            ota: None,
            reassembler: MessageReassembler::new(),
            chunk_size: config::DEFAULT_CHUNK_SIZE,
            outputs: Vec::new(),
        }
    }

    /// Override the link packet size.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(config::HEADER_SIZE);
        self
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Ready
    }

    pub fn is_firmware_updating(&self) -> bool {
        self.ota.is_some()
    }

    /// True until every issued send has had its command write acknowledged.
    pub fn has_pending_send(&self) -> bool {
        !self.in_flight.is_empty()
    }

    /// The slot is held only while a send still has bulk-out chunks queued.
    /// Single-chunk messages free it as soon as their first write is issued.
    fn send_slot_busy(&self) -> bool {
        self.in_flight.iter().any(|p| !p.remaining.is_empty())
    }

    pub fn layout(&self) -> Option<&ServiceLayout> {
        self.layout.as_ref()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Drain the queued application events.
    pub fn take_outputs(&mut self) -> Vec<SessionOutput> {
        std::mem::take(&mut self.outputs)
    }

    // ---- public operations -------------------------------------------------

    /// Start connecting. Outcome arrives as a connection event.
    pub fn connect(&mut self) -> SessionResult<()> {
        match self.state {
            SessionState::Connecting | SessionState::Negotiating => {
                return Err(SessionError::Busy(Operation::Connect))
            }
            SessionState::Disconnecting => return Err(SessionError::Busy(Operation::Disconnect)),
            SessionState::Disconnected | SessionState::Ready => {}
        }

        if !self.adapter.is_powered() {
            return Err(SessionError::AdapterOff);
        }

        if self.adapter.is_scanning() && !self.adapter.stop_scan() {
            return Err(SessionError::ScanStopFailed);
        }

        if self.state == SessionState::Ready {
            debug!("Already connected to {}", self.identity.display_name());
            self.notify_connection(Status::Success, LinkState::Connected);
            return Ok(());
        }

        let address = AddressCodec::new(&self.adapter.local_address()).decode(&self.identity.id)?;

        self.transport.close();
        if !self.transport.connect(address) {
            return Err(SessionError::ConnectRefused);
        }

        self.state = SessionState::Connecting;
        info!(
            "Connecting to {} ({})",
            self.identity.display_name(),
            self.identity.id
        );
        Ok(())
    }

    /// Start disconnecting. Outcome arrives as a connection event.
    pub fn disconnect(&mut self) -> SessionResult<()> {
        if self.state == SessionState::Disconnecting {
            return Err(SessionError::Busy(Operation::Disconnect));
        }

        if !self.adapter.is_powered() {
            return Err(SessionError::AdapterOff);
        }

        if self.state != SessionState::Ready {
            return Err(SessionError::NotConnected);
        }

        self.state = SessionState::Disconnecting;
        self.transport.disconnect();
        info!("Disconnecting from {}", self.identity.display_name());
        Ok(())
    }

    /// Send an application message.
    pub fn send(&mut self, message_type: u8, payload: &[u8]) -> SessionResult<()> {
        if message_type::is_reserved(message_type) {
            return Err(SessionError::ReservedMessageType(message_type));
        }

        let message = Message::new(message_type, payload)?;
        self.send_message(message, SendOrigin::Application)
    }

    /// Ask the device to switch into OTA mode.
    pub fn set_ota_mode(&mut self) -> SessionResult<()> {
        self.send_message(Message::ota_mode(), SendOrigin::Application)
    }

    /// Request the remote RSSI. Result arrives as an RSSI event.
    pub fn read_remote_rssi(&mut self) -> SessionResult<()> {
        if !self.adapter.is_powered() {
            return Err(SessionError::AdapterOff);
        }

        if self.state != SessionState::Ready {
            return Err(SessionError::NotConnected);
        }

        if !self.transport.read_remote_rssi() {
            return Err(SessionError::RequestRejected);
        }
        Ok(())
    }

    /// Reserve the firmware update slot. The caller fetches the image and
    /// hands it back through [`Self::firmware_downloaded`].
    pub fn begin_firmware_update(&mut self) -> SessionResult<()> {
        if self.ota.is_some() {
            return Err(SessionError::Busy(Operation::FirmwareUpdate));
        }

        self.ota = Some(OtaTransfer::new());
        info!("Firmware update started for {}", self.identity.display_name());
        Ok(())
    }

    /// Continue the update with the result of the download.
    pub fn firmware_downloaded(&mut self, result: Result<Vec<u8>, String>) {
        let Some(ota) = self.ota.as_mut() else {
            debug!("Firmware download finished after the update was abandoned");
            return;
        };

        let begin = match result {
            Ok(image) => ota.begin(image),
            Err(reason) => Err(SessionError::Download(reason)),
        };

        match begin.and_then(|message| self.send_message(message, SendOrigin::Firmware)) {
            Ok(()) => debug!("OTA BEGIN sent"),
            Err(e) => self.fail_ota(e),
        }
    }

    // ---- transport events --------------------------------------------------

    /// Feed one transport event into the machine.
    pub fn handle_gatt_event(&mut self, event: GattEvent) {
        match event {
            GattEvent::ConnectionStateChanged { status, connected } => {
                self.on_connection_state(status, connected)
            }
            GattEvent::ServicesDiscovered { status, services } => {
                self.on_services_discovered(status, &services)
            }
            GattEvent::DescriptorWritten {
                characteristic,
                status,
            } => self.on_descriptor_written(characteristic, status),
            GattEvent::CharacteristicWritten {
                characteristic,
                status,
            } => self.on_characteristic_written(characteristic, status),
            GattEvent::CharacteristicChanged {
                characteristic,
                value,
            } => self.on_notification(characteristic, &value),
            GattEvent::RemoteRssi { rssi, status } => self.on_remote_rssi(rssi, status),
        }
    }

    fn on_connection_state(&mut self, status: GattStatus, connected: bool) {
        if !status.is_success() {
            if self.state == SessionState::Disconnected {
                self.transport.close();
            } else {
                self.teardown(SessionError::LinkLost);
            }
            return;
        }

        if connected {
            if self.state != SessionState::Connecting {
                debug!("Ignoring connected event in state {:?}", self.state);
                return;
            }

            self.state = SessionState::Negotiating;
            debug!("Link up, discovering services");
            if !self.transport.discover_services() {
                warn!("Service discovery request rejected");
                self.transport.disconnect();
            }
            return;
        }

        self.transport.close();
        self.release();

        match self.state {
            SessionState::Connecting | SessionState::Negotiating => {
                warn!("Link closed before negotiation finished");
                self.state = SessionState::Disconnected;
                self.notify_connection(Status::Failure, LinkState::Connected);
            }
            SessionState::Ready | SessionState::Disconnecting => {
                if self.state == SessionState::Ready {
                    info!("Device {} dropped the link", self.identity.display_name());
                }
                self.state = SessionState::Disconnected;
                let event = self.connection_event(Status::Success, LinkState::Disconnected);
                self.outputs.push(SessionOutput::NotifyAfterSettle(event));
            }
            SessionState::Disconnected => debug!("Disconnected event while already disconnected"),
        }
    }

    fn on_services_discovered(&mut self, status: GattStatus, services: &[DiscoveredService]) {
        if self.state != SessionState::Negotiating {
            debug!("Ignoring service discovery in state {:?}", self.state);
            return;
        }

        match status {
            GattStatus::LinkLost => self.teardown(SessionError::LinkLost),
            GattStatus::Failure => {
                warn!("Service discovery failed");
                self.transport.disconnect();
            }
            GattStatus::Success => match ServiceLayout::resolve(services) {
                Ok(layout) => {
                    self.layout = Some(layout);
                    if !self.transport.enable_notifications(CharacteristicRole::Event) {
                        self.transport.disconnect();
                    }
                }
                Err(e) => {
                    error!("Device {} is not supported: {}", self.identity.id, e);
                    self.notify(DeviceEvent::Error {
                        device: self.identity.id,
                        error: e,
                    });
                    self.transport.disconnect();
                }
            },
        }
    }

    fn on_descriptor_written(&mut self, characteristic: CharacteristicRole, status: GattStatus) {
        if self.state != SessionState::Negotiating {
            debug!("Ignoring descriptor write in state {:?}", self.state);
            return;
        }

        match status {
            GattStatus::LinkLost => self.teardown(SessionError::LinkLost),
            GattStatus::Failure => {
                warn!("Enabling notifications on {:?} failed", characteristic);
                self.transport.disconnect();
            }
            GattStatus::Success => match characteristic {
                CharacteristicRole::Event => {
                    if !self.transport.enable_notifications(CharacteristicRole::BulkIn) {
                        self.transport.disconnect();
                    }
                }
                CharacteristicRole::BulkIn => {
                    self.state = SessionState::Ready;
                    info!("Device {} ready", self.identity.display_name());
                    self.notify_connection(Status::Success, LinkState::Connected);
                }
                other => debug!("Unexpected descriptor ack for {:?}", other),
            },
        }
    }

    fn on_characteristic_written(&mut self, characteristic: CharacteristicRole, status: GattStatus) {
        if status.is_success() {
            if characteristic == CharacteristicRole::Command {
                self.on_command_written();
            }
            return;
        }

        warn!("Write to {:?} failed: {:?}", characteristic, status);

        // Bulk-out chunks belong to a send that already completed; only a
        // command write failure is charged to the oldest send in flight.
        let owner = if characteristic == CharacteristicRole::Command {
            self.in_flight.pop_front().map(|p| p.origin)
        } else {
            None
        };

        match owner {
            Some(origin) => self.fail_send(origin),
            None if self.ota.is_some() => self.fail_ota(SessionError::TransportWriteFailed),
            None => self.notify(DeviceEvent::SendCompleted {
                device: self.identity.id,
                status: Status::Failure,
                payload: None,
            }),
        }

        if status == GattStatus::LinkLost {
            self.teardown(SessionError::LinkLost);
        }
    }

    /// First chunk acknowledged: flush the rest to bulk-out back-to-back.
    fn on_command_written(&mut self) {
        let Some(mut pending) = self.in_flight.pop_front() else {
            debug!("Command write ack without a pending send");
            return;
        };

        if pending.origin == SendOrigin::Firmware && self.ota.is_none() {
            debug!("Dropping firmware message of an aborted update");
            return;
        }

        while let Some(chunk) = pending.remaining.pop_front() {
            if !self
                .transport
                .write_characteristic(CharacteristicRole::BulkOut, &chunk)
            {
                warn!(
                    "Bulk-out write rejected with {} chunks left",
                    pending.remaining.len() + 1
                );
                self.fail_send(pending.origin);
                return;
            }
        }

        match pending.origin {
            SendOrigin::Application => {
                debug!("Send complete: {} bytes", pending.payload.len());
                self.notify(DeviceEvent::SendCompleted {
                    device: self.identity.id,
                    status: Status::Success,
                    payload: Some(pending.payload),
                });
            }
            SendOrigin::Firmware => {
                let finished = self
                    .ota
                    .as_mut()
                    .is_some_and(|ota| ota.on_send_complete(&pending.payload));
                if finished {
                    self.ota = None;
                    info!("Firmware update complete for {}", self.identity.display_name());
                    self.notify(DeviceEvent::FirmwareUpdate {
                        device: self.identity.id,
                        status: Status::Success,
                    });
                }
            }
        }
    }

    fn on_notification(&mut self, characteristic: CharacteristicRole, value: &[u8]) {
        if characteristic == CharacteristicRole::Event
            && value.first() == Some(&message_type::OTA_DATA)
        {
            if let Some(ota) = self.ota.as_mut() {
                match ota.handle_ack(value) {
                    OtaStep::Send(message) => {
                        if let Err(e) = self.send_message(message, SendOrigin::Firmware) {
                            self.fail_ota(e);
                        }
                    }
                    OtaStep::Ignore => {}
                    OtaStep::Fail(reason) => self.fail_ota(SessionError::FirmwareRejected(reason)),
                }
                return;
            }
        }

        let starts_message = characteristic == CharacteristicRole::Event;
        if let Some(message) = self.reassembler.process_packet(value, starts_message) {
            if message.is_application() {
                self.notify(DeviceEvent::MessageReceived {
                    device: self.identity.id,
                    message_type: message.message_type,
                    payload: message.payload,
                });
            } else {
                debug!("Dropping reserved message type {:#04x}", message.message_type);
            }
        }
    }

    fn on_remote_rssi(&mut self, rssi: i16, status: GattStatus) {
        let result = if status.is_success() {
            Status::Success
        } else {
            Status::Failure
        };
        self.notify(DeviceEvent::RemoteRssi {
            device: self.identity.id,
            status: result,
            rssi,
        });

        if status == GattStatus::LinkLost {
            self.teardown(SessionError::LinkLost);
        }
    }

    // ---- helpers -----------------------------------------------------------

    fn send_message(&mut self, message: Message, origin: SendOrigin) -> SessionResult<()> {
        if !self.adapter.is_powered() {
            return Err(SessionError::AdapterOff);
        }

        if self.send_slot_busy() {
            return Err(SessionError::Busy(Operation::Send));
        }

        if self.state != SessionState::Ready {
            return Err(SessionError::NotConnected);
        }

        let mut chunks: VecDeque<Vec<u8>> = chunk_message(&message.to_wire(), self.chunk_size).into();
        let first = chunks.pop_front().unwrap_or_default();

        if !self
            .transport
            .write_characteristic(CharacteristicRole::Command, &first)
        {
            return Err(SessionError::TransportWriteFailed);
        }

        debug!(
            "Sending type {:#04x}: {} bytes in {} chunks",
            message.message_type,
            message.payload.len(),
            chunks.len() + 1
        );
        self.in_flight.push_back(PendingSend {
            remaining: chunks,
            payload: message.payload,
            origin,
        });
        Ok(())
    }

    fn fail_send(&mut self, origin: SendOrigin) {
        match origin {
            SendOrigin::Application => self.notify(DeviceEvent::SendCompleted {
                device: self.identity.id,
                status: Status::Failure,
                payload: None,
            }),
            SendOrigin::Firmware => self.fail_ota(SessionError::TransportWriteFailed),
        }
    }

    fn fail_ota(&mut self, error: SessionError) {
        if self.ota.take().is_none() {
            return;
        }

        warn!("Firmware update failed: {}", error);
        self.notify(DeviceEvent::Error {
            device: self.identity.id,
            error,
        });
        self.notify(DeviceEvent::FirmwareUpdate {
            device: self.identity.id,
            status: Status::Failure,
        });
    }

    /// Drop per-link state. In-flight operations are abandoned silently.
    fn release(&mut self) {
        self.layout = None;
        self.reassembler.reset();
        if !self.in_flight.is_empty() {
            warn!("Abandoning {} pending sends", self.in_flight.len());
            self.in_flight.clear();
        }
        if self.ota.take().is_some() {
            warn!("Abandoning firmware update");
        }
    }

    /// Hard failure: close the link and fail whatever was in flight.
    fn teardown(&mut self, error: SessionError) {
        error!(
            "Tearing down link to {} in state {:?}: {}",
            self.identity.display_name(),
            self.state,
            error
        );
        self.transport.close();

        for pending in std::mem::take(&mut self.in_flight) {
            self.fail_send(pending.origin);
        }
        self.fail_ota(error.clone());

        let link = if self.state == SessionState::Disconnecting {
            LinkState::Disconnected
        } else {
            LinkState::Connected
        };

        self.release();
        self.state = SessionState::Disconnected;
        self.notify(DeviceEvent::Error {
            device: self.identity.id,
            error,
        });
        self.notify_connection(Status::Failure, link);
    }

    fn connection_event(&self, status: Status, state: LinkState) -> DeviceEvent {
        DeviceEvent::ConnectionStateChanged {
            device: self.identity.id,
            status,
            state,
        }
    }

    fn notify_connection(&mut self, status: Status, state: LinkState) {
        let event = self.connection_event(status, state);
        self.notify(event);
    }

    fn notify(&mut self, event: DeviceEvent) {
        self.outputs.push(SessionOutput::Notify(event));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::ble_constants::ota_header;
    use crate::identity::HardwareAddress;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Connect(HardwareAddress),
        Disconnect,
        Close,
        Discover,
        EnableNotifications(CharacteristicRole),
        Write(CharacteristicRole, Vec<u8>),
        ReadRssi,
    }

    struct RecordingTransport {
        calls: Vec<Call>,
        accept_writes: bool,
    }

    impl RecordingTransport {
        fn new() -> Self {
            Self {
                calls: Vec::new(),
                accept_writes: true,
            }
        }

        fn writes(&self) -> Vec<(CharacteristicRole, Vec<u8>)> {
            self.calls
                .iter()
                .filter_map(|c| match c {
                    Call::Write(role, data) => Some((*role, data.clone())),
                    _ => None,
                })
                .collect()
        }
    }

    impl GattTransport for RecordingTransport {
        fn connect(&mut self, address: HardwareAddress) -> bool {
            self.calls.push(Call::Connect(address));
            true
        }

        fn disconnect(&mut self) {
            self.calls.push(Call::Disconnect);
        }

        fn close(&mut self) {
            self.calls.push(Call::Close);
        }

        fn discover_services(&mut self) -> bool {
            self.calls.push(Call::Discover);
            true
        }

        fn enable_notifications(&mut self, characteristic: CharacteristicRole) -> bool {
            self.calls.push(Call::EnableNotifications(characteristic));
            true
        }

        fn write_characteristic(&mut self, characteristic: CharacteristicRole, value: &[u8]) -> bool {
            self.calls.push(Call::Write(characteristic, value.to_vec()));
            self.accept_writes
        }

        fn read_remote_rssi(&mut self) -> bool {
            self.calls.push(Call::ReadRssi);
            true
        }
    }

    struct FakeAdapter {
        powered: AtomicBool,
        scanning: AtomicBool,
        stop_ok: bool,
    }

    impl FakeAdapter {
        fn new() -> Self {
            Self {
                powered: AtomicBool::new(true),
                scanning: AtomicBool::new(false),
                stop_ok: true,
            }
        }
    }

    impl AdapterControl for FakeAdapter {
        fn is_powered(&self) -> bool {
            self.powered.load(Ordering::SeqCst)
        }

        fn is_scanning(&self) -> bool {
            self.scanning.load(Ordering::SeqCst)
        }

        fn stop_scan(&self) -> bool {
            if self.stop_ok {
                self.scanning.store(false, Ordering::SeqCst);
            }
            self.stop_ok
        }

        fn local_address(&self) -> HardwareAddress {
            local_address()
        }
    }

    fn local_address() -> HardwareAddress {
        "00:1A:7D:DA:71:13".parse().unwrap()
    }

    fn device_address() -> HardwareAddress {
        "C4:BE:84:12:34:56".parse().unwrap()
    }

    fn machine_with(adapter: FakeAdapter) -> SessionMachine<RecordingTransport> {
        let id = AddressCodec::new(&local_address()).encode(&device_address());
        let identity = DeviceIdentity::new(Some("sensor".to_string()), id);
        SessionMachine::new(identity, RecordingTransport::new(), Arc::new(adapter))
    }

    fn machine() -> SessionMachine<RecordingTransport> {
        machine_with(FakeAdapter::new())
    }

    fn events(machine: &mut SessionMachine<RecordingTransport>) -> Vec<DeviceEvent> {
        machine
            .take_outputs()
            .into_iter()
            .map(|o| match o {
                SessionOutput::Notify(e) | SessionOutput::NotifyAfterSettle(e) => e,
            })
            .collect()
    }

    fn negotiate(machine: &mut SessionMachine<RecordingTransport>) {
        machine.connect().unwrap();
        machine.handle_gatt_event(GattEvent::ConnectionStateChanged {
            status: GattStatus::Success,
            connected: true,
        });
        machine.handle_gatt_event(GattEvent::ServicesDiscovered {
            status: GattStatus::Success,
            services: vec![DiscoveredService::expected()],
        });
        machine.handle_gatt_event(GattEvent::DescriptorWritten {
            characteristic: CharacteristicRole::Event,
            status: GattStatus::Success,
        });
        machine.handle_gatt_event(GattEvent::DescriptorWritten {
            characteristic: CharacteristicRole::BulkIn,
            status: GattStatus::Success,
        });
    }

    fn ready_machine() -> SessionMachine<RecordingTransport> {
        let mut machine = machine();
        negotiate(&mut machine);
        machine.take_outputs();
        machine.transport_mut().calls.clear();
        machine
    }

    fn ack(machine: &mut SessionMachine<RecordingTransport>, role: CharacteristicRole) {
        machine.handle_gatt_event(GattEvent::CharacteristicWritten {
            characteristic: role,
            status: GattStatus::Success,
        });
    }

    fn notify(machine: &mut SessionMachine<RecordingTransport>, role: CharacteristicRole, value: &[u8]) {
        machine.handle_gatt_event(GattEvent::CharacteristicChanged {
            characteristic: role,
            value: value.to_vec(),
        });
    }

    #[test]
    fn test_negotiation_success() {
        let mut machine = machine();
        negotiate(&mut machine);

        assert_eq!(machine.state(), SessionState::Ready);
        assert!(machine.is_connected());
        assert!(machine.layout().is_some());
        assert_eq!(
            machine.transport().calls,
            vec![
                Call::Close,
                Call::Connect(device_address()),
                Call::Discover,
                Call::EnableNotifications(CharacteristicRole::Event),
                Call::EnableNotifications(CharacteristicRole::BulkIn),
            ]
        );

        let connected: Vec<_> = events(&mut machine)
            .into_iter()
            .filter(|e| {
                matches!(
                    e,
                    DeviceEvent::ConnectionStateChanged {
                        status: Status::Success,
                        state: LinkState::Connected,
                        ..
                    }
                )
            })
            .collect();
        assert_eq!(connected.len(), 1);
    }

    #[test]
    fn test_connect_rejections() {
        let mut machine = machine();
        machine.connect().unwrap();
        assert_eq!(machine.connect(), Err(SessionError::Busy(Operation::Connect)));

        let adapter = FakeAdapter::new();
        adapter.powered.store(false, Ordering::SeqCst);
        let mut machine = machine_with(adapter);
        assert_eq!(machine.connect(), Err(SessionError::AdapterOff));
        assert_eq!(machine.state(), SessionState::Disconnected);

        let adapter = FakeAdapter {
            stop_ok: false,
            ..FakeAdapter::new()
        };
        adapter.scanning.store(true, Ordering::SeqCst);
        let mut machine = machine_with(adapter);
        assert_eq!(machine.connect(), Err(SessionError::ScanStopFailed));
        assert!(machine.transport().calls.is_empty());
    }

    #[test]
    fn test_connect_stops_scan() {
        let adapter = FakeAdapter::new();
        adapter.scanning.store(true, Ordering::SeqCst);
        let mut machine = machine_with(adapter);
        machine.connect().unwrap();
        assert_eq!(machine.state(), SessionState::Connecting);
    }

    #[test]
    fn test_connect_with_foreign_identifier() {
        let id = AddressCodec::from_seed(b"another host").encode(&device_address());
        let identity = DeviceIdentity::new(None, id);
        let mut machine =
            SessionMachine::new(identity, RecordingTransport::new(), Arc::new(FakeAdapter::new()));

        let result = machine.connect();
        assert_ne!(result, Ok(()));
        assert_eq!(machine.state(), SessionState::Disconnected);
        assert!(!machine
            .transport()
            .calls
            .iter()
            .any(|c| matches!(c, Call::Connect(_))));
    }

    #[test]
    fn test_connect_when_ready_short_circuits() {
        let mut machine = ready_machine();
        machine.connect().unwrap();

        assert!(machine.transport().calls.is_empty());
        assert_eq!(
            events(&mut machine),
            vec![DeviceEvent::ConnectionStateChanged {
                device: machine.identity().id,
                status: Status::Success,
                state: LinkState::Connected,
            }]
        );
    }

    #[test]
    fn test_link_lost_during_negotiation() {
        let mut machine = machine();
        machine.connect().unwrap();
        machine.handle_gatt_event(GattEvent::ConnectionStateChanged {
            status: GattStatus::Success,
            connected: true,
        });
        machine.handle_gatt_event(GattEvent::ServicesDiscovered {
            status: GattStatus::Success,
            services: vec![DiscoveredService::expected()],
        });
        assert!(machine.layout().is_some());

        machine.handle_gatt_event(GattEvent::DescriptorWritten {
            characteristic: CharacteristicRole::Event,
            status: GattStatus::LinkLost,
        });

        assert_eq!(machine.state(), SessionState::Disconnected);
        assert!(machine.layout().is_none());
        assert_eq!(machine.transport().calls.last(), Some(&Call::Close));

        let events = events(&mut machine);
        assert!(events.contains(&DeviceEvent::ConnectionStateChanged {
            device: machine.identity().id,
            status: Status::Failure,
            state: LinkState::Connected,
        }));
    }

    #[test]
    fn test_capability_mismatch() {
        let mut machine = machine();
        machine.connect().unwrap();
        machine.handle_gatt_event(GattEvent::ConnectionStateChanged {
            status: GattStatus::Success,
            connected: true,
        });

        let mut service = DiscoveredService::expected();
        service
            .characteristics
            .retain(|c| c.uuid != CharacteristicRole::BulkIn.uuid());
        machine.handle_gatt_event(GattEvent::ServicesDiscovered {
            status: GattStatus::Success,
            services: vec![service],
        });

        assert_eq!(machine.transport().calls.last(), Some(&Call::Disconnect));
        assert!(events(&mut machine).iter().any(|e| matches!(
            e,
            DeviceEvent::Error {
                error: SessionError::CapabilityMismatch(_),
                ..
            }
        )));

        machine.handle_gatt_event(GattEvent::ConnectionStateChanged {
            status: GattStatus::Success,
            connected: false,
        });
        assert_eq!(machine.state(), SessionState::Disconnected);
        assert_eq!(
            events(&mut machine),
            vec![DeviceEvent::ConnectionStateChanged {
                device: machine.identity().id,
                status: Status::Failure,
                state: LinkState::Connected,
            }]
        );
    }

    #[test]
    fn test_missing_descriptor_is_mismatch() {
        let mut service = DiscoveredService::expected();
        for c in service.characteristics.iter_mut() {
            c.descriptors.clear();
        }
        assert!(matches!(
            ServiceLayout::resolve(&[service]),
            Err(SessionError::CapabilityMismatch(_))
        ));
        assert!(ServiceLayout::resolve(&[]).is_err());
    }

    #[test]
    fn test_oversized_send_rejected() {
        let mut machine = ready_machine();
        assert_eq!(
            machine.send(0x05, &[0u8; 250]),
            Err(SessionError::PayloadTooLarge { len: 250, max: 198 })
        );
        assert!(machine.transport().calls.is_empty());
        assert!(!machine.has_pending_send());
    }

    #[test]
    fn test_reserved_type_rejected() {
        let mut machine = ready_machine();
        assert_eq!(
            machine.send(0x80, b"x"),
            Err(SessionError::ReservedMessageType(0x80))
        );
        assert!(machine.transport().calls.is_empty());
    }

    #[test]
    fn test_send_requires_ready() {
        let mut machine = machine();
        assert_eq!(machine.send(0x05, b"hi"), Err(SessionError::NotConnected));
        assert_eq!(machine.read_remote_rssi(), Err(SessionError::NotConnected));
        assert_eq!(machine.disconnect(), Err(SessionError::NotConnected));
    }

    #[test]
    fn test_send_chunk_routing() {
        let mut machine = ready_machine();
        let payload: Vec<u8> = (0..45u8).collect();
        machine.send(0x05, &payload).unwrap();

        // Only the first chunk goes out before the command ack
        let writes = machine.transport().writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].0, CharacteristicRole::Command);
        assert_eq!(writes[0].1.len(), 20);
        assert_eq!(writes[0].1[..2], [0x05, 45]);

        ack(&mut machine, CharacteristicRole::Command);

        let writes = machine.transport().writes();
        assert_eq!(writes.len(), 3);
        assert_eq!(writes[1].0, CharacteristicRole::BulkOut);
        assert_eq!(writes[2].0, CharacteristicRole::BulkOut);
        assert_eq!(writes[2].1.len(), 7);

        let wire: Vec<u8> = writes.into_iter().flat_map(|(_, d)| d).collect();
        assert_eq!(&wire[2..], &payload[..]);

        assert!(!machine.has_pending_send());
        assert_eq!(
            events(&mut machine),
            vec![DeviceEvent::SendCompleted {
                device: machine.identity().id,
                status: Status::Success,
                payload: Some(payload),
            }]
        );
    }

    #[test]
    fn test_send_while_pending_rejected() {
        let mut machine = ready_machine();
        machine.send(0x05, &[1u8; 30]).unwrap();

        assert_eq!(
            machine.send(0x06, b"second"),
            Err(SessionError::Busy(Operation::Send))
        );
        assert_eq!(machine.transport().writes().len(), 1);

        // The first send still completes untouched
        ack(&mut machine, CharacteristicRole::Command);
        assert_eq!(
            events(&mut machine),
            vec![DeviceEvent::SendCompleted {
                device: machine.identity().id,
                status: Status::Success,
                payload: Some(vec![1u8; 30]),
            }]
        );
    }

    #[test]
    fn test_rejected_first_write() {
        let mut machine = ready_machine();
        machine.transport_mut().accept_writes = false;
        assert_eq!(
            machine.send(0x05, b"hi"),
            Err(SessionError::TransportWriteFailed)
        );
        assert!(!machine.has_pending_send());
    }

    #[test]
    fn test_bulk_write_rejected_mid_stream() {
        let mut machine = ready_machine();
        machine.send(0x05, &[7u8; 60]).unwrap();
        machine.transport_mut().accept_writes = false;
        ack(&mut machine, CharacteristicRole::Command);

        assert!(!machine.has_pending_send());
        assert_eq!(
            events(&mut machine),
            vec![DeviceEvent::SendCompleted {
                device: machine.identity().id,
                status: Status::Failure,
                payload: None,
            }]
        );
        assert_eq!(machine.state(), SessionState::Ready);
    }

    #[test]
    fn test_late_bulk_failure_spares_next_send() {
        let mut machine = ready_machine();
        machine.send(0x05, &[1u8; 45]).unwrap();
        ack(&mut machine, CharacteristicRole::Command);
        machine.take_outputs();

        let second: Vec<u8> = (0..45u8).collect();
        machine.send(0x06, &second).unwrap();
        let issued = machine.transport().writes().len();

        // Failure for a bulk-out chunk of the first message lands late
        machine.handle_gatt_event(GattEvent::CharacteristicWritten {
            characteristic: CharacteristicRole::BulkOut,
            status: GattStatus::Failure,
        });
        assert!(machine.has_pending_send());

        ack(&mut machine, CharacteristicRole::Command);
        let writes = machine.transport().writes();
        assert_eq!(writes.len() - issued, 2);
        assert!(writes[issued..]
            .iter()
            .all(|(role, _)| *role == CharacteristicRole::BulkOut));

        assert_eq!(
            events(&mut machine),
            vec![
                DeviceEvent::SendCompleted {
                    device: machine.identity().id,
                    status: Status::Failure,
                    payload: None,
                },
                DeviceEvent::SendCompleted {
                    device: machine.identity().id,
                    status: Status::Success,
                    payload: Some(second),
                },
            ]
        );
    }

    #[test]
    fn test_single_chunk_sends_queue_behind_acks() {
        let mut machine = ready_machine();
        machine.send(0x05, b"one").unwrap();
        machine.send(0x06, b"two").unwrap();
        assert_eq!(machine.transport().writes().len(), 2);

        // Command acks arrive in write order
        machine.handle_gatt_event(GattEvent::CharacteristicWritten {
            characteristic: CharacteristicRole::Command,
            status: GattStatus::Failure,
        });
        assert!(machine.has_pending_send());
        ack(&mut machine, CharacteristicRole::Command);
        assert!(!machine.has_pending_send());

        assert_eq!(
            events(&mut machine),
            vec![
                DeviceEvent::SendCompleted {
                    device: machine.identity().id,
                    status: Status::Failure,
                    payload: None,
                },
                DeviceEvent::SendCompleted {
                    device: machine.identity().id,
                    status: Status::Success,
                    payload: Some(b"two".to_vec()),
                },
            ]
        );
    }

    #[test]
    fn test_write_link_lost_tears_down() {
        let mut machine = ready_machine();
        machine.send(0x05, b"hi").unwrap();
        machine.handle_gatt_event(GattEvent::CharacteristicWritten {
            characteristic: CharacteristicRole::Command,
            status: GattStatus::LinkLost,
        });

        assert_eq!(machine.state(), SessionState::Disconnected);
        let events = events(&mut machine);
        assert!(events.contains(&DeviceEvent::SendCompleted {
            device: machine.identity().id,
            status: Status::Failure,
            payload: None,
        }));
        assert!(events.iter().any(|e| matches!(
            e,
            DeviceEvent::ConnectionStateChanged {
                status: Status::Failure,
                ..
            }
        )));
    }

    #[test]
    fn test_receive_path() {
        let mut machine = ready_machine();

        notify(&mut machine, CharacteristicRole::Event, &[0x05, 0x02, 0xAA, 0xBB]);
        notify(&mut machine, CharacteristicRole::Event, &[0x90, 0x01, 0x01]);
        notify(&mut machine, CharacteristicRole::Event, &[0x06, 0x19, 1, 2, 3, 4, 5]);
        notify(&mut machine, CharacteristicRole::BulkIn, &[0u8; 20]);

        let events = events(&mut machine);
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0],
            DeviceEvent::MessageReceived {
                device: machine.identity().id,
                message_type: 0x05,
                payload: vec![0xAA, 0xBB],
            }
        );
        match &events[1] {
            DeviceEvent::MessageReceived {
                message_type,
                payload,
                ..
            } => {
                assert_eq!(*message_type, 0x06);
                assert_eq!(payload.len(), 25);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_ota_ack_without_update_is_dropped() {
        let mut machine = ready_machine();
        notify(&mut machine, CharacteristicRole::Event, &[0x81, 0x01, ota_header::DATA]);
        assert!(events(&mut machine).is_empty());
        assert!(machine.transport().calls.is_empty());
    }

    #[test]
    fn test_rssi() {
        let mut machine = ready_machine();
        machine.read_remote_rssi().unwrap();
        assert_eq!(machine.transport().calls, vec![Call::ReadRssi]);

        machine.handle_gatt_event(GattEvent::RemoteRssi {
            rssi: -61,
            status: GattStatus::Success,
        });
        assert_eq!(
            events(&mut machine),
            vec![DeviceEvent::RemoteRssi {
                device: machine.identity().id,
                status: Status::Success,
                rssi: -61,
            }]
        );
    }

    #[test]
    fn test_disconnect_reports_after_settle() {
        let mut machine = ready_machine();
        machine.disconnect().unwrap();
        assert_eq!(machine.state(), SessionState::Disconnecting);
        assert_eq!(machine.disconnect(), Err(SessionError::Busy(Operation::Disconnect)));
        assert_eq!(machine.transport().calls, vec![Call::Disconnect]);

        machine.handle_gatt_event(GattEvent::ConnectionStateChanged {
            status: GattStatus::Success,
            connected: false,
        });

        assert_eq!(machine.state(), SessionState::Disconnected);
        assert!(machine.layout().is_none());
        assert_eq!(
            machine.take_outputs(),
            vec![SessionOutput::NotifyAfterSettle(
                DeviceEvent::ConnectionStateChanged {
                    device: machine.identity().id,
                    status: Status::Success,
                    state: LinkState::Disconnected,
                }
            )]
        );
    }

    #[test]
    fn test_unexpected_drop_reports_disconnect() {
        let mut machine = ready_machine();
        machine.handle_gatt_event(GattEvent::ConnectionStateChanged {
            status: GattStatus::Success,
            connected: false,
        });
        assert_eq!(machine.state(), SessionState::Disconnected);
        assert!(matches!(
            machine.take_outputs().as_slice(),
            [SessionOutput::NotifyAfterSettle(DeviceEvent::ConnectionStateChanged {
                status: Status::Success,
                state: LinkState::Disconnected,
                ..
            })]
        ));
    }

    /// Walk the machine through a full transfer, answering every firmware
    /// message the way the device would.
    fn drive_update(machine: &mut SessionMachine<RecordingTransport>, image: Vec<u8>) -> Vec<Vec<u8>> {
        machine.begin_firmware_update().unwrap();
        machine.firmware_downloaded(Ok(image));

        let mut sent = Vec::new();
        loop {
            let start = machine.transport().writes().len();
            let command = machine.transport().writes()[start - 1].clone();
            assert_eq!(command.0, CharacteristicRole::Command);
            ack(machine, CharacteristicRole::Command);

            let message: Vec<u8> = std::iter::once(command.1)
                .chain(machine.transport().writes()[start..].iter().map(|(_, d)| d.clone()))
                .flatten()
                .collect();
            let header = message[2];
            sent.push(message);

            match header {
                ota_header::BEGIN => notify(machine, CharacteristicRole::Event, &[0x81, 0x01, ota_header::BEGIN]),
                ota_header::DATA => notify(machine, CharacteristicRole::Event, &[0x81, 0x01, ota_header::DATA]),
                _ => break,
            }
        }
        sent
    }

    #[test]
    fn test_firmware_update_500_bytes() {
        let mut machine = ready_machine();
        let image: Vec<u8> = (0..500u32).map(|i| (i % 251) as u8).collect();
        let sent = drive_update(&mut machine, image);

        let headers: Vec<(u8, usize)> = sent.iter().map(|m| (m[2], m.len() - 2)).collect();
        assert_eq!(
            headers,
            vec![
                (ota_header::BEGIN, 1),
                (ota_header::DATA, 198),
                (ota_header::DATA, 198),
                (ota_header::DATA, 110),
                (ota_header::END, 1),
            ]
        );
        assert_eq!(sent[1][3], 0);
        assert_eq!(sent[2][3], 1);
        assert_eq!(sent[3][3], 2);

        assert!(!machine.is_firmware_updating());
        let events = events(&mut machine);
        assert_eq!(
            events,
            vec![DeviceEvent::FirmwareUpdate {
                device: machine.identity().id,
                status: Status::Success,
            }]
        );
    }

    #[test]
    fn test_begin_ack_before_write_ack() {
        let mut machine = ready_machine();
        machine.begin_firmware_update().unwrap();
        machine.firmware_downloaded(Ok(vec![0xAB; 40]));
        assert_eq!(machine.transport().writes().len(), 1);

        // Device answers BEGIN before the transport reports the write
        notify(&mut machine, CharacteristicRole::Event, &[0x81, 0x01, ota_header::BEGIN]);
        assert!(machine.is_firmware_updating());
        let writes = machine.transport().writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[1].0, CharacteristicRole::Command);
        assert_eq!(writes[1].1[..4], [0x81, 42, ota_header::DATA, 0]);

        // BEGIN's ack completes nothing and flushes nothing
        ack(&mut machine, CharacteristicRole::Command);
        assert_eq!(machine.transport().writes().len(), 2);

        // DATA's ack releases its bulk-out chunks
        ack(&mut machine, CharacteristicRole::Command);
        assert_eq!(machine.transport().writes().len(), 4);

        notify(&mut machine, CharacteristicRole::Event, &[0x81, 0x01, ota_header::DATA]);
        let writes = machine.transport().writes();
        assert_eq!(writes[4].1[..3], [0x81, 1, ota_header::END]);
        ack(&mut machine, CharacteristicRole::Command);

        assert!(!machine.is_firmware_updating());
        assert_eq!(
            events(&mut machine),
            vec![DeviceEvent::FirmwareUpdate {
                device: machine.identity().id,
                status: Status::Success,
            }]
        );
    }

    #[test]
    fn test_firmware_update_empty_image() {
        let mut machine = ready_machine();
        let sent = drive_update(&mut machine, Vec::new());
        let headers: Vec<u8> = sent.iter().map(|m| m[2]).collect();
        assert_eq!(headers, vec![ota_header::BEGIN, ota_header::END]);
        assert!(!machine.is_firmware_updating());
    }

    #[test]
    fn test_firmware_update_busy() {
        let mut machine = ready_machine();
        machine.begin_firmware_update().unwrap();
        assert_eq!(
            machine.begin_firmware_update(),
            Err(SessionError::Busy(Operation::FirmwareUpdate))
        );
    }

    #[test]
    fn test_firmware_download_failure() {
        let mut machine = ready_machine();
        machine.begin_firmware_update().unwrap();
        machine.firmware_downloaded(Err("404".to_string()));

        assert!(!machine.is_firmware_updating());
        assert!(machine.transport().calls.is_empty());
        let events = events(&mut machine);
        assert_eq!(
            events.last(),
            Some(&DeviceEvent::FirmwareUpdate {
                device: machine.identity().id,
                status: Status::Failure,
            })
        );
    }

    #[test]
    fn test_firmware_update_when_disconnected_fails() {
        let mut machine = machine();
        machine.begin_firmware_update().unwrap();
        machine.firmware_downloaded(Ok(vec![1, 2, 3]));
        assert!(!machine.is_firmware_updating());
        assert!(events(&mut machine).iter().any(|e| matches!(
            e,
            DeviceEvent::FirmwareUpdate {
                status: Status::Failure,
                ..
            }
        )));
    }

    #[test]
    fn test_device_rejects_transfer() {
        let mut machine = ready_machine();
        machine.begin_firmware_update().unwrap();
        machine.firmware_downloaded(Ok(vec![0u8; 10]));
        ack(&mut machine, CharacteristicRole::Command);

        notify(&mut machine, CharacteristicRole::Event, &[0x81, 0x01, 0x7F]);
        assert!(!machine.is_firmware_updating());
        assert!(events(&mut machine).iter().any(|e| matches!(
            e,
            DeviceEvent::Error {
                error: SessionError::FirmwareRejected(_),
                ..
            }
        )));
    }

    #[test]
    fn test_disconnect_abandons_update() {
        let mut machine = ready_machine();
        machine.begin_firmware_update().unwrap();
        machine.firmware_downloaded(Ok(vec![0u8; 400]));
        ack(&mut machine, CharacteristicRole::Command);
        machine.take_outputs();

        machine.disconnect().unwrap();
        machine.handle_gatt_event(GattEvent::ConnectionStateChanged {
            status: GattStatus::Success,
            connected: false,
        });

        assert!(!machine.is_firmware_updating());
        let outputs = machine.take_outputs();
        assert_eq!(outputs.len(), 1);
        assert!(!outputs.iter().any(|o| matches!(
            o,
            SessionOutput::Notify(DeviceEvent::FirmwareUpdate { .. })
        )));
    }

    #[test]
    fn test_ota_mode_command() {
        let mut machine = ready_machine();
        machine.set_ota_mode().unwrap();
        let writes = machine.transport().writes();
        assert_eq!(writes[0].1[0], 0x82);
        assert_eq!(&writes[0].1[2..10], b"OTA_MODE");
    }
}
