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

//! Seams between the session state machine and the platform radio stack.
//!
//! Every request returns immediately with whether it was accepted. Results
//! are delivered later, in order, as [`GattEvent`]s on the session's event
//! channel.

use uuid::Uuid;

use super::ble_constants::*;
use crate::identity::HardwareAddress;

/// Raw status code the platform uses for resource exhaustion / link loss.
pub const LINK_LOST_CODE: i32 = 133;

/// Status of a completed GATT operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattStatus {
    Success,
    Failure,
    /// Treated like `Failure`, and additionally forces the link closed.
    LinkLost,
}

impl GattStatus {
    /// Map a raw platform status code.
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => GattStatus::Success,
            LINK_LOST_CODE => GattStatus::LinkLost,
            _ => GattStatus::Failure,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, GattStatus::Success)
    }
}

/// The four characteristics of the device service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CharacteristicRole {
    Command,
    Event,
    BulkOut,
    BulkIn,
}

impl CharacteristicRole {
    pub const ALL: [CharacteristicRole; 4] = [
        CharacteristicRole::Command,
        CharacteristicRole::Event,
        CharacteristicRole::BulkOut,
        CharacteristicRole::BulkIn,
    ];

    pub fn uuid(&self) -> Uuid {
        match self {
            CharacteristicRole::Command => COMMAND_UUID,
            CharacteristicRole::Event => EVENT_UUID,
            CharacteristicRole::BulkOut => BULK_OUT_UUID,
            CharacteristicRole::BulkIn => BULK_IN_UUID,
        }
    }

    pub fn from_uuid(uuid: &Uuid) -> Option<Self> {
        Self::ALL.into_iter().find(|role| role.uuid() == *uuid)
    }

    /// Whether the characteristic delivers notifications.
    pub fn is_notify(&self) -> bool {
        matches!(self, CharacteristicRole::Event | CharacteristicRole::BulkIn)
    }
}

/// A characteristic found during service discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredCharacteristic {
    pub uuid: Uuid,
    pub descriptors: Vec<Uuid>,
}

/// A service found during service discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredService {
    pub uuid: Uuid,
    pub characteristics: Vec<DiscoveredCharacteristic>,
}

impl DiscoveredService {
    /// The service layout the device is expected to expose.
    pub fn expected() -> Self {
        let characteristics = CharacteristicRole::ALL
            .into_iter()
            .map(|role| DiscoveredCharacteristic {
                uuid: role.uuid(),
                descriptors: if role.is_notify() {
                    vec![CLIENT_CONFIG_UUID]
                } else {
                    Vec::new()
                },
            })
            .collect();

        Self {
            uuid: SERVICE_UUID,
            characteristics,
        }
    }
}

/// Events delivered by the transport, in order, for one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattEvent {
    ConnectionStateChanged { status: GattStatus, connected: bool },
    ServicesDiscovered {
        status: GattStatus,
        services: Vec<DiscoveredService>,
    },
    DescriptorWritten {
        characteristic: CharacteristicRole,
        status: GattStatus,
    },
    CharacteristicWritten {
        characteristic: CharacteristicRole,
        status: GattStatus,
    },
    CharacteristicChanged {
        characteristic: CharacteristicRole,
        value: Vec<u8>,
    },
    RemoteRssi { rssi: i16, status: GattStatus },
}

/// Request side of a GATT client link to one device.
pub trait GattTransport: Send {
    /// Open the link. Completion arrives as `ConnectionStateChanged`.
    fn connect(&mut self, address: HardwareAddress) -> bool;

    /// Close the link gracefully. Completion arrives as `ConnectionStateChanged`.
    fn disconnect(&mut self);

    /// Release the link handle immediately; no further events are delivered.
    fn close(&mut self);

    fn discover_services(&mut self) -> bool;

    /// Write the client configuration descriptor of a notify characteristic.
    fn enable_notifications(&mut self, characteristic: CharacteristicRole) -> bool;

    fn write_characteristic(&mut self, characteristic: CharacteristicRole, value: &[u8]) -> bool;

    fn read_remote_rssi(&mut self) -> bool;
}

/// Local adapter state consulted by the session.
pub trait AdapterControl: Send + Sync {
    fn is_powered(&self) -> bool;

    fn is_scanning(&self) -> bool;

    /// Stop an active scan. Returns false if the scan could not be stopped.
    fn stop_scan(&self) -> bool;

    /// Address of the local adapter, used as the identifier key seed.
    fn local_address(&self) -> HardwareAddress;
}
