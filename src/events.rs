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

//! Events delivered to the application.

use uuid::Uuid;

use crate::error::SessionError;
use crate::identity::DeviceIdentity;

/// Outcome of an asynchronous operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    Failure,
}

impl Status {
    pub fn is_success(&self) -> bool {
        matches!(self, Status::Success)
    }
}

/// Link state reported with connection events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    Disconnected,
}

/// Events emitted by a device session. Each carries the opaque id of the
/// device it concerns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// Connect or disconnect finished (or the link dropped).
    ConnectionStateChanged {
        device: Uuid,
        status: Status,
        state: LinkState,
    },
    /// Application message received (type < 0x80).
    MessageReceived {
        device: Uuid,
        message_type: u8,
        payload: Vec<u8>,
    },
    /// Outbound message finished; carries the original payload on success.
    SendCompleted {
        device: Uuid,
        status: Status,
        payload: Option<Vec<u8>>,
    },
    RemoteRssi {
        device: Uuid,
        status: Status,
        rssi: i16,
    },
    FirmwareUpdate { device: Uuid, status: Status },
    /// Diagnostic detail accompanying a failure.
    Error { device: Uuid, error: SessionError },
}

impl DeviceEvent {
    /// Opaque id of the device this event concerns.
    pub fn device(&self) -> Uuid {
        match self {
            DeviceEvent::ConnectionStateChanged { device, .. }
            | DeviceEvent::MessageReceived { device, .. }
            | DeviceEvent::SendCompleted { device, .. }
            | DeviceEvent::RemoteRssi { device, .. }
            | DeviceEvent::FirmwareUpdate { device, .. }
            | DeviceEvent::Error { device, .. } => *device,
        }
    }
}

/// Scan state transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Started,
    Stopped,
}

/// Events emitted by the scanner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    Discovered {
        identity: DeviceIdentity,
        rssi: Option<i16>,
    },
    StateChanged(ScanState),
}
