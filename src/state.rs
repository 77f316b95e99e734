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

//! Session state shared with synchronous readers.

use parking_lot::RwLock;
use std::sync::Arc;

use crate::bluetooth::SessionState;

/// Snapshot of a device session, refreshed by the session actor after
/// every command and transport event.
#[derive(Debug)]
pub struct SessionStatus {
    /// Current link state.
    pub state: RwLock<SessionState>,

    /// Whether a firmware update is in flight.
    pub firmware_updating: RwLock<bool>,

    /// Last RSSI reported by the device.
    pub last_rssi: RwLock<Option<i16>>,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            state: RwLock::new(SessionState::Disconnected),
            firmware_updating: RwLock::new(false),
            last_rssi: RwLock::new(None),
        }
    }
}

impl SessionStatus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn update(&self, state: SessionState, firmware_updating: bool) {
        *self.state.write() = state;
        *self.firmware_updating.write() = firmware_updating;
    }

    pub fn set_rssi(&self, rssi: i16) {
        *self.last_rssi.write() = Some(rssi);
    }

    pub fn get_state(&self) -> SessionState {
        *self.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.get_state() == SessionState::Ready
    }

    pub fn is_firmware_updating(&self) -> bool {
        *self.firmware_updating.read()
    }

    pub fn get_rssi(&self) -> Option<i16> {
        *self.last_rssi.read()
    }
}
