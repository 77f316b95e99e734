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

//! Gattlink: BLE central SDK for devices speaking the chunked command/event
//! protocol, with OTA firmware updates.

pub mod bluetooth;
pub mod config;
pub mod crypto;
pub mod error;
pub mod events;
pub mod firmware;
pub mod identity;
pub mod state;

pub use bluetooth::ble_constants::SDK_VERSION;
pub use bluetooth::DeviceSession;
pub use error::{Operation, SessionError, SessionResult};
pub use events::{DeviceEvent, LinkState, ScanEvent, ScanState, Status};
pub use identity::{DeviceIdentity, HardwareAddress};
