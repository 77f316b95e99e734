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

//! Bluetooth communication module.
//!
//! GATT client side of the device protocol: framing, negotiation, firmware
//! transfer and, with the `bluez` feature, the BlueZ binding.

pub mod ble_constants;
pub mod connection;
pub mod ota;
pub mod protocol;
pub mod reassembler;
pub mod session;
pub mod transport;

#[cfg(feature = "bluez")]
mod gatt_client;
#[cfg(feature = "bluez")]
mod scanner;

pub use connection::{ServiceLayout, SessionMachine, SessionOutput, SessionState};
pub use ota::{OtaPhase, OtaStep, OtaTransfer};
pub use protocol::{Message, OtaAck, OtaPacket};
pub use reassembler::{chunk_message, MessageReassembler};
pub use session::{DeviceSession, SessionOptions, DEFAULT_SETTLE_DELAY};
pub use transport::{
    AdapterControl, CharacteristicRole, DiscoveredCharacteristic, DiscoveredService, GattEvent,
    GattStatus, GattTransport,
};

#[cfg(feature = "bluez")]
pub use gatt_client::BluezTransport;
#[cfg(feature = "bluez")]
pub use scanner::{BluezAdapter, Central};
