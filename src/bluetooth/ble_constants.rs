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

//! BLE service, characteristic and message constants.

use uuid::Uuid;

/// Primary GATT service exposed by the device.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x00008000_60b2_21f8_bce3_94eea697f98c);

/// Command characteristic (first chunk of every outbound message).
/// Properties: Write
pub const COMMAND_UUID: Uuid = Uuid::from_u128(0x00008001_60b2_21f8_bce3_94eea697f98c);

/// Event characteristic (inbound messages and OTA acks).
/// Properties: Notify
pub const EVENT_UUID: Uuid = Uuid::from_u128(0x00008002_60b2_21f8_bce3_94eea697f98c);

/// Bulk-out characteristic (remaining chunks of an outbound message).
/// Properties: Write
pub const BULK_OUT_UUID: Uuid = Uuid::from_u128(0x00008003_60b2_21f8_bce3_94eea697f98c);

/// Bulk-in characteristic (continuation of inbound messages).
/// Properties: Notify
pub const BULK_IN_UUID: Uuid = Uuid::from_u128(0x00008004_60b2_21f8_bce3_94eea697f98c);

/// Client characteristic configuration descriptor.
pub const CLIENT_CONFIG_UUID: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

/// 16-bit service identifier carried in advertisements (0xFE90).
pub const ADVERTISED_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x0000fe90_0000_1000_8000_00805f9b34fb);

/// SDK version reported by the CLI.
pub const SDK_VERSION: &str = "02.00.00.01.151203";

/// Application message types.
pub mod message_type {
    /// Types with this bit set are reserved for internal signaling.
    pub const RESERVED_MASK: u8 = 0x80;

    /// OTA data phase (BEGIN / DATA / END).
    pub const OTA_DATA: u8 = 0x81;

    /// Switch the device into OTA mode.
    pub const OTA_SET: u8 = 0x82;

    pub fn is_reserved(message_type: u8) -> bool {
        message_type & RESERVED_MASK != 0
    }
}

/// Sub-headers of OTA data-phase messages.
pub mod ota_header {
    pub const BEGIN: u8 = 0x00;
    pub const END: u8 = 0x01;
    pub const DATA: u8 = 0x02;
}

/// Fixed payload of the OTA mode-switch command.
pub const OTA_MODE_PAYLOAD: &[u8] = b"OTA_MODE\0";

/// Framing configuration constants.
pub mod config {
    /// Default MTU (minimum for all BLE devices).
    pub const DEFAULT_MTU: usize = 23;

    /// ATT protocol overhead (3 bytes).
    pub const ATT_OVERHEAD: usize = 3;

    /// Message header: type + length.
    pub const HEADER_SIZE: usize = 2;

    /// Largest payload of a single application message.
    pub const MAX_PAYLOAD: usize = 198;

    /// OTA sub-header inside a DATA payload: header + packet index.
    pub const OTA_DATA_HEADER_SIZE: usize = 2;

    /// Firmware bytes carried by one OTA DATA packet.
    pub const OTA_CHUNK_SIZE: usize = MAX_PAYLOAD - OTA_DATA_HEADER_SIZE;

    /// Link packet size used for chunking.
    pub const DEFAULT_CHUNK_SIZE: usize = DEFAULT_MTU - ATT_OVERHEAD;

    /// Calculate link packet size for a given MTU.
    pub fn chunk_size_for_mtu(mtu: usize) -> usize {
        mtu.saturating_sub(ATT_OVERHEAD).max(1)
    }
}
