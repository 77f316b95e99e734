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

//! Firmware transfer state machine.

use tracing::{debug, info, warn};

use super::ble_constants::{config, ota_header};
use super::protocol::{Message, OtaAck, OtaPacket};
use crate::error::SessionError;

/// Phase of a firmware transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaPhase {
    /// Image is being fetched by a background task.
    Downloading,
    /// BEGIN was sent; waiting for the device to acknowledge it.
    AwaitingBeginAck,
    /// DATA packets are flowing, one per device acknowledgment.
    Transferring,
    /// END was sent; waiting for that send to complete.
    AwaitingEndAck,
}

/// What the session should do after an acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OtaStep {
    /// Send this message over the normal send path.
    Send(Message),
    /// Nothing to do.
    Ignore,
    /// Abort the transfer.
    Fail(String),
}

/// State of one firmware update. Dropping it abandons the update.
#[derive(Debug)]
pub struct OtaTransfer {
    firmware: Vec<u8>,
    offset: usize,
    packet_index: u8,
    packets_sent: usize,
    phase: OtaPhase,
}

impl OtaTransfer {
    /// Start a transfer whose image is still downloading.
    pub fn new() -> Self {
        Self {
            firmware: Vec::new(),
            offset: 0,
            packet_index: 0,
            packets_sent: 0,
            phase: OtaPhase::Downloading,
        }
    }

    pub fn phase(&self) -> OtaPhase {
        self.phase
    }

    /// Index the next DATA packet will carry.
    pub fn packet_index(&self) -> u8 {
        self.packet_index
    }

    /// Number of DATA packets issued so far.
    pub fn packets_sent(&self) -> usize {
        self.packets_sent
    }

    pub fn remaining(&self) -> usize {
        self.firmware.len() - self.offset
    }

    /// Install the downloaded image and produce the BEGIN message.
    pub fn begin(&mut self, firmware: Vec<u8>) -> Result<Message, SessionError> {
        info!("Firmware image ready: {} bytes", firmware.len());
        self.firmware = firmware;
        self.offset = 0;
        self.packet_index = 0;
        self.packets_sent = 0;
        self.phase = OtaPhase::AwaitingBeginAck;
        OtaPacket::Begin.into_message()
    }

    /// React to an acknowledgment notification from the device.
    pub fn handle_ack(&mut self, notification: &[u8]) -> OtaStep {
        let Some(ack) = OtaAck::parse(notification) else {
            return OtaStep::Fail(format!("malformed OTA ack: {:02x?}", notification));
        };

        match (ack, self.phase) {
            (OtaAck::Begin, OtaPhase::AwaitingBeginAck) => {
                self.phase = OtaPhase::Transferring;
                self.next_packet()
            }
            (OtaAck::Data, OtaPhase::Transferring) => self.next_packet(),
            (OtaAck::Unknown(header), _) => {
                OtaStep::Fail(format!("device rejected transfer (header {:#04x})", header))
            }
            (ack, phase) => {
                warn!("Ignoring OTA ack {:?} in phase {:?}", ack, phase);
                OtaStep::Ignore
            }
        }
    }

    /// Called when the firmware message `payload` finished sending.
    ///
    /// Returns true once the END message has gone out, which completes the
    /// update. Completions of earlier messages can arrive after the device
    /// already acknowledged them, so only END counts.
    pub fn on_send_complete(&mut self, payload: &[u8]) -> bool {
        self.phase == OtaPhase::AwaitingEndAck && payload.first() == Some(&ota_header::END)
    }

    fn next_packet(&mut self) -> OtaStep {
        let packet = if self.remaining() == 0 {
            debug!("Firmware exhausted after {} packets, sending END", self.packets_sent);
            self.phase = OtaPhase::AwaitingEndAck;
            OtaPacket::End
        } else {
            let end = (self.offset + config::OTA_CHUNK_SIZE).min(self.firmware.len());
            let chunk = self.firmware[self.offset..end].to_vec();
            let index = self.packet_index;

            self.offset = end;
            self.packet_index = self.packet_index.wrapping_add(1);
            self.packets_sent += 1;
            debug!(
                "OTA packet {} ({} bytes, {} remaining)",
                index,
                chunk.len(),
                self.remaining()
            );
            OtaPacket::Data { index, chunk }
        };

        match packet.into_message() {
            Ok(message) => OtaStep::Send(message),
            Err(e) => OtaStep::Fail(e.to_string()),
        }
    }
}

impl Default for OtaTransfer {
    fn default() -> Self {
        Self::new()
    }
}
