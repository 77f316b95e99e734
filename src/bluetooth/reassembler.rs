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

//! BLE packet chunking and reassembly.

use tracing::{debug, warn};

use super::ble_constants::config;
use super::protocol::Message;

/// Reassembles inbound notifications into complete messages.
///
/// There is no more-fragments flag on the wire: the first notification
/// carries `[type, length]` and continuation notifications are appended
/// until the declared length has been received.
pub struct MessageReassembler {
    buffer: Vec<u8>,
    message_type: u8,
    expected_length: usize,
    in_progress: bool,
}

impl MessageReassembler {
    /// Create a new message reassembler.
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(config::HEADER_SIZE + config::MAX_PAYLOAD),
            message_type: 0,
            expected_length: 0,
            in_progress: false,
        }
    }

    /// Process an incoming notification.
    ///
    /// `starts_message` is set for notifications that always carry a header
    /// (the event characteristic). A continuation received while nothing is
    /// in progress is treated as the start of a new message.
    ///
    /// Returns `Some(message)` when a full message is reassembled.
    pub fn process_packet(&mut self, packet: &[u8], starts_message: bool) -> Option<Message> {
        if starts_message || !self.in_progress {
            if self.in_progress {
                warn!(
                    "Dropping partial message: {} of {} bytes",
                    self.buffer.len(),
                    self.expected_length
                );
            }

            if packet.len() < config::HEADER_SIZE {
                warn!("Packet too short: {} bytes", packet.len());
                self.reset();
                return None;
            }

            self.buffer.clear();
            self.message_type = packet[0];
            self.expected_length = packet[1] as usize;
            self.buffer.extend_from_slice(&packet[config::HEADER_SIZE..]);
            self.in_progress = true;
        } else {
            self.buffer.extend_from_slice(packet);
        }

        if self.buffer.len() >= self.expected_length {
            self.in_progress = false;
            debug!(
                "Message reassembly complete: type {:#04x}, {} bytes",
                self.message_type,
                self.buffer.len()
            );
            return Some(Message {
                message_type: self.message_type,
                payload: std::mem::take(&mut self.buffer),
            });
        }

        debug!(
            "Reassembly in progress: {} of {} bytes",
            self.buffer.len(),
            self.expected_length
        );
        None
    }

    /// Reset the reassembler state.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.message_type = 0;
        self.expected_length = 0;
        self.in_progress = false;
    }

    /// Check if reassembly is in progress.
    pub fn is_in_progress(&self) -> bool {
        self.in_progress
    }
}

impl Default for MessageReassembler {
    fn default() -> Self {
        Self::new()
    }
}

/// Split wire bytes into link packets of at most `max_chunk` bytes.
pub fn chunk_message(wire: &[u8], max_chunk: usize) -> Vec<Vec<u8>> {
    wire.chunks(max_chunk.max(1)).map(<[u8]>::to_vec).collect()
}
