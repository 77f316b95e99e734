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

//! Application message format.
//!
//! Wire form is `[type, length, payload...]` with at most 198 payload bytes.

use super::ble_constants::{config, message_type, ota_header, OTA_MODE_PAYLOAD};
use crate::error::SessionError;

/// A single application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Message type (values >= 0x80 are reserved).
    pub message_type: u8,

    /// Payload bytes.
    pub payload: Vec<u8>,
}

impl Message {
    /// Create a message, enforcing the payload limit.
    pub fn new(message_type: u8, payload: impl Into<Vec<u8>>) -> Result<Self, SessionError> {
        let payload = payload.into();
        if payload.len() > config::MAX_PAYLOAD {
            return Err(SessionError::PayloadTooLarge {
                len: payload.len(),
                max: config::MAX_PAYLOAD,
            });
        }

        Ok(Self {
            message_type,
            payload,
        })
    }

    /// Create the OTA mode-switch command.
    pub fn ota_mode() -> Self {
        Self {
            message_type: message_type::OTA_SET,
            payload: OTA_MODE_PAYLOAD.to_vec(),
        }
    }

    /// Whether the type is delivered to the application.
    pub fn is_application(&self) -> bool {
        !message_type::is_reserved(self.message_type)
    }

    /// Serialize to wire bytes.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut wire = Vec::with_capacity(config::HEADER_SIZE + self.payload.len());
        wire.push(self.message_type);
        wire.push(self.payload.len() as u8);
        wire.extend_from_slice(&self.payload);
        wire
    }
}

/// Build the wire form of a message.
pub fn frame(message_type: u8, payload: &[u8]) -> Result<Vec<u8>, SessionError> {
    Ok(Message::new(message_type, payload)?.to_wire())
}

/// Strip the 2-byte header from a notification.
///
/// The payload is whatever bytes follow the header; the declared length is
/// not checked here.
pub fn parse_notification(bytes: &[u8]) -> Option<(u8, Vec<u8>)> {
    if bytes.len() < config::HEADER_SIZE {
        return None;
    }
    Some((bytes[0], bytes[config::HEADER_SIZE..].to_vec()))
}

/// Outbound OTA data-phase packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OtaPacket {
    Begin,
    Data { index: u8, chunk: Vec<u8> },
    End,
}

impl OtaPacket {
    /// Convert into an application message of the OTA data type.
    pub fn into_message(self) -> Result<Message, SessionError> {
        let payload = match self {
            OtaPacket::Begin => vec![ota_header::BEGIN],
            OtaPacket::End => vec![ota_header::END],
            OtaPacket::Data { index, chunk } => {
                if chunk.len() > config::OTA_CHUNK_SIZE {
                    return Err(SessionError::PayloadTooLarge {
                        len: chunk.len(),
                        max: config::OTA_CHUNK_SIZE,
                    });
                }
                let mut payload = Vec::with_capacity(config::OTA_DATA_HEADER_SIZE + chunk.len());
                payload.push(ota_header::DATA);
                payload.push(index);
                payload.extend_from_slice(&chunk);
                payload
            }
        };
        Message::new(message_type::OTA_DATA, payload)
    }
}

/// Acknowledgment sent by the device during an OTA transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaAck {
    Begin,
    Data,
    End,
    Unknown(u8),
}

impl OtaAck {
    /// Parse an event notification `[0x81, len, header, ...]`.
    pub fn parse(notification: &[u8]) -> Option<Self> {
        if notification.len() < 3 || notification[0] != message_type::OTA_DATA {
            return None;
        }
        Some(match notification[2] {
            ota_header::BEGIN => OtaAck::Begin,
            ota_header::DATA => OtaAck::Data,
            ota_header::END => OtaAck::End,
            other => OtaAck::Unknown(other),
        })
    }
}
