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

//! Error types for device sessions.

use std::fmt;
use thiserror::Error;

/// Public operations guarded against re-entrant invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Connect,
    Disconnect,
    Send,
    FirmwareUpdate,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Connect => "connect",
            Operation::Disconnect => "disconnect",
            Operation::Send => "send",
            Operation::FirmwareUpdate => "firmware update",
        };
        f.write_str(name)
    }
}

/// Errors that can occur while driving a device session.
///
/// Synchronous validation failures are returned directly from the public
/// session calls. Failures that happen later on the link only ever arrive
/// through [`crate::events::DeviceEvent`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// The remote device does not expose the expected service layout.
    #[error("device does not expose the required GATT layout: {0}")]
    CapabilityMismatch(String),

    /// The transport reported the distinguished link-loss status.
    #[error("link to the device was lost")]
    LinkLost,

    /// A like-kind operation is already in flight.
    #[error("{0} already in progress")]
    Busy(Operation),

    /// Payload does not fit into a single application message.
    #[error("payload of {len} bytes exceeds the {max}-byte limit")]
    PayloadTooLarge { len: usize, max: usize },

    /// Opaque identifier could not be turned back into a hardware address.
    #[error("malformed device identifier: {0}")]
    MalformedIdentifier(String),

    /// The transport refused a characteristic write.
    #[error("transport rejected the characteristic write")]
    TransportWriteFailed,

    /// Message types with the high bit set are reserved for internal use.
    #[error("message type {0:#04x} is reserved")]
    ReservedMessageType(u8),

    /// Operation requires a ready link.
    #[error("device is not connected")]
    NotConnected,

    /// Local Bluetooth adapter is missing or powered off.
    #[error("bluetooth adapter is powered off")]
    AdapterOff,

    /// An active scan could not be stopped before connecting.
    #[error("could not stop the active scan")]
    ScanStopFailed,

    /// The transport refused to open the link.
    #[error("transport refused the connection request")]
    ConnectRefused,

    /// The transport refused a non-write request.
    #[error("transport rejected the request")]
    RequestRejected,

    /// The session actor is gone.
    #[error("device session has shut down")]
    SessionClosed,

    /// Firmware image could not be fetched.
    #[error("firmware download failed: {0}")]
    Download(String),

    /// The device answered an OTA step with an error or garbage.
    #[error("device rejected the firmware transfer: {0}")]
    FirmwareRejected(String),
}

pub type SessionResult<T> = std::result::Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(
            SessionError::Busy(Operation::Send).to_string(),
            "send already in progress"
        );
        assert_eq!(
            SessionError::PayloadTooLarge { len: 250, max: 198 }.to_string(),
            "payload of 250 bytes exceeds the 198-byte limit"
        );
        assert_eq!(
            SessionError::ReservedMessageType(0x81).to_string(),
            "message type 0x81 is reserved"
        );
    }
}
