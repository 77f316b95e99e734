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

//! Device identity and hardware addresses.

use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::SessionError;

/// 48-bit Bluetooth hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HardwareAddress(pub [u8; 6]);

impl HardwareAddress {
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    /// Twelve uppercase hex digits without separators.
    pub fn to_compact_hex(&self) -> String {
        hex::encode_upper(self.0)
    }
}

impl fmt::Display for HardwareAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            a, b, c, d, e, g
        )
    }
}

impl FromStr for HardwareAddress {
    type Err = SessionError;

    /// Accepts `AA:BB:CC:DD:EE:FF` or `AABBCCDDEEFF`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let compact: String = s.chars().filter(|c| *c != ':').collect();
        if compact.len() != 12 {
            return Err(SessionError::MalformedIdentifier(format!(
                "expected 12 hex digits, got {:?}",
                s
            )));
        }

        let mut bytes = [0u8; 6];
        hex::decode_to_slice(&compact, &mut bytes)
            .map_err(|e| SessionError::MalformedIdentifier(format!("{}: {}", s, e)))?;
        Ok(Self(bytes))
    }
}

/// Identity of a discovered device as seen by callers.
///
/// Callers only ever hold the opaque id, never the hardware address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub name: Option<String>,
    pub id: Uuid,
}

impl DeviceIdentity {
    pub fn new(name: Option<String>, id: Uuid) -> Self {
        Self { name, id }
    }

    /// Name for log lines.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("Unknown")
    }
}
