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

//! Reversible obfuscation of hardware addresses into opaque identifiers.
//!
//! The key is expanded from the *local* adapter's address, so an identifier
//! produced on one host only decodes on that same host.

use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::SessionError;
use crate::identity::HardwareAddress;

const KEY_SIZE: usize = 16;
const BLOCK_SIZE: usize = 16;
const ADDRESS_HEX_LEN: usize = 12;

/// Encodes hardware addresses into opaque ids and back.
#[derive(Clone)]
pub struct AddressCodec {
    key: [u8; KEY_SIZE],
}

impl AddressCodec {
    /// Create a codec keyed by the local adapter's address.
    pub fn new(local_address: &HardwareAddress) -> Self {
        Self::from_seed(local_address.to_string().as_bytes())
    }

    /// Create a codec from an arbitrary key seed.
    pub fn from_seed(seed: &[u8]) -> Self {
        Self {
            key: derive_key(seed),
        }
    }

    /// Encode a hardware address into an opaque identifier.
    pub fn encode(&self, address: &HardwareAddress) -> Uuid {
        let mut block = pad_block(address.to_compact_hex().as_bytes());
        let cipher = Aes128::new((&self.key).into());
        cipher.encrypt_block((&mut block).into());
        Uuid::from_bytes(block)
    }

    /// Decode an opaque identifier back into a hardware address.
    pub fn decode(&self, id: &Uuid) -> Result<HardwareAddress, SessionError> {
        let mut block = *id.as_bytes();
        let cipher = Aes128::new((&self.key).into());
        cipher.decrypt_block((&mut block).into());

        let plaintext = unpad_block(&block)
            .ok_or_else(|| SessionError::MalformedIdentifier(format!("{}: bad padding", id)))?;
        if plaintext.len() != ADDRESS_HEX_LEN {
            return Err(SessionError::MalformedIdentifier(format!(
                "{}: decoded {} bytes",
                id,
                plaintext.len()
            )));
        }

        let text = std::str::from_utf8(plaintext)
            .map_err(|_| SessionError::MalformedIdentifier(format!("{}: not ASCII", id)))?;
        text.parse()
    }

    /// Decode the hyphenated text form of an identifier.
    pub fn decode_str(&self, id: &str) -> Result<HardwareAddress, SessionError> {
        let compact: String = id.chars().filter(|c| *c != '-').collect();
        if compact.len() != BLOCK_SIZE * 2 {
            return Err(SessionError::MalformedIdentifier(id.to_string()));
        }

        let mut bytes = [0u8; BLOCK_SIZE];
        hex::decode_to_slice(&compact, &mut bytes)
            .map_err(|e| SessionError::MalformedIdentifier(format!("{}: {}", id, e)))?;
        self.decode(&Uuid::from_bytes(bytes))
    }
}

/// Expand a seed into a 128-bit key with a seeded PRNG.
pub fn derive_key(seed: &[u8]) -> [u8; KEY_SIZE] {
    let digest: [u8; 32] = Sha256::digest(seed).into();
    let mut rng = ChaCha20Rng::from_seed(digest);

    let mut key = [0u8; KEY_SIZE];
    rng.fill_bytes(&mut key);
    key
}

/// PKCS#7 pad a short plaintext into one block.
fn pad_block(plaintext: &[u8]) -> [u8; BLOCK_SIZE] {
    debug_assert!(plaintext.len() < BLOCK_SIZE);
    let pad = (BLOCK_SIZE - plaintext.len()) as u8;
    let mut block = [pad; BLOCK_SIZE];
    block[..plaintext.len()].copy_from_slice(plaintext);
    block
}

fn unpad_block(block: &[u8; BLOCK_SIZE]) -> Option<&[u8]> {
    let pad = block[BLOCK_SIZE - 1] as usize;
    if pad == 0 || pad > BLOCK_SIZE {
        return None;
    }
    let (data, padding) = block.split_at(BLOCK_SIZE - pad);
    if padding.iter().all(|&b| b as usize == pad) {
        Some(data)
    } else {
        None
    }
}
