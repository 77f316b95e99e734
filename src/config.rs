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

//! Configuration module.
//!
//! Handles loading and saving SDK settings.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::bluetooth::ble_constants::config as ble;
use crate::bluetooth::{SessionOptions, DEFAULT_SETTLE_DELAY};

const APP_DIR: &str = "gattlink";

/// SDK configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bluetooth settings.
    pub bluetooth: BluetoothConfig,

    /// Firmware download settings.
    pub firmware: FirmwareConfig,

    /// Logging settings.
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    /// Only report devices whose advertised name contains this string.
    pub scan_name_filter: Option<String>,

    /// How long a CLI scan runs before stopping.
    pub scan_seconds: u64,

    /// Delay before a completed disconnect is reported.
    pub settle_delay_ms: u64,

    /// Link packet size for outbound chunks.
    pub chunk_size: usize,

    /// ATT MTU of the link. When set, it overrides `chunk_size`.
    pub mtu: Option<usize>,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            scan_name_filter: None,
            scan_seconds: 10,
            settle_delay_ms: DEFAULT_SETTLE_DELAY.as_millis() as u64,
            chunk_size: ble::DEFAULT_CHUNK_SIZE,
            mtu: None,
        }
    }
}

impl BluetoothConfig {
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            settle_delay: Duration::from_millis(self.settle_delay_ms),
            chunk_size: self.mtu.map(ble::chunk_size_for_mtu).unwrap_or(self.chunk_size),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FirmwareConfig {
    /// HTTP request timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for FirmwareConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 60,
        }
    }
}

impl FirmwareConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Directive added to `RUST_LOG`.
    pub default_directive: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default_directive: "gattlink=info".to_string(),
        }
    }
}

impl Config {
    /// Default location of the config file.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
            .join("config.toml")
    }

    /// Load configuration from the default location or create it.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path())
    }

    /// Load configuration from `path`, writing defaults if it does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Ok(toml::from_str(&content)?)
        } else {
            let config = Self::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::default_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
