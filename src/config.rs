// Copyright 2026 Daniel Pelikan
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
//! Handles loading and saving bridge settings.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

use crate::bluetooth::constants::{defaults, SERVICE_NAME, SPP_UUID};

const APP_DIR: &str = "spp-bridge";

/// Sanitize a name for use as a Bluetooth alias.
/// Bluetooth names should only contain alphanumeric chars, spaces, and hyphens.
pub fn sanitize_device_name(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == ' ' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = sanitized.trim_matches('-');
    if trimmed.is_empty() {
        "SPP-Bridge".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    /// Bluetooth settings.
    #[serde(default)]
    pub bluetooth: BluetoothConfig,

    /// Session settings.
    #[serde(default)]
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BluetoothConfig {
    /// RFCOMM service UUID used for both listening and dialing.
    pub service_uuid: Uuid,

    /// Service record name.
    pub service_name: String,

    /// Adapter alias to set on startup.
    pub device_name: Option<String>,

    /// Make the adapter discoverable while listening.
    pub discoverable: bool,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            service_uuid: SPP_UUID,
            service_name: SERVICE_NAME.to_string(),
            device_name: None,
            discoverable: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SessionConfig {
    /// Bytes requested per read.
    pub read_buffer_size: usize,

    /// Event channel capacity.
    pub event_capacity: usize,

    /// Grace period for background tasks on shutdown.
    pub shutdown_grace_ms: u64,

    /// Optional dial deadline. Unset or 0 waits for the transport.
    pub connect_timeout_ms: Option<u64>,

    /// Optional accept deadline. Unset or 0 waits forever.
    pub accept_timeout_ms: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: defaults::READ_BUFFER_SIZE,
            event_capacity: defaults::EVENT_CAPACITY,
            shutdown_grace_ms: defaults::SHUTDOWN_GRACE_MS,
            connect_timeout_ms: None,
            accept_timeout_ms: None,
        }
    }
}

impl SessionConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        nonzero_millis(self.connect_timeout_ms)
    }

    pub fn accept_timeout(&self) -> Option<Duration> {
        nonzero_millis(self.accept_timeout_ms)
    }
}

fn nonzero_millis(ms: Option<u64>) -> Option<Duration> {
    ms.filter(|ms| *ms > 0).map(Duration::from_millis)
}

impl Config {
    /// Default config file location.
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
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            let config = Self::default();
            config.save_to(path)?;
            config
        };

        if let Some(name) = config.bluetooth.device_name.take() {
            config.bluetooth.device_name = Some(sanitize_device_name(&name));
        }

        Ok(config)
    }

    /// Save configuration to `path`.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
