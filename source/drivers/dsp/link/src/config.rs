// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Link configuration, loadable from TOML.
//!
//! ```toml
//! processor_id = 0
//! max_channels = 8
//! dsp_endianness = "little"
//!
//! [handshake]
//! poll_limit = 20000
//! poll_interval_us = 50
//!
//! [driver]
//! kind = "shm"
//! data_size = 4096
//! message_channels = [6, 7]
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use nexus_hal::Endianness;
use serde::Deserialize;

use crate::error::{LinkError, Result};
use crate::hpi::layout::{HpiLayout, HPI_MAX_CHANNELS};
use crate::shm::layout::SHM_MAX_CHANNELS;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LinkConfig {
    pub processor_id: u16,
    #[serde(default)]
    pub link_id: u16,
    #[serde(default = "default_max_channels")]
    pub max_channels: u16,
    #[serde(default)]
    pub dsp_endianness: Endianness,
    #[serde(default)]
    pub handshake: HandshakeConfig,
    pub driver: DriverConfig,
}

/// Physical link variant.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DriverConfig {
    Shm(ShmConfig),
    Hpi(HpiConfig),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ShmConfig {
    /// Offset of the control block inside the shared region.
    #[serde(default)]
    pub control_offset: usize,
    /// Size of each of the two data regions (input, output).
    #[serde(default = "default_data_size")]
    pub data_size: usize,
    /// `[input, output]` channel pair signalled through the dedicated message flags.
    #[serde(default)]
    pub message_channels: Option<[u16; 2]>,
}

impl Default for ShmConfig {
    fn default() -> Self {
        Self { control_offset: 0, data_size: default_data_size(), message_channels: None }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HpiConfig {
    /// DSP address of the GPP control block.
    #[serde(default = "default_control_addr")]
    pub control_addr: u32,
}

impl Default for HpiConfig {
    fn default() -> Self {
        Self { control_addr: default_control_addr() }
    }
}

/// Bounds of the startup rendezvous poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct HandshakeConfig {
    #[serde(default = "default_poll_limit")]
    pub poll_limit: u32,
    #[serde(default = "default_poll_interval_us")]
    pub poll_interval_us: u64,
}

impl HandshakeConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.poll_interval_us)
    }
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self { poll_limit: default_poll_limit(), poll_interval_us: default_poll_interval_us() }
    }
}

fn default_max_channels() -> u16 {
    8
}

fn default_data_size() -> usize {
    0x1000
}

fn default_control_addr() -> u32 {
    0x0001_0000
}

fn default_poll_limit() -> u32 {
    100_000
}

fn default_poll_interval_us() -> u64 {
    10
}

impl LinkConfig {
    /// Shared-memory link with default settings.
    pub fn shm(processor_id: u16, max_channels: u16) -> Self {
        Self {
            processor_id,
            link_id: 0,
            max_channels,
            dsp_endianness: Endianness::default(),
            handshake: HandshakeConfig::default(),
            driver: DriverConfig::Shm(ShmConfig::default()),
        }
    }

    /// Register-bridge link with default settings.
    pub fn hpi(processor_id: u16, max_channels: u16) -> Self {
        Self { driver: DriverConfig::Hpi(HpiConfig::default()), ..Self::shm(processor_id, max_channels) }
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let cfg: LinkConfig =
            toml::from_str(text).map_err(|source| LinkError::ConfigParse { source })?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|source| LinkError::ConfigRead { path: path.to_path_buf(), source })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_channels == 0 {
            return Err(LinkError::Config("max_channels must be at least 1".into()));
        }
        if self.handshake.poll_limit == 0 {
            return Err(LinkError::Config("handshake.poll_limit must be at least 1".into()));
        }
        match &self.driver {
            DriverConfig::Shm(shm) => {
                if self.max_channels > SHM_MAX_CHANNELS {
                    return Err(LinkError::Config(format!(
                        "shm supports at most {SHM_MAX_CHANNELS} channels, got {}",
                        self.max_channels
                    )));
                }
                if shm.data_size == 0 || shm.data_size > usize::from(u16::MAX) {
                    return Err(LinkError::Config(format!(
                        "shm data_size must be within 1..=65535, got {}",
                        shm.data_size
                    )));
                }
                if let Some([input, output]) = shm.message_channels {
                    if input == output || input >= self.max_channels || output >= self.max_channels {
                        return Err(LinkError::Config(format!(
                            "invalid message channel pair [{input}, {output}]"
                        )));
                    }
                }
            }
            DriverConfig::Hpi(hpi) => {
                if self.max_channels > HPI_MAX_CHANNELS {
                    return Err(LinkError::Config(format!(
                        "hpi supports at most {HPI_MAX_CHANNELS} channels, got {}",
                        self.max_channels
                    )));
                }
                if hpi.control_addr % 4 != 0 {
                    return Err(LinkError::Config("hpi control_addr must be word aligned".into()));
                }
                HpiLayout::new(hpi.control_addr, self.max_channels).check()?;
            }
        }
        Ok(())
    }
}
