// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use dsp_link::ChannelId;
use serde::Deserialize;

use crate::error::{Result, RmqtError};
use crate::mqa::MqaId;
use crate::wire::{CONTROL_MSG_SIZE, LOCATE};

/// Transport attributes, usually a `[rmqt]` table of the board configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TransportAttrs {
    /// Id stamped on messages delivered through this transport.
    pub mqt_id: u16,
    /// Remote queue ids `0..max_queues` can be located.
    pub max_queues: u16,
    /// Channel carrying DSP to GPP messages.
    pub input_channel: ChannelId,
    /// Channel carrying GPP to DSP messages.
    pub output_channel: ChannelId,
    /// Receive buffer size; the largest message either side may send.
    pub max_msg_size: usize,
    /// Size of a DSP word in bytes; message sizes travel in words.
    pub word_size: usize,
    /// Allocator for control messages and for incoming messages naming an
    /// unknown allocator.
    pub default_mqa: MqaId,
    pub exit_timeout_ms: u64,
}

impl Default for TransportAttrs {
    fn default() -> Self {
        Self {
            mqt_id: 1,
            max_queues: 16,
            input_channel: 6,
            output_channel: 7,
            max_msg_size: 256,
            word_size: 2,
            default_mqa: 0,
            exit_timeout_ms: 100,
        }
    }
}

impl TransportAttrs {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let attrs: TransportAttrs = toml::from_str(text)?;
        attrs.validate()?;
        Ok(attrs)
    }

    pub fn exit_timeout(&self) -> Duration {
        Duration::from_millis(self.exit_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if !matches!(self.word_size, 1 | 2 | 4) {
            return Err(RmqtError::Config(format!("word_size {} not in {{1, 2, 4}}", self.word_size)));
        }
        if self.max_msg_size < CONTROL_MSG_SIZE || self.max_msg_size % self.word_size != 0 {
            return Err(RmqtError::Config(format!(
                "max_msg_size {} must be a word multiple of at least {CONTROL_MSG_SIZE}",
                self.max_msg_size
            )));
        }
        if self.input_channel == self.output_channel {
            return Err(RmqtError::Config("input and output channel must differ".into()));
        }
        if self.max_queues == 0 || self.max_queues >= LOCATE {
            return Err(RmqtError::Config(format!("max_queues {} out of range", self.max_queues)));
        }
        Ok(())
    }
}
