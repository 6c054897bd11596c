// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Pluggable behaviour of the simulated DSP.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::irp::ChannelId;

/// Data the firmware wants to send back to the GPP.
#[derive(Debug, Default)]
pub struct Outbox {
    queued: VecDeque<(ChannelId, Vec<u8>)>,
}

impl Outbox {
    pub fn send(&mut self, channel: ChannelId, data: Vec<u8>) {
        self.queued.push_back((channel, data));
    }

    pub fn len(&self) -> usize {
        self.queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }

    pub(crate) fn drain(&mut self) -> impl Iterator<Item = (ChannelId, Vec<u8>)> + '_ {
        self.queued.drain(..)
    }
}

/// Program running on the simulated DSP thread.
pub trait DspFirmware: Send + 'static {
    /// Called once per completed handshake.
    fn on_start(&mut self, _outbox: &mut Outbox) {}

    /// A unit the GPP sent on `channel`.
    fn on_receive(&mut self, channel: ChannelId, data: &[u8], outbox: &mut Outbox);
}

/// Sends every unit received on `from` back on `to`.
pub struct EchoFirmware {
    routes: Vec<(ChannelId, ChannelId)>,
}

impl EchoFirmware {
    pub fn new(routes: &[(ChannelId, ChannelId)]) -> Self {
        Self { routes: routes.to_vec() }
    }
}

impl DspFirmware for EchoFirmware {
    fn on_receive(&mut self, channel: ChannelId, data: &[u8], outbox: &mut Outbox) {
        for &(from, to) in &self.routes {
            if from == channel {
                outbox.send(to, data.to_vec());
            }
        }
    }
}

/// Shared log of everything a [`RecordingFirmware`] received.
pub type Received = Arc<Mutex<Vec<(ChannelId, Vec<u8>)>>>;

/// Keeps every received unit for inspection.
#[derive(Default)]
pub struct RecordingFirmware {
    received: Received,
}

impl RecordingFirmware {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn received(&self) -> Received {
        Arc::clone(&self.received)
    }
}

impl DspFirmware for RecordingFirmware {
    fn on_receive(&mut self, channel: ChannelId, data: &[u8], _outbox: &mut Outbox) {
        self.received.lock().push((channel, data.to_vec()));
    }
}
