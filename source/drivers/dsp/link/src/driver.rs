// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Physical link driver contract shared by the SHM and HPI variants.

use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use crate::chnl::{ChannelGuard, ChannelManager, Delivery, IoKick};
use crate::config::HandshakeConfig;
use crate::error::{LinkError, Result};

/// Token the GPP writes into its handshake word.
pub const GPP_HANDSHAKE: u32 = 0xC0C0;
/// Token the DSP answers with.
pub const DSP_HANDSHAKE: u32 = 0xBABA;

/// Link-layer operations implemented once per physical medium.
///
/// Channel hooks run with the channel locked. `service` is the deferred-work body:
/// it may lock channels itself and must push callback deliveries to `out` instead of
/// running them.
pub trait LinkDriver: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Largest payload one output transfer can carry.
    fn max_transfer(&self) -> usize;

    /// Validates and zeroes the shared control region.
    fn initialize(&self) -> Result<()>;

    /// Zeroes shared state on the way down.
    fn finalize(&self) -> Result<()>;

    fn handshake_setup(&self) -> Result<()>;
    fn handshake_start(&self) -> Result<()>;
    fn handshake_complete(&self, cfg: &HandshakeConfig) -> Result<()>;

    fn open_channel(&self, ch: &mut ChannelGuard<'_>) -> Result<()>;
    fn close_channel(&self, ch: &mut ChannelGuard<'_>) -> Result<()>;

    fn cancel_io(&self, ch: &mut ChannelGuard<'_>) -> Result<()> {
        self.close_channel(ch)
    }

    /// Binds the head request of `ch` to the medium.
    fn io_request(&self, ch: &mut ChannelGuard<'_>) -> Result<IoKick>;

    fn service(&self, channels: &ChannelManager, out: &mut Vec<Delivery>) -> Result<()>;

    /// Clears the GPP interrupt source. Runs in interrupt context.
    fn acknowledge_interrupt(&self);

    /// Raw write into DSP address space.
    fn write_memory(&self, addr: u32, bytes: &[u8]) -> Result<()>;

    fn counters(&self) -> &TransferCounters;
}

#[derive(Debug, Default)]
pub struct TransferCounters {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    discarded: AtomicU64,
}

impl TransferCounters {
    pub fn record_in(&self, bytes: usize) {
        self.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_out(&self, bytes: usize) {
        self.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_discard(&self) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }

    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }
}

/// Polls `read_peer` until it yields [`DSP_HANDSHAKE`], at most `poll_limit` times.
pub(crate) fn poll_handshake(
    cfg: &HandshakeConfig,
    mut read_peer: impl FnMut() -> Result<u32>,
) -> Result<()> {
    let interval = cfg.poll_interval();
    for attempt in 0..cfg.poll_limit {
        if read_peer()? == DSP_HANDSHAKE {
            log::debug!("dsp-link: handshake answered after {attempt} polls");
            return Ok(());
        }
        thread::sleep(interval);
    }
    log::error!("dsp-link: no handshake answer after {} polls", cfg.poll_limit);
    Err(LinkError::Timeout)
}
