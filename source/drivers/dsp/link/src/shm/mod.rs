// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Shared-memory link driver.
//!
//! One input and one output data region are shared by every channel. The DSP
//! announces which output channels it can accept in `dspFreeMask`; the GPP announces
//! which input channels have a queued buffer in `gppFreeMask`. A unit is handed over
//! by setting the matching `*_full` flag and interrupting the peer; the receiver
//! clears the flag once the region may be reused.

pub mod layout;

use std::sync::Arc;

use nexus_hal::{Endianness, InterruptLine, SharedMemory};
use parking_lot::Mutex;

use crate::chnl::{ChannelGuard, ChannelManager, Delivery, IoKick};
use crate::config::{HandshakeConfig, ShmConfig};
use crate::driver::{self, LinkDriver, TransferCounters, DSP_HANDSHAKE, GPP_HANDSHAKE};
use crate::error::{FirstError, LinkError, Result};
use crate::irp::{ChannelId, Direction};

use self::layout::{ControlWords, Field, ShmLayout};

pub struct ShmDriver {
    mem: Arc<dyn SharedMemory>,
    irq: Arc<dyn InterruptLine>,
    layout: ShmLayout,
    words: ControlWords,
    max_channels: u16,
    message_channels: Option<[ChannelId; 2]>,
    /// Shadow of the GPP-written readiness words; only the GPP writes them.
    gpp_ready: Mutex<u16>,
    /// Next output channel to consider, for round-robin fairness.
    next_output: Mutex<ChannelId>,
    counters: TransferCounters,
}

impl ShmDriver {
    pub fn new(
        mem: Arc<dyn SharedMemory>,
        irq: Arc<dyn InterruptLine>,
        cfg: &ShmConfig,
        max_channels: u16,
        endian: Endianness,
    ) -> Self {
        let layout = ShmLayout::new(cfg);
        let words = ControlWords::new(Arc::clone(&mem), layout.control, endian);
        Self {
            mem,
            irq,
            layout,
            words,
            max_channels,
            message_channels: cfg.message_channels,
            gpp_ready: Mutex::new(0),
            next_output: Mutex::new(0),
            counters: TransferCounters::default(),
        }
    }

    pub fn layout(&self) -> &ShmLayout {
        &self.layout
    }

    fn set_gpp_ready(&self, id: ChannelId, ready: bool) {
        let mut mask = self.gpp_ready.lock();
        if self.message_channels.map(|[input, _]| input) == Some(id) {
            self.words.write(Field::GPP_FREE_MSG, u16::from(ready));
            return;
        }
        let bit = 1u16 << id;
        let next = if ready { *mask | bit } else { *mask & !bit };
        if next != *mask {
            *mask = next;
            self.words.write(Field::GPP_FREE_MASK, next);
        }
    }

    fn dsp_ready(&self, id: ChannelId, dsp_mask: u16, dsp_msg: u16) -> bool {
        if self.message_channels.map(|[_, output]| output) == Some(id) {
            dsp_msg != 0
        } else {
            dsp_mask & (1 << id) != 0
        }
    }

    /// Takes the unit the DSP handed over, if any, and frees the input region.
    fn receive(
        &self,
        channels: &ChannelManager,
        out: &mut Vec<Delivery>,
        errs: &mut FirstError,
    ) -> bool {
        if self.words.read(Field::INPUT_FULL) == 0 {
            return false;
        }
        let id = self.words.read(Field::INPUT_ID);
        let announced = usize::from(self.words.read(Field::INPUT_SIZE));
        errs.record("shm receive", self.deliver_input(channels, id, announced, out));
        self.words.write(Field::INPUT_FULL, 0);
        true
    }

    /// A unit larger than the input region fails the queue of the channel it was
    /// sent on.
    fn deliver_input(
        &self,
        channels: &ChannelManager,
        id: ChannelId,
        announced: usize,
        out: &mut Vec<Delivery>,
    ) -> Result<()> {
        if id >= self.max_channels {
            log::error!("shm: DSP sent on unknown channel {id}");
            self.counters.record_discard();
            return Ok(());
        }
        let mut ch = channels.lock(id)?;
        let accepts = ch.is_open() && ch.direction() == Direction::Input;
        if announced > self.layout.data_size {
            self.counters.record_discard();
            if accepts {
                ch.fail_pending(out);
                self.set_gpp_ready(id, false);
            }
            return Err(LinkError::Fail(format!(
                "DSP announced {announced} bytes on channel {id}, input region holds {}",
                self.layout.data_size
            )));
        }
        match ch.head_mut() {
            Some(irp) if accepts => {
                let n = announced.min(irp.size());
                self.mem.read(self.layout.input, &mut irp.data_mut()[..n]);
                self.counters.record_in(n);
                out.extend(ch.complete_head(n));
                if !ch.has_pending() {
                    self.set_gpp_ready(id, false);
                }
            }
            _ => {
                log::warn!("shm: dropping {announced} bytes for idle channel {id}");
                self.counters.record_discard();
            }
        }
        Ok(())
    }

    fn transmit(&self, channels: &ChannelManager, out: &mut Vec<Delivery>) -> Result<bool> {
        if self.words.read(Field::OUTPUT_FULL) != 0 {
            return Ok(false);
        }
        let dsp_mask = self.words.read(Field::DSP_FREE_MASK);
        let dsp_msg = self.words.read(Field::DSP_FREE_MSG);
        // Only the deferred work moves the cursor.
        let cursor = *self.next_output.lock();
        for step in 0..self.max_channels {
            let id = (cursor + step) % self.max_channels;
            if !self.dsp_ready(id, dsp_mask, dsp_msg) {
                continue;
            }
            let mut ch = channels.lock(id)?;
            if !ch.is_open() || ch.direction() != Direction::Output {
                continue;
            }
            let Some(irp) = ch.head() else { continue };
            let size = irp.size();
            self.mem.write(self.layout.output, irp.data());
            self.words.write(Field::OUTPUT_ID, id);
            self.words.write(Field::OUTPUT_SIZE, size as u16);
            self.words.write(Field::OUTPUT_FULL, 1);
            self.counters.record_out(size);
            out.extend(ch.complete_head(size));
            *self.next_output.lock() = (id + 1) % self.max_channels;
            return Ok(true);
        }
        Ok(false)
    }
}

impl LinkDriver for ShmDriver {
    fn kind(&self) -> &'static str {
        "shm"
    }

    fn max_transfer(&self) -> usize {
        self.layout.data_size
    }

    fn initialize(&self) -> Result<()> {
        self.layout.check(self.mem.size())?;
        self.mem.fill(self.layout.control, self.layout.end() - self.layout.control, 0);
        *self.gpp_ready.lock() = 0;
        *self.next_output.lock() = 0;
        log::debug!(
            "shm: control at {:#x}, data regions {:#x}/{:#x} ({} bytes)",
            self.layout.control,
            self.layout.input,
            self.layout.output,
            self.layout.data_size
        );
        Ok(())
    }

    fn finalize(&self) -> Result<()> {
        self.words.clear_all();
        *self.gpp_ready.lock() = 0;
        Ok(())
    }

    fn handshake_setup(&self) -> Result<()> {
        self.words.write(Field::HANDSHAKE_GPP, 0);
        self.words.write(Field::HANDSHAKE_DSP, 0);
        Ok(())
    }

    fn handshake_start(&self) -> Result<()> {
        self.words.write(Field::HANDSHAKE_GPP, GPP_HANDSHAKE as u16);
        self.irq.raise_peer();
        Ok(())
    }

    fn handshake_complete(&self, cfg: &HandshakeConfig) -> Result<()> {
        driver::poll_handshake(cfg, || Ok(u32::from(self.words.read(Field::HANDSHAKE_DSP))))?;
        debug_assert_eq!(u32::from(self.words.read(Field::HANDSHAKE_DSP)), DSP_HANDSHAKE);
        Ok(())
    }

    fn open_channel(&self, ch: &mut ChannelGuard<'_>) -> Result<()> {
        self.set_gpp_ready(ch.id(), false);
        Ok(())
    }

    fn close_channel(&self, ch: &mut ChannelGuard<'_>) -> Result<()> {
        self.set_gpp_ready(ch.id(), false);
        Ok(())
    }

    fn io_request(&self, ch: &mut ChannelGuard<'_>) -> Result<IoKick> {
        match ch.direction() {
            Direction::Input => {
                self.set_gpp_ready(ch.id(), true);
                self.irq.raise_peer();
                Ok(IoKick::None)
            }
            Direction::Output => Ok(IoKick::Schedule),
        }
    }

    fn service(&self, channels: &ChannelManager, out: &mut Vec<Delivery>) -> Result<()> {
        let mut errs = FirstError::new();
        let received = self.receive(channels, out, &mut errs);
        let sent = match self.transmit(channels, out) {
            Ok(sent) => sent,
            Err(err) => {
                errs.record("shm transmit", Err(err));
                false
            }
        };
        if received || sent {
            self.irq.raise_peer();
        }
        errs.finish()
    }

    fn acknowledge_interrupt(&self) {
        self.irq.clear();
    }

    fn write_memory(&self, addr: u32, bytes: &[u8]) -> Result<()> {
        let offset = addr as usize;
        let limit = self.mem.size();
        if offset.checked_add(bytes.len()).map_or(true, |end| end > limit) {
            return Err(LinkError::Range { offset, len: bytes.len(), limit });
        }
        self.mem.write(offset, bytes);
        Ok(())
    }

    fn counters(&self) -> &TransferCounters {
        &self.counters
    }
}
