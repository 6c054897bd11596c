// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! HPI register-bridge link driver.
//!
//! Each channel carries at most one command at a time:
//!
//! ```text
//! GPP: Read/Write ──► DSP: ReadAck/WriteAck (+ buffer) ──► GPP: copy, Done ──► DSP: Invalid
//! ```
//!
//! The GPP mask bit of a channel is set while the GPP owns a command on it; the DSP
//! mask bit is set between its acknowledge and its release. The next queued request
//! is bound only after the release has been observed.

pub mod bridge;
pub mod layout;

use std::sync::Arc;

use nexus_hal::{Bus, Endianness, InterruptLine};
use parking_lot::Mutex;

use crate::chnl::{ChannelGuard, ChannelManager, Delivery, IoKick};
use crate::config::{HandshakeConfig, HpiConfig};
use crate::driver::{self, LinkDriver, TransferCounters, GPP_HANDSHAKE};
use crate::error::{FirstError, Result};
use crate::irp::{ChannelId, Direction};

use self::bridge::HpiBridge;
use self::layout::{mask_bit, ChannelField, Command, HpiLayout, Side};

/// GPP view of one channel's command slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SlotState {
    Idle,
    /// Command posted, waiting for the DSP acknowledge.
    Posted(Direction),
    /// `Done` written, waiting for the DSP release.
    Completing,
}

pub struct HpiDriver {
    bridge: HpiBridge,
    layout: HpiLayout,
    slots: Box<[Mutex<SlotState>]>,
    gpp_mask: Mutex<[u32; 2]>,
    counters: TransferCounters,
}

impl HpiDriver {
    pub fn new(
        bus: Arc<dyn Bus + Send + Sync>,
        irq: Arc<dyn InterruptLine>,
        cfg: &HpiConfig,
        max_channels: u16,
        endian: Endianness,
    ) -> Self {
        Self {
            bridge: HpiBridge::new(bus, irq, endian),
            layout: HpiLayout::new(cfg.control_addr, max_channels),
            slots: (0..max_channels).map(|_| Mutex::new(SlotState::Idle)).collect(),
            gpp_mask: Mutex::new([0; 2]),
            counters: TransferCounters::default(),
        }
    }

    pub fn layout(&self) -> &HpiLayout {
        &self.layout
    }

    fn field(&self, id: ChannelId, field: ChannelField) -> u32 {
        self.bridge.read_word(self.layout.channel(id, field))
    }

    fn set_field(&self, id: ChannelId, field: ChannelField, value: u32) {
        self.bridge.write_word(self.layout.channel(id, field), value);
    }

    fn set_gpp_bit(&self, id: ChannelId, set: bool) {
        let mut mask = self.gpp_mask.lock();
        let word = &mut mask[usize::from(id / 32)];
        let next = if set { *word | mask_bit(id) } else { *word & !mask_bit(id) };
        if next != *word {
            *word = next;
            self.bridge.write_word(self.layout.mask(Side::Gpp, id), next);
        }
    }

    /// Posts the head request of `ch`. The slot must be idle.
    fn bind(&self, ch: &ChannelGuard<'_>, slot: &mut SlotState) -> bool {
        let Some(irp) = ch.head() else { return false };
        let id = ch.id();
        let command = match ch.direction() {
            Direction::Input => Command::Read,
            Direction::Output => Command::Write,
        };
        // GPP buffers are not DSP-addressable; the DSP only needs the size.
        self.set_field(id, ChannelField::ClientBufPtr, 0);
        self.set_field(id, ChannelField::ClientBufSize, irp.size() as u32);
        self.set_field(id, ChannelField::IsValid, 1);
        self.set_field(id, ChannelField::Command, command as u32);
        *slot = SlotState::Posted(ch.direction());
        self.set_gpp_bit(id, true);
        log::trace!("hpi: chnl {id} posted {command:?} for {} bytes", irp.size());
        true
    }

    /// Copies the acknowledged unit and answers `Done`.
    ///
    /// `Done` is written even when the copy fails, so the DSP can release the
    /// command; the channel's queued requests are failed instead.
    fn transfer(
        &self,
        ch: &mut ChannelGuard<'_>,
        posted: Direction,
        out: &mut Vec<Delivery>,
    ) -> Result<()> {
        let id = ch.id();
        let buf_ptr = self.field(id, ChannelField::SharedBufPtr);
        let offered = self.field(id, ChannelField::SharedBufSize) as usize;
        let accepts = ch.is_open() && ch.direction() == posted;
        let moved = match ch.head_mut() {
            Some(irp) if accepts => {
                let n = offered.min(irp.size());
                let copied = match posted {
                    Direction::Input => self.bridge.read_block(buf_ptr, &mut irp.data_mut()[..n]),
                    Direction::Output => self.bridge.write_block(buf_ptr, &irp.data()[..n]),
                };
                copied.map(|()| Some(n))
            }
            _ => Ok(None),
        };
        let result = match moved {
            Ok(Some(n)) => {
                match posted {
                    Direction::Input => self.counters.record_in(n),
                    Direction::Output => self.counters.record_out(n),
                }
                self.set_field(id, ChannelField::SharedBufSize, n as u32);
                out.extend(ch.complete_head(n));
                Ok(())
            }
            Ok(None) => {
                log::warn!("hpi: chnl {id} acknowledged with no request bound, discarding");
                self.counters.record_discard();
                self.set_field(id, ChannelField::SharedBufSize, 0);
                Ok(())
            }
            Err(err) => {
                log::error!(
                    "hpi: chnl {id} unusable DSP buffer {buf_ptr:#x} ({offered} bytes): {err}"
                );
                self.counters.record_discard();
                self.set_field(id, ChannelField::SharedBufSize, 0);
                ch.fail_pending(out);
                Err(err)
            }
        };
        self.set_field(id, ChannelField::Command, Command::Done as u32);
        result
    }
}

impl LinkDriver for HpiDriver {
    fn kind(&self) -> &'static str {
        "hpi"
    }

    fn max_transfer(&self) -> usize {
        u32::MAX as usize
    }

    fn initialize(&self) -> Result<()> {
        self.bridge.zero(self.layout.control_addr, self.layout.span())?;
        *self.gpp_mask.lock() = [0; 2];
        for slot in self.slots.iter() {
            *slot.lock() = SlotState::Idle;
        }
        log::debug!(
            "hpi: control at {:#x}, {} channel slots",
            self.layout.control_addr,
            self.layout.channels
        );
        Ok(())
    }

    fn finalize(&self) -> Result<()> {
        self.bridge.zero(self.layout.control_addr, self.layout.span())?;
        *self.gpp_mask.lock() = [0; 2];
        Ok(())
    }

    fn handshake_setup(&self) -> Result<()> {
        self.bridge.write_word(self.layout.handshake(Side::Gpp), 0);
        self.bridge.write_word(self.layout.handshake(Side::Dsp), 0);
        Ok(())
    }

    fn handshake_start(&self) -> Result<()> {
        self.bridge.write_word(self.layout.handshake(Side::Gpp), GPP_HANDSHAKE);
        self.bridge.raise_dsp();
        Ok(())
    }

    fn handshake_complete(&self, cfg: &HandshakeConfig) -> Result<()> {
        let addr = self.layout.handshake(Side::Dsp);
        driver::poll_handshake(cfg, || Ok(self.bridge.read_word(addr)))
    }

    fn open_channel(&self, ch: &mut ChannelGuard<'_>) -> Result<()> {
        if *self.slots[usize::from(ch.id())].lock() == SlotState::Idle {
            self.set_gpp_bit(ch.id(), false);
        }
        Ok(())
    }

    fn close_channel(&self, ch: &mut ChannelGuard<'_>) -> Result<()> {
        let slot = *self.slots[usize::from(ch.id())].lock();
        match slot {
            SlotState::Idle => self.set_gpp_bit(ch.id(), false),
            // An in-flight command is retired through the discard path.
            other => log::debug!("hpi: chnl {} closing with command {other:?}", ch.id()),
        }
        Ok(())
    }

    fn io_request(&self, ch: &mut ChannelGuard<'_>) -> Result<IoKick> {
        let mut slot = self.slots[usize::from(ch.id())].lock();
        if *slot == SlotState::Idle && self.bind(ch, &mut slot) {
            self.bridge.raise_dsp();
        }
        Ok(IoKick::None)
    }

    fn service(&self, channels: &ChannelManager, out: &mut Vec<Delivery>) -> Result<()> {
        let dsp_mask = [
            self.bridge.read_word(self.layout.mask(Side::Dsp, 0)),
            self.bridge.read_word(self.layout.mask(Side::Dsp, 32)),
        ];
        let gpp_mask = *self.gpp_mask.lock();
        let mut notify = false;
        let mut errs = FirstError::new();
        for id in 0..self.layout.channels {
            let word = usize::from(id / 32);
            if gpp_mask[word] & mask_bit(id) == 0 {
                continue;
            }
            let dsp_active = dsp_mask[word] & mask_bit(id) != 0;
            let mut ch = match channels.lock(id) {
                Ok(ch) => ch,
                Err(err) => {
                    errs.record("hpi channel lookup", Err(err));
                    continue;
                }
            };
            let mut slot = self.slots[usize::from(id)].lock();
            let command = Command::from_raw(self.field(id, ChannelField::Command));
            match (*slot, command) {
                (SlotState::Posted(dir), Some(Command::ReadAck | Command::WriteAck))
                    if dsp_active =>
                {
                    let expected = match dir {
                        Direction::Input => Command::ReadAck,
                        Direction::Output => Command::WriteAck,
                    };
                    if command != Some(expected) {
                        log::error!("hpi: chnl {id} answered {command:?} to a {dir:?} request");
                    }
                    // A failed copy stays on this channel; the others are still serviced.
                    let copied = self.transfer(&mut ch, dir, out);
                    *slot = SlotState::Completing;
                    notify = true;
                    errs.record("hpi transfer", copied);
                }
                (SlotState::Completing, Some(Command::Invalid)) if !dsp_active => {
                    *slot = SlotState::Idle;
                    self.set_field(id, ChannelField::IsValid, 0);
                    if ch.is_open() && self.bind(&ch, &mut slot) {
                        notify = true;
                    } else {
                        self.set_gpp_bit(id, false);
                    }
                }
                (SlotState::Idle, _) => {
                    log::warn!("hpi: chnl {id} mask set without a command");
                }
                _ => {}
            }
        }
        if notify {
            self.bridge.raise_dsp();
        }
        errs.finish()
    }

    fn acknowledge_interrupt(&self) {
        self.bridge.acknowledge_host();
    }

    fn write_memory(&self, addr: u32, bytes: &[u8]) -> Result<()> {
        self.bridge.write_block(addr, bytes)
    }

    fn counters(&self) -> &TransferCounters {
        &self.counters
    }
}
