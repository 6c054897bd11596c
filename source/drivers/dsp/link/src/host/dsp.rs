// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Simulated DSP: a thread playing the DSP side of the SHM or HPI protocol.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use nexus_hal::{Endianness, SharedMemory};
use parking_lot::Mutex;

use crate::driver::{DSP_HANDSHAKE, GPP_HANDSHAKE};
use crate::hpi::layout::{mask_bit, ChannelField, Command, HpiLayout, Side};
use crate::irp::{ChannelId, Direction};
use crate::shm::layout::{ControlWords, Field, ShmLayout};

use super::firmware::{DspFirmware, Outbox};
use super::hpi_bus::SimHpiBus;
use super::irq::{Doorbell, SimInterrupt};
use super::memory::SimMemory;

const IDLE_POLL: Duration = Duration::from_millis(1);

/// State shared between the DSP thread and its [`SimDsp`] handle.
struct DspShared {
    outbound: Mutex<Vec<VecDeque<Vec<u8>>>>,
    accepting: Mutex<u64>,
    /// Channels whose buffer descriptors are deliberately broken.
    corrupt: Mutex<u64>,
    stop: AtomicBool,
    received: AtomicU64,
    sent: AtomicU64,
    violations: AtomicU64,
}

pub(crate) enum Personality {
    Shm { layout: ShmLayout, message_channels: Option<[ChannelId; 2]> },
    Hpi { layout: HpiLayout, bus: Arc<SimHpiBus>, buffer_base: u32, buffer_size: u32 },
}

pub(crate) struct DspWiring {
    pub memory: Arc<SimMemory>,
    pub endian: Endianness,
    pub gpp: Arc<SimInterrupt>,
    pub bell: Arc<Doorbell>,
    pub channels: u16,
    pub personality: Personality,
}

/// Handle to a running simulated DSP. Stops the thread on drop.
pub struct SimDsp {
    shared: Arc<DspShared>,
    bell: Arc<Doorbell>,
    thread: Option<JoinHandle<()>>,
}

impl SimDsp {
    pub(crate) fn spawn(
        wiring: DspWiring,
        firmware: Box<dyn DspFirmware>,
    ) -> std::io::Result<Self> {
        let channels = usize::from(wiring.channels);
        let shared = Arc::new(DspShared {
            outbound: Mutex::new(vec![VecDeque::new(); channels]),
            accepting: Mutex::new(u64::MAX),
            corrupt: Mutex::new(0),
            stop: AtomicBool::new(false),
            received: AtomicU64::new(0),
            sent: AtomicU64::new(0),
            violations: AtomicU64::new(0),
        });
        let bell = Arc::clone(&wiring.bell);
        let mut core = DspCore {
            shared: Arc::clone(&shared),
            wiring,
            firmware,
            handshaken: false,
            mask_shadow: [0; 2],
            slots: vec![DspSlot::Idle; channels],
            cursor: 0,
        };
        let thread = thread::Builder::new().name("sim-dsp".into()).spawn(move || core.run())?;
        Ok(Self { shared, bell, thread: Some(thread) })
    }

    /// Queues `data` for delivery to the GPP on `channel`. An empty unit signals end
    /// of stream.
    pub fn inject(&self, channel: ChannelId, data: Vec<u8>) {
        if let Some(queue) = self.shared.outbound.lock().get_mut(usize::from(channel)) {
            queue.push_back(data);
        }
        self.bell.ring();
    }

    /// Controls whether the DSP offers buffers for GPP output on `channel`.
    pub fn set_accepting(&self, channel: ChannelId, accepting: bool) {
        let mut mask = self.shared.accepting.lock();
        if accepting {
            *mask |= 1 << channel;
        } else {
            *mask &= !(1 << channel);
        }
        drop(mask);
        self.bell.ring();
    }

    /// Makes the DSP describe its buffers on `channel` wrongly: a misaligned HPI
    /// buffer pointer, or an SHM input size larger than the data region.
    pub fn corrupt_buffers(&self, channel: ChannelId, corrupt: bool) {
        let mut mask = self.shared.corrupt.lock();
        if corrupt {
            *mask |= 1 << channel;
        } else {
            *mask &= !(1 << channel);
        }
        drop(mask);
        self.bell.ring();
    }

    /// Units received from the GPP.
    pub fn received(&self) -> u64 {
        self.shared.received.load(Ordering::SeqCst)
    }

    /// Units delivered to the GPP.
    pub fn sent(&self) -> u64 {
        self.shared.sent.load(Ordering::SeqCst)
    }

    /// Wire-protocol violations observed on the DSP side.
    pub fn protocol_violations(&self) -> u64 {
        self.shared.violations.load(Ordering::SeqCst)
    }

    pub fn stop(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        self.bell.ring();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("sim-dsp: thread panicked");
            }
        }
    }
}

impl Drop for SimDsp {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DspSlot {
    Idle,
    Acked(Direction),
}

struct DspCore {
    shared: Arc<DspShared>,
    wiring: DspWiring,
    firmware: Box<dyn DspFirmware>,
    handshaken: bool,
    mask_shadow: [u32; 2],
    slots: Vec<DspSlot>,
    cursor: usize,
}

impl DspCore {
    fn run(&mut self) {
        let mut busy = false;
        while !self.shared.stop.load(Ordering::SeqCst) {
            if !busy {
                self.wiring.bell.wait(IDLE_POLL);
            }
            let mut outbox = Outbox::default();
            let notify = if matches!(self.wiring.personality, Personality::Shm { .. }) {
                self.step_shm(&mut outbox)
            } else {
                self.step_hpi(&mut outbox)
            };
            busy = notify || !outbox.is_empty();
            {
                let mut outbound = self.shared.outbound.lock();
                for (channel, data) in outbox.drain() {
                    match outbound.get_mut(usize::from(channel)) {
                        Some(queue) => queue.push_back(data),
                        None => log::warn!("sim-dsp: firmware sent on unknown channel {channel}"),
                    }
                }
            }
            if notify {
                self.interrupt_gpp();
            }
        }
    }

    fn interrupt_gpp(&self) {
        match &self.wiring.personality {
            Personality::Shm { .. } => self.wiring.gpp.trigger(),
            Personality::Hpi { bus, .. } => bus.raise_host(),
        }
    }

    fn accepting(&self, channel: ChannelId) -> bool {
        *self.shared.accepting.lock() & (1 << channel) != 0
    }

    fn corrupt(&self, channel: ChannelId) -> bool {
        *self.shared.corrupt.lock() & (1 << channel) != 0
    }

    fn reset_session(&mut self) {
        self.handshaken = false;
        self.mask_shadow = [0; 2];
        self.slots.iter_mut().for_each(|slot| *slot = DspSlot::Idle);
        log::debug!("sim-dsp: GPP left, session reset");
    }

    /// Answers the GPP handshake token. Returns `Some(notify)` when the session is
    /// not (or no longer) established and the caller must not go on.
    ///
    /// `answered` tells whether the DSP token is still in place; a GPP that cleared it
    /// is starting a new session.
    fn handshake(
        &mut self,
        gpp_token: u32,
        answered: bool,
        answer: impl FnOnce(),
        outbox: &mut Outbox,
    ) -> Option<bool> {
        if self.handshaken {
            if gpp_token == GPP_HANDSHAKE && answered {
                return None;
            }
            self.reset_session();
        }
        if gpp_token != GPP_HANDSHAKE {
            return Some(false);
        }
        answer();
        self.handshaken = true;
        log::debug!("sim-dsp: handshake answered");
        self.firmware.on_start(outbox);
        Some(true)
    }

    fn next_outbound(&self, ready: impl Fn(ChannelId) -> bool) -> Option<(ChannelId, Vec<u8>)> {
        let mut outbound = self.shared.outbound.lock();
        let n = outbound.len();
        for step in 0..n {
            let idx = (self.cursor + step) % n;
            let id = idx as ChannelId;
            if !outbound[idx].is_empty() && ready(id) {
                return outbound[idx].pop_front().map(|data| (id, data));
            }
        }
        None
    }

    fn step_shm(&mut self, outbox: &mut Outbox) -> bool {
        let Personality::Shm { layout, message_channels } = self.wiring.personality else {
            return false;
        };
        let words =
            ControlWords::new(self.wiring.memory.clone(), layout.control, self.wiring.endian);
        let gpp_token = u32::from(words.read(Field::HANDSHAKE_GPP));
        let answered = u32::from(words.read(Field::HANDSHAKE_DSP)) == DSP_HANDSHAKE;
        let answer = || words.write(Field::HANDSHAKE_DSP, DSP_HANDSHAKE as u16);
        if let Some(notify) = self.handshake(gpp_token, answered, answer, outbox) {
            if notify {
                self.publish_shm_masks(&words, message_channels);
            }
            return notify;
        }
        let mut notify = self.publish_shm_masks(&words, message_channels);

        if words.read(Field::OUTPUT_FULL) != 0 {
            let id = words.read(Field::OUTPUT_ID);
            let size = usize::from(words.read(Field::OUTPUT_SIZE)).min(layout.data_size);
            let data = self.wiring.memory.snapshot(layout.output, size);
            if id >= self.wiring.channels || !self.accepting(id) {
                log::error!("sim-dsp: GPP sent on channel {id} which was not offered");
                self.shared.violations.fetch_add(1, Ordering::SeqCst);
            }
            words.write(Field::OUTPUT_FULL, 0);
            self.shared.received.fetch_add(1, Ordering::SeqCst);
            self.firmware.on_receive(id, &data, outbox);
            notify = true;
        }

        if words.read(Field::INPUT_FULL) == 0 {
            let gpp_mask = words.read(Field::GPP_FREE_MASK);
            let gpp_msg = words.read(Field::GPP_FREE_MSG);
            let ready = |id: ChannelId| match message_channels {
                Some([input, _]) if input == id => gpp_msg != 0,
                _ => id < 16 && gpp_mask & (1 << id) != 0,
            };
            if let Some((id, mut data)) = self.next_outbound(ready) {
                if data.len() > layout.data_size {
                    log::warn!("sim-dsp: truncating {} byte unit on channel {id}", data.len());
                    data.truncate(layout.data_size);
                }
                self.wiring.memory.write(layout.input, &data);
                let announced = if self.corrupt(id) {
                    u16::try_from(layout.data_size + 1).unwrap_or(u16::MAX)
                } else {
                    data.len() as u16
                };
                words.write(Field::INPUT_ID, id);
                words.write(Field::INPUT_SIZE, announced);
                words.write(Field::INPUT_FULL, 1);
                self.cursor = usize::from(id) + 1;
                self.shared.sent.fetch_add(1, Ordering::SeqCst);
                notify = true;
            }
        }
        notify
    }

    /// Writes the DSP readiness words when they changed.
    fn publish_shm_masks(
        &mut self,
        words: &ControlWords,
        message_channels: Option<[ChannelId; 2]>,
    ) -> bool {
        let accepting = *self.shared.accepting.lock();
        let mut mask = 0u16;
        let mut msg = 0u16;
        for id in 0..self.wiring.channels.min(16) {
            if accepting & (1 << id) == 0 {
                continue;
            }
            match message_channels {
                Some([_, output]) if output == id => msg = 1,
                _ => mask |= 1 << id,
            }
        }
        let next = [u32::from(mask), u32::from(msg)];
        if next == self.mask_shadow {
            return false;
        }
        self.mask_shadow = next;
        words.write(Field::DSP_FREE_MASK, mask);
        words.write(Field::DSP_FREE_MSG, msg);
        true
    }

    fn step_hpi(&mut self, outbox: &mut Outbox) -> bool {
        let Personality::Hpi { layout, buffer_base, buffer_size, .. } = self.wiring.personality
        else {
            return false;
        };
        let mem = Arc::clone(&self.wiring.memory);
        let endian = self.wiring.endian;
        let gpp_token = mem.read_u32(endian, layout.handshake(Side::Gpp) as usize);
        let dsp_token = layout.handshake(Side::Dsp) as usize;
        let answered = mem.read_u32(endian, dsp_token) == DSP_HANDSHAKE;
        let answer = || mem.write_u32(endian, dsp_token, DSP_HANDSHAKE);
        if let Some(notify) = self.handshake(gpp_token, answered, answer, outbox) {
            return notify;
        }

        let field = |id: ChannelId, f: ChannelField| layout.channel(id, f) as usize;
        let mut notify = false;
        for id in 0..self.wiring.channels {
            let idx = usize::from(id);
            let raw = mem.read_u32(endian, field(id, ChannelField::Command));
            let buffer = buffer_base + u32::from(id) * buffer_size;
            let offered = if self.corrupt(id) { buffer + 1 } else { buffer };
            match (Command::from_raw(raw), self.slots[idx]) {
                (Some(Command::Read), DspSlot::Idle) => {
                    self.check_valid(id, mem.read_u32(endian, field(id, ChannelField::IsValid)));
                    let data = {
                        let mut outbound = self.shared.outbound.lock();
                        outbound[idx].pop_front()
                    };
                    let Some(mut data) = data else { continue };
                    data.truncate(buffer_size as usize);
                    mem.write(buffer as usize, &data);
                    mem.write_u32(endian, field(id, ChannelField::SharedBufPtr), offered);
                    mem.write_u32(endian, field(id, ChannelField::SharedBufSize), data.len() as u32);
                    mem.write_u32(endian, field(id, ChannelField::Command), Command::ReadAck as u32);
                    self.set_hpi_mask(id, true);
                    self.slots[idx] = DspSlot::Acked(Direction::Input);
                    self.shared.sent.fetch_add(1, Ordering::SeqCst);
                    notify = true;
                }
                (Some(Command::Write), DspSlot::Idle) => {
                    self.check_valid(id, mem.read_u32(endian, field(id, ChannelField::IsValid)));
                    if !self.accepting(id) {
                        continue;
                    }
                    mem.write_u32(endian, field(id, ChannelField::SharedBufPtr), offered);
                    mem.write_u32(endian, field(id, ChannelField::SharedBufSize), buffer_size);
                    mem.write_u32(endian, field(id, ChannelField::Command), Command::WriteAck as u32);
                    self.set_hpi_mask(id, true);
                    self.slots[idx] = DspSlot::Acked(Direction::Output);
                    notify = true;
                }
                (Some(Command::Done), DspSlot::Acked(dir)) => {
                    if dir == Direction::Output {
                        let size = mem.read_u32(endian, field(id, ChannelField::SharedBufSize));
                        let data = mem.snapshot(buffer as usize, size.min(buffer_size) as usize);
                        self.shared.received.fetch_add(1, Ordering::SeqCst);
                        self.firmware.on_receive(id, &data, outbox);
                    }
                    mem.write_u32(endian, field(id, ChannelField::Command), Command::Invalid as u32);
                    self.set_hpi_mask(id, false);
                    self.slots[idx] = DspSlot::Idle;
                    notify = true;
                }
                (Some(Command::Read | Command::Write), DspSlot::Acked(_)) => {
                    log::error!("sim-dsp: second command posted on channel {id}");
                    self.shared.violations.fetch_add(1, Ordering::SeqCst);
                }
                (None, _) => {
                    log::error!("sim-dsp: bad command {raw:#x} on channel {id}");
                    self.shared.violations.fetch_add(1, Ordering::SeqCst);
                }
                _ => {}
            }
        }
        if notify {
            let words = [
                (layout.mask(Side::Dsp, 0), self.mask_shadow[0]),
                (layout.mask(Side::Dsp, 32), self.mask_shadow[1]),
            ];
            for (addr, value) in words {
                mem.write_u32(endian, addr as usize, value);
            }
        }
        notify
    }

    fn check_valid(&self, id: ChannelId, is_valid: u32) {
        if is_valid != 1 {
            log::error!("sim-dsp: command on channel {id} without a valid client buffer");
            self.shared.violations.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn set_hpi_mask(&mut self, id: ChannelId, set: bool) {
        let word = &mut self.mask_shadow[usize::from(id / 32)];
        if set {
            *word |= mask_bit(id);
        } else {
            *word &= !mask_bit(id);
        }
    }
}
