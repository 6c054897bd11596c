// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Simulated HPI register window over the DSP memory.

use std::sync::Arc;

use nexus_hal::{Bus, Endianness, SharedMemory};
use parking_lot::Mutex;

use crate::hpi::layout::{Hpic, REG_HPIA, REG_HPIC, REG_HPID, REG_HPID_AUTO};

use super::irq::{Doorbell, SimInterrupt};
use super::memory::SimMemory;

struct Regs {
    hpia: u32,
    hpic: Hpic,
}

pub struct SimHpiBus {
    memory: Arc<SimMemory>,
    endian: Endianness,
    regs: Mutex<Regs>,
    dsp: Arc<Doorbell>,
    gpp: Arc<SimInterrupt>,
}

impl SimHpiBus {
    pub fn new(
        memory: Arc<SimMemory>,
        endian: Endianness,
        dsp: Arc<Doorbell>,
        gpp: Arc<SimInterrupt>,
    ) -> Self {
        Self { memory, endian, regs: Mutex::new(Regs { hpia: 0, hpic: Hpic::empty() }), dsp, gpp }
    }

    /// DSP side: latch HINT and interrupt the GPP.
    pub fn raise_host(&self) {
        self.regs.lock().hpic.insert(Hpic::HINT);
        self.gpp.trigger();
    }

    pub fn host_pending(&self) -> bool {
        self.regs.lock().hpic.contains(Hpic::HINT)
    }

    fn in_range(&self, addr: u32) -> bool {
        let ok = (addr as usize).checked_add(4).is_some_and(|end| end <= self.memory.size());
        if !ok {
            log::error!("hpi-sim: access at {addr:#x} outside DSP memory");
        }
        ok
    }

    fn load(&self, addr: u32) -> u32 {
        if self.in_range(addr) {
            self.memory.read_u32(self.endian, addr as usize)
        } else {
            0
        }
    }

    fn store(&self, addr: u32, value: u32) {
        if self.in_range(addr) {
            self.memory.write_u32(self.endian, addr as usize, value);
        }
    }
}

impl Bus for SimHpiBus {
    fn read(&self, addr: usize) -> u32 {
        let mut regs = self.regs.lock();
        match addr {
            REG_HPIC => regs.hpic.bits(),
            REG_HPIA => regs.hpia,
            REG_HPID => self.load(regs.hpia),
            REG_HPID_AUTO => {
                let value = self.load(regs.hpia);
                regs.hpia = regs.hpia.wrapping_add(4);
                value
            }
            _ => 0,
        }
    }

    fn write(&self, addr: usize, value: u32) {
        let mut regs = self.regs.lock();
        match addr {
            REG_HPIC => {
                let bits = Hpic::from_bits_truncate(value);
                if bits.contains(Hpic::HINT) {
                    regs.hpic.remove(Hpic::HINT);
                }
                if bits.contains(Hpic::DSPINT) {
                    drop(regs);
                    self.dsp.ring();
                }
            }
            REG_HPIA => regs.hpia = value,
            REG_HPID => self.store(regs.hpia, value),
            REG_HPID_AUTO => {
                self.store(regs.hpia, value);
                regs.hpia = regs.hpia.wrapping_add(4);
            }
            _ => {}
        }
    }
}
