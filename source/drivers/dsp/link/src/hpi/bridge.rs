// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Register-bridge access to DSP memory.
//!
//! Every access is an address write to HPIA followed by data-port accesses. The pair
//! must not interleave with another sequence, so each one runs with the GPP
//! interrupt masked and the bridge lock held.

use std::sync::Arc;

use nexus_hal::{Bus, Endianness, InterruptLine, IrqGuard};
use parking_lot::Mutex;

use crate::error::{LinkError, Result};

use super::layout::{Hpic, REG_HPIA, REG_HPIC, REG_HPID, REG_HPID_AUTO};

pub struct HpiBridge {
    bus: Arc<dyn Bus + Send + Sync>,
    irq: Arc<dyn InterruptLine>,
    endian: Endianness,
    lock: Mutex<()>,
}

impl HpiBridge {
    pub fn new(bus: Arc<dyn Bus + Send + Sync>, irq: Arc<dyn InterruptLine>, endian: Endianness) -> Self {
        Self { bus, irq, endian, lock: Mutex::new(()) }
    }

    pub fn read_word(&self, addr: u32) -> u32 {
        let _irq = IrqGuard::new(&*self.irq);
        let _bus = self.lock.lock();
        self.bus.write(REG_HPIA, addr);
        self.bus.read(REG_HPID)
    }

    pub fn write_word(&self, addr: u32, value: u32) {
        let _irq = IrqGuard::new(&*self.irq);
        let _bus = self.lock.lock();
        self.bus.write(REG_HPIA, addr);
        self.bus.write(REG_HPID, value);
    }

    /// Copies DSP memory at `addr` into `buf`.
    pub fn read_block(&self, addr: u32, buf: &mut [u8]) -> Result<()> {
        check_block(addr, buf.len())?;
        if buf.is_empty() {
            return Ok(());
        }
        let _irq = IrqGuard::new(&*self.irq);
        let _bus = self.lock.lock();
        self.bus.write(REG_HPIA, addr);
        for chunk in buf.chunks_mut(4) {
            let word = self.endian.u32_to(self.bus.read(REG_HPID_AUTO));
            chunk.copy_from_slice(&word[..chunk.len()]);
        }
        Ok(())
    }

    /// Copies `data` to DSP memory at `addr`, preserving the bytes after a trailing
    /// partial word.
    pub fn write_block(&self, addr: u32, data: &[u8]) -> Result<()> {
        check_block(addr, data.len())?;
        let _irq = IrqGuard::new(&*self.irq);
        let _bus = self.lock.lock();
        let mut words = data.chunks_exact(4);
        self.bus.write(REG_HPIA, addr);
        for chunk in words.by_ref() {
            let word = [chunk[0], chunk[1], chunk[2], chunk[3]];
            self.bus.write(REG_HPID_AUTO, self.endian.u32_from(word));
        }
        let tail = words.remainder();
        if !tail.is_empty() {
            let overflow = LinkError::Range { offset: addr as usize, len: data.len(), limit: LAST_ADDR };
            let tail_addr = u32::try_from(data.len() - tail.len())
                .ok()
                .and_then(|offset| addr.checked_add(offset))
                .ok_or(overflow)?;
            self.bus.write(REG_HPIA, tail_addr);
            let mut word = self.endian.u32_to(self.bus.read(REG_HPID));
            word[..tail.len()].copy_from_slice(tail);
            self.bus.write(REG_HPID, self.endian.u32_from(word));
        }
        Ok(())
    }

    pub fn zero(&self, addr: u32, len: u32) -> Result<()> {
        check_block(addr, len as usize)?;
        let _irq = IrqGuard::new(&*self.irq);
        let _bus = self.lock.lock();
        self.bus.write(REG_HPIA, addr);
        for _ in 0..len.div_ceil(4) {
            self.bus.write(REG_HPID_AUTO, 0);
        }
        Ok(())
    }

    /// Interrupts the DSP.
    pub fn raise_dsp(&self) {
        self.bus.write(REG_HPIC, Hpic::DSPINT.bits());
    }

    /// Clears the GPP interrupt status. Touches HPIC only, so it is safe from the ISR.
    pub fn acknowledge_host(&self) {
        self.bus.write(REG_HPIC, Hpic::HINT.bits());
    }
}

/// Size of the DSP address space reachable through HPIA.
const DSP_SPACE: u64 = 1 << 32;
const LAST_ADDR: usize = u32::MAX as usize;

/// Block addresses come from the DSP, so both ends are checked before HPIA is written.
fn check_block(addr: u32, len: usize) -> Result<()> {
    if addr % 4 != 0 {
        return Err(LinkError::InvalidArgument("HPI block address must be word aligned"));
    }
    if u64::from(addr).checked_add(len as u64).map_or(true, |end| end > DSP_SPACE) {
        return Err(LinkError::Range { offset: addr as usize, len, limit: LAST_ADDR });
    }
    Ok(())
}
