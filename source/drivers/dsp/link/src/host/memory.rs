// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

use nexus_hal::{Endianness, SharedMemory};
use parking_lot::Mutex;

/// Heap-backed memory shared by the simulated GPP and DSP.
pub struct SimMemory {
    bytes: Mutex<Vec<u8>>,
}

impl SimMemory {
    pub fn new(size: usize) -> Self {
        Self { bytes: Mutex::new(vec![0; size]) }
    }

    pub fn read_u16(&self, endian: Endianness, offset: usize) -> u16 {
        let mut raw = [0u8; 2];
        self.read(offset, &mut raw);
        endian.u16_from(raw)
    }

    pub fn write_u16(&self, endian: Endianness, offset: usize, value: u16) {
        self.write(offset, &endian.u16_to(value));
    }

    pub fn read_u32(&self, endian: Endianness, offset: usize) -> u32 {
        let mut raw = [0u8; 4];
        self.read(offset, &mut raw);
        endian.u32_from(raw)
    }

    pub fn write_u32(&self, endian: Endianness, offset: usize, value: u32) {
        self.write(offset, &endian.u32_to(value));
    }

    pub fn snapshot(&self, offset: usize, len: usize) -> Vec<u8> {
        let mut out = vec![0; len];
        self.read(offset, &mut out);
        out
    }
}

impl SharedMemory for SimMemory {
    fn size(&self) -> usize {
        self.bytes.lock().len()
    }

    fn read(&self, offset: usize, buf: &mut [u8]) {
        buf.copy_from_slice(&self.bytes.lock()[offset..offset + buf.len()]);
    }

    fn write(&self, offset: usize, data: &[u8]) {
        self.bytes.lock()[offset..offset + data.len()].copy_from_slice(data);
    }
}
