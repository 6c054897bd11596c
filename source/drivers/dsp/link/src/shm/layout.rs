// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Shared-memory control block and data regions.
//!
//! All control fields are 16-bit words in DSP byte order. Each word has exactly one
//! writer, except the two `*_full` flags which one side sets and the other clears.

use core::mem::{offset_of, size_of};
use std::sync::Arc;

use nexus_hal::{Endianness, SharedMemory};
use static_assertions::const_assert_eq;

use crate::config::ShmConfig;
use crate::error::{LinkError, Result};

/// Channel count limited by the width of the free masks.
pub const SHM_MAX_CHANNELS: u16 = 16;
/// Control block footprint, one cache line.
pub const CONTROL_SIZE: usize = 128;

#[repr(C)]
pub struct ShmControl {
    pub handshake_gpp: u16,
    pub handshake_dsp: u16,
    pub dsp_free_mask: u16,
    pub gpp_free_mask: u16,
    pub input_full: u16,
    pub input_id: u16,
    pub input_size: u16,
    pub output_full: u16,
    pub output_id: u16,
    pub output_size: u16,
    pub dsp_free_msg: u16,
    pub gpp_free_msg: u16,
    #[allow(dead_code)]
    reserved: [u16; 52],
}

const_assert_eq!(size_of::<ShmControl>(), CONTROL_SIZE);

/// Byte offset of a control word inside the control block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Field(usize);

impl Field {
    pub const HANDSHAKE_GPP: Self = Self(offset_of!(ShmControl, handshake_gpp));
    pub const HANDSHAKE_DSP: Self = Self(offset_of!(ShmControl, handshake_dsp));
    pub const DSP_FREE_MASK: Self = Self(offset_of!(ShmControl, dsp_free_mask));
    pub const GPP_FREE_MASK: Self = Self(offset_of!(ShmControl, gpp_free_mask));
    pub const INPUT_FULL: Self = Self(offset_of!(ShmControl, input_full));
    pub const INPUT_ID: Self = Self(offset_of!(ShmControl, input_id));
    pub const INPUT_SIZE: Self = Self(offset_of!(ShmControl, input_size));
    pub const OUTPUT_FULL: Self = Self(offset_of!(ShmControl, output_full));
    pub const OUTPUT_ID: Self = Self(offset_of!(ShmControl, output_id));
    pub const OUTPUT_SIZE: Self = Self(offset_of!(ShmControl, output_size));
    pub const DSP_FREE_MSG: Self = Self(offset_of!(ShmControl, dsp_free_msg));
    pub const GPP_FREE_MSG: Self = Self(offset_of!(ShmControl, gpp_free_msg));

    pub const fn offset(self) -> usize {
        self.0
    }
}

const_assert_eq!(Field::HANDSHAKE_GPP.0, 0x00);
const_assert_eq!(Field::DSP_FREE_MASK.0, 0x04);
const_assert_eq!(Field::INPUT_FULL.0, 0x08);
const_assert_eq!(Field::OUTPUT_FULL.0, 0x0E);
const_assert_eq!(Field::GPP_FREE_MSG.0, 0x16);

/// Placement of the control block and the two data regions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShmLayout {
    pub control: usize,
    /// DSP to GPP data region.
    pub input: usize,
    /// GPP to DSP data region.
    pub output: usize,
    pub data_size: usize,
}

impl ShmLayout {
    pub fn new(cfg: &ShmConfig) -> Self {
        let input = cfg.control_offset + CONTROL_SIZE;
        Self {
            control: cfg.control_offset,
            input,
            output: input + cfg.data_size,
            data_size: cfg.data_size,
        }
    }

    pub fn end(&self) -> usize {
        self.output + self.data_size
    }

    pub fn check(&self, region: usize) -> Result<()> {
        if self.end() > region {
            return Err(LinkError::Range {
                offset: self.control,
                len: self.end() - self.control,
                limit: region,
            });
        }
        Ok(())
    }
}

/// Typed access to the 16-bit control words.
#[derive(Clone)]
pub struct ControlWords {
    mem: Arc<dyn SharedMemory>,
    base: usize,
    endian: Endianness,
}

impl ControlWords {
    pub fn new(mem: Arc<dyn SharedMemory>, base: usize, endian: Endianness) -> Self {
        Self { mem, base, endian }
    }

    pub fn read(&self, field: Field) -> u16 {
        let mut raw = [0u8; 2];
        self.mem.read(self.base + field.0, &mut raw);
        self.endian.u16_from(raw)
    }

    pub fn write(&self, field: Field, value: u16) {
        self.mem.write(self.base + field.0, &self.endian.u16_to(value));
    }

    pub fn clear_all(&self) {
        self.mem.fill(self.base, CONTROL_SIZE, 0);
    }
}
