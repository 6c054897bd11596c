// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! HPI register map and the DSP-resident control structures.

use core::mem::{offset_of, size_of};

use bitflags::bitflags;
use static_assertions::const_assert_eq;

use crate::error::{LinkError, Result};

/// Two 32-bit mask words.
pub const HPI_MAX_CHANNELS: u16 = 64;
pub const CACHE_LINE: u32 = 128;

// Register offsets inside the bridge window (bytes).
pub const REG_HPIC: usize = 0x00;
pub const REG_HPIA: usize = 0x04;
/// Data port with address post-increment.
pub const REG_HPID_AUTO: usize = 0x08;
pub const REG_HPID: usize = 0x0C;

bitflags! {
    /// HPI control register bits. Status bits are write-one-to-clear.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Hpic: u32 {
        /// Raises the DSP interrupt.
        const DSPINT = 1 << 1;
        /// GPP interrupt pending.
        const HINT = 1 << 2;
    }
}

/// Handshake token and readiness masks written by one processor.
#[repr(C)]
pub struct HpiControl {
    pub handshake: u32,
    pub mask: [u32; 2],
    #[allow(dead_code)]
    reserved: [u32; 29],
}

const_assert_eq!(size_of::<HpiControl>(), CACHE_LINE as usize);

#[repr(C)]
pub struct HpiChannelInfo {
    pub command: u32,
    pub is_valid: u32,
    pub shared_buf_ptr: u32,
    pub shared_buf_size: u32,
    pub client_buf_ptr: u32,
    pub client_buf_size: u32,
    #[allow(dead_code)]
    reserved: [u32; 26],
}

const_assert_eq!(size_of::<HpiChannelInfo>(), CACHE_LINE as usize);

/// Per-channel command word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum Command {
    Invalid = 0,
    Read = 1,
    Write = 2,
    ReadAck = 3,
    WriteAck = 4,
    Done = 5,
}

impl Command {
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Self::Invalid,
            1 => Self::Read,
            2 => Self::Write,
            3 => Self::ReadAck,
            4 => Self::WriteAck,
            5 => Self::Done,
            _ => return None,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelField {
    Command,
    IsValid,
    SharedBufPtr,
    SharedBufSize,
    ClientBufPtr,
    ClientBufSize,
}

impl ChannelField {
    const fn offset(self) -> u32 {
        (match self {
            Self::Command => offset_of!(HpiChannelInfo, command),
            Self::IsValid => offset_of!(HpiChannelInfo, is_valid),
            Self::SharedBufPtr => offset_of!(HpiChannelInfo, shared_buf_ptr),
            Self::SharedBufSize => offset_of!(HpiChannelInfo, shared_buf_size),
            Self::ClientBufPtr => offset_of!(HpiChannelInfo, client_buf_ptr),
            Self::ClientBufSize => offset_of!(HpiChannelInfo, client_buf_size),
        }) as u32
    }
}

/// Which half of the control area.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    Gpp,
    Dsp,
}

/// DSP addresses of the control structures rooted at `control_addr`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HpiLayout {
    pub control_addr: u32,
    pub channels: u16,
}

impl HpiLayout {
    pub fn new(control_addr: u32, channels: u16) -> Self {
        Self { control_addr, channels }
    }

    fn control(&self, side: Side) -> u32 {
        match side {
            Side::Gpp => self.control_addr,
            Side::Dsp => self.control_addr + CACHE_LINE,
        }
    }

    pub fn handshake(&self, side: Side) -> u32 {
        self.control(side) + offset_of!(HpiControl, handshake) as u32
    }

    /// Mask word holding bit `id % 32`.
    pub fn mask(&self, side: Side, id: u16) -> u32 {
        self.control(side) + offset_of!(HpiControl, mask) as u32 + 4 * u32::from(id / 32)
    }

    pub fn channel(&self, id: u16, field: ChannelField) -> u32 {
        self.control_addr + 2 * CACHE_LINE + u32::from(id) * CACHE_LINE + field.offset()
    }

    /// First address past the channel table.
    pub fn end(&self) -> u32 {
        self.control_addr + self.span()
    }

    /// Bytes from `control_addr` to the end of the channel table.
    pub fn span(&self) -> u32 {
        2 * CACHE_LINE + u32::from(self.channels) * CACHE_LINE
    }

    /// Fails when the channel table would run past the 32-bit DSP address space.
    pub fn check(&self) -> Result<()> {
        match self.control_addr.checked_add(self.span()) {
            Some(_) => Ok(()),
            None => Err(LinkError::Range {
                offset: self.control_addr as usize,
                len: self.span() as usize,
                limit: u32::MAX as usize,
            }),
        }
    }
}

pub const fn mask_bit(id: u16) -> u32 {
    1 << (id % 32)
}
