// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), no_std)]

//! CONTEXT: Hardware access traits shared by the GPP<->DSP link drivers
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: Unit tests + `tests/endianness.rs`
//!
//! PUBLIC API:
//!   - `Bus`: 32-bit register window (HPI register bridge)
//!   - `SharedMemory`: byte-addressable region visible to both processors
//!   - `InterruptLine`: GPP interrupt registration plus the peer doorbell
//!   - `IrqGuard`: scoped interrupt masking for task-context register sequences
//!   - `Endianness`: DSP byte order helpers for control words and loader sections

extern crate alloc;

use alloc::sync::Arc;
use core::fmt;

/// Basic bus access trait shared by user drivers.
///
/// `addr` is a register offset inside the bridge window.
pub trait Bus {
    fn read(&self, addr: usize) -> u32;
    fn write(&self, addr: usize, value: u32);
}

/// Memory region mapped into both address spaces.
///
/// Offsets are relative to the start of the region. Implementations panic on
/// out-of-range access; drivers validate their layout against [`SharedMemory::size`]
/// before touching the region.
pub trait SharedMemory: Send + Sync {
    fn size(&self) -> usize;
    fn read(&self, offset: usize, buf: &mut [u8]);
    fn write(&self, offset: usize, data: &[u8]);

    fn fill(&self, offset: usize, len: usize, value: u8) {
        const CHUNK: usize = 256;
        let block = [value; CHUNK];
        let mut done = 0;
        while done < len {
            let n = core::cmp::min(CHUNK, len - done);
            self.write(offset + done, &block[..n]);
            done += n;
        }
    }
}

/// Interrupt service routine installed on an [`InterruptLine`].
pub type IsrHandler = Arc<dyn Fn() + Send + Sync>;

/// Errors reported by HAL implementations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HalError {
    /// A handler is already installed on the line.
    AlreadyInstalled,
    /// The operation requires an installed handler.
    NotInstalled,
    /// Access outside the mapped window.
    OutOfRange { offset: usize, len: usize },
}

impl fmt::Display for HalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyInstalled => write!(f, "interrupt handler already installed"),
            Self::NotInstalled => write!(f, "no interrupt handler installed"),
            Self::OutOfRange { offset, len } => {
                write!(f, "access out of range (offset {offset:#x}, len {len})")
            }
        }
    }
}

/// GPP-side interrupt line of a link plus the doorbell towards the DSP.
pub trait InterruptLine: Send + Sync {
    fn install(&self, handler: IsrHandler) -> Result<(), HalError>;
    fn uninstall(&self);
    fn enable(&self);
    fn disable(&self);
    /// Clears the pending interrupt source.
    fn clear(&self);
    /// Interrupts the peer processor.
    fn raise_peer(&self);
}

/// Masks an interrupt line for the lifetime of the guard.
pub struct IrqGuard<'a> {
    line: &'a dyn InterruptLine,
}

impl<'a> IrqGuard<'a> {
    pub fn new(line: &'a dyn InterruptLine) -> Self {
        line.disable();
        Self { line }
    }
}

impl Drop for IrqGuard<'_> {
    fn drop(&mut self) {
        self.line.enable();
    }
}

/// Byte order of the DSP memory system.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Endianness {
    #[default]
    Little,
    Big,
}

impl Endianness {
    /// Byte order of the processor running this code.
    pub const fn host() -> Self {
        if cfg!(target_endian = "big") {
            Self::Big
        } else {
            Self::Little
        }
    }

    pub fn u16_from(self, bytes: [u8; 2]) -> u16 {
        match self {
            Self::Little => u16::from_le_bytes(bytes),
            Self::Big => u16::from_be_bytes(bytes),
        }
    }

    pub fn u16_to(self, value: u16) -> [u8; 2] {
        match self {
            Self::Little => value.to_le_bytes(),
            Self::Big => value.to_be_bytes(),
        }
    }

    pub fn u32_from(self, bytes: [u8; 4]) -> u32 {
        match self {
            Self::Little => u32::from_le_bytes(bytes),
            Self::Big => u32::from_be_bytes(bytes),
        }
    }

    pub fn u32_to(self, value: u32) -> [u8; 4] {
        match self {
            Self::Little => value.to_le_bytes(),
            Self::Big => value.to_be_bytes(),
        }
    }

    /// Reverses the byte order of every `width`-byte element of `data` when `self`
    /// differs from `other`. A trailing partial element is left untouched.
    pub fn convert_elements(self, other: Endianness, width: usize, data: &mut [u8]) {
        if self == other || width < 2 {
            return;
        }
        for chunk in data.chunks_exact_mut(width) {
            chunk.reverse();
        }
    }
}
