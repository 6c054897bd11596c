// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Message wire format. Every field is stored in DSP byte order.
//!
//! ```text
//! header (16 bytes):  mqt_id size dst_id src_id mqa_id msg_id reply_id flags   (u16 each)
//! control (24 bytes): queue_id:u16 mqa_id:u16 timeout:u32 reply_handle:u32
//!                     arg:u32 sem_handle:u32 msgq_found:u16 pad:u16
//! ```
//!
//! `size` counts DSP words and covers header plus payload.

use core::fmt;
use core::mem::{offset_of, size_of};

use nexus_hal::Endianness;
use static_assertions::const_assert_eq;

/// Destination id of transport control traffic.
pub const CONTROL_DST: u16 = 0xFFFF;
/// Control message ids.
pub const LOCATE: u16 = 0xFF00;
pub const LOCATE_ACK: u16 = 0xFF01;
pub const EXIT: u16 = 0xFF02;

/// `arg` of an `EXIT` control message.
pub const EXIT_REQUEST: u32 = 0;
pub const EXIT_ACK: u32 = 1;

#[repr(C)]
pub struct RawHeader {
    pub mqt_id: u16,
    pub size: u16,
    pub dst_id: u16,
    pub src_id: u16,
    pub mqa_id: u16,
    pub msg_id: u16,
    pub reply_id: u16,
    pub flags: u16,
}

#[repr(C)]
pub struct RawControl {
    pub queue_id: u16,
    pub mqa_id: u16,
    pub timeout: u32,
    pub reply_handle: u32,
    pub arg: u32,
    pub sem_handle: u32,
    pub msgq_found: u16,
    pub pad: u16,
}

pub const HEADER_SIZE: usize = size_of::<RawHeader>();
pub const CONTROL_SIZE: usize = size_of::<RawControl>();
/// Bytes of a complete control message.
pub const CONTROL_MSG_SIZE: usize = HEADER_SIZE + CONTROL_SIZE;

const_assert_eq!(HEADER_SIZE, 16);
const_assert_eq!(CONTROL_SIZE, 24);
const_assert_eq!(offset_of!(RawControl, sem_handle), 16);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WireError {
    /// Buffer shorter than the structure or the declared size.
    Truncated { need: usize, have: usize },
    /// Byte count that is not a whole number of DSP words.
    NotWordMultiple { bytes: usize, word_size: usize },
    /// Size does not fit the 16-bit word count.
    TooLarge(usize),
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated { need, have } => write!(f, "need {need} bytes, have {have}"),
            Self::NotWordMultiple { bytes, word_size } => {
                write!(f, "{bytes} bytes is not a multiple of the {word_size}-byte word")
            }
            Self::TooLarge(bytes) => write!(f, "{bytes} bytes exceed the wire size field"),
        }
    }
}

impl std::error::Error for WireError {}

/// Converts a byte count to the word count carried on the wire.
pub fn bytes_to_words(bytes: usize, word_size: usize) -> Result<u16, WireError> {
    if bytes % word_size != 0 {
        return Err(WireError::NotWordMultiple { bytes, word_size });
    }
    u16::try_from(bytes / word_size).map_err(|_| WireError::TooLarge(bytes))
}

pub fn words_to_bytes(words: u16, word_size: usize) -> usize {
    usize::from(words) * word_size
}

fn check_len(buf: &[u8], need: usize) -> Result<(), WireError> {
    if buf.len() < need {
        return Err(WireError::Truncated { need, have: buf.len() });
    }
    Ok(())
}

fn get_u16(endian: Endianness, buf: &[u8], off: usize) -> u16 {
    endian.u16_from([buf[off], buf[off + 1]])
}

fn get_u32(endian: Endianness, buf: &[u8], off: usize) -> u32 {
    endian.u32_from([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn put_u16(endian: Endianness, buf: &mut [u8], off: usize, value: u16) {
    buf[off..off + 2].copy_from_slice(&endian.u16_to(value));
}

fn put_u32(endian: Endianness, buf: &mut [u8], off: usize, value: u32) {
    buf[off..off + 4].copy_from_slice(&endian.u32_to(value));
}

/// Decoded message header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MsgHeader {
    /// Transport the message last crossed.
    pub mqt_id: u16,
    pub size_words: u16,
    pub dst_id: u16,
    pub src_id: u16,
    pub mqa_id: u16,
    pub msg_id: u16,
    pub reply_id: u16,
    pub flags: u16,
}

impl MsgHeader {
    pub fn encode(&self, endian: Endianness, buf: &mut [u8]) -> Result<(), WireError> {
        check_len(buf, HEADER_SIZE)?;
        put_u16(endian, buf, offset_of!(RawHeader, mqt_id), self.mqt_id);
        put_u16(endian, buf, offset_of!(RawHeader, size), self.size_words);
        put_u16(endian, buf, offset_of!(RawHeader, dst_id), self.dst_id);
        put_u16(endian, buf, offset_of!(RawHeader, src_id), self.src_id);
        put_u16(endian, buf, offset_of!(RawHeader, mqa_id), self.mqa_id);
        put_u16(endian, buf, offset_of!(RawHeader, msg_id), self.msg_id);
        put_u16(endian, buf, offset_of!(RawHeader, reply_id), self.reply_id);
        put_u16(endian, buf, offset_of!(RawHeader, flags), self.flags);
        Ok(())
    }

    pub fn decode(endian: Endianness, buf: &[u8]) -> Result<Self, WireError> {
        check_len(buf, HEADER_SIZE)?;
        Ok(Self {
            mqt_id: get_u16(endian, buf, offset_of!(RawHeader, mqt_id)),
            size_words: get_u16(endian, buf, offset_of!(RawHeader, size)),
            dst_id: get_u16(endian, buf, offset_of!(RawHeader, dst_id)),
            src_id: get_u16(endian, buf, offset_of!(RawHeader, src_id)),
            mqa_id: get_u16(endian, buf, offset_of!(RawHeader, mqa_id)),
            msg_id: get_u16(endian, buf, offset_of!(RawHeader, msg_id)),
            reply_id: get_u16(endian, buf, offset_of!(RawHeader, reply_id)),
            flags: get_u16(endian, buf, offset_of!(RawHeader, flags)),
        })
    }

    pub fn is_control(&self) -> bool {
        self.dst_id == CONTROL_DST
    }
}

/// Body of `LOCATE`, `LOCATE_ACK` and `EXIT` messages.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ControlBody {
    pub queue_id: u16,
    pub mqa_id: u16,
    pub timeout: u32,
    pub reply_handle: u32,
    pub arg: u32,
    pub sem_handle: u32,
    pub msgq_found: bool,
}

impl ControlBody {
    /// Encodes into `buf`, which starts right after the header.
    pub fn encode(&self, endian: Endianness, buf: &mut [u8]) -> Result<(), WireError> {
        check_len(buf, CONTROL_SIZE)?;
        put_u16(endian, buf, offset_of!(RawControl, queue_id), self.queue_id);
        put_u16(endian, buf, offset_of!(RawControl, mqa_id), self.mqa_id);
        put_u32(endian, buf, offset_of!(RawControl, timeout), self.timeout);
        put_u32(endian, buf, offset_of!(RawControl, reply_handle), self.reply_handle);
        put_u32(endian, buf, offset_of!(RawControl, arg), self.arg);
        put_u32(endian, buf, offset_of!(RawControl, sem_handle), self.sem_handle);
        put_u16(endian, buf, offset_of!(RawControl, msgq_found), u16::from(self.msgq_found));
        put_u16(endian, buf, offset_of!(RawControl, pad), 0);
        Ok(())
    }

    pub fn decode(endian: Endianness, buf: &[u8]) -> Result<Self, WireError> {
        check_len(buf, CONTROL_SIZE)?;
        Ok(Self {
            queue_id: get_u16(endian, buf, offset_of!(RawControl, queue_id)),
            mqa_id: get_u16(endian, buf, offset_of!(RawControl, mqa_id)),
            timeout: get_u32(endian, buf, offset_of!(RawControl, timeout)),
            reply_handle: get_u32(endian, buf, offset_of!(RawControl, reply_handle)),
            arg: get_u32(endian, buf, offset_of!(RawControl, arg)),
            sem_handle: get_u32(endian, buf, offset_of!(RawControl, sem_handle)),
            msgq_found: get_u16(endian, buf, offset_of!(RawControl, msgq_found)) != 0,
        })
    }
}
