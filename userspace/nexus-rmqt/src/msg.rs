// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

use core::fmt;

use crate::wire::{MsgHeader, HEADER_SIZE};

/// A message owned by the application or in transit.
///
/// The buffer comes from the allocator named by [`Message::mqa_id`] and holds the
/// header area followed by the payload; it goes back to the same allocator through
/// [`crate::AllocatorTable::free`].
pub struct Message {
    header: MsgHeader,
    buf: Vec<u8>,
}

impl Message {
    /// `buf` must be at least [`HEADER_SIZE`] bytes.
    pub(crate) fn from_parts(header: MsgHeader, buf: Vec<u8>) -> Self {
        debug_assert!(buf.len() >= HEADER_SIZE);
        Self { header, buf }
    }

    pub(crate) fn into_parts(self) -> (MsgHeader, Vec<u8>) {
        (self.header, self.buf)
    }

    pub fn header(&self) -> &MsgHeader {
        &self.header
    }

    pub fn msg_id(&self) -> u16 {
        self.header.msg_id
    }

    pub fn set_msg_id(&mut self, id: u16) {
        self.header.msg_id = id;
    }

    pub fn src_id(&self) -> u16 {
        self.header.src_id
    }

    pub fn set_src_id(&mut self, id: u16) {
        self.header.src_id = id;
    }

    /// Queue the receiver should answer to.
    pub fn reply_id(&self) -> u16 {
        self.header.reply_id
    }

    pub fn set_reply_id(&mut self, id: u16) {
        self.header.reply_id = id;
    }

    pub fn dst_id(&self) -> u16 {
        self.header.dst_id
    }

    pub fn mqa_id(&self) -> u16 {
        self.header.mqa_id
    }

    /// Transport that delivered the message, or 0 for a local one.
    pub fn mqt_id(&self) -> u16 {
        self.header.mqt_id
    }

    /// Header plus payload, in bytes.
    pub fn frame_len(&self) -> usize {
        self.buf.len()
    }

    pub fn payload_len(&self) -> usize {
        self.buf.len() - HEADER_SIZE
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf[HEADER_SIZE..]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.buf[HEADER_SIZE..]
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("header", &self.header)
            .field("payload_len", &self.payload_len())
            .finish()
    }
}
