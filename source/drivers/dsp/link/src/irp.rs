// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! I/O request packets.
//!
//! An [`Irp`] owns its buffer from submission until completion. The buffer travels
//! back to the client inside the [`IrpCompletion`]; no driver keeps a reference to it
//! afterwards.

use core::fmt;

use crate::error::LinkError;

/// Logical channel number on a link.
pub type ChannelId = u16;

/// Transfer direction as seen from the GPP.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    /// DSP to GPP.
    Input,
    /// GPP to DSP.
    Output,
}

/// Completion callback attached to an [`Irp`].
pub type CompletionFn = Box<dyn FnOnce(IrpCompletion) + Send>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IrpStatus {
    Completed,
    /// Zero-length transfer; the channel is now at end of stream.
    EndOfStream,
    /// Drained by close or cancel before any data moved.
    Cancelled,
    Error,
}

pub struct Irp {
    buffer: Vec<u8>,
    size: usize,
    arg: u32,
    callback: Option<CompletionFn>,
}

impl Irp {
    /// Receive request for up to `capacity` bytes.
    pub fn read(capacity: usize) -> Self {
        Self::with_buffer(vec![0; capacity], capacity)
    }

    /// Send request carrying all of `data`.
    pub fn write(data: Vec<u8>) -> Self {
        let size = data.len();
        Self::with_buffer(data, size)
    }

    /// Request over `buffer` limited to its first `size` bytes.
    pub fn with_buffer(buffer: Vec<u8>, size: usize) -> Self {
        Self { buffer, size, arg: 0, callback: None }
    }

    pub fn with_arg(mut self, arg: u32) -> Self {
        self.arg = arg;
        self
    }

    /// Delivers the completion to `f` on the deferred-work context instead of the
    /// channel's completion queue.
    pub fn on_complete(mut self, f: impl FnOnce(IrpCompletion) + Send + 'static) -> Self {
        self.callback = Some(Box::new(f));
        self
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn arg(&self) -> u32 {
        self.arg
    }

    pub fn has_callback(&self) -> bool {
        self.callback.is_some()
    }

    /// Bytes to send (output) or the receive window (input).
    pub fn data(&self) -> &[u8] {
        &self.buffer[..self.size]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[..self.size]
    }

    /// Takes the buffer back out of a request that was never completed.
    pub fn into_buffer(self) -> Vec<u8> {
        self.buffer
    }

    pub(crate) fn is_well_formed(&self) -> bool {
        self.size <= self.buffer.len()
    }

    pub(crate) fn finish(
        self,
        channel: ChannelId,
        transferred: usize,
        status: IrpStatus,
    ) -> (IrpCompletion, Option<CompletionFn>) {
        let completion =
            IrpCompletion { channel, buffer: self.buffer, transferred, status, arg: self.arg };
        (completion, self.callback)
    }
}

impl fmt::Debug for Irp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Irp")
            .field("size", &self.size)
            .field("capacity", &self.buffer.len())
            .field("arg", &self.arg)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

/// A request the channel refused, handed back together with the reason.
#[derive(Debug)]
pub struct Rejected {
    pub error: LinkError,
    pub irp: Irp,
}

impl From<Rejected> for LinkError {
    fn from(rejected: Rejected) -> Self {
        rejected.error
    }
}

/// Result of a finished [`Irp`]; hands the buffer back to the client.
#[derive(Debug)]
pub struct IrpCompletion {
    pub channel: ChannelId,
    pub buffer: Vec<u8>,
    pub transferred: usize,
    pub status: IrpStatus,
    pub arg: u32,
}

impl IrpCompletion {
    /// The bytes that crossed the link.
    pub fn data(&self) -> &[u8] {
        &self.buffer[..self.transferred.min(self.buffer.len())]
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.status == IrpStatus::EndOfStream
    }
}
