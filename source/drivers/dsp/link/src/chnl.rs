// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Channel manager: per-channel state machine and IRP queues.
//!
//! Each channel is `Closed -> Ready <-> Running` with an orthogonal end-of-stream
//! flag. `Running` means at least one IRP is queued. Requests complete strictly in
//! submission order.
//!
//! Lock order: channel, then driver state such as slots or the output cursor.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use nexus_sync::Wait;
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::error::{LinkError, Result};
use crate::irp::{ChannelId, CompletionFn, Direction, Irp, IrpCompletion, IrpStatus, Rejected};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    Closed,
    Ready,
    Running,
}

/// What the link must do after a driver accepted a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoKick {
    None,
    /// Run the deferred work; the transfer is performed there.
    Schedule,
}

struct ChannelObject {
    state: ChannelState,
    direction: Direction,
    eos: bool,
    pending: VecDeque<Irp>,
    completed: VecDeque<IrpCompletion>,
}

impl ChannelObject {
    const fn closed() -> Self {
        Self {
            state: ChannelState::Closed,
            direction: Direction::Input,
            eos: false,
            pending: VecDeque::new(),
            completed: VecDeque::new(),
        }
    }
}

struct ChannelSlot {
    obj: Mutex<ChannelObject>,
    cv: Condvar,
}

/// A completion whose callback runs once every channel lock is released.
pub struct Delivery {
    completion: IrpCompletion,
    callback: CompletionFn,
}

impl Delivery {
    pub fn deliver(self) {
        (self.callback)(self.completion);
    }
}

/// Locked view of one channel handed to link drivers.
pub struct ChannelGuard<'a> {
    id: ChannelId,
    obj: MutexGuard<'a, ChannelObject>,
    cv: &'a Condvar,
    completions: &'a AtomicU64,
}

impl ChannelGuard<'_> {
    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn state(&self) -> ChannelState {
        self.obj.state
    }

    pub fn is_open(&self) -> bool {
        self.obj.state != ChannelState::Closed
    }

    pub fn direction(&self) -> Direction {
        self.obj.direction
    }

    pub fn has_pending(&self) -> bool {
        !self.obj.pending.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.obj.pending.len()
    }

    /// Oldest queued request, the only one a driver may bind.
    pub fn head(&self) -> Option<&Irp> {
        self.obj.pending.front()
    }

    pub fn head_mut(&mut self) -> Option<&mut Irp> {
        self.obj.pending.front_mut()
    }

    /// Completes the head request with `transferred` bytes.
    ///
    /// A zero-length transfer marks end of stream. Requests without a callback are
    /// queued for [`ChannelManager::get_io_completion`]; the rest are returned for
    /// delivery outside the lock.
    pub fn complete_head(&mut self, transferred: usize) -> Option<Delivery> {
        let irp = self.obj.pending.pop_front()?;
        let status = if transferred == 0 {
            if self.obj.eos {
                log::warn!("chnl {}: second end of stream from the peer", self.id);
            }
            self.obj.eos = true;
            IrpStatus::EndOfStream
        } else {
            IrpStatus::Completed
        };
        if self.obj.pending.is_empty() && self.obj.state == ChannelState::Running {
            self.obj.state = ChannelState::Ready;
        }
        self.completions.fetch_add(1, Ordering::Relaxed);
        log::trace!("chnl {}: completed {transferred} bytes ({status:?})", self.id);
        self.route(irp, transferred, status)
    }

    /// Fails every queued request with [`IrpStatus::Error`] after a transfer on this
    /// channel went wrong. The channel stays open; other channels are unaffected.
    pub fn fail_pending(&mut self, out: &mut Vec<Delivery>) -> usize {
        let failed: Vec<Irp> = self.obj.pending.drain(..).collect();
        if self.obj.state == ChannelState::Running {
            self.obj.state = ChannelState::Ready;
        }
        let count = failed.len();
        for irp in failed {
            out.extend(self.route(irp, 0, IrpStatus::Error));
        }
        log::warn!("chnl {}: {count} requests failed", self.id);
        count
    }

    fn route(&mut self, irp: Irp, transferred: usize, status: IrpStatus) -> Option<Delivery> {
        let (completion, callback) = irp.finish(self.id, transferred, status);
        match callback {
            Some(callback) => Some(Delivery { completion, callback }),
            None => {
                self.obj.completed.push_back(completion);
                self.cv.notify_all();
                None
            }
        }
    }

    /// Moves the channel to `Closed`, returning everything it still holds.
    fn shutdown(&mut self) -> Vec<IrpCompletion> {
        let mut drained: Vec<IrpCompletion> = self.obj.completed.drain(..).collect();
        drained.extend(self.obj.pending.drain(..).map(|irp| {
            // Callbacks of drained requests are dropped without being called.
            irp.finish(self.id, 0, IrpStatus::Cancelled).0
        }));
        self.obj.state = ChannelState::Closed;
        self.obj.eos = false;
        self.cv.notify_all();
        drained
    }
}

/// Table of channels for one link.
pub struct ChannelManager {
    slots: Box<[ChannelSlot]>,
    completions: AtomicU64,
}

impl ChannelManager {
    pub fn new(max_channels: u16) -> Self {
        let slots = (0..max_channels)
            .map(|_| ChannelSlot { obj: Mutex::new(ChannelObject::closed()), cv: Condvar::new() })
            .collect();
        Self { slots, completions: AtomicU64::new(0) }
    }

    pub fn channel_count(&self) -> u16 {
        self.slots.len() as u16
    }

    /// Total requests completed with data or end of stream.
    pub fn completions(&self) -> u64 {
        self.completions.load(Ordering::Relaxed)
    }

    pub fn lock(&self, id: ChannelId) -> Result<ChannelGuard<'_>> {
        let slot =
            self.slots.get(usize::from(id)).ok_or(LinkError::InvalidArgument("channel id"))?;
        Ok(ChannelGuard { id, obj: slot.obj.lock(), cv: &slot.cv, completions: &self.completions })
    }

    /// `Closed -> Ready`. `prepare` runs under the channel lock before the transition.
    pub fn open(
        &self,
        id: ChannelId,
        direction: Direction,
        prepare: impl FnOnce(&mut ChannelGuard<'_>) -> Result<()>,
    ) -> Result<()> {
        let mut ch = self.lock(id)?;
        if ch.is_open() {
            return Err(LinkError::InvalidState("channel already open"));
        }
        prepare(&mut ch)?;
        ch.obj.direction = direction;
        ch.obj.eos = false;
        ch.obj.state = ChannelState::Ready;
        log::debug!("chnl {id}: open ({direction:?})");
        Ok(())
    }

    /// Any state to `Closed`. `release` runs under the channel lock first; queued
    /// requests come back with [`IrpStatus::Cancelled`].
    pub fn close(
        &self,
        id: ChannelId,
        release: impl FnOnce(&mut ChannelGuard<'_>) -> Result<()>,
    ) -> Result<Vec<IrpCompletion>> {
        let mut ch = self.lock(id)?;
        let released = release(&mut ch);
        let drained = ch.shutdown();
        log::debug!("chnl {id}: closed, {} requests drained", drained.len());
        released.map(|()| drained)
    }

    /// Queues `irp`; `kick` runs under the channel lock when it is the only pending
    /// request. Output requests larger than `max_output` are refused. A refused
    /// request comes back inside the error.
    pub fn add_io_request(
        &self,
        id: ChannelId,
        irp: Irp,
        max_output: usize,
        kick: impl FnOnce(&mut ChannelGuard<'_>) -> Result<IoKick>,
    ) -> core::result::Result<IoKick, Rejected> {
        let mut ch = match self.lock(id) {
            Ok(ch) => ch,
            Err(error) => return Err(Rejected { error, irp }),
        };
        if let Err(error) = Self::admit(&ch, &irp, max_output) {
            return Err(Rejected { error, irp });
        }
        ch.obj.pending.push_back(irp);
        ch.obj.state = ChannelState::Running;
        if ch.obj.pending.len() > 1 {
            return Ok(IoKick::None);
        }
        match kick(&mut ch) {
            Ok(next) => Ok(next),
            Err(error) => {
                ch.obj.state = ChannelState::Ready;
                match ch.obj.pending.pop_back() {
                    Some(irp) => Err(Rejected { error, irp }),
                    None => Err(Rejected { error, irp: Irp::read(0) }),
                }
            }
        }
    }

    fn admit(ch: &ChannelGuard<'_>, irp: &Irp, max_output: usize) -> Result<()> {
        if !ch.is_open() {
            return Err(LinkError::InvalidState("channel not open"));
        }
        if ch.obj.eos {
            return Err(LinkError::EndOfStream);
        }
        if !irp.is_well_formed() {
            return Err(LinkError::InvalidArgument("request size exceeds buffer"));
        }
        match ch.direction() {
            Direction::Output if irp.size() > max_output => {
                Err(LinkError::InvalidArgument("request exceeds link transfer size"))
            }
            Direction::Input if irp.size() == 0 => {
                Err(LinkError::InvalidArgument("empty receive window"))
            }
            _ => Ok(()),
        }
    }

    /// Pops the oldest completion of a request submitted without a callback.
    pub fn get_io_completion(&self, id: ChannelId, wait: Wait) -> Result<IrpCompletion> {
        let slot =
            self.slots.get(usize::from(id)).ok_or(LinkError::InvalidArgument("channel id"))?;
        let deadline = wait.timeout().map(|t| Instant::now() + t);
        let mut obj = slot.obj.lock();
        loop {
            if let Some(done) = obj.completed.pop_front() {
                return Ok(done);
            }
            if obj.state == ChannelState::Closed {
                return Err(LinkError::InvalidState("channel not open"));
            }
            if wait.is_non_blocking() {
                return Err(LinkError::NotComplete);
            }
            match deadline {
                None => slot.cv.wait(&mut obj),
                Some(deadline) => {
                    if slot.cv.wait_until(&mut obj, deadline).timed_out()
                        && obj.completed.is_empty()
                    {
                        return Err(LinkError::Timeout);
                    }
                }
            }
        }
    }

    pub fn has_more_pending(&self, id: ChannelId) -> Result<bool> {
        Ok(self.lock(id)?.has_pending())
    }

    pub fn state(&self, id: ChannelId) -> Result<ChannelState> {
        Ok(self.lock(id)?.state())
    }

    pub fn is_end_of_stream(&self, id: ChannelId) -> Result<bool> {
        Ok(self.lock(id)?.obj.eos)
    }
}
