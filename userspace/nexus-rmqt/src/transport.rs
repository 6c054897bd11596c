// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Remote message queue transport over a pair of link channels.
//!
//! Outgoing messages wait in a FIFO; only its head is handed to the link, and the
//! next one goes out from the head's completion callback. A standing receive
//! request on the input channel is re-posted after every incoming message.
//!
//! Lock order: transport state, then the link's channel locks. Link callbacks run
//! with no lock held and reach the transport through a weak reference.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use dsp_link::{Direction, Irp, IrpCompletion, IrpStatus, Link};
use nexus_hal::Endianness;
use nexus_sync::{Semaphore, Wait, WaitError};
use parking_lot::Mutex;

use crate::config::TransportAttrs;
use crate::error::{Result, RmqtError};
use crate::mqa::{AllocatorTable, MqaId};
use crate::msg::Message;
use crate::msgq::MsgqCore;
use crate::wire::{
    bytes_to_words, words_to_bytes, ControlBody, MsgHeader, CONTROL_DST, CONTROL_MSG_SIZE, EXIT,
    EXIT_ACK, EXIT_REQUEST, HEADER_SIZE, LOCATE, LOCATE_ACK,
};

/// Local view of a remote queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueStatus {
    Empty,
    /// Located; `put` is allowed.
    InUse,
}

struct RemoteQueue {
    status: Mutex<QueueStatus>,
}

impl RemoteQueue {
    fn status(&self) -> QueueStatus {
        *self.status.lock()
    }
}

/// A queued outgoing message. `frame` is `None` while the link owns it.
struct Pending {
    token: u32,
    mqa_id: MqaId,
    frame: Option<Vec<u8>>,
}

struct TxState {
    /// New puts and locates are admitted.
    accepting: bool,
    /// Channels are going away: no resubmission, no receive re-post.
    torn_down: bool,
    fifo: VecDeque<Pending>,
    next_token: u32,
}

struct Inner {
    link: Arc<Link>,
    attrs: TransportAttrs,
    endian: Endianness,
    allocators: AllocatorTable,
    local: Arc<dyn MsgqCore>,
    queues: Box<[RemoteQueue]>,
    /// Outstanding locates by the request id carried in `sem_handle`.
    locates: Mutex<BTreeMap<u32, Arc<Semaphore>>>,
    next_locate: AtomicU32,
    exit_ack: Semaphore,
    state: Mutex<TxState>,
}

/// One transport instance bound to a running [`Link`].
pub struct Rmqt {
    inner: Arc<Inner>,
}

fn expired(err: WaitError) -> RmqtError {
    match err {
        WaitError::WouldBlock => RmqtError::NotComplete,
        WaitError::Timeout => RmqtError::Timeout,
    }
}

fn wait_millis(wait: Wait) -> u32 {
    match wait {
        Wait::Blocking => u32::MAX,
        Wait::NonBlocking => 0,
        Wait::Timeout(d) => u32::try_from(d.as_millis()).unwrap_or(u32::MAX - 1),
    }
}

impl Rmqt {
    /// Opens both channels and posts the standing receive request.
    pub fn open(
        link: Arc<Link>,
        attrs: TransportAttrs,
        allocators: AllocatorTable,
        local: Arc<dyn MsgqCore>,
    ) -> Result<Self> {
        attrs.validate()?;
        if !allocators.contains(attrs.default_mqa) {
            return Err(RmqtError::InvalidArgument("default allocator not registered"));
        }
        if attrs.max_msg_size > link.max_transfer() {
            return Err(RmqtError::Config(format!(
                "max_msg_size {} exceeds the link transfer size {}",
                attrs.max_msg_size,
                link.max_transfer()
            )));
        }
        let queues = (0..attrs.max_queues)
            .map(|_| RemoteQueue { status: Mutex::new(QueueStatus::Empty) })
            .collect();
        let inner = Arc::new(Inner {
            endian: link.config().dsp_endianness,
            link,
            attrs,
            allocators,
            local,
            queues,
            locates: Mutex::new(BTreeMap::new()),
            next_locate: AtomicU32::new(0),
            exit_ack: Semaphore::new(0),
            state: Mutex::new(TxState {
                accepting: true,
                torn_down: false,
                fifo: VecDeque::new(),
                next_token: 0,
            }),
        });

        let (input, output) = (inner.attrs.input_channel, inner.attrs.output_channel);
        inner.link.open_channel(input, Direction::Input)?;
        let opened = inner
            .link
            .open_channel(output, Direction::Output)
            .map_err(RmqtError::from)
            .and_then(|()| inner.post_receive(vec![0; inner.attrs.max_msg_size]));
        if let Err(err) = opened {
            inner.state.lock().torn_down = true;
            for id in [output, input] {
                if let Err(close_err) = inner.link.close_channel(id) {
                    log::warn!("rmqt: closing channel {id} after failed open: {close_err}");
                }
            }
            return Err(err);
        }
        log::info!("rmqt: transport {} open on channels {input}/{output}", inner.attrs.mqt_id);
        Ok(Self { inner })
    }

    /// Resolves remote queue `queue_id`, waiting for the peer's answer per `wait`.
    ///
    /// Only the LOCATE_ACK echoing this call's request id answers it; an ack for
    /// an expired request is dropped.
    pub fn locate(&self, queue_id: u16, wait: Wait) -> Result<()> {
        let inner = &self.inner;
        let queue = inner.queue(queue_id)?;
        if queue.status() == QueueStatus::InUse {
            return Ok(());
        }
        let request = inner.next_locate.fetch_add(1, Ordering::Relaxed);
        let answered = Arc::new(Semaphore::new(0));
        inner.locates.lock().insert(request, Arc::clone(&answered));
        let body = ControlBody {
            queue_id,
            mqa_id: inner.attrs.default_mqa,
            timeout: wait_millis(wait),
            sem_handle: request,
            ..ControlBody::default()
        };
        let token = match inner.send_control(LOCATE, body, false) {
            Ok(token) => token,
            Err(err) => {
                inner.locates.lock().remove(&request);
                return Err(err);
            }
        };
        if let Err(err) = answered.wait(wait) {
            if inner.locates.lock().remove(&request).is_some() {
                inner.withdraw(token);
                return Err(expired(err));
            }
            // The ack took the entry after the expiry and signals once the status
            // is written.
            answered.wait(Wait::Blocking).map_err(expired)?;
        }
        match queue.status() {
            QueueStatus::InUse => Ok(()),
            QueueStatus::Empty => Err(RmqtError::NotFound(queue_id)),
        }
    }

    /// Forgets a located queue. The peer is not told.
    pub fn release(&self, queue_id: u16) -> Result<()> {
        *self.inner.queue(queue_id)?.status.lock() = QueueStatus::Empty;
        Ok(())
    }

    pub fn status(&self, queue_id: u16) -> Result<QueueStatus> {
        Ok(self.inner.queue(queue_id)?.status())
    }

    /// Sends `msg` to located queue `queue_id`. The message is consumed; on failure
    /// it is freed.
    pub fn put(&self, queue_id: u16, msg: Message) -> Result<()> {
        let inner = &self.inner;
        let checked = inner.queue(queue_id).and_then(|queue| {
            if queue.status() != QueueStatus::InUse {
                return Err(RmqtError::NotFound(queue_id));
            }
            if msg.frame_len() > inner.attrs.max_msg_size {
                return Err(RmqtError::InvalidArgument("message exceeds max_msg_size"));
            }
            bytes_to_words(msg.frame_len(), inner.attrs.word_size)
                .map_err(|_| RmqtError::InvalidArgument("message size is not a whole number of words"))
        });
        let words = match checked {
            Ok(words) => words,
            Err(err) => {
                inner.allocators.free(msg);
                return Err(err);
            }
        };
        let (mut header, mut frame) = msg.into_parts();
        header.mqt_id = inner.attrs.mqt_id;
        header.size_words = words;
        header.dst_id = queue_id;
        if let Err(err) = header.encode(inner.endian, &mut frame) {
            inner.allocators.free_frame(header.mqa_id, frame);
            return Err(err.into());
        }
        log::trace!("rmqt: put msg {} to queue {queue_id} ({words} words)", header.msg_id);
        inner.enqueue(header.mqa_id, frame, false).map(drop)
    }

    /// Messages queued or in flight on the output channel.
    pub fn pending_outgoing(&self) -> usize {
        self.inner.state.lock().fifo.len()
    }

    pub fn attrs(&self) -> &TransportAttrs {
        &self.inner.attrs
    }

    pub fn allocators(&self) -> &AllocatorTable {
        &self.inner.allocators
    }

    pub fn is_open(&self) -> bool {
        self.inner.state.lock().accepting
    }

    /// Tells the peer, closes both channels and frees every queued message. Calling
    /// it again does nothing.
    pub fn close(&self) -> Result<()> {
        self.inner.close()
    }
}

impl Drop for Rmqt {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::warn!("rmqt: close on drop failed: {err}");
        }
    }
}

impl Inner {
    fn queue(&self, queue_id: u16) -> Result<&RemoteQueue> {
        self.queues
            .get(usize::from(queue_id))
            .ok_or(RmqtError::InvalidArgument("queue id out of range"))
    }

    fn post_receive(self: &Arc<Self>, buf: Vec<u8>) -> Result<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let size = buf.len();
        let irp = Irp::with_buffer(buf, size).on_complete(move |done| {
            if let Some(inner) = weak.upgrade() {
                inner.get_callback(done);
            }
        });
        self.link.add_io_request(self.attrs.input_channel, irp)?;
        Ok(())
    }

    /// Appends a frame to the FIFO and submits it when the FIFO was empty. Returns
    /// the FIFO token.
    fn enqueue(
        self: &Arc<Self>,
        mqa_id: MqaId,
        frame: Vec<u8>,
        closing_ok: bool,
    ) -> Result<u32> {
        let mut tx = self.state.lock();
        if !(tx.accepting || (closing_ok && !tx.torn_down)) {
            drop(tx);
            self.allocators.free_frame(mqa_id, frame);
            return Err(RmqtError::InvalidState("transport closed"));
        }
        let token = tx.next_token;
        tx.next_token = tx.next_token.wrapping_add(1);
        tx.fifo.push_back(Pending { token, mqa_id, frame: Some(frame) });
        if tx.fifo.len() == 1 {
            self.submit_head(&mut tx)?;
        }
        Ok(token)
    }

    /// Hands the FIFO head to the link. On refusal the head is dropped from the FIFO
    /// and freed.
    fn submit_head(self: &Arc<Self>, tx: &mut TxState) -> Result<()> {
        let Some(head) = tx.fifo.front_mut() else { return Ok(()) };
        let Some(frame) = head.frame.take() else { return Ok(()) };
        let token = head.token;
        let weak: Weak<Self> = Arc::downgrade(self);
        let irp = Irp::write(frame).with_arg(token).on_complete(move |done| {
            if let Some(inner) = weak.upgrade() {
                inner.put_callback(done);
            }
        });
        match self.link.try_add_io_request(self.attrs.output_channel, irp) {
            Ok(()) => Ok(()),
            Err(rejected) => {
                if let Some(entry) = tx.fifo.pop_front() {
                    self.allocators.free_frame(entry.mqa_id, rejected.irp.into_buffer());
                }
                Err(rejected.error.into())
            }
        }
    }

    /// Removes a not yet submitted frame, e.g. a locate that timed out. A frame the
    /// link already owns is freed by its completion instead.
    fn withdraw(&self, token: u32) {
        let mut tx = self.state.lock();
        let Some(pos) = tx.fifo.iter().position(|p| p.token == token) else { return };
        if tx.fifo[pos].frame.is_none() {
            return;
        }
        if let Some(Pending { mqa_id, frame: Some(frame), .. }) = tx.fifo.remove(pos) {
            self.allocators.free_frame(mqa_id, frame);
            log::debug!("rmqt: withdrew queued message {token}");
        }
    }

    fn put_callback(self: &Arc<Self>, done: IrpCompletion) {
        let mut tx = self.state.lock();
        let token = done.arg;
        match tx.fifo.iter().position(|p| p.token == token) {
            Some(pos) => {
                if pos != 0 {
                    log::error!("rmqt: completion for message {token} is not the FIFO head");
                }
                if let Some(entry) = tx.fifo.remove(pos) {
                    self.allocators.free_frame(entry.mqa_id, done.buffer);
                }
            }
            None => log::error!("rmqt: completion for unknown message {token}"),
        }
        if done.status != IrpStatus::Completed {
            log::warn!("rmqt: message {token} finished with {:?}", done.status);
        }
        if tx.torn_down {
            return;
        }
        while !tx.fifo.is_empty() {
            match self.submit_head(&mut tx) {
                Ok(()) => break,
                Err(err) => log::error!("rmqt: dropping queued message: {err}"),
            }
        }
    }

    fn get_callback(self: &Arc<Self>, done: IrpCompletion) {
        match done.status {
            IrpStatus::Completed => self.dispatch(done.data()),
            IrpStatus::EndOfStream => {
                log::warn!("rmqt: peer ended the input stream");
                return;
            }
            IrpStatus::Error => log::warn!("rmqt: receive failed on the link, re-posting"),
            IrpStatus::Cancelled => return,
        }
        if self.state.lock().torn_down {
            return;
        }
        if let Err(err) = self.post_receive(done.buffer) {
            log::error!("rmqt: cannot re-post receive request: {err}");
        }
    }

    fn dispatch(self: &Arc<Self>, data: &[u8]) {
        let header = match MsgHeader::decode(self.endian, data) {
            Ok(header) => header,
            Err(err) => {
                log::error!("rmqt: bad message header: {err}");
                return;
            }
        };
        let size = words_to_bytes(header.size_words, self.attrs.word_size);
        if size < HEADER_SIZE || size > data.len() {
            log::error!("rmqt: message of {size} bytes in a {} byte unit", data.len());
            return;
        }
        let frame = &data[..size];
        if header.dst_id == CONTROL_DST {
            self.control(&header, &frame[HEADER_SIZE..]);
            return;
        }

        let mqa_id = if self.allocators.contains(header.mqa_id) {
            header.mqa_id
        } else {
            log::warn!("rmqt: unknown allocator {}, using the default", header.mqa_id);
            self.attrs.default_mqa
        };
        let mut buf = match self.allocators.alloc_frame(mqa_id, size) {
            Ok(buf) => buf,
            Err(err) => {
                log::error!("rmqt: dropping message for queue {}: {err}", header.dst_id);
                return;
            }
        };
        buf.copy_from_slice(frame);
        let header = MsgHeader { mqt_id: self.attrs.mqt_id, mqa_id, ..header };
        log::trace!("rmqt: msg {} for queue {}", header.msg_id, header.dst_id);
        if let Err(msg) = self.local.deliver(header.dst_id, Message::from_parts(header, buf)) {
            log::warn!("rmqt: no local queue {}, message dropped", header.dst_id);
            self.allocators.free(msg);
        }
    }

    fn control(self: &Arc<Self>, header: &MsgHeader, body: &[u8]) {
        let body = match ControlBody::decode(self.endian, body) {
            Ok(body) => body,
            Err(err) => {
                log::error!("rmqt: bad control message: {err}");
                return;
            }
        };
        match header.msg_id {
            LOCATE => {
                let found = self.local.contains(body.queue_id);
                log::debug!("rmqt: peer locates queue {} (found: {found})", body.queue_id);
                let ack = ControlBody { msgq_found: found, ..body };
                if let Err(err) = self.send_control(LOCATE_ACK, ack, false) {
                    log::warn!("rmqt: cannot answer locate: {err}");
                }
            }
            LOCATE_ACK => {
                let Some(answered) = self.locates.lock().remove(&body.sem_handle) else {
                    log::debug!(
                        "rmqt: ignoring ack for expired locate {} of queue {}",
                        body.sem_handle,
                        body.queue_id
                    );
                    return;
                };
                match self.queues.get(usize::from(body.queue_id)) {
                    Some(queue) => {
                        let status =
                            if body.msgq_found { QueueStatus::InUse } else { QueueStatus::Empty };
                        log::debug!("rmqt: queue {} located: {status:?}", body.queue_id);
                        *queue.status.lock() = status;
                    }
                    None => log::warn!("rmqt: locate ack for unknown queue {}", body.queue_id),
                }
                answered.signal();
            }
            EXIT if body.arg == EXIT_ACK => self.exit_ack.signal(),
            EXIT => {
                self.local.transport_exit(self.attrs.mqt_id);
                let ack = ControlBody { arg: EXIT_ACK, ..body };
                if let Err(err) = self.send_control(EXIT, ack, true) {
                    log::warn!("rmqt: cannot acknowledge exit: {err}");
                }
            }
            other => log::error!("rmqt: unknown control message {other:#x}"),
        }
    }

    fn send_control(
        self: &Arc<Self>,
        msg_id: u16,
        body: ControlBody,
        closing_ok: bool,
    ) -> Result<u32> {
        let mqa_id = self.attrs.default_mqa;
        let header = MsgHeader {
            mqt_id: self.attrs.mqt_id,
            size_words: bytes_to_words(CONTROL_MSG_SIZE, self.attrs.word_size)?,
            dst_id: CONTROL_DST,
            mqa_id,
            msg_id,
            ..MsgHeader::default()
        };
        let mut frame = self.allocators.alloc_frame(mqa_id, CONTROL_MSG_SIZE)?;
        let (head, rest) = frame.split_at_mut(HEADER_SIZE);
        let encoded = header.encode(self.endian, head).and_then(|()| body.encode(self.endian, rest));
        if let Err(err) = encoded {
            self.allocators.free_frame(mqa_id, frame);
            return Err(err.into());
        }
        self.enqueue(mqa_id, frame, closing_ok)
    }

    fn close(self: &Arc<Self>) -> Result<()> {
        {
            let mut tx = self.state.lock();
            if !tx.accepting {
                return Ok(());
            }
            tx.accepting = false;
        }
        self.exit_ack.reset();
        let exit = ControlBody { arg: EXIT_REQUEST, ..ControlBody::default() };
        match self.send_control(EXIT, exit, true) {
            Ok(_) => {
                if self.exit_ack.wait(Wait::Timeout(self.attrs.exit_timeout())).is_err() {
                    log::warn!("rmqt: peer did not acknowledge exit, closing anyway");
                }
            }
            Err(err) => log::warn!("rmqt: cannot send exit: {err}"),
        }

        self.state.lock().torn_down = true;
        let mut first: Option<RmqtError> = None;
        let drained = match self.link.close_channel(self.attrs.output_channel) {
            Ok(drained) => drained,
            Err(err) => {
                first = Some(err.into());
                Vec::new()
            }
        };
        if let Err(err) = self.link.close_channel(self.attrs.input_channel) {
            match first {
                None => first = Some(err.into()),
                Some(_) => log::warn!("rmqt: closing input channel: {err}"),
            }
        }

        let mut freed = 0usize;
        {
            let mut tx = self.state.lock();
            for done in drained {
                if let Some(pos) = tx.fifo.iter().position(|p| p.token == done.arg) {
                    if let Some(entry) = tx.fifo.remove(pos) {
                        self.allocators.free_frame(entry.mqa_id, done.buffer);
                        freed += 1;
                    }
                }
            }
            // Frames still owned by the link are freed by their late completion.
            let mut in_flight = VecDeque::new();
            for entry in tx.fifo.drain(..) {
                match entry.frame {
                    Some(frame) => {
                        self.allocators.free_frame(entry.mqa_id, frame);
                        freed += 1;
                    }
                    None => in_flight.push_back(Pending {
                        token: entry.token,
                        mqa_id: entry.mqa_id,
                        frame: None,
                    }),
                }
            }
            tx.fifo = in_flight;
        }
        for queue in self.queues.iter() {
            *queue.status.lock() = QueueStatus::Empty;
        }
        log::info!("rmqt: transport {} closed, {freed} queued messages freed", self.attrs.mqt_id);
        first.map_or(Ok(()), Err)
    }
}
