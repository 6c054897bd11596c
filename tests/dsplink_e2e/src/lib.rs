// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: RMQT peer running on the simulated DSP
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable (test harness)
//! TEST_COVERAGE: Used by `tests/rmqt_transport.rs`
//!
//! PUBLIC API:
//!   - RmqtPeer: DSP firmware answering LOCATE/EXIT and echoing data messages
//!   - PeerLog: everything the peer received
//!   - frame()/control_frame(): build frames to inject from the DSP side
//!
//! DEPENDENCIES:
//!   - dsp_link::host::{DspFirmware, Outbox}
//!   - nexus_rmqt::wire: header and control codec

#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::sync::Arc;

use dsp_link::host::{DspFirmware, Outbox};
use dsp_link::ChannelId;
use nexus_hal::Endianness;
use nexus_rmqt::wire::{
    bytes_to_words, ControlBody, MsgHeader, WireError, CONTROL_DST, CONTROL_MSG_SIZE, EXIT,
    EXIT_ACK, EXIT_REQUEST, HEADER_SIZE, LOCATE, LOCATE_ACK,
};
use parking_lot::Mutex;

/// Everything the peer saw on its receive channel.
#[derive(Debug, Default)]
pub struct PeerRecord {
    pub data: Vec<(MsgHeader, Vec<u8>)>,
    pub control: Vec<(MsgHeader, ControlBody)>,
    pub malformed: u64,
}

impl PeerRecord {
    /// Data message ids in arrival order.
    pub fn data_ids(&self) -> Vec<u16> {
        self.data.iter().map(|(header, _)| header.msg_id).collect()
    }

    /// Control messages with `msg_id`.
    pub fn control_of(&self, msg_id: u16) -> Vec<ControlBody> {
        self.control.iter().filter(|(h, _)| h.msg_id == msg_id).map(|(_, body)| *body).collect()
    }
}

pub type PeerLog = Arc<Mutex<PeerRecord>>;

/// Builds a frame with `header` and `payload`; the size field is filled in.
pub fn frame(
    endian: Endianness,
    word_size: usize,
    header: MsgHeader,
    payload: &[u8],
) -> Result<Vec<u8>, WireError> {
    let mut buf = vec![0; HEADER_SIZE + payload.len()];
    let header = MsgHeader { size_words: bytes_to_words(buf.len(), word_size)?, ..header };
    header.encode(endian, &mut buf)?;
    buf[HEADER_SIZE..].copy_from_slice(payload);
    Ok(buf)
}

pub fn control_frame(
    endian: Endianness,
    word_size: usize,
    msg_id: u16,
    body: ControlBody,
) -> Result<Vec<u8>, WireError> {
    let mut encoded = [0u8; CONTROL_MSG_SIZE - HEADER_SIZE];
    body.encode(endian, &mut encoded)?;
    let header = MsgHeader { dst_id: CONTROL_DST, msg_id, ..MsgHeader::default() };
    frame(endian, word_size, header, &encoded)
}

/// DSP side of a transport: answers locates for its queues, acknowledges exits and
/// echoes data messages to the sender's `reply_id`.
pub struct RmqtPeer {
    endian: Endianness,
    word_size: usize,
    /// Channel the GPP sends on.
    rx: ChannelId,
    /// Channel the GPP receives on.
    tx: ChannelId,
    queues: BTreeSet<u16>,
    silent: bool,
    log: PeerLog,
}

impl RmqtPeer {
    pub fn new(endian: Endianness, word_size: usize, rx: ChannelId, tx: ChannelId) -> Self {
        Self {
            endian,
            word_size,
            rx,
            tx,
            queues: BTreeSet::new(),
            silent: false,
            log: PeerLog::default(),
        }
    }

    pub fn with_queues(mut self, queues: &[u16]) -> Self {
        self.queues.extend(queues);
        self
    }

    /// Records traffic without ever answering.
    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }

    pub fn log(&self) -> PeerLog {
        Arc::clone(&self.log)
    }

    fn send(&self, outbox: &mut Outbox, built: Result<Vec<u8>, WireError>) {
        match built {
            Ok(frame) => outbox.send(self.tx, frame),
            Err(err) => log::error!("rmqt-peer: cannot build frame: {err}"),
        }
    }

    fn on_control(&mut self, header: MsgHeader, body: ControlBody, outbox: &mut Outbox) {
        self.log.lock().control.push((header, body));
        if self.silent {
            return;
        }
        match header.msg_id {
            LOCATE => {
                let ack = ControlBody { msgq_found: self.queues.contains(&body.queue_id), ..body };
                self.send(outbox, control_frame(self.endian, self.word_size, LOCATE_ACK, ack));
            }
            EXIT if body.arg == EXIT_REQUEST => {
                let ack = ControlBody { arg: EXIT_ACK, ..body };
                self.send(outbox, control_frame(self.endian, self.word_size, EXIT, ack));
            }
            _ => {}
        }
    }

    fn on_data(&mut self, header: MsgHeader, payload: &[u8], outbox: &mut Outbox) {
        self.log.lock().data.push((header, payload.to_vec()));
        if self.silent || !self.queues.contains(&header.dst_id) {
            return;
        }
        let reply = MsgHeader {
            mqt_id: 0,
            dst_id: header.reply_id,
            src_id: header.dst_id,
            ..header
        };
        self.send(outbox, frame(self.endian, self.word_size, reply, payload));
    }
}

impl DspFirmware for RmqtPeer {
    fn on_receive(&mut self, channel: ChannelId, data: &[u8], outbox: &mut Outbox) {
        if channel != self.rx {
            return;
        }
        let Ok(header) = MsgHeader::decode(self.endian, data) else {
            self.log.lock().malformed += 1;
            return;
        };
        let size = usize::from(header.size_words) * self.word_size;
        if size < HEADER_SIZE || size > data.len() {
            self.log.lock().malformed += 1;
            return;
        }
        let payload = &data[HEADER_SIZE..size];
        if header.dst_id == CONTROL_DST {
            match ControlBody::decode(self.endian, payload) {
                Ok(body) => self.on_control(header, body, outbox),
                Err(_) => self.log.lock().malformed += 1,
            }
        } else {
            self.on_data(header, payload, outbox);
        }
    }
}
