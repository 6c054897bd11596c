// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Local message-queue core: the receiving side of a transport.

use std::collections::{BTreeMap, VecDeque};
use std::time::Instant;

use nexus_sync::Wait;
use parking_lot::{Condvar, Mutex};

use crate::error::{Result, RmqtError};
use crate::msg::Message;

/// What a transport needs from the local queues.
pub trait MsgqCore: Send + Sync {
    /// Whether `queue_id` exists locally (answers a peer's locate).
    fn contains(&self, queue_id: u16) -> bool;

    /// Hands an incoming message to `queue_id`. The message comes back when no such
    /// queue exists so the transport can free it.
    fn deliver(&self, queue_id: u16, msg: Message) -> core::result::Result<(), Message>;

    /// The peer shut transport `mqt_id` down.
    fn transport_exit(&self, mqt_id: u16);
}

/// In-process queue table with blocking receive.
#[derive(Default)]
pub struct LocalMsgqTable {
    queues: Mutex<BTreeMap<u16, VecDeque<Message>>>,
    cv: Condvar,
    exits: Mutex<Vec<u16>>,
}

impl LocalMsgqTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, queue_id: u16) -> Result<()> {
        let mut queues = self.queues.lock();
        if queues.contains_key(&queue_id) {
            return Err(RmqtError::InvalidState("queue already exists"));
        }
        queues.insert(queue_id, VecDeque::new());
        log::debug!("msgq: created queue {queue_id}");
        Ok(())
    }

    /// Removes `queue_id` and returns the messages still queued on it.
    pub fn delete(&self, queue_id: u16) -> Result<Vec<Message>> {
        let queue = self.queues.lock().remove(&queue_id).ok_or(RmqtError::NotFound(queue_id))?;
        self.cv.notify_all();
        Ok(queue.into())
    }

    pub fn len(&self, queue_id: u16) -> usize {
        self.queues.lock().get(&queue_id).map_or(0, VecDeque::len)
    }

    /// Takes the oldest message from `queue_id`.
    pub fn get(&self, queue_id: u16, wait: Wait) -> Result<Message> {
        let deadline = wait.timeout().map(|t| Instant::now() + t);
        let mut queues = self.queues.lock();
        loop {
            let queue = queues.get_mut(&queue_id).ok_or(RmqtError::NotFound(queue_id))?;
            if let Some(msg) = queue.pop_front() {
                return Ok(msg);
            }
            if wait.is_non_blocking() {
                return Err(RmqtError::NotComplete);
            }
            match deadline {
                None => self.cv.wait(&mut queues),
                Some(deadline) => {
                    if self.cv.wait_until(&mut queues, deadline).timed_out() {
                        let ready = queues.get(&queue_id).is_some_and(|q| !q.is_empty());
                        if !ready {
                            return Err(RmqtError::Timeout);
                        }
                    }
                }
            }
        }
    }

    /// Transport ids whose peer announced shutdown, oldest first.
    pub fn exits(&self) -> Vec<u16> {
        self.exits.lock().clone()
    }
}

impl MsgqCore for LocalMsgqTable {
    fn contains(&self, queue_id: u16) -> bool {
        self.queues.lock().contains_key(&queue_id)
    }

    fn deliver(&self, queue_id: u16, msg: Message) -> core::result::Result<(), Message> {
        let mut queues = self.queues.lock();
        match queues.get_mut(&queue_id) {
            Some(queue) => {
                queue.push_back(msg);
                self.cv.notify_all();
                Ok(())
            }
            None => Err(msg),
        }
    }

    fn transport_exit(&self, mqt_id: u16) {
        log::info!("msgq: transport {mqt_id} closed by peer");
        self.exits.lock().push(mqt_id);
    }
}
