// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Message allocators.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Result, RmqtError};
use crate::msg::Message;
use crate::wire::{MsgHeader, HEADER_SIZE};

/// Allocator id carried in every message header.
pub type MqaId = u16;

/// Source of message buffers.
pub trait MsgAllocator: Send + Sync {
    /// Returns a zeroed buffer of exactly `size` bytes.
    fn alloc(&self, size: usize) -> Result<Vec<u8>>;
    fn free(&self, buf: Vec<u8>);
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub allocs: u64,
    pub frees: u64,
    /// Allocations refused because the pool was exhausted.
    pub failures: u64,
    pub in_use: usize,
}

struct PoolState {
    spare: Vec<Vec<u8>>,
    stats: PoolStats,
}

/// Fixed number of fixed-size blocks; freed blocks are reused.
pub struct PoolAllocator {
    block_size: usize,
    blocks: usize,
    state: Mutex<PoolState>,
}

impl PoolAllocator {
    pub fn new(block_size: usize, blocks: usize) -> Self {
        Self {
            block_size,
            blocks,
            state: Mutex::new(PoolState { spare: Vec::new(), stats: PoolStats::default() }),
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn stats(&self) -> PoolStats {
        self.state.lock().stats
    }
}

impl MsgAllocator for PoolAllocator {
    fn alloc(&self, size: usize) -> Result<Vec<u8>> {
        if size > self.block_size {
            return Err(RmqtError::InvalidArgument("message larger than pool block"));
        }
        let mut state = self.state.lock();
        if state.stats.in_use == self.blocks {
            state.stats.failures += 1;
            return Err(RmqtError::OutOfMemory);
        }
        let mut buf = state.spare.pop().unwrap_or_else(|| Vec::with_capacity(self.block_size));
        buf.clear();
        buf.resize(size, 0);
        state.stats.in_use += 1;
        state.stats.allocs += 1;
        Ok(buf)
    }

    fn free(&self, buf: Vec<u8>) {
        let mut state = self.state.lock();
        if state.stats.in_use == 0 {
            log::error!("mqa: free without a matching alloc");
            return;
        }
        state.stats.in_use -= 1;
        state.stats.frees += 1;
        if buf.capacity() >= self.block_size {
            state.spare.push(buf);
        }
    }
}

/// Allocators reachable by id.
#[derive(Default, Clone)]
pub struct AllocatorTable {
    allocators: BTreeMap<MqaId, Arc<dyn MsgAllocator>>,
}

impl AllocatorTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, id: MqaId, allocator: Arc<dyn MsgAllocator>) -> Self {
        self.insert(id, allocator);
        self
    }

    pub fn insert(&mut self, id: MqaId, allocator: Arc<dyn MsgAllocator>) {
        self.allocators.insert(id, allocator);
    }

    pub fn contains(&self, id: MqaId) -> bool {
        self.allocators.contains_key(&id)
    }

    fn get(&self, id: MqaId) -> Result<&Arc<dyn MsgAllocator>> {
        self.allocators.get(&id).ok_or(RmqtError::InvalidArgument("unknown allocator id"))
    }

    /// Allocates a message with a `payload_len` byte payload from allocator `mqa_id`.
    pub fn alloc(&self, mqa_id: MqaId, msg_id: u16, payload_len: usize) -> Result<Message> {
        let buf = self.alloc_frame(mqa_id, HEADER_SIZE + payload_len)?;
        let header = MsgHeader { mqa_id, msg_id, ..MsgHeader::default() };
        Ok(Message::from_parts(header, buf))
    }

    pub fn free(&self, msg: Message) {
        let (header, buf) = msg.into_parts();
        self.free_frame(header.mqa_id, buf);
    }

    pub(crate) fn alloc_frame(&self, mqa_id: MqaId, size: usize) -> Result<Vec<u8>> {
        self.get(mqa_id)?.alloc(size)
    }

    pub(crate) fn free_frame(&self, mqa_id: MqaId, buf: Vec<u8>) {
        match self.allocators.get(&mqa_id) {
            Some(allocator) => allocator.free(buf),
            None => log::error!("mqa: buffer for unknown allocator {mqa_id} dropped"),
        }
    }
}
