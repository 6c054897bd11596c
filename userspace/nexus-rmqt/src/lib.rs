// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Remote message queue transport (RMQT) between the GPP and a DSP
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable (bring-up)
//! TEST_COVERAGE: Unit tests + `tests/wire_props.rs`; end-to-end in `tests/dsplink_e2e`
//!
//! PUBLIC API:
//!   - Rmqt: open/locate/release/put/status/close over two link channels
//!   - Message: header accessors and payload
//!   - AllocatorTable, MsgAllocator, PoolAllocator: message buffers by allocator id
//!   - MsgqCore, LocalMsgqTable: local queues receiving incoming messages
//!   - TransportAttrs: TOML-loadable transport attributes
//!   - wire: header and control message codec
//!
//! DEPENDENCIES:
//!   - dsp-link: channels and IRPs
//!   - nexus-sync: rendezvous semaphores and wait policies
//!   - thiserror/log/serde/toml: errors, logging, configuration

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod mqa;
pub mod msg;
pub mod msgq;
pub mod transport;
pub mod wire;

pub use config::TransportAttrs;
pub use error::{Result, RmqtError};
pub use mqa::{AllocatorTable, MqaId, MsgAllocator, PoolAllocator, PoolStats};
pub use msg::Message;
pub use msgq::{LocalMsgqTable, MsgqCore};
pub use transport::{QueueStatus, Rmqt};
