// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: GPP<->DSP link driver with channel multiplexing (SHM and HPI variants)
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable (bring-up)
//! TEST_COVERAGE: Unit tests + `tests/` (SHM, HPI, channel properties, config files)
//!
//! PUBLIC API:
//!   - Link: one link instance (initialize/start/finalize, channels, IRPs, stats)
//!   - LinkDriver: physical-medium contract; ShmDriver, HpiDriver
//!   - ChannelManager: per-channel state machine and IRP queues
//!   - LinkRegistry: owned table of links keyed by (processor, link)
//!   - loader::write_sections(): DSP image placement before the handshake
//!   - LinkConfig: TOML-loadable configuration
//!   - host: simulated board + DSP (feature `host`)
//!
//! DEPENDENCIES:
//!   - nexus-hal::{Bus, SharedMemory, InterruptLine, IrqGuard, Endianness}
//!   - nexus-sync::{DeferredWork, Wait}
//!   - parking_lot: channel and driver locks
//!   - thiserror/log/serde/toml: errors, logging, configuration
//!   - bitflags/static_assertions: register bits and wire layouts

#![forbid(unsafe_code)]

pub mod chnl;
pub mod config;
pub mod driver;
pub mod error;
pub mod hpi;
pub mod irp;
pub mod link;
pub mod loader;
pub mod registry;
pub mod shm;

#[cfg(feature = "host")]
pub mod host;

pub use chnl::{ChannelGuard, ChannelManager, ChannelState, Delivery, IoKick};
pub use config::{DriverConfig, HandshakeConfig, HpiConfig, LinkConfig, ShmConfig};
pub use driver::{LinkDriver, TransferCounters, DSP_HANDSHAKE, GPP_HANDSHAKE};
pub use error::{FirstError, LinkError, Result};
pub use hpi::HpiDriver;
pub use irp::{ChannelId, CompletionFn, Direction, Irp, IrpCompletion, IrpStatus, Rejected};
pub use link::{Link, LinkResources, LinkState, LinkStats, Medium};
pub use registry::{LinkKey, LinkRegistry};
pub use shm::ShmDriver;

pub use nexus_sync::Wait;
