// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

use dsp_link::LinkError;
use thiserror::Error;

use crate::wire::WireError;

pub type Result<T> = core::result::Result<T, RmqtError>;

/// Errors produced by the message queue transport.
#[derive(Debug, Error)]
pub enum RmqtError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// The remote queue is not located (or the peer denied it).
    #[error("queue {0} not found")]
    NotFound(u16),
    #[error("operation timed out")]
    Timeout,
    /// A zero-wait locate could not finish immediately.
    #[error("operation not complete")]
    NotComplete,
    #[error("message allocator exhausted")]
    OutOfMemory,
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    #[error("transport failure: {0}")]
    Fail(String),
    #[error("malformed message: {0}")]
    Wire(#[from] WireError),
    #[error("invalid transport attributes: {0}")]
    Config(String),
    #[error("failed to parse transport attributes: {source}")]
    ConfigParse {
        #[from]
        source: toml::de::Error,
    },
    #[error("link: {0}")]
    Link(#[from] LinkError),
}
