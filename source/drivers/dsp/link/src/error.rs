// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

use nexus_hal::HalError;
use thiserror::Error;

/// Result alias for link operations.
pub type Result<T> = core::result::Result<T, LinkError>;

/// Errors produced by the link driver and channel layer.
#[derive(Debug, Error)]
pub enum LinkError {
    /// Null/out-of-range handle, channel id or parameter.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// Requested object does not exist.
    #[error("not found")]
    NotFound,
    /// A bounded wait (handshake, completion) expired.
    #[error("operation timed out")]
    Timeout,
    /// A non-blocking request could not finish immediately.
    #[error("operation not complete")]
    NotComplete,
    /// Offset or index outside the addressable region.
    #[error("range error: {len} bytes at {offset:#x} exceed limit {limit:#x}")]
    Range { offset: usize, len: usize, limit: usize },
    /// Allocator or buffer exhaustion.
    #[error("out of memory")]
    OutOfMemory,
    /// Hardware or peer protocol violation.
    #[error("link failure: {0}")]
    Fail(String),
    /// Operation not permitted in the current link or channel state.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    /// The channel reached end of stream.
    #[error("channel reached end of stream")]
    EndOfStream,
    /// Configuration rejected by validation.
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("failed to read link config {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse link config: {source}")]
    ConfigParse {
        #[source]
        source: toml::de::Error,
    },
    /// The deferred-work thread could not be created.
    #[error("failed to spawn deferred work: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("hal error: {0}")]
    Hal(HalError),
}

impl From<HalError> for LinkError {
    fn from(err: HalError) -> Self {
        match err {
            HalError::OutOfRange { offset, len } => Self::Range { offset, len, limit: 0 },
            other => Self::Hal(other),
        }
    }
}

/// Keeps the first failure of a best-effort sequence and logs the rest.
#[derive(Default)]
pub struct FirstError {
    first: Option<LinkError>,
}

impl FirstError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, what: &str, result: Result<()>) {
        if let Err(err) = result {
            if self.first.is_none() {
                self.first = Some(err);
            } else {
                log::warn!("dsp-link: {what} failed after an earlier error: {err}");
            }
        }
    }

    pub fn finish(self) -> Result<()> {
        match self.first {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_error_wins() {
        let mut errs = FirstError::new();
        errs.record("a", Ok(()));
        errs.record("b", Err(LinkError::Timeout));
        errs.record("c", Err(LinkError::NotFound));
        assert!(matches!(errs.finish(), Err(LinkError::Timeout)));
    }

    #[test]
    fn hal_range_maps_to_range() {
        let err: LinkError = HalError::OutOfRange { offset: 4, len: 2 }.into();
        assert!(matches!(err, LinkError::Range { offset: 4, len: 2, .. }));
    }
}
