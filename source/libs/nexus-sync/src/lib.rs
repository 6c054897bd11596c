// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Host OS-abstraction primitives consumed by the DSP link stack
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: Unit tests (host)
//!
//! PUBLIC API:
//!   - `Wait`: blocking policy for suspension points
//!   - `Semaphore`: counting semaphore with bounded waits
//!   - `DeferredWork`: coalescing bottom half running on a dedicated thread
//!
//! DEPENDENCIES:
//!   - parking_lot::{Mutex, Condvar}
//!   - log: worker lifecycle tracing

#![forbid(unsafe_code)]

mod dpc;
mod semaphore;

pub use dpc::DeferredWork;
pub use semaphore::Semaphore;

use core::fmt;
use core::time::Duration;

/// Behaviour of a blocking call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wait {
    /// Block until the operation completes.
    Blocking,
    /// Return immediately if no progress can be made.
    NonBlocking,
    /// Block until either the operation completes or the timeout expires.
    Timeout(Duration),
}

impl Wait {
    /// Returns `true` for a non-blocking attempt, including a zero timeout.
    pub fn is_non_blocking(self) -> bool {
        match self {
            Self::NonBlocking => true,
            Self::Timeout(d) => d.is_zero(),
            Self::Blocking => false,
        }
    }

    /// Converts a [`Wait::Timeout`] variant into its [`Duration`].
    pub const fn timeout(self) -> Option<Duration> {
        match self {
            Self::Timeout(duration) => Some(duration),
            Self::Blocking | Self::NonBlocking => None,
        }
    }

    /// Builds a policy from a millisecond count where `u32::MAX` means forever and `0` means poll.
    pub fn from_millis(ms: u32) -> Self {
        match ms {
            0 => Self::NonBlocking,
            u32::MAX => Self::Blocking,
            ms => Self::Timeout(Duration::from_millis(u64::from(ms))),
        }
    }
}

/// Failure of a suspension point.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitError {
    /// Non-blocking attempt could not complete.
    WouldBlock,
    /// Bounded wait expired.
    Timeout,
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WouldBlock => write!(f, "operation would block"),
            Self::Timeout => write!(f, "operation timed out"),
        }
    }
}

impl std::error::Error for WaitError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_timeout_is_non_blocking() {
        assert!(Wait::Timeout(Duration::ZERO).is_non_blocking());
        assert!(Wait::NonBlocking.is_non_blocking());
        assert!(!Wait::Blocking.is_non_blocking());
    }

    #[test]
    fn from_millis_maps_sentinels() {
        assert_eq!(Wait::from_millis(0), Wait::NonBlocking);
        assert_eq!(Wait::from_millis(u32::MAX), Wait::Blocking);
        assert_eq!(Wait::from_millis(5).timeout(), Some(Duration::from_millis(5)));
    }
}
