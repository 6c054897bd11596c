// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::{Wait, WaitError};

/// Counting semaphore.
pub struct Semaphore {
    count: Mutex<u32>,
    cv: Condvar,
}

impl Semaphore {
    pub const fn new(initial: u32) -> Self {
        Self { count: Mutex::new(initial), cv: Condvar::new() }
    }

    /// Increments the count and wakes one waiter.
    pub fn signal(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_add(1);
        self.cv.notify_one();
    }

    /// Decrements the count, suspending according to `wait` while it is zero.
    pub fn wait(&self, wait: Wait) -> Result<(), WaitError> {
        let mut count = self.count.lock();
        if *count > 0 {
            *count -= 1;
            return Ok(());
        }
        if wait.is_non_blocking() {
            return Err(WaitError::WouldBlock);
        }
        let deadline = wait.timeout().map(|t| Instant::now() + t);
        while *count == 0 {
            match deadline {
                None => self.cv.wait(&mut count),
                Some(deadline) => {
                    if self.cv.wait_until(&mut count, deadline).timed_out() && *count == 0 {
                        return Err(WaitError::Timeout);
                    }
                }
            }
        }
        *count -= 1;
        Ok(())
    }

    /// Drops any accumulated signals.
    pub fn reset(&self) {
        *self.count.lock() = 0;
    }

    pub fn count(&self) -> u32 {
        *self.count.lock()
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new(0)
    }
}
