// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Simulated interrupt wiring between the GPP and the DSP thread.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nexus_hal::{HalError, InterruptLine, IsrHandler};
use parking_lot::{Condvar, Mutex};

/// Wake-up line of the simulated DSP.
#[derive(Default)]
pub struct Doorbell {
    rung: Mutex<bool>,
    cv: Condvar,
    rings: AtomicU64,
}

impl Doorbell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ring(&self) {
        self.rings.fetch_add(1, Ordering::Relaxed);
        *self.rung.lock() = true;
        self.cv.notify_all();
    }

    /// Waits up to `timeout` for a ring; returns whether one arrived.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut rung = self.rung.lock();
        if !*rung {
            self.cv.wait_for(&mut rung, timeout);
        }
        std::mem::replace(&mut *rung, false)
    }

    pub fn rings(&self) -> u64 {
        self.rings.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
struct LineState {
    handler: Option<IsrHandler>,
    /// Nesting depth of `disable` calls; the line starts masked.
    masked: u32,
    pending: bool,
}

/// GPP interrupt line. A trigger while masked is latched and delivered on the
/// `enable` that unmasks the line.
pub struct SimInterrupt {
    state: Mutex<LineState>,
    peer: Arc<Doorbell>,
    delivered: AtomicU64,
}

impl SimInterrupt {
    pub fn new(peer: Arc<Doorbell>) -> Self {
        Self {
            state: Mutex::new(LineState { masked: 1, ..LineState::default() }),
            peer,
            delivered: AtomicU64::new(0),
        }
    }

    /// Raised by the DSP side. Runs the handler on the calling thread when unmasked.
    pub fn trigger(&self) {
        let handler = {
            let mut state = self.state.lock();
            let handler = if state.masked == 0 { state.handler.clone() } else { None };
            if handler.is_none() {
                state.pending = true;
            }
            handler
        };
        if let Some(handler) = handler {
            self.delivered.fetch_add(1, Ordering::Relaxed);
            handler();
        }
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn is_installed(&self) -> bool {
        self.state.lock().handler.is_some()
    }
}

impl InterruptLine for SimInterrupt {
    fn install(&self, handler: IsrHandler) -> Result<(), HalError> {
        let mut state = self.state.lock();
        if state.handler.is_some() {
            return Err(HalError::AlreadyInstalled);
        }
        state.handler = Some(handler);
        Ok(())
    }

    fn uninstall(&self) {
        let mut state = self.state.lock();
        state.handler = None;
        state.pending = false;
    }

    fn enable(&self) {
        let handler = {
            let mut state = self.state.lock();
            state.masked = state.masked.saturating_sub(1);
            if state.masked == 0 && state.pending && state.handler.is_some() {
                state.pending = false;
                state.handler.clone()
            } else {
                None
            }
        };
        if let Some(handler) = handler {
            self.delivered.fetch_add(1, Ordering::Relaxed);
            handler();
        }
    }

    fn disable(&self) {
        self.state.lock().masked += 1;
    }

    fn clear(&self) {
        self.state.lock().pending = false;
    }

    fn raise_peer(&self) {
        self.peer.ring();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masked_trigger_is_delivered_on_enable() {
        let line = SimInterrupt::new(Arc::new(Doorbell::new()));
        let hits = Arc::new(AtomicU64::new(0));
        let h = Arc::clone(&hits);
        line.install(Arc::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();
        line.trigger();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        line.enable();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        line.trigger();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(line.install(Arc::new(|| {})), Err(HalError::AlreadyInstalled));
    }

    #[test]
    fn nested_masking() {
        let line = SimInterrupt::new(Arc::new(Doorbell::new()));
        let hits = Arc::new(AtomicU64::new(0));
        let h = Arc::clone(&hits);
        line.install(Arc::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();
        line.enable();
        line.disable();
        line.disable();
        line.trigger();
        line.enable();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        line.enable();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn doorbell_latches() {
        let bell = Doorbell::new();
        bell.ring();
        assert!(bell.wait(Duration::from_millis(1)));
        assert!(!bell.wait(Duration::from_millis(1)));
        assert_eq!(bell.rings(), 1);
    }
}
