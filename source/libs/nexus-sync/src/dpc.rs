// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Deferred work ("DPC"): the bottom half an interrupt handler schedules.
//!
//! Invariants:
//!   - `schedule()` never blocks and coalesces: any number of calls before the worker
//!     picks the request up produce a single run.
//!   - The pending flag is cleared *before* the routine runs, so a schedule issued while
//!     the routine is executing produces exactly one more run.

use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::{Condvar, Mutex};

/// Routine executed by a [`DeferredWork`] object.
pub type DpcRoutine = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct DpcState {
    pending: bool,
    stop: bool,
    runs: u64,
}

struct Shared {
    state: Mutex<DpcState>,
    cv: Condvar,
}

/// A coalescing deferred-work object backed by one worker thread.
pub struct DeferredWork {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
}

impl DeferredWork {
    /// Spawns the worker thread executing `routine` once per coalesced schedule.
    pub fn spawn(name: &str, routine: DpcRoutine) -> std::io::Result<Self> {
        let shared = Arc::new(Shared { state: Mutex::new(DpcState::default()), cv: Condvar::new() });
        let worker_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run_worker(&worker_shared, &routine))?;
        let worker_id = handle.thread().id();
        log::trace!("dpc {name}: worker started");
        Ok(Self { shared, worker: Mutex::new(Some(handle)), worker_id })
    }

    /// Requests one run of the routine.
    pub fn schedule(&self) {
        let mut state = self.shared.state.lock();
        if state.stop || state.pending {
            return;
        }
        state.pending = true;
        self.shared.cv.notify_one();
    }

    /// Drops a request that has not started yet.
    pub fn cancel(&self) {
        self.shared.state.lock().pending = false;
    }

    pub fn is_scheduled(&self) -> bool {
        self.shared.state.lock().pending
    }

    /// Number of completed routine runs.
    pub fn runs(&self) -> u64 {
        self.shared.state.lock().runs
    }

    /// Stops the worker and waits for it unless called from the worker itself.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            state.stop = true;
            state.pending = false;
            self.shared.cv.notify_all();
        }
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if thread::current().id() == self.worker_id {
                // Joining ourselves would deadlock; the loop exits after this run.
                return;
            }
            if handle.join().is_err() {
                log::error!("dpc: worker panicked");
            }
        }
    }
}

impl Drop for DeferredWork {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(shared: &Shared, routine: &DpcRoutine) {
    loop {
        {
            let mut state = shared.state.lock();
            while !state.pending && !state.stop {
                shared.cv.wait(&mut state);
            }
            if state.stop {
                break;
            }
            state.pending = false;
        }
        routine();
        shared.state.lock().runs += 1;
    }
    log::trace!("dpc: worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::{Duration, Instant};

    fn wait_for(pred: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !pred() {
            assert!(Instant::now() < deadline, "condition not reached");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn schedules_coalesce_while_pending() {
        let gate = Arc::new(Mutex::new(()));
        let hits = Arc::new(AtomicU32::new(0));
        let (g, h) = (Arc::clone(&gate), Arc::clone(&hits));
        let held = gate.lock();
        let dpc = DeferredWork::spawn(
            "dpc-test",
            Arc::new(move || {
                let _g = g.lock();
                h.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

        dpc.schedule();
        // The first run is blocked on the gate; these three coalesce into one more run.
        wait_for(|| !dpc.is_scheduled());
        dpc.schedule();
        dpc.schedule();
        dpc.schedule();
        drop(held);
        wait_for(|| dpc.runs() == 2);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn cancel_drops_pending_request() {
        let hits = Arc::new(AtomicU32::new(0));
        let gate = Arc::new(Mutex::new(()));
        let (g, h) = (Arc::clone(&gate), Arc::clone(&hits));
        let held = gate.lock();
        let dpc = DeferredWork::spawn(
            "dpc-cancel",
            Arc::new(move || {
                let _g = g.lock();
                h.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();
        dpc.schedule();
        wait_for(|| !dpc.is_scheduled());
        dpc.schedule();
        dpc.cancel();
        drop(held);
        wait_for(|| dpc.runs() == 1);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn shutdown_is_idempotent() {
        let dpc = DeferredWork::spawn("dpc-stop", Arc::new(|| {})).unwrap();
        dpc.shutdown();
        dpc.shutdown();
        dpc.schedule();
        assert!(!dpc.is_scheduled());
    }
}
