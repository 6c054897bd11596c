// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Link instance: one driver, its channel table, the interrupt and the deferred work.
//!
//! Interrupt flow: ISR (acknowledge, schedule) -> deferred work (driver `service`,
//! then callbacks with no lock held). Callbacks may submit new requests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use nexus_hal::{Bus, InterruptLine, SharedMemory};
use nexus_sync::{DeferredWork, Wait};
use parking_lot::Mutex;

use crate::chnl::{ChannelManager, ChannelState, IoKick};
use crate::config::{DriverConfig, LinkConfig};
use crate::driver::LinkDriver;
use crate::error::{FirstError, LinkError, Result};
use crate::hpi::HpiDriver;
use crate::irp::{ChannelId, Direction, Irp, IrpCompletion, Rejected};
use crate::shm::ShmDriver;

/// Physical medium backing a link.
#[derive(Clone)]
pub enum Medium {
    Shm(Arc<dyn SharedMemory>),
    Hpi(Arc<dyn Bus + Send + Sync>),
}

/// Hardware handed to [`Link::initialize`].
#[derive(Clone)]
pub struct LinkResources {
    pub medium: Medium,
    pub irq: Arc<dyn InterruptLine>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    /// Driver bound, loader writes allowed, no handshake yet.
    Initialized,
    Running,
    Finalized,
}

/// Snapshot of the link counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub interrupts: u64,
    pub deferred_runs: u64,
    pub completions: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub discarded: u64,
}

pub struct Link {
    config: LinkConfig,
    driver: Box<dyn LinkDriver>,
    irq: Arc<dyn InterruptLine>,
    channels: ChannelManager,
    dpc: Mutex<Option<DeferredWork>>,
    state: Mutex<LinkState>,
    interrupts: AtomicU64,
    deferred_runs: AtomicU64,
}

fn build_driver(config: &LinkConfig, resources: &LinkResources) -> Result<Box<dyn LinkDriver>> {
    let irq = Arc::clone(&resources.irq);
    match (&config.driver, &resources.medium) {
        (DriverConfig::Shm(cfg), Medium::Shm(mem)) => Ok(Box::new(ShmDriver::new(
            Arc::clone(mem),
            irq,
            cfg,
            config.max_channels,
            config.dsp_endianness,
        ))),
        (DriverConfig::Hpi(cfg), Medium::Hpi(bus)) => Ok(Box::new(HpiDriver::new(
            Arc::clone(bus),
            irq,
            cfg,
            config.max_channels,
            config.dsp_endianness,
        ))),
        _ => Err(LinkError::Config("driver kind does not match the supplied medium".into())),
    }
}

impl Link {
    /// Binds the driver, installs the interrupt and creates the deferred work.
    ///
    /// On failure every step already taken is undone.
    pub fn initialize(config: LinkConfig, resources: LinkResources) -> Result<Arc<Self>> {
        config.validate()?;
        let driver = build_driver(&config, &resources)?;
        driver.initialize()?;

        let link = Arc::new(Self {
            channels: ChannelManager::new(config.max_channels),
            config,
            driver,
            irq: resources.irq,
            dpc: Mutex::new(None),
            state: Mutex::new(LinkState::Initialized),
            interrupts: AtomicU64::new(0),
            deferred_runs: AtomicU64::new(0),
        });

        let weak: Weak<Self> = Arc::downgrade(&link);
        let name = format!("dsp-link{}.{}", link.config.processor_id, link.config.link_id);
        let dpc = DeferredWork::spawn(
            &name,
            Arc::new(move || {
                if let Some(link) = weak.upgrade() {
                    link.run_deferred();
                }
            }),
        );
        let dpc = match dpc {
            Ok(dpc) => dpc,
            Err(err) => {
                link.abort_bring_up();
                return Err(LinkError::Spawn(err));
            }
        };
        *link.dpc.lock() = Some(dpc);

        let weak: Weak<Self> = Arc::downgrade(&link);
        let installed = link.irq.install(Arc::new(move || {
            if let Some(link) = weak.upgrade() {
                link.isr();
            }
        }));
        if let Err(err) = installed {
            link.abort_bring_up();
            return Err(err.into());
        }
        link.irq.enable();
        log::info!(
            "dsp-link: {} link {}.{} up with {} channels",
            link.driver.kind(),
            link.config.processor_id,
            link.config.link_id,
            link.config.max_channels
        );
        Ok(link)
    }

    fn abort_bring_up(&self) {
        *self.state.lock() = LinkState::Finalized;
        if let Some(dpc) = self.dpc.lock().take() {
            dpc.shutdown();
        }
        if let Err(err) = self.driver.finalize() {
            log::warn!("dsp-link: driver cleanup after failed bring-up: {err}");
        }
    }

    /// Performs the startup rendezvous with the DSP.
    pub fn start(&self) -> Result<()> {
        let mut state = self.state.lock();
        if *state != LinkState::Initialized {
            return Err(LinkError::InvalidState("link already started or finalized"));
        }
        self.driver.handshake_setup()?;
        self.driver.handshake_start()?;
        self.driver.handshake_complete(&self.config.handshake)?;
        *state = LinkState::Running;
        log::info!("dsp-link: handshake with processor {} complete", self.config.processor_id);
        Ok(())
    }

    /// Releases the link. Every step runs even when an earlier one fails; the first
    /// failure is returned. Calling it again is a no-op.
    pub fn finalize(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state == LinkState::Finalized {
                return Ok(());
            }
            *state = LinkState::Finalized;
        }
        let mut errs = FirstError::new();
        self.irq.disable();
        self.irq.uninstall();
        let dpc = self.dpc.lock().take();
        if let Some(dpc) = dpc {
            dpc.shutdown();
        }
        let mut cancelled = 0;
        for id in 0..self.channels.channel_count() {
            if matches!(self.channels.state(id), Ok(ChannelState::Closed)) {
                continue;
            }
            match self.channels.close(id, |ch| self.driver.close_channel(ch)) {
                Ok(drained) => cancelled += drained.len(),
                Err(err) => errs.record("channel close", Err(err)),
            }
        }
        errs.record("driver finalize", self.driver.finalize());
        log::info!(
            "dsp-link: link {}.{} down, {cancelled} requests cancelled",
            self.config.processor_id,
            self.config.link_id
        );
        errs.finish()
    }

    fn isr(&self) {
        self.interrupts.fetch_add(1, Ordering::Relaxed);
        self.driver.acknowledge_interrupt();
        self.schedule();
    }

    fn run_deferred(&self) {
        if *self.state.lock() == LinkState::Finalized {
            return;
        }
        self.deferred_runs.fetch_add(1, Ordering::Relaxed);
        let mut deliveries = Vec::new();
        if let Err(err) = self.driver.service(&self.channels, &mut deliveries) {
            log::error!("dsp-link: deferred work failed: {err}");
        }
        for delivery in deliveries {
            delivery.deliver();
        }
    }

    /// Requests a deferred-work pass. Coalesces with a pass not yet started.
    pub fn schedule(&self) {
        if let Some(dpc) = self.dpc.lock().as_ref() {
            dpc.schedule();
        }
    }

    fn ensure_running(&self) -> Result<()> {
        match *self.state.lock() {
            LinkState::Running => Ok(()),
            LinkState::Initialized => Err(LinkError::InvalidState("link not started")),
            LinkState::Finalized => Err(LinkError::InvalidState("link finalized")),
        }
    }

    pub fn open_channel(&self, id: ChannelId, direction: Direction) -> Result<()> {
        self.ensure_running()?;
        self.channels.open(id, direction, |ch| self.driver.open_channel(ch))
    }

    /// Closes `id`, returning its queued requests as cancelled. Their callbacks are
    /// dropped without being called.
    pub fn close_channel(&self, id: ChannelId) -> Result<Vec<IrpCompletion>> {
        self.channels.close(id, |ch| self.driver.close_channel(ch))
    }

    /// Cancels every queued request on `id`; the channel ends up closed.
    pub fn cancel_io(&self, id: ChannelId) -> Result<Vec<IrpCompletion>> {
        self.channels.close(id, |ch| self.driver.cancel_io(ch))
    }

    pub fn add_io_request(&self, id: ChannelId, irp: Irp) -> Result<()> {
        Ok(self.try_add_io_request(id, irp)?)
    }

    /// Like [`Link::add_io_request`], but a refused request is handed back.
    pub fn try_add_io_request(&self, id: ChannelId, irp: Irp) -> core::result::Result<(), Rejected> {
        if let Err(error) = self.ensure_running() {
            return Err(Rejected { error, irp });
        }
        let kick = self.channels.add_io_request(id, irp, self.driver.max_transfer(), |ch| {
            self.driver.io_request(ch)
        })?;
        if kick == IoKick::Schedule {
            self.schedule();
        }
        Ok(())
    }

    pub fn get_io_completion(&self, id: ChannelId, wait: Wait) -> Result<IrpCompletion> {
        self.channels.get_io_completion(id, wait)
    }

    pub fn has_more_pending(&self, id: ChannelId) -> Result<bool> {
        self.channels.has_more_pending(id)
    }

    pub fn channel_state(&self, id: ChannelId) -> Result<ChannelState> {
        self.channels.state(id)
    }

    pub fn is_end_of_stream(&self, id: ChannelId) -> Result<bool> {
        self.channels.is_end_of_stream(id)
    }

    /// Raw write into DSP address space; only before [`Link::start`].
    pub fn write_memory(&self, addr: u32, bytes: &[u8]) -> Result<()> {
        if *self.state.lock() != LinkState::Initialized {
            return Err(LinkError::InvalidState("DSP memory is only writable before the handshake"));
        }
        self.driver.write_memory(addr, bytes)
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn state(&self) -> LinkState {
        *self.state.lock()
    }

    pub fn max_transfer(&self) -> usize {
        self.driver.max_transfer()
    }

    pub fn stats(&self) -> LinkStats {
        let counters = self.driver.counters();
        LinkStats {
            interrupts: self.interrupts.load(Ordering::Relaxed),
            deferred_runs: self.deferred_runs.load(Ordering::Relaxed),
            completions: self.channels.completions(),
            bytes_in: counters.bytes_in(),
            bytes_out: counters.bytes_out(),
            discarded: counters.discarded(),
        }
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        if let Err(err) = self.finalize() {
            log::warn!("dsp-link: finalize on drop failed: {err}");
        }
    }
}
