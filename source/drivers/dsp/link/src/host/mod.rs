// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Host emulation of a GPP+DSP board.
//!
//! [`SimBoard`] wires simulated memory, the GPP interrupt line and (for HPI) the
//! register bridge; [`SimBoard::spawn_dsp`] starts a thread that plays the DSP side of
//! the configured protocol and runs a [`DspFirmware`].

mod dsp;
mod firmware;
mod hpi_bus;
mod irq;
mod memory;

use std::sync::Arc;

pub use dsp::SimDsp;
pub use firmware::{DspFirmware, EchoFirmware, Outbox, Received, RecordingFirmware};
pub use hpi_bus::SimHpiBus;
pub use irq::{Doorbell, SimInterrupt};
pub use memory::SimMemory;

use crate::config::{DriverConfig, LinkConfig};
use crate::hpi::layout::{HpiLayout, CACHE_LINE};
use crate::link::{LinkResources, Medium};
use crate::shm::layout::ShmLayout;

use self::dsp::{DspWiring, Personality};

/// Spare bytes after the SHM data regions, available to the loader.
pub const SHM_SCRATCH: usize = 0x1000;
/// Size of each DSP-side channel buffer in the HPI personality.
pub const HPI_BUFFER_SIZE: u32 = 0x1000;

/// Simulated hardware for one link.
pub struct SimBoard {
    config: LinkConfig,
    memory: Arc<SimMemory>,
    doorbell: Arc<Doorbell>,
    irq: Arc<SimInterrupt>,
    bus: Option<Arc<SimHpiBus>>,
}

impl SimBoard {
    pub fn new(config: &LinkConfig) -> Self {
        let doorbell = Arc::new(Doorbell::new());
        let irq = Arc::new(SimInterrupt::new(Arc::clone(&doorbell)));
        let (size, hpi) = match &config.driver {
            DriverConfig::Shm(shm) => (ShmLayout::new(shm).end() + SHM_SCRATCH, false),
            DriverConfig::Hpi(hpi) => {
                let layout = HpiLayout::new(hpi.control_addr, config.max_channels);
                let buffers = u32::from(config.max_channels) * HPI_BUFFER_SIZE;
                ((hpi_buffer_base(&layout) + buffers) as usize, true)
            }
        };
        let memory = Arc::new(SimMemory::new(size));
        let bus = hpi.then(|| {
            Arc::new(SimHpiBus::new(
                Arc::clone(&memory),
                config.dsp_endianness,
                Arc::clone(&doorbell),
                Arc::clone(&irq),
            ))
        });
        Self { config: config.clone(), memory, doorbell, irq, bus }
    }

    pub fn resources(&self) -> LinkResources {
        let medium = match &self.bus {
            Some(bus) => Medium::Hpi(bus.clone()),
            None => Medium::Shm(self.memory.clone()),
        };
        LinkResources { medium, irq: self.irq.clone() }
    }

    pub fn memory(&self) -> &Arc<SimMemory> {
        &self.memory
    }

    pub fn irq(&self) -> &Arc<SimInterrupt> {
        &self.irq
    }

    pub fn doorbell(&self) -> &Arc<Doorbell> {
        &self.doorbell
    }

    pub fn spawn_dsp(&self, firmware: impl DspFirmware) -> std::io::Result<SimDsp> {
        let personality = match &self.config.driver {
            DriverConfig::Shm(shm) => Personality::Shm {
                layout: ShmLayout::new(shm),
                message_channels: shm.message_channels,
            },
            DriverConfig::Hpi(hpi) => {
                let Some(bus) = &self.bus else {
                    return Err(std::io::Error::other("board has no HPI bridge"));
                };
                let layout = HpiLayout::new(hpi.control_addr, self.config.max_channels);
                Personality::Hpi {
                    layout,
                    bus: Arc::clone(bus),
                    buffer_base: hpi_buffer_base(&layout),
                    buffer_size: HPI_BUFFER_SIZE,
                }
            }
        };
        let wiring = DspWiring {
            memory: Arc::clone(&self.memory),
            endian: self.config.dsp_endianness,
            gpp: Arc::clone(&self.irq),
            bell: Arc::clone(&self.doorbell),
            channels: self.config.max_channels,
            personality,
        };
        SimDsp::spawn(wiring, Box::new(firmware))
    }
}

fn hpi_buffer_base(layout: &HpiLayout) -> u32 {
    layout.end().next_multiple_of(CACHE_LINE)
}
