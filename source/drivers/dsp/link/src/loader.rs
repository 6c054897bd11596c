// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Loader port: places image sections into DSP memory before the handshake.

use nexus_hal::Endianness;

use crate::error::{LinkError, Result};
use crate::link::Link;

/// One contiguous run of image bytes.
#[derive(Clone, Copy, Debug)]
pub struct Section<'a> {
    pub address: u32,
    pub data: &'a [u8],
    /// Element width in bytes used for byte-order conversion (1, 2 or 4).
    pub element_width: usize,
}

impl<'a> Section<'a> {
    pub fn new(address: u32, data: &'a [u8]) -> Self {
        Self { address, data, element_width: 4 }
    }

    pub fn with_element_width(mut self, width: usize) -> Self {
        self.element_width = width;
        self
    }
}

/// Writes `sections` in order, converting host-order elements to the DSP byte
/// order. Returns the number of bytes written.
pub fn write_sections(link: &Link, sections: &[Section<'_>]) -> Result<usize> {
    let dsp = link.config().dsp_endianness;
    let mut written = 0;
    for section in sections {
        if !matches!(section.element_width, 1 | 2 | 4) {
            return Err(LinkError::InvalidArgument("section element width"));
        }
        let mut bytes = section.data.to_vec();
        Endianness::host().convert_elements(dsp, section.element_width, &mut bytes);
        link.write_memory(section.address, &bytes)?;
        log::trace!("loader: {} bytes at {:#x}", bytes.len(), section.address);
        written += bytes.len();
    }
    log::debug!("loader: {} sections, {written} bytes", sections.len());
    Ok(written)
}
