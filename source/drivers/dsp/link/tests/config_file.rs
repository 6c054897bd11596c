// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Loading link configuration from TOML files
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: 4 integration tests
//!
//! TEST_SCENARIOS:
//!   - load_shm_file(): full SHM file with message channels
//!   - load_hpi_file_with_defaults(): HPI file relying on defaults
//!   - missing_file_reports_path(): read errors carry the path
//!   - invalid_file_is_rejected(): parse and validation failures
//!
//! DEPENDENCIES:
//!   - tempfile: scratch directories

use std::fs;

use dsp_link::{DriverConfig, HpiConfig, LinkConfig, LinkError};
use nexus_hal::Endianness;

#[test]
fn load_shm_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("link.toml");
    fs::write(
        &path,
        r#"
processor_id = 2
link_id = 1
max_channels = 8
dsp_endianness = "big"

[handshake]
poll_limit = 50
poll_interval_us = 20

[driver]
kind = "shm"
data_size = 2048
message_channels = [6, 7]
"#,
    )
    .unwrap();

    let cfg = LinkConfig::load(&path).unwrap();
    assert_eq!(cfg.processor_id, 2);
    assert_eq!(cfg.link_id, 1);
    assert_eq!(cfg.dsp_endianness, Endianness::Big);
    assert_eq!(cfg.handshake.poll_limit, 50);
    let DriverConfig::Shm(shm) = cfg.driver else { panic!("expected shm driver") };
    assert_eq!(shm.data_size, 2048);
    assert_eq!(shm.message_channels, Some([6, 7]));
}

#[test]
fn load_hpi_file_with_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hpi.toml");
    fs::write(&path, "processor_id = 0\n[driver]\nkind = \"hpi\"\n").unwrap();

    let cfg = LinkConfig::load(&path).unwrap();
    assert_eq!(cfg, LinkConfig::hpi(0, 8));
    assert_eq!(cfg.driver, DriverConfig::Hpi(HpiConfig::default()));
}

#[test]
fn missing_file_reports_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.toml");
    match LinkConfig::load(&path) {
        Err(LinkError::ConfigRead { path: reported, .. }) => assert_eq!(reported, path),
        other => panic!("unexpected result: {other:?}"),
    }
}

#[test]
fn invalid_file_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let garbled = dir.path().join("garbled.toml");
    fs::write(&garbled, "processor_id = [\n").unwrap();
    assert!(matches!(LinkConfig::load(&garbled), Err(LinkError::ConfigParse { .. })));

    let too_wide = dir.path().join("wide.toml");
    fs::write(&too_wide, "processor_id = 0\nmax_channels = 17\n[driver]\nkind = \"shm\"\n")
        .unwrap();
    assert!(matches!(LinkConfig::load(&too_wide), Err(LinkError::Config(_))));
}
