//! Anchor search tests

mod common;

use common::{MemoryBlockDevice, UdfImageBuilder};
use std::time::Duration;
use udf::device::Addressing;
use udf::error::{ErrorKind, UdfError};
use udf::utils::sector::fixed_to_variable;
use udf::{mount, mount_with_clock, MountOptions};

const ESTIMATE: u64 = 1000;

/// Last-block candidates for an estimate of 1000, in search order
const LAST_BLOCK_CANDIDATES: [u64; 14] = [
    1000, 744, 999, 743, 1001, 745, 998, 742, 1002, 746, 850, 594, 848, 592,
];

fn with_estimate() -> MountOptions {
    MountOptions {
        block_size: Some(2048),
        last_block: Some(ESTIMATE),
        ..MountOptions::default()
    }
}

#[test]
fn test_anchor_found_at_every_last_block_candidate() {
    for block in LAST_BLOCK_CANDIDATES {
        let mut device = UdfImageBuilder::new()
            .blocks(1100)
            .anchors(vec![block])
            .build();
        let volume = mount(&mut device, &with_estimate())
            .unwrap_or_else(|err| panic!("anchor at {} not found: {}", block, err));
        assert_eq!(volume.state().anchor_block, block);
        assert_eq!(volume.root_directory().block, 2);
    }
}

#[test]
fn test_implied_last_block_follows_candidate() {
    let mut device = UdfImageBuilder::new()
        .blocks(1100)
        .anchors(vec![743])
        .build();
    let volume = mount(&mut device, &with_estimate()).unwrap();
    // 743 is the "minus 256" partner of 999
    assert_eq!(volume.state().last_block, 999);
}

#[test]
fn test_no_anchor_away_from_candidates() {
    let mut device = UdfImageBuilder::new()
        .blocks(1100)
        .anchors(vec![1003])
        .build();
    let err = mount(&mut device, &with_estimate()).err().unwrap();
    assert!(matches!(err, UdfError::NoAnchor));
    assert_eq!(err.kind(), ErrorKind::Structural);
}

#[test]
fn test_anchor_override() {
    let build = || {
        UdfImageBuilder::new()
            .blocks(1100)
            .anchors(vec![700])
            .build()
    };

    let mut device = build();
    let options = MountOptions {
        block_size: Some(2048),
        ..MountOptions::default()
    };
    assert!(matches!(mount(&mut device, &options).err(), Some(UdfError::NoAnchor)));

    let mut device = build();
    let options = MountOptions {
        anchor: Some(700),
        ..options
    };
    let volume = mount(&mut device, &options).unwrap();
    assert_eq!(volume.state().anchor_block, 700);
}

#[test]
fn test_half_open_disc_anchor() {
    let mut device = UdfImageBuilder::new().anchors(vec![512]).build();
    let volume = mount(&mut device, &MountOptions::default()).unwrap();
    assert_eq!(volume.state().anchor_block, 512);
}

#[test]
fn test_end_of_media_anchor_only() {
    let builder = UdfImageBuilder::new();
    let last = builder.last_block();
    let mut device = builder.anchors(vec![last]).build();
    let volume = mount(&mut device, &MountOptions::default()).unwrap();
    assert_eq!(volume.state().anchor_block, last);
    assert_eq!(volume.state().last_block, last);
}

#[test]
fn test_repeated_timeouts_skip_remaining_candidates() {
    let mut device = UdfImageBuilder::new()
        .blocks(1100)
        .anchors(vec![512])
        .build();
    for block in LAST_BLOCK_CANDIDATES {
        device.fail_at(block);
    }
    let clock = device.with_clock(Duration::from_secs(3));

    let volume = mount_with_clock(&mut device, &with_estimate(), Box::new(clock)).unwrap();
    assert_eq!(volume.state().anchor_block, 512);
    drop(volume);

    // three timeouts in a row exhaust the budget
    assert!(device.was_read(999));
    assert!(!device.was_read(743));
    assert!(!device.was_read(592));
}

#[test]
fn test_repeated_errors_skip_remaining_candidates() {
    let mut device = UdfImageBuilder::new()
        .blocks(1100)
        .anchors(vec![512])
        .build();
    for block in LAST_BLOCK_CANDIDATES {
        device.fail_at(block);
    }
    let clock = device.with_clock(Duration::from_millis(10));

    let volume = mount_with_clock(&mut device, &with_estimate(), Box::new(clock)).unwrap();
    assert_eq!(volume.state().anchor_block, 512);
    drop(volume);

    // thirteen fast failures exhaust the budget before the last candidate
    assert!(device.was_read(848));
    assert!(!device.was_read(592));
}

/// Move every block of a fixed-packet image to its variable-packet position
fn to_variable_packets(fixed: MemoryBlockDevice) -> MemoryBlockDevice {
    let bs = fixed.block_size;
    let blocks = (fixed.data.len() / bs) as u64;
    let size = fixed_to_variable(blocks - 1) + 1;
    let mut data = vec![0u8; size as usize * bs];
    for block in 0..blocks {
        let to = fixed_to_variable(block) as usize * bs;
        let from = block as usize * bs;
        data[to..to + bs].copy_from_slice(&fixed.data[from..from + bs]);
    }
    MemoryBlockDevice::new(data, bs)
}

#[test]
fn test_variable_packet_retry() {
    let mut device = to_variable_packets(UdfImageBuilder::new().build());
    let volume = mount(&mut device, &MountOptions::default()).unwrap();
    let state = volume.state();
    assert_eq!(state.addressing, Addressing::Variable);
    assert_eq!(state.anchor_block, 256);
    assert_eq!(state.last_block, 1023);
    assert_eq!(state.root.block, 2);
}

#[test]
fn test_anchor_with_broken_sequences_fails_structurally() {
    let mut device = UdfImageBuilder::new()
        .corrupt_main_pvd()
        .without_reserve()
        .build();
    let err = mount(&mut device, &MountOptions::default()).err().unwrap();
    assert!(matches!(err, UdfError::MissingDescriptor(_)));
    assert_eq!(err.to_errno(), libc::EIO);
}
