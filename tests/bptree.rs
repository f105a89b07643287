//! Persistent-tree behavior through the full engine stack: order bounds,
//! split shape, and discard-driven deletion.

mod common;

use veilcrypt::config::{MAX_TREE_ORDER, MIN_TREE_ORDER};

#[test]
fn tree_records_every_mapping() {
    let (_backing, device) = common::open_hidden_device(8192);
    for logical in [10u32, 20, 30, 5, 15] {
        device
            .hidden_write(logical, &common::random_sector(logical as u64))
            .unwrap();
    }
    let entries = device.tree_entries().unwrap();
    let keys: Vec<u16> = entries.iter().map(|&(k, _)| k).collect();
    assert_eq!(keys, vec![5, 10, 15, 20, 30]);
    for (key, phys) in entries {
        assert_eq!(
            device.map_entry(key as u32).unwrap().physical,
            phys,
            "tree and map agree for {key}"
        );
    }
}

#[test]
fn order_three_survives_splits_and_reboot() {
    let (backing, device) = common::open_hidden_device_with_order(16384, MIN_TREE_ORDER);
    // Enough keys to force repeated splits at order 3.
    for logical in 0..24u32 {
        device
            .hidden_write(logical, &common::random_sector(logical as u64))
            .unwrap();
    }
    assert_eq!(device.tree_entries().unwrap().len(), 24);

    drop(device);
    let device = common::reopen(&backing, MIN_TREE_ORDER);
    for logical in 0..24u32 {
        let mut back = [0u8; 512];
        device.hidden_read(logical, &mut back).unwrap();
        assert_eq!(back, common::random_sector(logical as u64), "logical {logical}");
    }
}

#[test]
fn order_twenty_survives_splits_and_reboot() {
    let (backing, device) = common::open_hidden_device_with_order(16384, MAX_TREE_ORDER);
    for logical in (0..48u32).rev() {
        device
            .hidden_write(logical, &common::random_sector(logical as u64))
            .unwrap();
    }
    drop(device);
    let device = common::reopen(&backing, MAX_TREE_ORDER);
    assert_eq!(device.tree_entries().unwrap().len(), 48);
    let mut back = [0u8; 512];
    device.hidden_read(47, &mut back).unwrap();
    assert_eq!(back, common::random_sector(47));
}

#[test]
fn discard_deletes_the_tree_record() {
    let (backing, device) = common::open_hidden_device(8192);
    for logical in 0..8u32 {
        device
            .hidden_write(logical, &common::random_sector(logical as u64))
            .unwrap();
    }
    for logical in 0..4u32 {
        device.hidden_discard(logical).unwrap();
    }
    let keys: Vec<u16> = device
        .tree_entries()
        .unwrap()
        .iter()
        .map(|&(k, _)| k)
        .collect();
    assert_eq!(keys, vec![4, 5, 6, 7]);

    // Deletions persist across a reboot.
    drop(device);
    let device = common::reopen(&backing, 16);
    let keys: Vec<u16> = device
        .tree_entries()
        .unwrap()
        .iter()
        .map(|&(k, _)| k)
        .collect();
    assert_eq!(keys, vec![4, 5, 6, 7]);
}
