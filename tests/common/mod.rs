//! Shared fixtures for the scenario tests.

#![allow(dead_code)]

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use veilcrypt::config::{SECTOR_SIZE, TEST_RANDOM_SEED};
use veilcrypt::{CryptDevice, DeviceParams, MemDevice};

/// 64 bytes of deterministic key material (public || hidden), hex encoded.
pub fn key_hex() -> String {
    let mut rng = StdRng::seed_from_u64(TEST_RANDOM_SEED);
    let mut key = [0u8; 64];
    rng.fill_bytes(&mut key);
    hex::encode(key)
}

/// Table line for a hidden-engine mapping at the given tree order.
pub fn hidden_table(key: &str, tree_order: usize) -> DeviceParams {
    let order = format!("tree_order:{tree_order}");
    DeviceParams::parse(&[
        "aes-cbc-plain64",
        key,
        "0",
        "mem:test",
        "0",
        "2",
        "store_data_in_integrity_md:16",
        &order,
    ])
    .expect("fixture table parses")
}

/// Fresh in-memory device plus an opened mapping over it.
pub fn open_hidden_device(sectors: u64) -> (Arc<MemDevice>, CryptDevice) {
    open_hidden_device_with_order(sectors, 16)
}

pub fn open_hidden_device_with_order(
    sectors: u64,
    tree_order: usize,
) -> (Arc<MemDevice>, CryptDevice) {
    let backing = Arc::new(MemDevice::new(sectors));
    let params = hidden_table(&key_hex(), tree_order);
    let device = CryptDevice::open(params, backing.clone()).expect("device opens");
    (backing, device)
}

/// Reopen a mapping over the same backing device, as after a reboot.
pub fn reopen(backing: &Arc<MemDevice>, tree_order: usize) -> CryptDevice {
    let params = hidden_table(&key_hex(), tree_order);
    CryptDevice::open(params, backing.clone()).expect("device reopens")
}

/// A full sector of one repeated byte.
pub fn pattern(byte: u8) -> [u8; SECTOR_SIZE] {
    [byte; SECTOR_SIZE]
}

/// A deterministic pseudorandom sector.
pub fn random_sector(seed: u64) -> [u8; SECTOR_SIZE] {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut data = [0u8; SECTOR_SIZE];
    rng.fill_bytes(&mut data);
    data
}
