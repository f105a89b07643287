//! Construction-surface scenarios: table validation, key handling, and
//! control messages.

mod common;

use std::sync::Arc;

use veilcrypt::{CryptDevice, DeviceParams, MemDevice, VeilError};

fn table(cipher: &str, key: &str) -> Vec<String> {
    vec![
        cipher.to_string(),
        key.to_string(),
        "0".into(),
        "mem:test".into(),
        "0".into(),
        "1".into(),
        "store_data_in_integrity_md:16".into(),
    ]
}

fn parse(args: &[String]) -> veilcrypt::Result<DeviceParams> {
    let refs: Vec<&str> = args.iter().map(String::as_str).collect();
    DeviceParams::parse(&refs)
}

#[test]
fn keyring_keys_are_parsed_but_unresolvable_here() {
    let params = parse(&table("aes-cbc-plain64", "logon:veil:disk0")).unwrap();
    match CryptDevice::open(params, Arc::new(MemDevice::new(256))) {
        Err(VeilError::KeyInvalid(_)) => {}
        other => panic!("expected KeyInvalid, got {other:?}"),
    }
}

#[test]
fn unsupported_cipher_is_config_invalid() {
    let params = parse(&table("serpent-cbc-plain64", &common::key_hex())).unwrap();
    match CryptDevice::open(params, Arc::new(MemDevice::new(256))) {
        Err(VeilError::ConfigInvalid(_)) => {}
        other => panic!("expected ConfigInvalid, got {other:?}"),
    }
}

#[test]
fn unsupported_iv_family_is_rejected_at_open() {
    let params = parse(&table("aes-cbc-lmk", &common::key_hex())).unwrap();
    assert!(matches!(
        CryptDevice::open(params, Arc::new(MemDevice::new(256))),
        Err(VeilError::ConfigInvalid(_))
    ));
}

#[test]
fn short_key_is_key_invalid() {
    let params = parse(&table("aes-cbc-plain64", &"ab".repeat(32))).unwrap();
    assert!(matches!(
        CryptDevice::open(params, Arc::new(MemDevice::new(256))),
        Err(VeilError::KeyInvalid(_))
    ));
}

#[test]
fn rekey_requires_suspension() {
    let (_backing, device) = common::open_hidden_device(1024);
    let fresh_key = "cd".repeat(64);
    let msg = format!("key set {fresh_key}");

    assert!(matches!(
        device.message(&msg),
        Err(VeilError::DeviceState(_))
    ));

    device.suspend();
    device.message(&msg).unwrap();
    device.resume().unwrap();
}

#[test]
fn io_is_refused_while_suspended() {
    let (_backing, device) = common::open_hidden_device(1024);
    device.suspend();
    assert!(matches!(
        device.hidden_write(1, &common::pattern(1)),
        Err(VeilError::DeviceState(_))
    ));
    assert!(matches!(
        device.public_read(0, &mut [0u8; 512]),
        Err(VeilError::DeviceState(_))
    ));
    device.resume().unwrap();
    device.hidden_write(1, &common::pattern(1)).unwrap();
}

#[test]
fn wipe_invalidates_io_and_blocks_resume() {
    let (_backing, device) = common::open_hidden_device(1024);
    device.hidden_write(3, &common::pattern(3)).unwrap();

    device.suspend();
    device.message("key wipe").unwrap();
    assert!(matches!(
        device.resume(),
        Err(VeilError::KeyInvalid(_))
    ));

    // Reloading the same key brings the device back.
    let key = common::key_hex();
    device.message(&format!("key set {key}")).unwrap();
    device.resume().unwrap();
    let mut back = [0u8; 512];
    device.hidden_read(3, &mut back).unwrap();
    assert_eq!(back, common::pattern(3));
}

#[test]
fn plain_mapping_round_trips_with_essiv() {
    let key32 = "ab".repeat(32);
    let params = DeviceParams::parse(&[
        "aes-cbc-essiv:sha256",
        key32.as_str(),
        "0",
        "mem:plain",
        "0",
    ])
    .unwrap();
    let device = CryptDevice::open(params, Arc::new(MemDevice::new(64))).unwrap();

    let data = common::random_sector(3);
    device.public_write(5, &data).unwrap();
    let mut back = [0u8; 512];
    device.public_read(5, &mut back).unwrap();
    assert_eq!(back[..], data[..]);

    // The hidden surface is absent on a plain mapping.
    assert!(matches!(
        device.hidden_write(0, &data),
        Err(VeilError::ConfigInvalid(_))
    ));
}

#[test]
fn start_offset_shifts_the_mapping() {
    let key32 = "ab".repeat(32);
    let params = DeviceParams::parse(&[
        "aes-cbc-plain64",
        key32.as_str(),
        "0",
        "mem:offset",
        "16",
    ])
    .unwrap();
    let backing = Arc::new(MemDevice::new(128));
    let device = CryptDevice::open(params, backing.clone()).unwrap();

    let data = common::random_sector(4);
    device.public_write(0, &data).unwrap();
    let mut back = [0u8; 512];
    device.public_read(0, &mut back).unwrap();
    assert_eq!(back[..], data[..]);

    // Mapped sector 0 landed at backing sector 16: the backing sectors
    // before the start are untouched.
    use veilcrypt::BlockDev;
    let mut raw = [0u8; 512];
    backing.read_sector(0, &mut raw).unwrap();
    assert_eq!(raw, [0u8; 512]);
    backing.read_sector(16, &mut raw).unwrap();
    assert_ne!(raw, [0u8; 512]);
}

#[test]
fn unknown_messages_are_rejected() {
    let (_backing, device) = common::open_hidden_device(1024);
    assert!(matches!(
        device.message("frobnicate"),
        Err(VeilError::ConfigInvalid(_))
    ));
}

#[test]
fn rekey_with_the_wrong_key_breaks_decryption_semantics() {
    let (backing, device) = common::open_hidden_device(2048);
    device.hidden_write(5, &common::pattern(5)).unwrap();
    drop(device);

    // Open with a different key: the tree probe sees noise, the scan
    // finds no valid chains, and the hidden namespace reads as absent.
    let other_key = "ef".repeat(64);
    let params = common::hidden_table(&other_key, 16);
    let device = CryptDevice::open(params, backing.clone()).unwrap();
    assert!(device.map_entry(5).is_none());
    let mut out = common::pattern(1);
    device.hidden_read(5, &mut out).unwrap();
    assert_eq!(out, [0u8; 512], "unmapped read under the wrong key");
}
