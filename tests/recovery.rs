//! Reboot and recovery scenarios: tree-walk restore, raw-scan restore,
//! and convergence onto the highest-sequence chain.

mod common;

use veilcrypt::config::IV_SIZE;
use veilcrypt::BlockDev;

#[test]
fn map_survives_reboot_via_the_tree() {
    let (backing, device) = common::open_hidden_device(8192);
    let payloads: Vec<_> = (1..=5u32)
        .map(|l| (l, common::random_sector(l as u64)))
        .collect();
    for (logical, data) in &payloads {
        device.hidden_write(*logical, data).unwrap();
    }
    let entries_before: Vec<_> = payloads
        .iter()
        .map(|(l, _)| (*l, device.map_entry(*l).unwrap()))
        .collect();

    drop(device);
    let device = common::reopen(&backing, 16);

    for (logical, entry) in &entries_before {
        let recovered = device.map_entry(*logical).expect("entry recovered");
        assert_eq!(recovered.physical, entry.physical, "logical {logical}");
        assert_eq!(recovered.sequence, entry.sequence, "logical {logical}");
    }
    for (logical, data) in &payloads {
        let mut back = [0u8; 512];
        device.hidden_read(*logical, &mut back).unwrap();
        assert_eq!(&back, data, "logical {logical}");
    }
}

#[test]
fn scan_rebuilds_the_map_without_the_tree() {
    let (backing, device) = common::open_hidden_device(8192);
    let data = common::random_sector(77);
    device.hidden_write(42, &data).unwrap();
    let entry = device.map_entry(42).unwrap();
    drop(device);

    // Wreck the tree root so only the steganographic encoding remains.
    backing.write_tag(0, &[0u8; IV_SIZE]).unwrap();

    let device = common::reopen(&backing, 16);
    assert!(
        device.tree_entries().unwrap().is_empty(),
        "tree must be gone"
    );
    let recovered = device.map_entry(42).expect("scan rebuilds the entry");
    assert_eq!(recovered.physical, entry.physical);
    assert_eq!(recovered.sequence, entry.sequence);

    let mut back = [0u8; 512];
    device.hidden_read(42, &mut back).unwrap();
    assert_eq!(back, data);
}

#[test]
fn scan_converges_on_the_highest_sequence_chain() {
    let (backing, device) = common::open_hidden_device(8192);
    let first = common::random_sector(1);
    device.hidden_write(9, &first).unwrap();
    let old_run = device.map_entry(9).unwrap().physical;
    drop(device);

    // After a reboot the reuse bit is clear, so the next write lays a
    // second chain with a higher sequence; the old one stays on disk.
    let device = common::reopen(&backing, 16);
    let second = common::random_sector(2);
    device.hidden_write(9, &second).unwrap();
    let new_entry = device.map_entry(9).unwrap();
    assert_ne!(new_entry.physical, old_run, "fresh run after recovery");
    assert_eq!(new_entry.sequence, 2);
    drop(device);

    let device = common::reopen(&backing, 16);
    let converged = device.map_entry(9).unwrap();
    assert_eq!(converged.physical, new_entry.physical);
    assert_eq!(converged.sequence, 2);

    let mut back = [0u8; 512];
    device.hidden_read(9, &mut back).unwrap();
    assert_eq!(back, second);
}

#[test]
fn free_list_is_seeded_by_the_scan() {
    let (_backing, device) = common::open_hidden_device(4096);
    // Everything except the reserved root region starts free.
    let reserved = veilcrypt::config::node_slots(16);
    assert_eq!(device.free_sector_count(), 4096 - reserved);
    for sector in 0..reserved as u32 {
        assert!(!device.sector_is_free(sector));
    }
}

#[test]
fn short_noise_chains_are_discarded() {
    let (backing, device) = common::open_hidden_device(4096);
    drop(device);

    // Hand-craft a lone head slot with no confirming tails. The scan
    // must reject it rather than invent a mapping.
    // (Raw tags are hidden-key ciphertext, so an attacker-visible random
    // tag decrypts to noise; writing noise directly models exactly that.)
    backing.write_tag(2000, &[0x5Au8; IV_SIZE]).unwrap();

    let device = common::reopen(&backing, 16);
    assert!(device.map_entry(0x5A5A_5A5A).is_none());
}
