//! Centralized configuration for the veilcrypt engine.
//!
//! This module contains constants and default parameters used throughout the
//! crate to ensure consistency and ease of modification. The IV-slot byte
//! positions defined here are an on-disk format: changing them invalidates
//! every existing device.

// --- Device Geometry ---

/// Size of one logical sector in bytes.
pub const SECTOR_SIZE: usize = 512;

/// Size of the per-sector integrity tag, which this design uses as the IV
/// slot. The slot cipher operates on exactly one block of this size.
pub const IV_SIZE: usize = 16;

/// Largest configurable sector size (`sector_size:<n>` optional parameter).
pub const MAX_SECTOR_SIZE: usize = 4096;

// --- IV-Slot Layout ---
//
// A slot is 16 bytes. Payload bytes come first; bookkeeping fields are
// packed at fixed positions from the tail:
//
//   [ payload | logical (head only) | sequence | iv_offset | counter | magic ]
//      0..          6..10             10..12       12        13..15     15

/// Marks a slot as carrying hidden payload bytes.
pub const HIDDEN_MAGIC: u8 = 0xAA;

/// Marks a slot as part of a persistent B+ tree node.
pub const TREE_MAGIC: u8 = 0xBB;

/// Byte position of the magic marker within a slot.
pub const MAGIC_POS: usize = IV_SIZE - 1;

/// Byte position of the little-endian public-write counter (2 bytes).
pub const COUNTER_POS: usize = IV_SIZE - 3;

/// Byte position of the carrier's offset within its run (1 byte).
pub const IV_OFFSET_POS: usize = IV_SIZE - 4;

/// Byte length of the logical hidden-sector number in the head slot.
pub const LOGICAL_LEN: usize = 4;

/// Byte length of the sequence number.
pub const SEQUENCE_LEN: usize = 2;

/// Hidden payload bytes carried by the head slot (`iv_offset == 0`).
pub const HEAD_PAYLOAD: usize = IV_OFFSET_POS - SEQUENCE_LEN - LOGICAL_LEN; // 6

/// Hidden payload bytes carried by each tail slot.
pub const TAIL_PAYLOAD: usize = IV_OFFSET_POS - SEQUENCE_LEN; // 10

/// Number of public carrier sectors consumed by one hidden sector:
/// `1 + ceil((SECTOR_SIZE - HEAD_PAYLOAD) / TAIL_PAYLOAD)`.
pub const CARRIERS_PER_HIDDEN: usize = 1 + (SECTOR_SIZE - HEAD_PAYLOAD).div_ceil(TAIL_PAYLOAD);

// --- Persistent B+ Tree Parameters ---

/// Default tree order (maximum children per inner node).
pub const DEFAULT_TREE_ORDER: usize = 16;

/// Minimum order a B+ tree can meaningfully have.
pub const MIN_TREE_ORDER: usize = 3;

/// Upper bound on the configurable tree order.
pub const MAX_TREE_ORDER: usize = 20;

/// Metadata sector at which the root node's run begins.
pub const ROOT_NODE_SECTOR: u32 = 0;

/// Value of the root-initialized byte in a written root image.
pub const ROOT_INITIALIZED: u8 = 0xAA;

/// Usable bytes per tree slot. The public-counter and magic positions are
/// common to every slot form, so a public overwrite can freshen a tree
/// slot's effective IV exactly as it does a data carrier's.
pub const NODE_BYTES_PER_SLOT: usize = COUNTER_POS;

/// Serialized length of a node stream at the given order: fixed header
/// (is_leaf, num_keys, root byte, parent) + keys + child/record pointers,
/// with one extra pointer slot so leaves can carry their next-leaf link.
pub const fn node_stream_len(order: usize) -> usize {
    7 + 2 * (order - 1) + 4 * order
}

/// Sector run occupied by one tree node. Eight slots (one 128-byte node
/// image) at the default order 16; the order-20 bound needs ten.
pub const fn node_slots(order: usize) -> usize {
    let needed = node_stream_len(order).div_ceil(NODE_BYTES_PER_SLOT);
    if needed < 8 {
        8
    } else {
        needed
    }
}

// --- Recovery Scanner ---

/// Worker threads used by the startup IV scan.
pub const RECOVERY_WORKERS: usize = 12;

/// Tail slots (ascending offsets from 1) that must confirm a head before
/// the scan accepts a chain. Anything shorter is indistinguishable from
/// noise.
pub const CHAIN_CONFIRM_TAILS: usize = 2;

// --- Worker Pools and Memory ---

/// Threads in the I/O submission pool.
pub const IO_WORKERS: usize = 2;

/// Threads in the crypto transform pool.
pub const CRYPT_WORKERS: usize = 4;

/// Scratch buffers held by the bounded per-device pool.
pub const POOL_BUFFERS: usize = 64;

/// Size of one pooled scratch buffer: the tag area of a full carrier run.
pub const POOL_BUFFER_LEN: usize = CARRIERS_PER_HIDDEN * IV_SIZE;

// --- Test-related Constants ---

/// A fixed random seed used in tests to ensure deterministic behavior.
pub const TEST_RANDOM_SEED: u64 = 42;
