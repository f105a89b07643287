//! veilcrypt: transparent block-device encryption with plausibly-deniable
//! hidden storage.
//!
//! The engine sits between a filesystem and a raw block device. Every
//! public sector is encrypted under the public key; in parallel, a second
//! namespace of hidden sectors is multiplexed into the per-sector IV/tag
//! slots of public "carrier" sectors, where it is indistinguishable from
//! random IVs without the hidden key. A persistent B+ tree, itself stored
//! in the tag area, maps hidden logical sectors to their carriers across
//! reboots.
//!
//! ## Main Components
//!
//! - [`engine`]: the [`CryptDevice`] context and the hidden, public and
//!   recovery pipelines
//! - [`ivslot`]: steganographic codec for the 16-byte IV slot
//! - [`freelist`]: ordered carrier allocator
//! - [`map`]: in-memory hidden-sector map
//! - [`bptree`]: persistent B+ tree over tag-area node storage
//! - [`device`]: block-device contract with in-memory and file backends
//! - [`params`]: mapping-table argument parsing
//! - [`config`]: centralized geometry and layout constants
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use veilcrypt::{CryptDevice, DeviceParams, MemDevice};
//!
//! // public key || hidden key, hex encoded
//! let key = "0123456789abcdef".repeat(8);
//! let params = DeviceParams::parse(&[
//!     "aes-cbc-plain64",
//!     &key,
//!     "0",
//!     "mem:demo",
//!     "0",
//!     "1",
//!     "store_data_in_integrity_md:16",
//! ])?;
//!
//! let device = CryptDevice::open(params, Arc::new(MemDevice::new(8192)))?;
//! device.hidden_write(100, &[0x42u8; 512])?;
//!
//! let mut plain = [0u8; 512];
//! device.hidden_read(100, &mut plain)?;
//! assert_eq!(plain, [0x42u8; 512]);
//!
//! // Public traffic crossing the carriers leaves the hidden data intact.
//! device.public_write(0, &vec![0u8; 512 * 4])?;
//! # Ok::<(), veilcrypt::VeilError>(())
//! ```

pub mod bptree;
pub mod cipher;
pub mod config;
pub mod device;
pub mod dirty;
pub mod engine;
pub mod error;
pub mod freelist;
pub mod ivgen;
pub mod ivslot;
pub mod key;
pub mod map;
pub mod metrics;
pub mod params;
pub mod pool;
pub mod workers;

// Re-export commonly used types for convenience
pub use bptree::{BpTree, NodeStore};
pub use device::{BlockDev, FileDevice, MemDevice, OffsetDevice};
pub use engine::request::{IoRequest, PipelineState};
pub use engine::CryptDevice;
pub use error::{Result, VeilError};
pub use freelist::FreeList;
pub use ivslot::{HeadSlot, SlotView, TailSlot};
pub use key::KeySpec;
pub use map::{HiddenMap, MapEntry};
pub use metrics::{Metrics, MetricsSnapshot};
pub use params::{CipherSpec, DeviceParams, Flags, IntegritySpec};
