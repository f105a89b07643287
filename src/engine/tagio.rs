//! Hidden-key tag-area I/O.
//!
//! Both hidden pipelines, the public-write preservation pass and the
//! persistent tree move IV slots through this primitive: read the raw
//! tags, decrypt them as single cipher blocks under the hidden key, and
//! the reverse on the way out. Per-slot IVs always come from the plain
//! generator over the carrier sector number, so an unchanged slot
//! re-encrypts to identical ciphertext.
//!
//! The raw (still encrypted) tag bytes double as the IV for the sector's
//! public payload: changing any plaintext field of a slot, including just
//! the public counter, rotates the payload's effective IV.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::IV_SIZE;
use crate::device::BlockDev;
use crate::error::{Result, VeilError};
use crate::ivgen::IvGenerator;
use crate::ivslot::Slot;
use crate::workers::WorkerPool;

use super::CipherSet;

/// Shared tag-path handle; cheap to clone per request.
#[derive(Clone)]
pub(crate) struct TagIo {
    dev: Arc<dyn BlockDev>,
    ciphers: Arc<RwLock<CipherSet>>,
    crypt_pool: Option<Arc<WorkerPool>>,
}

impl TagIo {
    pub fn new(
        dev: Arc<dyn BlockDev>,
        ciphers: Arc<RwLock<CipherSet>>,
        crypt_pool: Option<Arc<WorkerPool>>,
    ) -> Self {
        Self {
            dev,
            ciphers,
            crypt_pool,
        }
    }

    /// Read the raw on-disk tags of a run, without decrypting. These are
    /// the effective IVs of the corresponding payload sectors.
    pub fn read_raw_tags(&self, start: u64, count: usize) -> Result<Vec<Slot>> {
        let mut tags = Vec::with_capacity(count);
        for i in 0..count {
            let mut tag = [0u8; IV_SIZE];
            self.dev.read_tag(start + i as u64, &mut tag)?;
            tags.push(tag);
        }
        Ok(tags)
    }

    /// Read and decrypt the IV slots of `count` sectors starting at
    /// `start`.
    pub fn read_slots(&self, start: u64, count: usize) -> Result<Vec<Slot>> {
        let raw = self.read_raw_tags(start, count)?;
        self.decrypt_tags(start, raw)
    }

    /// Decrypt raw tags already read from `start`.
    pub fn decrypt_tags(&self, start: u64, raw: Vec<Slot>) -> Result<Vec<Slot>> {
        self.transform(start, raw, false)
    }

    /// Convenience single-slot read.
    pub fn read_slot(&self, sector: u64) -> Result<Slot> {
        let slots = self.read_slots(sector, 1)?;
        slots
            .into_iter()
            .next()
            .ok_or_else(|| VeilError::MetadataCorrupt("empty slot read".into()))
    }

    /// Encrypt a run of plaintext slots, write them as the run's tags,
    /// and return the ciphertext: the new payload IVs.
    pub fn seal_run(&self, start: u64, slots: Vec<Slot>) -> Result<Vec<Slot>> {
        let count = slots.len();
        let sealed = self.transform(start, slots, true)?;
        for (i, tag) in sealed.iter().enumerate().take(count) {
            self.dev.write_tag(start + i as u64, tag)?;
        }
        Ok(sealed)
    }

    /// Seal a run when the caller has no use for the new IVs.
    pub fn write_slots(&self, start: u64, slots: Vec<Slot>) -> Result<()> {
        self.seal_run(start, slots).map(|_| ())
    }

    /// Run the per-slot cipher over a run, on the crypto pool when one is
    /// attached (the provider may be busy; the pool gives us a
    /// continuation context), inline otherwise.
    fn transform(&self, start: u64, slots: Vec<Slot>, encrypt: bool) -> Result<Vec<Slot>> {
        let ciphers = self.ciphers.clone();
        let job = move || -> Result<Vec<Slot>> {
            let mut slots = slots;
            let guard = ciphers.read();
            let cipher = guard
                .hidden_slot
                .as_ref()
                .ok_or_else(|| VeilError::KeyInvalid("hidden key not configured".into()))?;
            for (i, slot) in slots.iter_mut().enumerate() {
                let mut iv = [0u8; IV_SIZE];
                guard.hidden_ivgen.generate(start + i as u64, &mut iv)?;
                if encrypt {
                    cipher.encrypt_slot(&iv, slot);
                } else {
                    cipher.decrypt_slot(&iv, slot);
                }
            }
            Ok(slots)
        };
        match &self.crypt_pool {
            Some(pool) => pool.run(job),
            None => job(),
        }
    }
}
