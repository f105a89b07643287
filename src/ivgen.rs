//! Pluggable IV-generation families.
//!
//! The pipelines depend only on the capability surface below; a family
//! that has no key-derived state simply inherits the no-op `init`/`wipe`.
//! The hidden-sector engine always pairs its slot cipher with the plain
//! generator over carrier sector numbers; the public payload path uses
//! whatever family the cipher spec names.

use aes::cipher::{BlockEncrypt, KeyInit};
use aes::{Aes256, Block};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::config::IV_SIZE;
use crate::error::{Result, VeilError};

/// Capability set exposed by every IV family. `init` derives key-dependent
/// state, `wipe` destroys it; families without such state keep the no-op
/// defaults. `post` exists for whitening families and is a no-op here.
pub trait IvGenerator: Send + Sync {
    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    fn wipe(&mut self) -> Result<()> {
        Ok(())
    }

    fn generate(&self, sector: u64, iv: &mut [u8; IV_SIZE]) -> Result<()>;

    fn post(&self, _sector: u64, _iv: &mut [u8; IV_SIZE]) -> Result<()> {
        Ok(())
    }
}

/// 32-bit sector number, little endian, zero padded.
pub struct PlainIv;

impl IvGenerator for PlainIv {
    fn generate(&self, sector: u64, iv: &mut [u8; IV_SIZE]) -> Result<()> {
        iv.fill(0);
        iv[..4].copy_from_slice(&(sector as u32).to_le_bytes());
        Ok(())
    }
}

/// Full 64-bit sector number, little endian.
pub struct Plain64Iv;

impl IvGenerator for Plain64Iv {
    fn generate(&self, sector: u64, iv: &mut [u8; IV_SIZE]) -> Result<()> {
        iv.fill(0);
        iv[..8].copy_from_slice(&sector.to_le_bytes());
        Ok(())
    }
}

/// 64-bit sector number, big endian, at the tail of the IV.
pub struct Plain64BeIv;

impl IvGenerator for Plain64BeIv {
    fn generate(&self, sector: u64, iv: &mut [u8; IV_SIZE]) -> Result<()> {
        iv.fill(0);
        iv[IV_SIZE - 8..].copy_from_slice(&sector.to_be_bytes());
        Ok(())
    }
}

/// Encrypted sector number under a digest of the data key, so equal
/// sectors on different devices get unrelated IVs.
pub struct EssivIv {
    key: Vec<u8>,
    tfm: Option<Aes256>,
}

impl EssivIv {
    pub fn new(hash: &str, key: &[u8]) -> Result<Self> {
        if hash != "sha256" {
            return Err(VeilError::ConfigInvalid(format!(
                "essiv digest {hash} not supported (use sha256)"
            )));
        }
        Ok(Self {
            key: key.to_vec(),
            tfm: None,
        })
    }
}

impl IvGenerator for EssivIv {
    fn init(&mut self) -> Result<()> {
        let salt = Sha256::digest(&self.key);
        self.tfm = Some(
            Aes256::new_from_slice(&salt)
                .map_err(|_| VeilError::KeyInvalid("essiv salt rejected".into()))?,
        );
        Ok(())
    }

    fn wipe(&mut self) -> Result<()> {
        self.tfm = None;
        Ok(())
    }

    fn generate(&self, sector: u64, iv: &mut [u8; IV_SIZE]) -> Result<()> {
        let tfm = self
            .tfm
            .as_ref()
            .ok_or_else(|| VeilError::KeyInvalid("essiv used before init".into()))?;
        iv.fill(0);
        iv[..8].copy_from_slice(&sector.to_le_bytes());
        let mut block = Block::clone_from_slice(iv);
        tfm.encrypt_block(&mut block);
        iv.copy_from_slice(&block);
        Ok(())
    }
}

/// big-endian 64-bit "block number" variant: narrow blocks count from 1.
pub struct BenbiIv {
    shift: u32,
}

impl BenbiIv {
    pub fn new() -> Self {
        // 512-byte sectors over 16-byte cipher blocks
        Self { shift: 9 - 4 }
    }
}

impl Default for BenbiIv {
    fn default() -> Self {
        Self::new()
    }
}

impl IvGenerator for BenbiIv {
    fn generate(&self, sector: u64, iv: &mut [u8; IV_SIZE]) -> Result<()> {
        iv.fill(0);
        let num = (sector << self.shift).wrapping_add(1);
        iv[IV_SIZE - 8..].copy_from_slice(&num.to_be_bytes());
        Ok(())
    }
}

/// All-zero IV (compatibility mode).
pub struct NullIv;

impl IvGenerator for NullIv {
    fn generate(&self, _sector: u64, iv: &mut [u8; IV_SIZE]) -> Result<()> {
        iv.fill(0);
        Ok(())
    }
}

/// Encrypted byte offset of the sector, after BitLocker eboiv.
pub struct EboivIv {
    key: Vec<u8>,
    tfm: Option<Aes256>,
}

impl EboivIv {
    pub fn new(key: &[u8]) -> Self {
        Self {
            key: key.to_vec(),
            tfm: None,
        }
    }
}

impl IvGenerator for EboivIv {
    fn init(&mut self) -> Result<()> {
        self.tfm = Some(
            Aes256::new_from_slice(&self.key)
                .map_err(|_| VeilError::KeyInvalid("eboiv key rejected".into()))?,
        );
        Ok(())
    }

    fn wipe(&mut self) -> Result<()> {
        self.tfm = None;
        Ok(())
    }

    fn generate(&self, sector: u64, iv: &mut [u8; IV_SIZE]) -> Result<()> {
        let tfm = self
            .tfm
            .as_ref()
            .ok_or_else(|| VeilError::KeyInvalid("eboiv used before init".into()))?;
        iv.fill(0);
        iv[..8].copy_from_slice(&(sector * crate::config::SECTOR_SIZE as u64).to_le_bytes());
        let mut block = Block::clone_from_slice(iv);
        tfm.encrypt_block(&mut block);
        iv.copy_from_slice(&block);
        Ok(())
    }
}

/// Fresh random IV per write; only usable for modes that store the IV.
pub struct RandomIv;

impl IvGenerator for RandomIv {
    fn generate(&self, _sector: u64, iv: &mut [u8; IV_SIZE]) -> Result<()> {
        OsRng.fill_bytes(iv);
        Ok(())
    }
}

/// Build and initialize the generator a cipher spec names.
///
/// `lmk`, `tcw` and `elephant` are recognized but rejected: their
/// whitening state is inseparable from cipher internals this engine does
/// not wire up.
pub fn create(mode: &str, ivopts: Option<&str>, key: &[u8]) -> Result<Box<dyn IvGenerator>> {
    let mut generator: Box<dyn IvGenerator> = match mode {
        "plain" => Box::new(PlainIv),
        "plain64" => Box::new(Plain64Iv),
        "plain64be" => Box::new(Plain64BeIv),
        "essiv" => {
            let hash = ivopts.ok_or_else(|| {
                VeilError::ConfigInvalid("essiv requires a digest option (essiv:sha256)".into())
            })?;
            Box::new(EssivIv::new(hash, key)?)
        }
        "benbi" => Box::new(BenbiIv::new()),
        "null" => Box::new(NullIv),
        "eboiv" => Box::new(EboivIv::new(key)),
        "random" => Box::new(RandomIv),
        "lmk" | "tcw" | "elephant" => {
            return Err(VeilError::ConfigInvalid(format!(
                "iv mode {mode} is not supported by this engine"
            )))
        }
        other => {
            return Err(VeilError::ConfigInvalid(format!(
                "unknown iv mode {other}"
            )))
        }
    };
    generator.init()?;
    Ok(generator)
}
