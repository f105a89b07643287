//! Symmetric transforms over sectors and IV slots.
//!
//! Two shapes of ciphertext exist in this design. Sector payloads are
//! encrypted CBC over 16-byte blocks with a per-sector IV from the
//! configured generator. IV slots are exactly one cipher block, so the
//! slot transform is the one-block degenerate case of CBC: whiten with the
//! IV, encrypt. Hidden-key slot transforms always take their IV from the
//! plain generator over the carrier sector number, which keeps a slot's
//! ciphertext stable when its plaintext and sector are unchanged.

use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::{Aes256, Block};

use crate::config::{IV_SIZE, SECTOR_SIZE};
use crate::error::{Result, VeilError};

/// AES-256 key length in bytes.
pub const KEY_LEN: usize = 32;

fn xor_in_place(buf: &mut [u8], mask: &[u8]) {
    for (b, m) in buf.iter_mut().zip(mask) {
        *b ^= m;
    }
}

/// One-block transform for 16-byte IV slots.
pub struct SlotCipher {
    aes: Aes256,
}

impl SlotCipher {
    pub fn new(key: &[u8]) -> Result<Self> {
        if key.len() != KEY_LEN {
            return Err(VeilError::KeyInvalid(format!(
                "slot cipher wants {KEY_LEN}-byte key, got {}",
                key.len()
            )));
        }
        Ok(Self {
            aes: Aes256::new_from_slice(key)
                .map_err(|_| VeilError::KeyInvalid("slot cipher key rejected".into()))?,
        })
    }

    pub fn encrypt_slot(&self, iv: &[u8; IV_SIZE], slot: &mut [u8; IV_SIZE]) {
        xor_in_place(slot, iv);
        let mut block = Block::clone_from_slice(slot);
        self.aes.encrypt_block(&mut block);
        slot.copy_from_slice(&block);
    }

    pub fn decrypt_slot(&self, iv: &[u8; IV_SIZE], slot: &mut [u8; IV_SIZE]) {
        let mut block = Block::clone_from_slice(slot);
        self.aes.decrypt_block(&mut block);
        slot.copy_from_slice(&block);
        xor_in_place(slot, iv);
    }
}

/// CBC transform for 512-byte sector payloads.
pub struct SectorCipher {
    aes: Aes256,
}

impl SectorCipher {
    pub fn new(key: &[u8]) -> Result<Self> {
        if key.len() != KEY_LEN {
            return Err(VeilError::KeyInvalid(format!(
                "sector cipher wants {KEY_LEN}-byte key, got {}",
                key.len()
            )));
        }
        Ok(Self {
            aes: Aes256::new_from_slice(key)
                .map_err(|_| VeilError::KeyInvalid("sector cipher key rejected".into()))?,
        })
    }

    pub fn encrypt_sector(&self, iv: &[u8; IV_SIZE], data: &mut [u8; SECTOR_SIZE]) {
        let mut prev = *iv;
        for chunk in data.chunks_exact_mut(IV_SIZE) {
            xor_in_place(chunk, &prev);
            let mut block = Block::clone_from_slice(chunk);
            self.aes.encrypt_block(&mut block);
            chunk.copy_from_slice(&block);
            prev.copy_from_slice(chunk);
        }
    }

    pub fn decrypt_sector(&self, iv: &[u8; IV_SIZE], data: &mut [u8; SECTOR_SIZE]) {
        let mut prev = *iv;
        for chunk in data.chunks_exact_mut(IV_SIZE) {
            let mut saved = [0u8; IV_SIZE];
            saved.copy_from_slice(chunk);
            let mut block = Block::clone_from_slice(chunk);
            self.aes.decrypt_block(&mut block);
            chunk.copy_from_slice(&block);
            xor_in_place(chunk, &prev);
            prev = saved;
        }
    }

    /// Single-block encrypt with a zero IV; the eboiv generator derives
    /// IVs this way.
    pub fn encrypt_block_raw(&self, block16: &mut [u8; IV_SIZE]) {
        let mut block = Block::clone_from_slice(block16);
        self.aes.encrypt_block(&mut block);
        block16.copy_from_slice(&block);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; KEY_LEN] = [7u8; KEY_LEN];

    #[test]
    fn slot_round_trip() {
        let cipher = SlotCipher::new(&KEY).unwrap();
        let iv = [3u8; IV_SIZE];
        let plain = *b"0123456789abcdef";
        let mut slot = plain;
        cipher.encrypt_slot(&iv, &mut slot);
        assert_ne!(slot, plain);
        cipher.decrypt_slot(&iv, &mut slot);
        assert_eq!(slot, plain);
    }

    #[test]
    fn slot_ciphertext_depends_on_iv() {
        let cipher = SlotCipher::new(&KEY).unwrap();
        let plain = [0x11u8; IV_SIZE];
        let mut a = plain;
        let mut b = plain;
        cipher.encrypt_slot(&[0u8; IV_SIZE], &mut a);
        cipher.encrypt_slot(&[1u8; IV_SIZE], &mut b);
        assert_ne!(a, b);
    }

    #[test]
    fn sector_round_trip() {
        let cipher = SectorCipher::new(&KEY).unwrap();
        let iv = [9u8; IV_SIZE];
        let mut data = [0u8; SECTOR_SIZE];
        for (i, byte) in data.iter_mut().enumerate() {
            *byte = (i % 256) as u8;
        }
        let original = data;
        cipher.encrypt_sector(&iv, &mut data);
        assert_ne!(data[..], original[..]);
        cipher.decrypt_sector(&iv, &mut data);
        assert_eq!(data[..], original[..]);
    }

    #[test]
    fn wrong_key_length_is_rejected() {
        assert!(matches!(
            SlotCipher::new(&[0u8; 16]),
            Err(VeilError::KeyInvalid(_))
        ));
    }
}
