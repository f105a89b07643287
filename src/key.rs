//! Key specifications and live key material.
//!
//! A construction key string is hex-encoded bytes, `"-"` for no key, or a
//! kernel keyring reference of the shape `<type>:<descriptor>`. When the
//! hidden-sector engine is enabled the decoded material is two equal
//! halves: the public payload key followed by the hidden slot key.

use zeroize::Zeroizing;

use crate::cipher::KEY_LEN;
use crate::error::{Result, VeilError};

/// Keyring key types accepted in `<type>:<descriptor>` references.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyringType {
    Logon,
    User,
    Encrypted,
    Trusted,
}

impl KeyringType {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "logon" => Some(Self::Logon),
            "user" => Some(Self::User),
            "encrypted" => Some(Self::Encrypted),
            "trusted" => Some(Self::Trusted),
            _ => None,
        }
    }
}

/// Parsed form of the key argument.
#[derive(Debug, Clone)]
pub enum KeySpec {
    /// `"-"`: no key material.
    None,
    /// Hex-encoded raw bytes.
    Raw(Zeroizing<Vec<u8>>),
    /// `<type>:<descriptor>` keyring reference.
    Keyring {
        ktype: KeyringType,
        descriptor: String,
    },
}

impl KeySpec {
    pub fn parse(s: &str) -> Result<Self> {
        if s == "-" {
            return Ok(KeySpec::None);
        }
        if let Some((ktype, descriptor)) = s.split_once(':') {
            let ktype = KeyringType::parse(ktype).ok_or_else(|| {
                VeilError::ConfigInvalid(format!("unknown keyring key type {ktype}"))
            })?;
            if descriptor.is_empty() {
                return Err(VeilError::ConfigInvalid(
                    "empty keyring key descriptor".into(),
                ));
            }
            return Ok(KeySpec::Keyring {
                ktype,
                descriptor: descriptor.to_string(),
            });
        }
        let bytes = hex::decode(s)
            .map_err(|e| VeilError::ConfigInvalid(format!("key is not valid hex: {e}")))?;
        Ok(KeySpec::Raw(Zeroizing::new(bytes)))
    }
}

/// Live key material held by a constructed device.
pub struct KeyMaterial {
    public: Zeroizing<Vec<u8>>,
    hidden: Option<Zeroizing<Vec<u8>>>,
    valid: bool,
}

impl KeyMaterial {
    /// Resolve a spec into key material. `split_hidden` is set when the
    /// hidden engine is enabled and makes the material `public || hidden`
    /// in equal halves.
    pub fn from_spec(spec: &KeySpec, split_hidden: bool) -> Result<Self> {
        let raw = match spec {
            KeySpec::None => {
                return Err(VeilError::KeyInvalid(
                    "this target requires key material".into(),
                ))
            }
            KeySpec::Raw(bytes) => bytes.clone(),
            KeySpec::Keyring { descriptor, .. } => {
                // Resolution needs a kernel keyring; this backend has none.
                return Err(VeilError::KeyInvalid(format!(
                    "keyring key {descriptor} cannot be resolved on this backend"
                )));
            }
        };
        let expected = if split_hidden { 2 * KEY_LEN } else { KEY_LEN };
        if raw.len() != expected {
            return Err(VeilError::KeyInvalid(format!(
                "key must be {expected} bytes, got {}",
                raw.len()
            )));
        }
        let (public, hidden) = if split_hidden {
            let (p, h) = raw.split_at(KEY_LEN);
            (
                Zeroizing::new(p.to_vec()),
                Some(Zeroizing::new(h.to_vec())),
            )
        } else {
            (Zeroizing::new(raw.to_vec()), None)
        };
        Ok(Self {
            public,
            hidden,
            valid: true,
        })
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn public(&self) -> Result<&[u8]> {
        if !self.valid {
            return Err(VeilError::KeyInvalid("key has been wiped".into()));
        }
        Ok(&self.public)
    }

    pub fn hidden(&self) -> Result<&[u8]> {
        if !self.valid {
            return Err(VeilError::KeyInvalid("key has been wiped".into()));
        }
        self.hidden
            .as_ref()
            .map(|h| h.as_slice())
            .ok_or_else(|| VeilError::KeyInvalid("no hidden key configured".into()))
    }

    /// `key wipe`: randomize in place, then invalidate. Zeroizing handles
    /// the final drop.
    pub fn wipe(&mut self) {
        use rand::RngCore;
        let mut rng = rand::rngs::OsRng;
        rng.fill_bytes(&mut self.public);
        if let Some(hidden) = self.hidden.as_mut() {
            rng.fill_bytes(hidden);
        }
        self.valid = false;
    }

    /// `key set`: replace the material wholesale.
    pub fn set(&mut self, spec: &KeySpec) -> Result<()> {
        let fresh = KeyMaterial::from_spec(spec, self.hidden.is_some())?;
        *self = fresh;
        Ok(())
    }
}
