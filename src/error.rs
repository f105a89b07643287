//! Error types for the veilcrypt engine.

/// Error types for the veilcrypt engine.
#[derive(Debug, thiserror::Error)]
pub enum VeilError {
    /// The free list cannot satisfy a contiguous carrier allocation
    #[error("no carriers: {needed} contiguous free sectors required, {available} sectors free")]
    NoCarriers { needed: usize, available: usize },

    /// A hidden read found carriers reclaimed by a public write
    #[error("stale hidden sector {logical}: chain carries sequence {found}, map expects {expected}")]
    StaleHidden {
        logical: u32,
        expected: u16,
        found: u16,
    },

    /// AEAD authentication failure on the integrity profile
    #[error("integrity check failed for sector {sector}")]
    IntegrityFailed { sector: u64 },

    /// The underlying device returned an error
    #[error("device I/O error at sector {sector}: {source}")]
    Io {
        sector: u64,
        #[source]
        source: std::io::Error,
    },

    /// No valid key is loaded (wiped, or never set)
    #[error("key invalid: {0}")]
    KeyInvalid(String),

    /// Construction-time parameter parsing failure
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Request deferred because a bounded resource is exhausted; the
    /// engine retries from a workqueue continuation, never drops
    #[error("resource backlog: {resource}")]
    Backlog { resource: &'static str },

    /// Sector outside the device or metadata region
    #[error("sector {sector} out of range: device has {limit} sectors")]
    OutOfRange { sector: u64, limit: u64 },

    /// Persistent tree state that cannot be interpreted
    #[error("metadata corrupt: {0}")]
    MetadataCorrupt(String),

    /// Operation requires the device to be suspended (or resumed)
    #[error("invalid device state: {0}")]
    DeviceState(&'static str),
}

/// Convenience Result type for veilcrypt operations.
pub type Result<T> = std::result::Result<T, VeilError>;

impl VeilError {
    /// Wrap an I/O error with the sector it occurred at.
    pub fn io(sector: u64, source: std::io::Error) -> Self {
        VeilError::Io { sector, source }
    }
}
