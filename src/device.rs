//! Underlying block-device contract and backends.
//!
//! The engine requires a device that stores, per sector, both the 512-byte
//! payload and a 16-byte integrity tag (the IV slot), with tag interval
//! equal to the sector size. Two backends are provided: an in-memory
//! device for tests and a file-backed device whose geometry travels in a
//! small serialized header.

use std::fs::{File, OpenOptions};
use std::io::{Read as _, Seek, SeekFrom, Write as _};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::{IV_SIZE, SECTOR_SIZE};
use crate::error::{Result, VeilError};

/// Sector-plus-tag block device.
///
/// Implementations are internally synchronized; the engine calls them from
/// several worker threads at once.
pub trait BlockDev: Send + Sync {
    /// Total number of sectors.
    fn sectors(&self) -> u64;

    fn read_sector(&self, sector: u64, buf: &mut [u8; SECTOR_SIZE]) -> Result<()>;

    fn write_sector(&self, sector: u64, buf: &[u8; SECTOR_SIZE]) -> Result<()>;

    fn read_tag(&self, sector: u64, tag: &mut [u8; IV_SIZE]) -> Result<()>;

    fn write_tag(&self, sector: u64, tag: &[u8; IV_SIZE]) -> Result<()>;

    fn check_range(&self, sector: u64) -> Result<()> {
        if sector >= self.sectors() {
            return Err(VeilError::OutOfRange {
                sector,
                limit: self.sectors(),
            });
        }
        Ok(())
    }
}

/// In-memory device, used by unit and scenario tests.
pub struct MemDevice {
    sectors: u64,
    data: Mutex<Vec<u8>>,
    tags: Mutex<Vec<u8>>,
}

impl MemDevice {
    /// Create a device of `sectors` sectors with zeroed payloads and tags.
    pub fn new(sectors: u64) -> Self {
        Self {
            sectors,
            data: Mutex::new(vec![0u8; sectors as usize * SECTOR_SIZE]),
            tags: Mutex::new(vec![0u8; sectors as usize * IV_SIZE]),
        }
    }
}

impl BlockDev for MemDevice {
    fn sectors(&self) -> u64 {
        self.sectors
    }

    fn read_sector(&self, sector: u64, buf: &mut [u8; SECTOR_SIZE]) -> Result<()> {
        self.check_range(sector)?;
        let data = self.data.lock();
        let at = sector as usize * SECTOR_SIZE;
        buf.copy_from_slice(&data[at..at + SECTOR_SIZE]);
        Ok(())
    }

    fn write_sector(&self, sector: u64, buf: &[u8; SECTOR_SIZE]) -> Result<()> {
        self.check_range(sector)?;
        let mut data = self.data.lock();
        let at = sector as usize * SECTOR_SIZE;
        data[at..at + SECTOR_SIZE].copy_from_slice(buf);
        Ok(())
    }

    fn read_tag(&self, sector: u64, tag: &mut [u8; IV_SIZE]) -> Result<()> {
        self.check_range(sector)?;
        let tags = self.tags.lock();
        let at = sector as usize * IV_SIZE;
        tag.copy_from_slice(&tags[at..at + IV_SIZE]);
        Ok(())
    }

    fn write_tag(&self, sector: u64, tag: &[u8; IV_SIZE]) -> Result<()> {
        self.check_range(sector)?;
        let mut tags = self.tags.lock();
        let at = sector as usize * IV_SIZE;
        tags[at..at + IV_SIZE].copy_from_slice(tag);
        Ok(())
    }
}

/// View of a device beginning at a fixed starting sector, the way a
/// mapping's `start` argument remaps it.
pub struct OffsetDevice {
    inner: Arc<dyn BlockDev>,
    start: u64,
    sectors: u64,
}

impl OffsetDevice {
    pub fn new(inner: Arc<dyn BlockDev>, start: u64) -> Result<Self> {
        let total = inner.sectors();
        if start >= total {
            return Err(VeilError::OutOfRange {
                sector: start,
                limit: total,
            });
        }
        Ok(Self {
            sectors: total - start,
            inner,
            start,
        })
    }
}

impl BlockDev for OffsetDevice {
    fn sectors(&self) -> u64 {
        self.sectors
    }

    fn read_sector(&self, sector: u64, buf: &mut [u8; SECTOR_SIZE]) -> Result<()> {
        self.check_range(sector)?;
        self.inner.read_sector(self.start + sector, buf)
    }

    fn write_sector(&self, sector: u64, buf: &[u8; SECTOR_SIZE]) -> Result<()> {
        self.check_range(sector)?;
        self.inner.write_sector(self.start + sector, buf)
    }

    fn read_tag(&self, sector: u64, tag: &mut [u8; IV_SIZE]) -> Result<()> {
        self.check_range(sector)?;
        self.inner.read_tag(self.start + sector, tag)
    }

    fn write_tag(&self, sector: u64, tag: &[u8; IV_SIZE]) -> Result<()> {
        self.check_range(sector)?;
        self.inner.write_tag(self.start + sector, tag)
    }
}

/// Geometry header persisted at the front of a file-backed device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct FileHeader {
    format_version: u16,
    sectors: u64,
    sector_size: u32,
    tag_size: u32,
}

const FILE_FORMAT_VERSION: u16 = 1;
const HEADER_RESERVED: u64 = 512;

/// File-backed device: a fixed header block, then the data region, then
/// the tag region.
pub struct FileDevice {
    sectors: u64,
    file: Mutex<File>,
}

impl FileDevice {
    /// Create (truncating) a backing file sized for `sectors` sectors.
    pub fn create(path: impl AsRef<Path>, sectors: u64) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| VeilError::io(0, e))?;
        let header = FileHeader {
            format_version: FILE_FORMAT_VERSION,
            sectors,
            sector_size: SECTOR_SIZE as u32,
            tag_size: IV_SIZE as u32,
        };
        let encoded = bincode::serialize(&header)
            .map_err(|e| VeilError::ConfigInvalid(format!("device header encode: {e}")))?;
        if encoded.len() as u64 > HEADER_RESERVED {
            return Err(VeilError::ConfigInvalid("device header too large".into()));
        }
        file.write_all(&encoded).map_err(|e| VeilError::io(0, e))?;
        let total = HEADER_RESERVED + sectors * (SECTOR_SIZE + IV_SIZE) as u64;
        file.set_len(total).map_err(|e| VeilError::io(0, e))?;
        Ok(Self {
            sectors,
            file: Mutex::new(file),
        })
    }

    /// Open an existing backing file, validating its geometry.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| VeilError::io(0, e))?;
        let mut raw = vec![0u8; HEADER_RESERVED as usize];
        file.read_exact(&mut raw).map_err(|e| VeilError::io(0, e))?;
        let header: FileHeader = bincode::deserialize(&raw)
            .map_err(|e| VeilError::ConfigInvalid(format!("device header decode: {e}")))?;
        if header.format_version != FILE_FORMAT_VERSION {
            return Err(VeilError::ConfigInvalid(format!(
                "unsupported device format version {}",
                header.format_version
            )));
        }
        if header.sector_size != SECTOR_SIZE as u32 || header.tag_size != IV_SIZE as u32 {
            return Err(VeilError::ConfigInvalid(format!(
                "device geometry {}/{} does not match engine geometry {}/{}",
                header.sector_size, header.tag_size, SECTOR_SIZE, IV_SIZE
            )));
        }
        Ok(Self {
            sectors: header.sectors,
            file: Mutex::new(file),
        })
    }

    fn data_offset(&self, sector: u64) -> u64 {
        HEADER_RESERVED + sector * SECTOR_SIZE as u64
    }

    fn tag_offset(&self, sector: u64) -> u64 {
        HEADER_RESERVED + self.sectors * SECTOR_SIZE as u64 + sector * IV_SIZE as u64
    }

    fn read_at(&self, sector: u64, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| VeilError::io(sector, e))?;
        file.read_exact(buf).map_err(|e| VeilError::io(sector, e))
    }

    fn write_at(&self, sector: u64, offset: u64, buf: &[u8]) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| VeilError::io(sector, e))?;
        file.write_all(buf).map_err(|e| VeilError::io(sector, e))
    }
}

impl BlockDev for FileDevice {
    fn sectors(&self) -> u64 {
        self.sectors
    }

    fn read_sector(&self, sector: u64, buf: &mut [u8; SECTOR_SIZE]) -> Result<()> {
        self.check_range(sector)?;
        self.read_at(sector, self.data_offset(sector), buf)
    }

    fn write_sector(&self, sector: u64, buf: &[u8; SECTOR_SIZE]) -> Result<()> {
        self.check_range(sector)?;
        self.write_at(sector, self.data_offset(sector), buf)
    }

    fn read_tag(&self, sector: u64, tag: &mut [u8; IV_SIZE]) -> Result<()> {
        self.check_range(sector)?;
        self.read_at(sector, self.tag_offset(sector), tag)
    }

    fn write_tag(&self, sector: u64, tag: &[u8; IV_SIZE]) -> Result<()> {
        self.check_range(sector)?;
        self.write_at(sector, self.tag_offset(sector), tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_device_round_trips_sector_and_tag() {
        let dev = MemDevice::new(8);
        let data = [0x5A; SECTOR_SIZE];
        let tag = [0xC3; IV_SIZE];
        dev.write_sector(3, &data).unwrap();
        dev.write_tag(3, &tag).unwrap();

        let mut data_back = [0u8; SECTOR_SIZE];
        let mut tag_back = [0u8; IV_SIZE];
        dev.read_sector(3, &mut data_back).unwrap();
        dev.read_tag(3, &mut tag_back).unwrap();
        assert_eq!(data_back, data);
        assert_eq!(tag_back, tag);
    }

    #[test]
    fn out_of_range_is_rejected() {
        let dev = MemDevice::new(4);
        let mut buf = [0u8; SECTOR_SIZE];
        match dev.read_sector(4, &mut buf) {
            Err(VeilError::OutOfRange { sector, limit }) => {
                assert_eq!(sector, 4);
                assert_eq!(limit, 4);
            }
            other => panic!("expected OutOfRange, got {other:?}"),
        }
    }

    #[test]
    fn offset_device_remaps_sectors() {
        let base: Arc<dyn BlockDev> = Arc::new(MemDevice::new(10));
        base.write_sector(7, &[9u8; SECTOR_SIZE]).unwrap();
        let view = OffsetDevice::new(base.clone(), 4).unwrap();
        assert_eq!(view.sectors(), 6);

        let mut buf = [0u8; SECTOR_SIZE];
        view.read_sector(3, &mut buf).unwrap();
        assert_eq!(buf, [9u8; SECTOR_SIZE]);
        view.write_tag(0, &[1u8; IV_SIZE]).unwrap();
        let mut tag = [0u8; IV_SIZE];
        base.read_tag(4, &mut tag).unwrap();
        assert_eq!(tag, [1u8; IV_SIZE]);

        assert!(OffsetDevice::new(base, 10).is_err());
    }

    #[test]
    fn file_device_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dev.img");
        {
            let dev = FileDevice::create(&path, 16).unwrap();
            dev.write_sector(5, &[0xAB; SECTOR_SIZE]).unwrap();
            dev.write_tag(5, &[0xCD; IV_SIZE]).unwrap();
        }
        let dev = FileDevice::open(&path).unwrap();
        assert_eq!(dev.sectors(), 16);
        let mut data = [0u8; SECTOR_SIZE];
        let mut tag = [0u8; IV_SIZE];
        dev.read_sector(5, &mut data).unwrap();
        dev.read_tag(5, &mut tag).unwrap();
        assert_eq!(data, [0xAB; SECTOR_SIZE]);
        assert_eq!(tag, [0xCD; IV_SIZE]);
    }
}
