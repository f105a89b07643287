//! Device context and high-level engine surface.
//!
//! A [`CryptDevice`] owns everything one constructed mapping needs: the
//! backing device, both cipher contexts, the carrier free list, the
//! hidden-sector map, the persistent tree, the worker pools and the
//! bounded buffer pool. The original keeps most of this as module-level
//! state; packaging it as one value keeps construction and teardown
//! symmetrical and lets tests run devices side by side.

pub mod hidden;
pub mod public;
pub mod recovery;
pub mod request;
pub(crate) mod tagio;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::bptree::{BpTree, NodeStore};
use crate::cipher::{SectorCipher, SlotCipher};
use crate::config::{
    node_slots, CARRIERS_PER_HIDDEN, CRYPT_WORKERS, IO_WORKERS, NODE_BYTES_PER_SLOT, SECTOR_SIZE,
    TREE_MAGIC,
};
use crate::device::BlockDev;
use crate::error::{Result, VeilError};
use crate::freelist::FreeList;
use crate::ivgen::{self, IvGenerator, PlainIv};
use crate::ivslot::{self, SlotView};
use crate::key::{KeyMaterial, KeySpec};
use crate::map::{HiddenMap, MapEntry};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::params::DeviceParams;
use crate::pool::BufferPool;
use crate::workers::{WorkerPool, WriteOrderer};

use tagio::TagIo;

/// Live cipher contexts, rebuilt on rekey.
pub(crate) struct CipherSet {
    /// Payload cipher under the public key.
    pub public: SectorCipher,
    /// IV family named by the cipher spec, for payload IVs.
    pub public_ivgen: Box<dyn IvGenerator>,
    /// One-block slot cipher under the hidden key.
    pub hidden_slot: Option<SlotCipher>,
    /// Slot IVs are always plain over the carrier sector number.
    pub hidden_ivgen: PlainIv,
}

fn build_cipher_set(params: &DeviceParams, keys: &KeyMaterial) -> Result<CipherSet> {
    let public_key = keys.public()?;
    let public = SectorCipher::new(public_key)?;
    let public_ivgen = ivgen::create(
        &params.cipher.ivmode,
        params.cipher.ivopts.as_deref(),
        public_key,
    )?;
    let hidden_slot = if params.hidden_enabled() {
        Some(SlotCipher::new(keys.hidden()?)?)
    } else {
        None
    };
    Ok(CipherSet {
        public,
        public_ivgen,
        hidden_slot,
        hidden_ivgen: PlainIv,
    })
}

/// Node storage for the persistent tree: node images live in the IV
/// slots of contiguous metadata sectors, moved through the hidden tag
/// path; runs come from the carrier free list.
pub(crate) struct TreeStore {
    tagio: TagIo,
    dev: Arc<dyn BlockDev>,
    ciphers: Arc<RwLock<CipherSet>>,
    freelist: Arc<Mutex<FreeList>>,
    metrics: Arc<Metrics>,
    slots: usize,
}

impl NodeStore for TreeStore {
    fn image_len(&self) -> usize {
        self.slots * NODE_BYTES_PER_SLOT
    }

    fn read_node(&mut self, sector: u32, buf: &mut [u8]) -> Result<()> {
        let slots = self.tagio.read_slots(sector as u64, self.slots)?;
        for (i, slot) in slots.iter().enumerate() {
            let chunk = &mut buf[i * NODE_BYTES_PER_SLOT..(i + 1) * NODE_BYTES_PER_SLOT];
            // A slot without the tree magic is noise, not node state;
            // blanking it makes the root-initialized probe deterministic
            // on fresh devices.
            if slot[crate::config::MAGIC_POS] == TREE_MAGIC {
                chunk.copy_from_slice(&slot[..NODE_BYTES_PER_SLOT]);
            } else {
                chunk.fill(0);
            }
        }
        Ok(())
    }

    fn write_node(&mut self, sector: u32, buf: &[u8]) -> Result<()> {
        let start = sector as u64;

        // The raw tags are the payload IVs; rewriting a node rotates
        // them, so the payload sectors must be carried across, exactly as
        // a hidden data write does.
        let old_raw = self.tagio.read_raw_tags(start, self.slots)?;
        let old_slots = self.tagio.read_slots(start, self.slots)?;
        let mut payloads = Vec::with_capacity(self.slots);
        for (i, old_iv) in old_raw.iter().enumerate() {
            let mut payload = Box::new([0u8; SECTOR_SIZE]);
            self.dev.read_sector(start + i as u64, &mut payload)?;
            self.ciphers.read().public.decrypt_sector(old_iv, &mut payload);
            payloads.push(payload);
        }

        let mut slots = Vec::with_capacity(self.slots);
        for (i, chunk) in buf.chunks(NODE_BYTES_PER_SLOT).enumerate() {
            let mut slot = [0u8; crate::config::IV_SIZE];
            slot[..chunk.len()].copy_from_slice(chunk);
            // Public counters survive node rewrites.
            slot[crate::config::COUNTER_POS..crate::config::COUNTER_POS + 2]
                .copy_from_slice(&old_slots[i][crate::config::COUNTER_POS..crate::config::COUNTER_POS + 2]);
            slot[crate::config::MAGIC_POS] = TREE_MAGIC;
            slots.push(slot);
        }
        let sealed = self.tagio.seal_run(start, slots)?;
        for (i, mut payload) in payloads.into_iter().enumerate() {
            self.ciphers.read().public.encrypt_sector(&sealed[i], &mut payload);
            self.dev.write_sector(start + i as u64, &payload)?;
        }
        Metrics::bump(&self.metrics.tree_nodes_written);
        Ok(())
    }

    fn allocate(&mut self) -> Result<u32> {
        self.freelist.lock().allocate_run(self.slots)
    }

    fn release(&mut self, sector: u32) -> Result<()> {
        self.freelist.lock().release_run(sector, self.slots);
        Ok(())
    }
}

/// Push payload writes out for a request: through the sector-ordering
/// thread by default, or inline when the mapping opted out of the write
/// workqueue. Errors latch into the request.
pub(crate) fn submit_payloads(
    ctx: &CryptDevice,
    req: &mut request::IoRequest,
    payloads: Vec<(u64, Box<[u8; SECTOR_SIZE]>)>,
) {
    if ctx.params.flags.no_write_workqueue {
        for (sector, data) in payloads {
            if let Err(err) = ctx.dev.write_sector(sector, &data) {
                req.latch(err);
            }
        }
        return;
    }
    let mut completions = Vec::with_capacity(payloads.len());
    for (sector, data) in payloads {
        req.inc_pending();
        completions.push(ctx.writer.submit(sector, data));
    }
    for completion in completions {
        match completion.recv() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => req.latch(err),
            Err(_) => req.latch(VeilError::DeviceState("write orderer gone")),
        }
        req.dec_pending();
    }
}

/// A constructed encryption mapping with the hidden-sector engine.
pub struct CryptDevice {
    dev: Arc<dyn BlockDev>,
    params: DeviceParams,
    keys: Mutex<KeyMaterial>,
    ciphers: Arc<RwLock<CipherSet>>,
    freelist: Arc<Mutex<FreeList>>,
    map: Mutex<HiddenMap>,
    tree: Mutex<Option<BpTree<TreeStore>>>,
    pool: BufferPool,
    crypt_pool: Arc<WorkerPool>,
    io_pool: WorkerPool,
    writer: WriteOrderer,
    metrics: Arc<Metrics>,
    suspended: AtomicBool,
    /// Sectors 0..reserved hold the tree root run and are never handed to
    /// the free list.
    reserved: u32,
}

impl std::fmt::Debug for CryptDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptDevice").finish_non_exhaustive()
    }
}

impl CryptDevice {
    /// Construct a mapping over `dev` and bring the hidden engine online
    /// (tree walk or full recovery scan).
    pub fn open(params: DeviceParams, dev: Arc<dyn BlockDev>) -> Result<Self> {
        params.cipher.validate_backend()?;
        let dev: Arc<dyn BlockDev> = if params.start > 0 {
            Arc::new(crate::device::OffsetDevice::new(dev, params.start)?)
        } else {
            dev
        };
        let keys = KeyMaterial::from_spec(&params.key, params.hidden_enabled())?;
        let ciphers = Arc::new(RwLock::new(build_cipher_set(&params, &keys)?));
        let crypt_pool = Arc::new(WorkerPool::new(CRYPT_WORKERS, "veil-crypt"));
        let io_pool = WorkerPool::new(IO_WORKERS, "veil-io");
        let writer = WriteOrderer::new(dev.clone());
        let freelist = Arc::new(Mutex::new(FreeList::new()));
        let metrics = Arc::new(Metrics::new());
        let reserved = if params.hidden_enabled() {
            node_slots(params.tree_order) as u32
        } else {
            0
        };

        let device = Self {
            dev,
            params,
            keys: Mutex::new(keys),
            ciphers,
            freelist,
            map: Mutex::new(HiddenMap::new()),
            tree: Mutex::new(None),
            pool: BufferPool::for_tags(),
            crypt_pool,
            io_pool,
            writer,
            metrics,
            suspended: AtomicBool::new(false),
            reserved,
        };

        if device.params.hidden_enabled() {
            device.bring_up_hidden()?;
        }
        Ok(device)
    }

    fn bring_up_hidden(&self) -> Result<()> {
        let store = TreeStore {
            tagio: self.tagio(),
            dev: self.dev.clone(),
            ciphers: self.ciphers.clone(),
            freelist: self.freelist.clone(),
            metrics: self.metrics.clone(),
            slots: node_slots(self.params.tree_order),
        };
        let mut tree = BpTree::open(store, self.params.tree_order)?;

        // Sectors legitimately holding tree state; every other slot with
        // the tree magic is decrypt noise, which the scan may reclaim.
        let slots = node_slots(self.params.tree_order) as u64;
        let mut tree_sectors = std::collections::HashSet::new();
        if tree.is_initialized() {
            debug!("metadata root initialized; walking tree into the map");
            self.load_map_from_tree(&mut tree)?;
            for start in tree.node_sectors()? {
                for s in 0..slots {
                    tree_sectors.insert(u64::from(start) + s);
                }
            }
        }
        *self.tree.lock() = Some(tree);

        // The scan always runs: it seeds the free list and, when the tree
        // was missing or incomplete, converges the map onto the
        // highest-sequence chains.
        recovery::recover(self, &tree_sectors)?;
        info!(
            map_entries = self.map.lock().len(),
            free_sectors = self.freelist.lock().len(),
            "hidden engine online"
        );
        Ok(())
    }

    /// Seed the map from persisted tree records. The tree stores logical
    /// to physical only; sequences are re-read from each chain's head
    /// slot, and entries whose chain no longer matches are dropped.
    fn load_map_from_tree(&self, tree: &mut BpTree<TreeStore>) -> Result<()> {
        let tagio = self.tagio();
        let mut map = self.map.lock();
        for (key, phys) in tree.entries()? {
            let head = tagio.read_slot(phys as u64)?;
            match ivslot::parse(&head) {
                SlotView::Head(h) if h.logical == key as u32 => {
                    map.insert(key as u32, phys, Some(h.sequence), false);
                }
                other => {
                    warn!(key, phys, ?other, "tree record without live chain; dropping");
                }
            }
        }
        Ok(())
    }

    pub(crate) fn tagio(&self) -> TagIo {
        TagIo::new(
            self.dev.clone(),
            self.ciphers.clone(),
            if self.params.flags.same_cpu_crypt {
                None
            } else {
                Some(self.crypt_pool.clone())
            },
        )
    }

    fn check_ready(&self) -> Result<()> {
        if self.suspended.load(Ordering::Acquire) {
            return Err(VeilError::DeviceState("device is suspended"));
        }
        if !self.keys.lock().is_valid() {
            return Err(VeilError::KeyInvalid("key has been wiped".into()));
        }
        Ok(())
    }

    fn check_hidden(&self) -> Result<()> {
        if !self.params.hidden_enabled() {
            return Err(VeilError::ConfigInvalid(
                "hidden engine not enabled on this mapping".into(),
            ));
        }
        Ok(())
    }

    // --- I/O surface ---

    /// Write one hidden logical sector.
    pub fn hidden_write(&self, logical: u32, data: &[u8; SECTOR_SIZE]) -> Result<()> {
        self.check_ready()?;
        self.check_hidden()?;
        hidden::hidden_write(self, logical, data)
    }

    /// Read one hidden logical sector. Unmapped sectors read as zeros.
    pub fn hidden_read(&self, logical: u32, out: &mut [u8; SECTOR_SIZE]) -> Result<()> {
        self.check_ready()?;
        self.check_hidden()?;
        hidden::hidden_read(self, logical, out)
    }

    /// Logically remove a hidden sector: its map and tree entries go
    /// away; the on-disk chain becomes stale and is reclaimed by public
    /// writes.
    pub fn hidden_discard(&self, logical: u32) -> Result<()> {
        self.check_ready()?;
        self.check_hidden()?;
        hidden::hidden_discard(self, logical)
    }

    /// Write public sectors starting at `sector`; `data` must be a whole
    /// number of sectors.
    pub fn public_write(&self, sector: u64, data: &[u8]) -> Result<()> {
        self.check_ready()?;
        public::public_write(self, sector, data)
    }

    /// Read public sectors starting at `sector` into `out`.
    pub fn public_read(&self, sector: u64, out: &mut [u8]) -> Result<()> {
        self.check_ready()?;
        public::public_read(self, sector, out)
    }

    // --- lifecycle and control messages ---

    pub fn suspend(&self) {
        self.suspended.store(true, Ordering::Release);
    }

    /// Resume I/O; refused when no valid key is loaded.
    pub fn resume(&self) -> Result<()> {
        if !self.keys.lock().is_valid() {
            return Err(VeilError::KeyInvalid("refusing resume without a key".into()));
        }
        self.suspended.store(false, Ordering::Release);
        Ok(())
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    /// Post-construction control messages: `key set <key>` (suspended
    /// only) and `key wipe`.
    pub fn message(&self, msg: &str) -> Result<()> {
        let words: Vec<&str> = msg.split_whitespace().collect();
        match words.as_slice() {
            ["key", "set", spec] => {
                if !self.is_suspended() {
                    return Err(VeilError::DeviceState("rekey requires a suspended device"));
                }
                let spec = KeySpec::parse(spec)?;
                let mut keys = self.keys.lock();
                let fresh = KeyMaterial::from_spec(&spec, self.params.hidden_enabled())?;
                let set = build_cipher_set(&self.params, &fresh)?;
                *keys = fresh;
                *self.ciphers.write() = set;
                info!("key material replaced");
                Ok(())
            }
            ["key", "wipe"] => {
                self.keys.lock().wipe();
                info!("key material wiped");
                Ok(())
            }
            _ => Err(VeilError::ConfigInvalid(format!(
                "unknown message {msg:?}"
            ))),
        }
    }

    // --- shared state accessors used by the pipelines ---

    pub(crate) fn device(&self) -> &Arc<dyn BlockDev> {
        &self.dev
    }

    pub(crate) fn ciphers(&self) -> &Arc<RwLock<CipherSet>> {
        &self.ciphers
    }

    pub(crate) fn map_lock(&self) -> &Mutex<HiddenMap> {
        &self.map
    }

    pub(crate) fn freelist_lock(&self) -> &Arc<Mutex<FreeList>> {
        &self.freelist
    }

    pub(crate) fn tree_lock(&self) -> &Mutex<Option<BpTree<TreeStore>>> {
        &self.tree
    }

    pub(crate) fn buffer_pool(&self) -> &BufferPool {
        &self.pool
    }

    pub(crate) fn io_pool(&self) -> &WorkerPool {
        &self.io_pool
    }

    pub(crate) fn metrics_ref(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub(crate) fn reserved_sectors(&self) -> u32 {
        self.reserved
    }

    // --- introspection (simulator and tests) ---

    pub fn params(&self) -> &DeviceParams {
        &self.params
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Current map entry for a hidden logical sector.
    pub fn map_entry(&self, logical: u32) -> Option<MapEntry> {
        self.map.lock().find(logical)
    }

    /// Whether a public sector currently sits in the free list.
    pub fn sector_is_free(&self, sector: u32) -> bool {
        self.freelist.lock().contains(sector)
    }

    pub fn free_sector_count(&self) -> usize {
        self.freelist.lock().len()
    }

    /// Decrypt and decode one IV slot; verification and debugging
    /// surface.
    pub fn inspect_slot(&self, sector: u64) -> Result<SlotView> {
        self.check_hidden()?;
        let slot = self.tagio().read_slot(sector)?;
        Ok(ivslot::parse(&slot))
    }

    /// Persisted tree records, in key order.
    pub fn tree_entries(&self) -> Result<Vec<(u16, u32)>> {
        match self.tree.lock().as_mut() {
            Some(tree) => tree.entries(),
            None => Ok(Vec::new()),
        }
    }

    /// Carrier-run length, re-exported for callers sizing buffers.
    pub const fn carriers_per_hidden() -> usize {
        CARRIERS_PER_HIDDEN
    }
}
