//! Hidden-sector pipelines: fan one 512-byte hidden sector out across the
//! IV slots of a 52-sector public carrier run, and gather it back.
//!
//! A hidden write is a read-modify-write of the whole run. The raw tags
//! are the payload IVs, so splicing new slot contents rotates every
//! carrier's effective IV; the public payloads are carried across the
//! rewrite unchanged in plaintext.

use crate::config::{CARRIERS_PER_HIDDEN, HEAD_PAYLOAD, IV_SIZE, SECTOR_SIZE, TAIL_PAYLOAD};
use crate::error::{Result, VeilError};
use crate::ivslot::{self, Slot, SlotView};
use crate::metrics::Metrics;

use super::request::{IoRequest, PipelineState};
use super::CryptDevice;

/// Largest hidden logical sector the persistent tree can index.
pub const MAX_HIDDEN_LOGICAL: u32 = u16::MAX as u32;

fn check_logical(logical: u32) -> Result<()> {
    if logical > MAX_HIDDEN_LOGICAL {
        return Err(VeilError::OutOfRange {
            sector: logical as u64,
            limit: MAX_HIDDEN_LOGICAL as u64 + 1,
        });
    }
    Ok(())
}

/// Gather a run's payload sectors, still ciphertext. Offloaded to the
/// I/O submission pool unless the mapping opted out of the read
/// workqueue.
fn read_run_payloads(
    ctx: &CryptDevice,
    start: u64,
) -> Result<Vec<Box<[u8; SECTOR_SIZE]>>> {
    let dev = ctx.device().clone();
    let job = move || -> Result<Vec<Box<[u8; SECTOR_SIZE]>>> {
        let mut payloads = Vec::with_capacity(CARRIERS_PER_HIDDEN);
        for i in 0..CARRIERS_PER_HIDDEN {
            let mut sector = Box::new([0u8; SECTOR_SIZE]);
            dev.read_sector(start + i as u64, &mut sector)?;
            payloads.push(sector);
        }
        Ok(payloads)
    };
    if ctx.params().flags.no_read_workqueue {
        job()
    } else {
        ctx.io_pool().run(job)
    }
}

/// Read-modify-write of one hidden sector.
pub(crate) fn hidden_write(
    ctx: &CryptDevice,
    logical: u32,
    data: &[u8; SECTOR_SIZE],
) -> Result<()> {
    check_logical(logical)?;
    let mut req = IoRequest::new("hidden-write");
    let tagio = ctx.tagio();

    // Reuse the mapped run when the reuse bit is set; otherwise a fresh
    // contiguous run comes off the free list.
    let prev = ctx.map_lock().lock().find(logical);
    let (phys, fresh) = match prev {
        Some(entry) if entry.reuse => (entry.physical, false),
        _ => {
            let start = match ctx.freelist_lock().lock().allocate_carrier_run() {
                Ok(start) => start,
                Err(err) => {
                    req.latch(err);
                    return req.finish();
                }
            };
            Metrics::add(
                &ctx.metrics_ref().carriers_allocated,
                CARRIERS_PER_HIDDEN as u64,
            );
            (start, true)
        }
    };
    let sequence = prev.map(|e| e.sequence).unwrap_or(0).wrapping_add(1);

    // PreRead: raw tags (the current payload IVs), the decrypted slots
    // (their public counters survive a reuse), and the payload sectors.
    let mut stage = ctx.buffer_pool().get();
    let old_raw = match tagio.read_raw_tags(phys as u64, CARRIERS_PER_HIDDEN) {
        Ok(raw) => raw,
        Err(err) => {
            req.latch(err);
            return req.finish();
        }
    };
    match tagio.decrypt_tags(phys as u64, old_raw.clone()) {
        Ok(slots) => {
            for (i, slot) in slots.iter().enumerate() {
                stage[i * IV_SIZE..(i + 1) * IV_SIZE].copy_from_slice(slot);
            }
        }
        Err(err) => {
            req.latch(err);
            return req.finish();
        }
    }
    let mut payloads = match read_run_payloads(ctx, phys as u64) {
        Ok(payloads) => payloads,
        Err(err) => {
            req.latch(err);
            return req.finish();
        }
    };
    for (old_iv, sector) in old_raw.iter().zip(payloads.iter_mut()) {
        ctx.ciphers().read().public.decrypt_sector(old_iv, sector);
    }

    // Splice the plaintext into the staged slots.
    req.advance(PipelineState::Splice);
    let chunks = ivslot::split_payload(data);
    let mut slots: Vec<Slot> = Vec::with_capacity(CARRIERS_PER_HIDDEN);
    for (i, chunk) in chunks.iter().enumerate() {
        let pre: Slot = stage[i * IV_SIZE..(i + 1) * IV_SIZE]
            .try_into()
            .unwrap_or([0u8; IV_SIZE]);
        let counter = if fresh { 0 } else { ivslot::counter_of(&pre) };
        let slot = if i == 0 {
            let mut head = [0u8; HEAD_PAYLOAD];
            head.copy_from_slice(&chunk[..HEAD_PAYLOAD]);
            ivslot::pack_head(&head, logical, sequence, counter)
        } else {
            let mut tail = [0u8; TAIL_PAYLOAD];
            tail.copy_from_slice(&chunk[..TAIL_PAYLOAD]);
            ivslot::pack_tail(&tail, sequence, i as u8, counter)
        };
        stage[i * IV_SIZE..(i + 1) * IV_SIZE].copy_from_slice(&slot);
        slots.push(slot);
    }

    // Seal the slots (the ciphertext doubles as the new payload IVs),
    // then push the re-encrypted payloads through the ordering thread.
    req.advance(PipelineState::Encrypt);
    let sealed = match tagio.seal_run(phys as u64, slots) {
        Ok(sealed) => sealed,
        Err(err) => {
            req.latch(err);
            return req.finish();
        }
    };
    req.advance(PipelineState::Submit);
    let mut writes = Vec::with_capacity(CARRIERS_PER_HIDDEN);
    for (i, mut sector) in payloads.into_iter().enumerate() {
        ctx.ciphers().read().public.encrypt_sector(&sealed[i], &mut sector);
        writes.push((phys as u64 + i as u64, sector));
    }
    super::submit_payloads(ctx, &mut req, writes);
    if req.has_error() {
        return req.finish();
    }

    // Publish: map first, then the persistent tree. A tree failure rolls
    // the map back; the slots already written are reconciled by the next
    // startup scan via sequence numbers.
    {
        let mut map = ctx.map_lock().lock();
        map.insert(logical, phys, Some(sequence), true);
    }
    let tree_result = {
        let mut guard = ctx.tree_lock().lock();
        match guard.as_mut() {
            Some(tree) => tree.insert(logical as u16, phys),
            None => Err(VeilError::ConfigInvalid("tree missing".into())),
        }
    };
    if let Err(err) = tree_result {
        let mut map = ctx.map_lock().lock();
        match prev {
            Some(old) => {
                map.insert(logical, old.physical, Some(old.sequence), old.reuse);
            }
            None => {
                map.remove(logical);
            }
        }
        req.latch(err);
        return req.finish();
    }

    Metrics::bump(&ctx.metrics_ref().hidden_writes);
    req.advance(PipelineState::Done);
    req.finish()
}

/// Gather one hidden sector back out of its carrier run.
pub(crate) fn hidden_read(
    ctx: &CryptDevice,
    logical: u32,
    out: &mut [u8; SECTOR_SIZE],
) -> Result<()> {
    Metrics::bump(&ctx.metrics_ref().hidden_reads);
    let entry = match ctx.map_lock().lock().find(logical) {
        Some(entry) => entry,
        None => {
            // Unmapped reads succeed with indeterminate contents; proving
            // absence would leak the hidden namespace.
            out.fill(0);
            return Ok(());
        }
    };

    let mut req = IoRequest::new("hidden-read");
    let tagio = ctx.tagio();
    let slots = match tagio.read_slots(entry.physical as u64, CARRIERS_PER_HIDDEN) {
        Ok(slots) => slots,
        Err(err) => {
            req.latch(err);
            return req.finish();
        }
    };

    let head = match ivslot::parse(&slots[0]) {
        SlotView::Head(head) if head.logical == logical && head.sequence == entry.sequence => head,
        SlotView::Head(head) => {
            req.latch(VeilError::StaleHidden {
                logical,
                expected: entry.sequence,
                found: head.sequence,
            });
            return req.finish();
        }
        _ => {
            // The run was silently reclaimed by a public write.
            req.latch(VeilError::StaleHidden {
                logical,
                expected: entry.sequence,
                found: 0,
            });
            return req.finish();
        }
    };

    let mut plain = Vec::with_capacity(HEAD_PAYLOAD + (CARRIERS_PER_HIDDEN - 1) * TAIL_PAYLOAD);
    plain.extend_from_slice(&head.payload);
    for (i, slot) in slots.iter().enumerate().skip(1) {
        match ivslot::parse(slot) {
            SlotView::Tail(tail) if tail.offset as usize == i && tail.sequence == head.sequence => {
                plain.extend_from_slice(&tail.payload);
            }
            _ => {
                req.latch(VeilError::StaleHidden {
                    logical,
                    expected: entry.sequence,
                    found: 0,
                });
                return req.finish();
            }
        }
    }
    plain.truncate(SECTOR_SIZE);
    out.copy_from_slice(&plain);
    req.advance(PipelineState::Done);
    req.finish()
}

/// Logical removal: drop the map and tree entries; the chain on disk
/// goes stale.
pub(crate) fn hidden_discard(ctx: &CryptDevice, logical: u32) -> Result<()> {
    check_logical(logical)?;
    ctx.map_lock().lock().remove(logical);
    let mut guard = ctx.tree_lock().lock();
    if let Some(tree) = guard.as_mut() {
        tree.delete(logical as u16)?;
    }
    Ok(())
}
