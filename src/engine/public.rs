//! Public pipelines: payload encryption under the public key, with the
//! carrier-preservation pass that keeps live hidden chains intact across
//! public overwrites.
//!
//! With the hidden engine enabled, a sector's payload IV is its raw
//! on-disk tag. The preservation pass therefore rewrites the tag area
//! first; whatever each slot became, its sealed ciphertext is the IV the
//! new payload is encrypted under. Bumping a live carrier's public
//! counter rotates that IV without disturbing the hidden payload bytes.

use rand::rngs::OsRng;
use rand::RngCore;

use crate::config::{CARRIERS_PER_HIDDEN, IV_SIZE, SECTOR_SIZE};
use crate::error::{Result, VeilError};
use crate::ivslot::{self, HeadSlot, Slot, SlotView};
use crate::metrics::Metrics;

use super::request::{IoRequest, PipelineState};
use super::CryptDevice;

fn check_span(data_len: usize) -> Result<usize> {
    if data_len == 0 || data_len % SECTOR_SIZE != 0 {
        return Err(VeilError::ConfigInvalid(format!(
            "public I/O must be whole sectors, got {data_len} bytes"
        )));
    }
    Ok(data_len / SECTOR_SIZE)
}

/// Decide whether the head decoded for a sector describes a live chain.
fn chain_is_live(ctx: &CryptDevice, head_sector: u64, head: &HeadSlot) -> bool {
    match ctx.map_lock().lock().find(head.logical) {
        Some(entry) => entry.sequence == head.sequence && u64::from(entry.physical) == head_sector,
        None => false,
    }
}

/// Write public sectors, preserving any live hidden carriers they cross.
pub(crate) fn public_write(ctx: &CryptDevice, start: u64, data: &[u8]) -> Result<()> {
    let count = check_span(data.len())?;
    let mut req = IoRequest::new("public-write");
    let tagio = ctx.tagio();
    let reserved = u64::from(ctx.reserved_sectors());
    let hidden = ctx.params().hidden_enabled();

    // Per-sector payload IVs; with the hidden engine these are the sealed
    // tags produced below, otherwise the configured generator's output.
    let mut payload_ivs: Vec<Slot> = Vec::with_capacity(count);

    if hidden {
        // The preservation pass works the tag area in run-sized windows;
        // the scratch window comes from the bounded pool.
        let mut stage = ctx.buffer_pool().get();
        // Cached head lookup: consecutive tails of one chain resolve the
        // same head, fetched once.
        let mut cached_head: Option<(u64, HeadSlot)> = None;

        let mut at = 0usize;
        while at < count {
            let window = (count - at).min(CARRIERS_PER_HIDDEN);
            let window_start = start + at as u64;
            match tagio.read_slots(window_start, window) {
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

            for i in 0..window {
                let sector = window_start + i as u64;
                let range = i * IV_SIZE..(i + 1) * IV_SIZE;
                let mut slot: Slot = stage[range.clone()].try_into().unwrap_or([0u8; IV_SIZE]);

                match classify(ctx, &tagio, sector, &slot, &mut cached_head) {
                    Ok(Verdict::Metadata) | Ok(Verdict::Live) => {
                        if !req.dirty.contains(sector) {
                            ivslot::bump_counter(&mut slot);
                            req.dirty.add(sector);
                            Metrics::bump(&ctx.metrics_ref().carriers_preserved);
                        }
                    }
                    Ok(Verdict::Dead) => {
                        OsRng.fill_bytes(&mut slot);
                        req.dirty.remove(sector);
                        let sector32 = sector as u32;
                        let protected = sector < reserved
                            || ctx
                                .map_lock()
                                .lock()
                                .covers_with_reuse(sector32, CARRIERS_PER_HIDDEN);
                        if !protected {
                            ctx.freelist_lock().lock().add(sector32);
                            Metrics::bump(&ctx.metrics_ref().carriers_freed);
                        }
                    }
                    Err(err) => {
                        req.latch(err);
                        return req.finish();
                    }
                }
                stage[range].copy_from_slice(&slot);
            }

            req.advance(PipelineState::Encrypt);
            let rewritten: Vec<Slot> = (0..window)
                .map(|i| {
                    stage[i * IV_SIZE..(i + 1) * IV_SIZE]
                        .try_into()
                        .unwrap_or([0u8; IV_SIZE])
                })
                .collect();
            match tagio.seal_run(window_start, rewritten) {
                Ok(sealed) => payload_ivs.extend(sealed),
                Err(err) => {
                    req.latch(err);
                    return req.finish();
                }
            }
            at += window;
        }
    } else {
        for i in 0..count {
            let mut iv = [0u8; IV_SIZE];
            let generated = ctx
                .ciphers()
                .read()
                .public_ivgen
                .generate(start + i as u64 + ctx.params().iv_offset, &mut iv);
            if let Err(err) = generated {
                req.latch(err);
                return req.finish();
            }
            payload_ivs.push(iv);
        }
    }

    // The slot read-modify-write is complete; only now does the payload
    // write go out, so completion implies both.
    req.advance(PipelineState::Submit);
    let mut writes = Vec::with_capacity(count);
    for i in 0..count {
        let sector = start + i as u64;
        let mut buf = Box::new([0u8; SECTOR_SIZE]);
        buf.copy_from_slice(&data[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE]);
        ctx.ciphers().read().public.encrypt_sector(&payload_ivs[i], &mut buf);
        writes.push((sector, buf));
    }
    super::submit_payloads(ctx, &mut req, writes);

    Metrics::bump(&ctx.metrics_ref().public_writes);
    req.advance(PipelineState::Done);
    req.finish()
}

enum Verdict {
    /// Live hidden-data carrier: bump the counter, keep the payload.
    Live,
    /// Tree-node slot: preserved like a live carrier, never freed.
    Metadata,
    /// Random, malformed or stale: randomize and reclaim.
    Dead,
}

/// Interpret one decrypted slot, resolving tails to their head via the
/// per-request cache.
fn classify(
    ctx: &CryptDevice,
    tagio: &super::tagio::TagIo,
    sector: u64,
    slot: &Slot,
    cached_head: &mut Option<(u64, HeadSlot)>,
) -> Result<Verdict> {
    match ivslot::parse(slot) {
        SlotView::Node => Ok(Verdict::Metadata),
        SlotView::Random => Ok(Verdict::Dead),
        SlotView::Head(head) => {
            *cached_head = Some((sector, head));
            if chain_is_live(ctx, sector, &head) {
                Ok(Verdict::Live)
            } else {
                Ok(Verdict::Dead)
            }
        }
        SlotView::Tail(tail) => {
            let head_sector = match ivslot::head_sector(sector, tail.offset) {
                Some(s) => s,
                None => return Ok(Verdict::Dead),
            };
            let head = match cached_head {
                Some((cached_sector, cached)) if *cached_sector == head_sector => *cached,
                _ => {
                    let head_slot = tagio.read_slot(head_sector)?;
                    match ivslot::parse(&head_slot) {
                        SlotView::Head(head) => {
                            *cached_head = Some((head_sector, head));
                            head
                        }
                        // The offset chain does not lead to a head;
                        // treat this slot as random.
                        _ => return Ok(Verdict::Dead),
                    }
                }
            };
            if chain_is_live(ctx, head_sector, &head) {
                Ok(Verdict::Live)
            } else {
                Ok(Verdict::Dead)
            }
        }
    }
}

/// Public read: gather payload sectors and decrypt them. With the hidden
/// engine the IV is the sector's raw tag; otherwise the configured
/// generator's output.
pub(crate) fn public_read(ctx: &CryptDevice, start: u64, out: &mut [u8]) -> Result<()> {
    let count = check_span(out.len())?;
    Metrics::bump(&ctx.metrics_ref().public_reads);
    let hidden = ctx.params().hidden_enabled();
    let tagio = ctx.tagio();
    for i in 0..count {
        let sector = start + i as u64;
        let mut buf = [0u8; SECTOR_SIZE];
        ctx.device().read_sector(sector, &mut buf)?;
        let iv = if hidden {
            let raw = tagio.read_raw_tags(sector, 1)?;
            raw[0]
        } else {
            let mut iv = [0u8; IV_SIZE];
            ctx.ciphers()
                .read()
                .public_ivgen
                .generate(sector + ctx.params().iv_offset, &mut iv)?;
            iv
        };
        ctx.ciphers().read().public.decrypt_sector(&iv, &mut buf);
        out[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE].copy_from_slice(&buf);
    }
    Ok(())
}
