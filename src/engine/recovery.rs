//! Startup scan: rebuild the hidden map and the carrier free list from
//! the steganographic encoding alone.
//!
//! The device's IV slots are divided into contiguous ranges, one per
//! worker. Each worker resolves every hidden-magic slot to its chain
//! head, applies the two-tail confirmation rule, and upserts the chain
//! into the shared map keeping the highest sequence per key. Slots that
//! decode as random seed the free list; accepted and losing (stale)
//! chains alike keep their sectors out of it.

use std::collections::HashSet;

use tracing::{debug, info};

use crate::config::{CARRIERS_PER_HIDDEN, CHAIN_CONFIRM_TAILS, RECOVERY_WORKERS};
use crate::error::Result;
use crate::ivslot::{self, SlotView};
use crate::metrics::Metrics;

use super::CryptDevice;

/// Run the parallel scan. Called with the hidden engine's shared state
/// already constructed; `tree_sectors` names the sectors legitimately
/// holding tree nodes.
pub(crate) fn recover(ctx: &CryptDevice, tree_sectors: &HashSet<u64>) -> Result<()> {
    let total = ctx.device().sectors();
    let reserved = u64::from(ctx.reserved_sectors());
    if total <= reserved {
        return Ok(());
    }
    let span = total - reserved;
    let workers = RECOVERY_WORKERS.min(span as usize).max(1);
    info!(total, workers, "scanning IV slots");

    std::thread::scope(|scope| {
        let mut handles = Vec::with_capacity(workers);
        for w in 0..workers {
            let lo = reserved + span * w as u64 / workers as u64;
            let hi = reserved + span * (w as u64 + 1) / workers as u64;
            handles.push(scope.spawn(move || scan_range(ctx, tree_sectors, lo, hi, total)));
        }
        let mut first_err = None;
        for handle in handles {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    first_err.get_or_insert(err);
                }
                Err(_) => {
                    first_err.get_or_insert(crate::error::VeilError::DeviceState(
                        "recovery worker panicked",
                    ));
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    })
}

fn scan_range(
    ctx: &CryptDevice,
    tree_sectors: &HashSet<u64>,
    lo: u64,
    hi: u64,
    device_end: u64,
) -> Result<()> {
    let tagio = ctx.tagio();
    debug!(lo, hi, "scan worker range");
    let mut sector = lo;
    while sector < hi {
        let slot = tagio.read_slot(sector)?;
        match ivslot::parse(&slot) {
            SlotView::Node => {
                // Real tree slots are never carriers and never free; a
                // tree magic anywhere else is decrypt noise.
                if !tree_sectors.contains(&sector) {
                    ctx.freelist_lock().lock().add(sector as u32);
                }
                sector += 1;
            }
            SlotView::Random => {
                ctx.freelist_lock().lock().add(sector as u32);
                sector += 1;
            }
            SlotView::Head(head) => {
                if sector + (CHAIN_CONFIRM_TAILS as u64) < device_end {
                    let tails = tagio.read_slots(sector + 1, CHAIN_CONFIRM_TAILS)?;
                    if ivslot::confirm_chain(&slot, &tails) {
                        accept_chain(ctx, head.logical, sector, head.sequence);
                        sector += CARRIERS_PER_HIDDEN as u64;
                        continue;
                    }
                }
                reject_slot(ctx, sector);
                sector += 1;
            }
            SlotView::Tail(tail) => {
                // We landed mid-chain (a range boundary, or a partially
                // overwritten run); walk back to the head and confirm
                // from there.
                let head_sector = match ivslot::head_sector(sector, tail.offset) {
                    Some(s) if s + (CHAIN_CONFIRM_TAILS as u64) < device_end => s,
                    _ => {
                        reject_slot(ctx, sector);
                        sector += 1;
                        continue;
                    }
                };
                let head_slot = tagio.read_slot(head_sector)?;
                let tails = tagio.read_slots(head_sector + 1, CHAIN_CONFIRM_TAILS)?;
                match ivslot::parse(&head_slot) {
                    SlotView::Head(head) if ivslot::confirm_chain(&head_slot, &tails) => {
                        accept_chain(ctx, head.logical, head_sector, head.sequence);
                        // Skip whatever remains of this chain.
                        sector = head_sector + CARRIERS_PER_HIDDEN as u64;
                    }
                    _ => {
                        reject_slot(ctx, sector);
                        sector += 1;
                    }
                }
            }
        }
    }
    Ok(())
}

fn accept_chain(ctx: &CryptDevice, logical: u32, head_sector: u64, sequence: u16) {
    let taken = ctx
        .map_lock()
        .lock()
        .upsert_max(logical, head_sector as u32, sequence);
    if taken {
        Metrics::bump(&ctx.metrics_ref().chains_recovered);
        debug!(logical, head_sector, sequence, "chain recovered");
    }
}

/// A magic slot that failed confirmation is indistinguishable from a
/// random IV; reclaim it.
fn reject_slot(ctx: &CryptDevice, sector: u64) {
    Metrics::bump(&ctx.metrics_ref().chains_rejected);
    ctx.freelist_lock().lock().add(sector as u32);
}
