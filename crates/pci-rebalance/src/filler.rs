//! Packing relocatable needs into the holes between fixed ones.

use crate::request::{
    align_down, pack_from, packed_end, sum_aligned_size, BridgeRequirement, PlacedRequest,
    SizedRequest,
};
use pci_fabric::ResourceType;

/// Highest base from which `run` packs to end at or below `limit`, if that base is at least
/// `lo`.
fn high_end_base(run: &[SizedRequest], lo: u64, limit: u64) -> Option<u64> {
    let head = run.first()?;
    let size = sum_aligned_size(run);
    let mut base = align_down(limit.checked_sub(size)?, head.align);
    loop {
        if base < lo {
            return None;
        }
        if packed_end(run, base).is_some_and(|end| end <= limit) {
            return Some(base);
        }
        base = align_down(base.checked_sub(head.align)?, head.align);
    }
}

/// Places a contiguous run of `relocatable` as high as possible inside `[lo, limit)`.
///
/// Runs are tried from each start position, longest first. The placed run is removed from
/// `relocatable`; an empty result means nothing fit.
pub fn place_high(relocatable: &mut Vec<SizedRequest>, lo: u64, limit: u64) -> Vec<PlacedRequest> {
    if lo >= limit {
        return Vec::new();
    }
    for start in 0..relocatable.len() {
        for end in (start + 1..=relocatable.len()).rev() {
            let run = &relocatable[start..end];
            let placed = high_end_base(run, lo, limit).and_then(|base| pack_from(run, base));
            if let Some(placed) = placed {
                tracing::trace!(
                    lo,
                    limit,
                    base = placed[0].base,
                    count = placed.len(),
                    "placed run at high end"
                );
                relocatable.drain(start..end);
                return placed;
            }
        }
    }
    Vec::new()
}

/// Moves relocatable needs into holes between consecutive fixed needs.
///
/// Each hole is filled from its high end; what is left of a hole below the placed block is
/// retried with the remaining needs. Needs that fit nowhere are returned for the caller to
/// place against the bridge's outer range.
pub fn fill(
    resource: ResourceType,
    mut relocatable: Vec<SizedRequest>,
    mut fixed: Vec<BridgeRequirement>,
) -> (Vec<SizedRequest>, Vec<BridgeRequirement>) {
    let mut i = 0;
    while i + 1 < fixed.len() && !relocatable.is_empty() {
        let (Some(lo), Some(limit)) = (fixed[i].fixed_end(), fixed[i + 1].fixed_base()) else {
            i += 1;
            continue;
        };
        let placed = place_high(&mut relocatable, lo, limit);
        if placed.is_empty() {
            i += 1;
            continue;
        }
        let at = i + 1;
        fixed.splice(at..at, placed.into_iter().map(|p| BridgeRequirement::pinned(resource, p)));
    }
    (relocatable, fixed)
}

/// The hole before `fixed[idx]` is too small and there is no room after it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct NoRoom;

/// Absorbs the residual relocatable needs of `fixed[idx]` around its fixed footprint.
///
/// The hole on the left (down to the previous fixed need, or `range_base` for the first one)
/// is filled from its high end, except for bus numbers; anything left is packed right after
/// the footprint and must end before the next fixed need. With no next need the right side
/// is unbounded here and checked against the bridge range when fitting.
pub fn grow(fixed: &mut [BridgeRequirement], idx: usize, range_base: u64) -> Result<(), NoRoom> {
    let lo = match idx {
        0 => Some(range_base),
        _ => fixed[idx - 1].fixed_end(),
    };
    let (Some(lo), Some(first), Some(last)) =
        (lo, fixed[idx].fixed_base(), fixed[idx].fixed_end())
    else {
        return Err(NoRoom);
    };

    let original = std::mem::take(&mut fixed[idx].relocatable);
    let mut residual = original.clone();
    // A bridge's bus numbers all lie above its own secondary bus, which heads its footprint.
    let left = match fixed[idx].resource {
        ResourceType::Bus => Vec::new(),
        _ => place_high(&mut residual, lo, first),
    };
    let limit = fixed.get(idx + 1).and_then(BridgeRequirement::fixed_base);
    let right = pack_from(&residual, last).filter(|right| {
        match (right.last().map(|p| p.end), limit) {
            (Some(end), Some(limit)) => end <= limit,
            _ => true,
        }
    });
    let Some(right) = right else {
        fixed[idx].relocatable = original;
        return Err(NoRoom);
    };

    let group = &mut fixed[idx];
    group.fixed.splice(0..0, left);
    group.fixed.extend(right);
    Ok(())
}
