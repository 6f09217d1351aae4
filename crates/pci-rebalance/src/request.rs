//! Value types describing what a subtree needs.

use pci_fabric::{Interval, NodeId, ResourceType, Slot};

/// Minimum granularity of an I/O window programmed into a bridge.
pub const IO_WINDOW_ALIGN: u64 = 0x1000;
/// Minimum granularity of a memory or prefetchable memory window programmed into a bridge.
pub const MEM_WINDOW_ALIGN: u64 = 0x10_0000;

/// A need whose address the allocator chooses.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct SizedRequest {
    pub owner: NodeId,
    pub slot: Slot,
    pub size: u64,
    /// Power of two; 1 means unaligned.
    pub align: u64,
}

impl SizedRequest {
    pub fn new(owner: NodeId, slot: Slot, size: u64, align: u64) -> Self {
        let align = align.max(1);
        debug_assert!(align.is_power_of_two());
        Self {
            owner,
            slot,
            size,
            align,
        }
    }

    /// Places this request at the first `align`-ed address at or after `base`. `None` when
    /// that runs past the end of the address space.
    pub fn place_at(&self, base: u64) -> Option<PlacedRequest> {
        let base = align_up(base, self.align)?;
        let end = base.checked_add(self.size)?;
        Some(PlacedRequest::new(self.owner, self.slot, base, end))
    }
}

/// A need bound to the half-open range `[base, end)`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct PlacedRequest {
    pub owner: NodeId,
    pub slot: Slot,
    pub base: u64,
    pub end: u64,
}

impl PlacedRequest {
    pub fn new(owner: NodeId, slot: Slot, base: u64, end: u64) -> Self {
        debug_assert!(base <= end);
        Self {
            owner,
            slot,
            base,
            end,
        }
    }

    pub fn len(&self) -> u64 {
        self.end - self.base
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.base
    }

    pub fn interval(&self) -> Interval {
        Interval::new(self.base, self.len())
    }
}

/// Aggregate need of one node for one resource type.
///
/// For a bridge this is what its children need from its window; `window_align` is the alignment
/// the bridge's own window must honour when the parent places it. Intermediate per-child
/// entries built while sorting use the same shape with the child as owner.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BridgeRequirement {
    pub owner: NodeId,
    pub resource: ResourceType,
    /// Descending alignment, then descending size. Bus numbers keep arrival order.
    pub relocatable: Vec<SizedRequest>,
    /// Ascending base.
    pub fixed: Vec<PlacedRequest>,
    pub window_align: u64,
}

impl BridgeRequirement {
    pub fn new(owner: NodeId, resource: ResourceType) -> Self {
        Self {
            owner,
            resource,
            relocatable: Vec::new(),
            fixed: Vec::new(),
            window_align: 1,
        }
    }

    /// A need made of a single already-placed entry.
    pub fn pinned(resource: ResourceType, placed: PlacedRequest) -> Self {
        Self {
            fixed: vec![placed],
            ..Self::new(placed.owner, resource)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.relocatable.is_empty() && self.fixed.is_empty()
    }

    pub fn is_fixed(&self) -> bool {
        !self.fixed.is_empty()
    }

    /// Lowest fixed base.
    pub fn fixed_base(&self) -> Option<u64> {
        self.fixed.first().map(|f| f.base)
    }

    /// Highest fixed end.
    pub fn fixed_end(&self) -> Option<u64> {
        self.fixed.last().map(|f| f.end)
    }

    /// Alignment of the head relocatable entry, the strictest one after sorting.
    pub fn head_align(&self) -> u64 {
        self.relocatable.first().map_or(1, |r| r.align)
    }
}

pub(crate) fn align_up(value: u64, align: u64) -> Option<u64> {
    debug_assert!(align.is_power_of_two());
    let mask = align - 1;
    value.checked_add(mask).map(|v| v & !mask)
}

pub(crate) fn align_down(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}

/// Space taken by `list` when packed from an `align`-ed base, gaps included.
///
/// Saturates at `u64::MAX`, a size no range can hold.
pub fn sum_aligned_size(list: &[SizedRequest]) -> u64 {
    packed_end(list, 0).unwrap_or(u64::MAX)
}

/// Exclusive end of `list` packed in order from `base`, or `None` past the address space.
pub(crate) fn packed_end(list: &[SizedRequest], base: u64) -> Option<u64> {
    list.iter().try_fold(base, |end, r| {
        align_up(end, r.align)?.checked_add(r.size)
    })
}

/// Packs `list` in order from `base`, each entry at its own alignment.
pub(crate) fn pack_from(list: &[SizedRequest], base: u64) -> Option<Vec<PlacedRequest>> {
    let mut next = base;
    list.iter()
        .map(|r| {
            let placed = r.place_at(next)?;
            next = placed.end;
            Some(placed)
        })
        .collect()
}

/// Alignment a bridge window for `resource` needs when its contents need `align`.
pub fn window_align(resource: ResourceType, align: u64) -> u64 {
    match resource {
        ResourceType::Io => align.max(IO_WINDOW_ALIGN),
        ResourceType::Mem | ResourceType::PrefetchMem => align.max(MEM_WINDOW_ALIGN),
        ResourceType::Bus => align.max(1),
    }
}

/// Rounds a window size up to the bridge granularity for `resource`, saturating at
/// `u64::MAX`.
pub fn window_size(resource: ResourceType, size: u64) -> u64 {
    let granule = match resource {
        ResourceType::Io => IO_WINDOW_ALIGN,
        ResourceType::Mem | ResourceType::PrefetchMem => MEM_WINDOW_ALIGN,
        ResourceType::Bus => return size,
    };
    align_up(size, granule).unwrap_or(u64::MAX)
}
