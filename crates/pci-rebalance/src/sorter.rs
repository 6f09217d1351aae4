//! Ordering of a bridge's per-child needs.

use crate::request::{sum_aligned_size, BridgeRequirement};
use pci_fabric::ResourceType;

/// A bridge's child needs, split by whether they can move.
///
/// Each element is one child's need: a single BAR of a leaf, or the whole resolved
/// requirement of a child bridge.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SortedNeeds {
    /// Descending alignment, then descending size; bus numbers in arrival order.
    pub relocatable: Vec<BridgeRequirement>,
    /// Ascending base.
    pub fixed: Vec<BridgeRequirement>,
}

impl SortedNeeds {
    pub fn push(&mut self, need: BridgeRequirement) {
        if need.is_fixed() {
            insert_fixed(&mut self.fixed, need);
        } else if !need.relocatable.is_empty() {
            insert_sized(&mut self.relocatable, need);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.relocatable.is_empty() && self.fixed.is_empty()
    }
}

/// Inserts before the first entry whose base is not lower.
pub fn insert_fixed(list: &mut Vec<BridgeRequirement>, need: BridgeRequirement) {
    let base = need.fixed_base();
    let pos = list
        .iter()
        .position(|n| base <= n.fixed_base())
        .unwrap_or(list.len());
    list.insert(pos, need);
}

/// Inserts before the first entry with a smaller alignment, or the same alignment and a size
/// no larger. Bus numbers are appended.
pub fn insert_sized(list: &mut Vec<BridgeRequirement>, need: BridgeRequirement) {
    if need.resource == ResourceType::Bus {
        list.push(need);
        return;
    }
    let align = need.window_align;
    let size = sum_aligned_size(&need.relocatable);
    let pos = list
        .iter()
        .position(|n| {
            align > n.window_align
                || (align == n.window_align && size >= sum_aligned_size(&n.relocatable))
        })
        .unwrap_or(list.len());
    list.insert(pos, need);
}
