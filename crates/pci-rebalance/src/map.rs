//! The delta a successful rebalance hands to its committer.

use crate::rebalancer::Rebalancer;
use crate::request::PlacedRequest;
use pci_fabric::{DeviceTree, Interval, NodeId, PropertyStore, ResourceType, Slot};
use std::collections::HashMap;

/// One resource of one device moving from `old` to `new`.
///
/// `new_len == 0` frees the resource, except for [`Slot::BusNumber`] entries, which only tell
/// the committer that the device's bus changed to `new_base`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct RebalanceEntry {
    pub owner: NodeId,
    pub slot: Slot,
    pub resource: ResourceType,
    pub old_base: u64,
    pub old_len: u64,
    pub new_base: u64,
    pub new_len: u64,
}

impl RebalanceEntry {
    pub fn is_bus_renumber(&self) -> bool {
        self.slot == Slot::BusNumber
    }

    pub fn old(&self) -> Interval {
        Interval::new(self.old_base, self.old_len)
    }

    pub fn new_interval(&self) -> Interval {
        Interval::new(self.new_base, self.new_len)
    }
}

/// Entries grouped per device, devices chained parent-first.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RebalanceMap {
    order: Vec<NodeId>,
    entries: HashMap<NodeId, Vec<RebalanceEntry>>,
}

impl RebalanceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Affected devices; no device appears after any of its descendants.
    pub fn nodes(&self) -> &[NodeId] {
        &self.order
    }

    pub fn entries_for(&self, node: NodeId) -> &[RebalanceEntry] {
        self.entries.get(&node).map_or(&[], Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &[RebalanceEntry])> + '_ {
        self.order.iter().map(|&n| (n, self.entries_for(n)))
    }

    /// All entries in application order.
    pub fn entries(&self) -> impl Iterator<Item = &RebalanceEntry> + '_ {
        self.order.iter().flat_map(|&n| self.entries_for(n))
    }

    pub fn find(&self, owner: NodeId, resource: ResourceType, slot: Slot) -> Option<&RebalanceEntry> {
        self.entries_for(owner)
            .iter()
            .find(|e| e.resource == resource && e.slot == slot)
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Records `entry`, replacing an earlier entry for the same slot of the same resource.
    pub(crate) fn record<T: DeviceTree + ?Sized>(&mut self, tree: &T, entry: RebalanceEntry) {
        if !self.entries.contains_key(&entry.owner) {
            self.chain_node(tree, entry.owner);
        }
        let list = self.entries.entry(entry.owner).or_default();
        match list
            .iter_mut()
            .find(|e| e.resource == entry.resource && e.slot == entry.slot)
        {
            Some(existing) => *existing = entry,
            None => list.push(entry),
        }
    }

    /// Inserts `node` before the first chained descendant, or at the tail.
    fn chain_node<T: DeviceTree + ?Sized>(&mut self, tree: &T, node: NodeId) {
        match self.order.iter().position(|&n| tree.is_ancestor(node, n)) {
            Some(pos) => self.order.insert(pos, node),
            None => self.order.push(node),
        }
    }
}

impl<'a, F> Rebalancer<'a, F>
where
    F: DeviceTree + PropertyStore,
{
    /// Records the moves implied by `layout`, a fitted layout of `bridge`'s window.
    ///
    /// Child bridge windows in the layout also get their own contents placed, so the later
    /// subtree walk sees concrete addresses.
    pub(crate) fn mark_layout(&mut self, bridge: NodeId, resource: ResourceType, layout: &[PlacedRequest]) {
        for placed in layout {
            match placed.slot {
                Slot::Reserved => continue,
                // The bridge's own bus number, or its own window being handed back.
                Slot::BridgeWindow if placed.owner == bridge => continue,
                Slot::BridgeWindow => {
                    self.place_bridge_contents(placed, resource);
                    if resource == ResourceType::Bus {
                        self.mark_bus_renumber(placed);
                    }
                    self.mark_entry(placed, resource);
                }
                _ => self.mark_entry(placed, resource),
            }
        }
    }

    /// Marks the cached layouts of every bridge below `bridge`, parents first.
    pub(crate) fn mark_subtree(&mut self, bridge: NodeId, resource: ResourceType) {
        let children: Vec<NodeId> = self
            .fabric
            .children(bridge)
            .filter(|&c| self.fabric.is_bridge(c))
            .collect();
        for child in children {
            self.mark_bridge(child, resource);
        }
    }

    /// Marks `bridge`'s own cached layout, then everything below it.
    pub(crate) fn mark_bridge(&mut self, bridge: NodeId, resource: ResourceType) {
        if let Some(req) = self.handle.cache.get(bridge, resource) {
            let fixed = req.fixed.clone();
            self.mark_layout(bridge, resource, &fixed);
        }
        self.mark_subtree(bridge, resource);
    }

    /// Turns the relocatable contents of a child bridge into placements inside its new window.
    pub(crate) fn place_bridge_contents(&mut self, window: &PlacedRequest, resource: ResourceType) {
        let Some(req) = self.handle.cache.get_mut(window.owner, resource) else {
            return;
        };
        if req.relocatable.is_empty() {
            return;
        }
        let Some(placed) = crate::request::pack_from(&req.relocatable, window.base)
            .filter(|placed| placed.last().map_or(true, |p| p.end <= window.end))
        else {
            tracing::warn!(
                bridge = %window.owner,
                %resource,
                "bridge contents overflow the window chosen for them"
            );
            return;
        };
        req.fixed.extend(placed);
        req.fixed.sort_by_key(|p| p.base);
        req.relocatable.clear();
    }

    pub(crate) fn mark_entry(&mut self, placed: &PlacedRequest, resource: ResourceType) {
        let old = match placed.slot {
            Slot::BridgeWindow => self.current_range(placed.owner, resource),
            slot => self
                .fabric
                .assigned_regions(placed.owner)
                .into_iter()
                .find(|r| r.slot == slot && self.effective_type(placed.owner, r) == resource)
                .map(|r| r.interval()),
        }
        .unwrap_or_default();

        let new = placed.interval();
        let unchanged = old.len == new.len && (new.len == 0 || old.base == new.base);
        if unchanged {
            return;
        }

        let entry = RebalanceEntry {
            owner: placed.owner,
            slot: placed.slot,
            resource,
            old_base: old.base,
            old_len: old.len,
            new_base: if new.len == 0 { 0 } else { new.base },
            new_len: new.len,
        };
        tracing::debug!(
            owner = %entry.owner,
            slot = ?entry.slot,
            %resource,
            "move {:#x}+{:#x} -> {:#x}+{:#x}",
            entry.old_base,
            entry.old_len,
            entry.new_base,
            entry.new_len
        );
        self.handle.map.record(self.fabric, entry);
    }

    /// Tells every child of a bridge whose secondary bus moved about its new bus number.
    fn mark_bus_renumber(&mut self, window: &PlacedRequest) {
        let Some(old) = self.fabric.bus_range(window.owner) else {
            return;
        };
        if old.lo as u64 == window.base {
            return;
        }
        let children: Vec<NodeId> = self.fabric.children(window.owner).collect();
        for child in children {
            self.handle.map.record(
                self.fabric,
                RebalanceEntry {
                    owner: child,
                    slot: Slot::BusNumber,
                    resource: ResourceType::Bus,
                    old_base: old.lo as u64,
                    old_len: 0,
                    new_base: window.base,
                    new_len: 0,
                },
            );
        }
    }
}
