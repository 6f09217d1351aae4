//! Placing a newly arrived device from its bridge's free space, without moving anything.

use crate::error::{RebalanceError, Result};
use crate::rebalancer::Rebalancer;
use crate::request::PlacedRequest;
use crate::root::checked_available;
use pci_fabric::{DeviceTree, NodeId, PropertyStore, ResourceType, ResourceTypes, Slot};
use pci_rangeset::{RangeError, RangeSet};

impl<'a, F> Rebalancer<'a, F>
where
    F: DeviceTree + PropertyStore,
{
    /// Tries to satisfy every function at `device` below `bridge` from the bridge's free
    /// space alone.
    ///
    /// Returns `Ok(false)` with nothing recorded when any need does not fit; the caller then
    /// runs the full search.
    pub fn try_available(
        &mut self,
        bridge: NodeId,
        device: u8,
        types: ResourceTypes,
    ) -> Result<bool> {
        let functions: Vec<NodeId> = self
            .fabric
            .children(bridge)
            .filter(|&c| self.fabric.device_number(c) == Some(device))
            .collect();
        if functions.is_empty() {
            return Err(RebalanceError::BadRequest("no such device below the bridge"));
        }

        let mut plan = Vec::new();
        for resource in types.types() {
            let Some(mut free) = self.free_space(bridge, resource) else {
                return Ok(false);
            };
            for &function in &functions {
                match self.place_from(&mut free, function, resource)? {
                    Some(placed) => plan.push((resource, function, placed)),
                    None => {
                        tracing::debug!(%bridge, device, %resource, "free space too small");
                        return Ok(false);
                    }
                }
            }
        }

        for (resource, function, placed) in plan {
            self.mark_layout(bridge, resource, &placed);
            if self.fabric.is_bridge(function) {
                self.mark_bridge(function, resource);
            }
        }
        Ok(true)
    }

    /// Unused space `bridge` forwards for `resource`.
    ///
    /// `None` when the recorded free space contradicts the bridge's ranges; the full search
    /// then decides what to do with the data.
    fn free_space(&self, bridge: NodeId, resource: ResourceType) -> Option<RangeSet> {
        let mut free = RangeSet::new();
        let unusable = |err: RangeError| {
            tracing::debug!(%bridge, %resource, %err, "free space unusable");
        };

        if resource == ResourceType::Bus {
            let Some(range) = self.fabric.bus_range(bridge) else {
                return Some(free);
            };
            let Some(own) = range.interval() else {
                tracing::debug!(%bridge, lo = range.lo, hi = range.hi, "inverted bus range");
                return None;
            };
            // The bridge's own secondary bus is not free.
            if own.len > 1 {
                free.insert(own.base + 1, own.len - 1).map_err(unusable).ok()?;
            }
            for child in self.fabric.children(bridge) {
                let Some(taken) = self.fabric.bus_range(child) else {
                    continue;
                };
                let Some(taken) = taken.interval() else {
                    tracing::debug!(%bridge, %child, "inverted child bus range");
                    return None;
                };
                free.remove(taken.base, taken.len).map_err(unusable).ok()?;
            }
            return Some(free);
        }

        let entries = if self.fabric.is_fabric_root(bridge) {
            checked_available(self.fabric, self.config, bridge, resource).ok()?
        } else {
            self.fabric.available(bridge, resource)
        };
        for entry in entries.into_iter().filter(|e| !e.is_empty()) {
            free.insert(entry.base, entry.len).map_err(unusable).ok()?;
        }
        Some(free)
    }

    /// Carves everything `function` needs out of `free`. `None` when something does not fit.
    fn place_from(
        &mut self,
        free: &mut RangeSet,
        function: NodeId,
        resource: ResourceType,
    ) -> Result<Option<Vec<PlacedRequest>>> {
        let unusable = |err: RangeError| {
            tracing::debug!(%function, %resource, %err, "free space unusable");
        };
        let mut placed = Vec::new();

        if self.fabric.is_bridge(function) {
            let req = self.requirement_for(function, resource)?;
            if req.is_fixed() {
                // Pinned contents are laid out by the full search.
                return Ok(None);
            }
            if !req.is_empty() {
                let window = self.collapse(&req);
                if window.size > 0 {
                    let Some(base) = free
                        .allocate(window.size, window.align)
                        .map_err(unusable)
                        .ok()
                        .flatten()
                    else {
                        return Ok(None);
                    };
                    placed.push(PlacedRequest::new(
                        function,
                        Slot::BridgeWindow,
                        base,
                        base + window.size,
                    ));
                }
            }
        }

        for need in self.device_needs(function, resource) {
            for pinned in &need.fixed {
                let current = self
                    .fabric
                    .assigned_regions(function)
                    .into_iter()
                    .any(|r| r.slot == pinned.slot && r.interval() == pinned.interval());
                if !current {
                    if !free.contains(pinned.base, pinned.len()) {
                        return Ok(None);
                    }
                    if free.remove(pinned.base, pinned.len()).map_err(unusable).is_err() {
                        return Ok(None);
                    }
                }
                placed.push(*pinned);
            }
            for sized in &need.relocatable {
                let Some(base) = free
                    .allocate(sized.size, sized.align)
                    .map_err(unusable)
                    .ok()
                    .flatten()
                else {
                    return Ok(None);
                };
                placed.push(PlacedRequest::new(
                    sized.owner,
                    sized.slot,
                    base,
                    base + sized.size,
                ));
            }
        }
        Ok(Some(placed))
    }
}
