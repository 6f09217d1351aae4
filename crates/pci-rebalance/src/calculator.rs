//! Bottom-up aggregation of what each bridge's subtree needs.

use crate::error::{RebalanceError, Result};
use crate::filler::{fill, grow};
use crate::rebalancer::Rebalancer;
use crate::request::{
    sum_aligned_size, window_align, window_size, BridgeRequirement, PlacedRequest, SizedRequest,
};
use crate::sorter::{insert_fixed, SortedNeeds};
use pci_fabric::{DeviceTree, NodeId, PropertyStore, Region, ResourceType, Slot, VfNeed};
use std::collections::HashMap;

/// Resolved requirements keyed by `(bridge, resource)`.
///
/// An entry for a bridge implies every bridge below it is resolved too.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RequirementCache {
    entries: HashMap<(NodeId, ResourceType), BridgeRequirement>,
}

impl RequirementCache {
    pub fn get(&self, node: NodeId, resource: ResourceType) -> Option<&BridgeRequirement> {
        self.entries.get(&(node, resource))
    }

    pub(crate) fn get_mut(
        &mut self,
        node: NodeId,
        resource: ResourceType,
    ) -> Option<&mut BridgeRequirement> {
        self.entries.get_mut(&(node, resource))
    }

    pub(crate) fn insert(&mut self, req: BridgeRequirement) {
        self.entries.insert((req.owner, req.resource), req);
    }

    pub fn contains(&self, node: NodeId, resource: ResourceType) -> bool {
        self.entries.contains_key(&(node, resource))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<'a, F> Rebalancer<'a, F>
where
    F: DeviceTree + PropertyStore,
{
    /// What the children of `node` need from it for `resource`.
    ///
    /// Resolves the subtree on first use; later calls return the cached value unchanged.
    pub fn requirement_for(
        &mut self,
        node: NodeId,
        resource: ResourceType,
    ) -> Result<BridgeRequirement> {
        if let Some(req) = self.handle.cache.get(node, resource) {
            return Ok(req.clone());
        }
        self.resolve_subtree(node, resource)?;
        self.resolve_bridge(node, resource)
    }

    /// Resolves every uncached bridge below `node`, children before parents.
    pub(crate) fn resolve_subtree(&mut self, node: NodeId, resource: ResourceType) -> Result<()> {
        let bridges: Vec<NodeId> = self
            .fabric
            .children(node)
            .filter(|&c| self.fabric.is_bridge(c))
            .collect();
        for child in bridges {
            if self.handle.cache.contains(child, resource) {
                continue;
            }
            self.resolve_subtree(child, resource)?;
            self.resolve_bridge(child, resource)?;
        }
        Ok(())
    }

    /// Recomputes `bridge`'s requirement from its children's and caches it.
    pub(crate) fn resolve_bridge(
        &mut self,
        bridge: NodeId,
        resource: ResourceType,
    ) -> Result<BridgeRequirement> {
        let is_root = self.fabric.is_fabric_root(bridge);

        let mut needs = SortedNeeds::default();
        let children: Vec<NodeId> = self.fabric.children(bridge).collect();
        for child in children {
            for need in self.child_needs(child, resource) {
                needs.push(need);
            }
        }
        if is_root && resource.is_address() {
            for gap in self.root_sections(resource)?.gaps() {
                let hole = PlacedRequest::new(bridge, Slot::Reserved, gap.base, gap.end());
                needs.push(BridgeRequirement::pinned(resource, hole));
            }
        }

        // The bridge's own secondary bus.
        let mut own = None;
        if resource == ResourceType::Bus {
            let lo = self
                .fabric
                .bus_range(bridge)
                .filter(|_| self.config.policy.is_fixed(self.fabric, bridge, resource))
                .map(|r| u64::from(r.lo));
            match lo {
                Some(lo) => {
                    let placed = PlacedRequest::new(bridge, Slot::BridgeWindow, lo, lo + 1);
                    insert_fixed(&mut needs.fixed, BridgeRequirement::pinned(resource, placed));
                }
                None => own = Some(SizedRequest::new(bridge, Slot::BridgeWindow, 1, 1)),
            }
        }

        if needs.is_empty() && own.is_none() {
            let mut req = BridgeRequirement::new(bridge, resource);
            // Nothing below: hand back whatever window the bridge still holds.
            if !is_root && self.current_range(bridge, resource).is_some_and(|w| !w.is_empty()) {
                req.relocatable
                    .push(SizedRequest::new(bridge, Slot::BridgeWindow, 0, 1));
                req.window_align = window_align(resource, 1);
            }
            return Ok(self.cache_requirement(req));
        }

        let mut relocatable: Vec<SizedRequest> =
            needs.relocatable.iter().map(|n| self.collapse(n)).collect();
        if let Some(own) = own {
            relocatable.insert(0, own);
        }

        let req = if needs.fixed.is_empty() {
            let align = relocatable.iter().map(|r| r.align).max().unwrap_or(1);
            BridgeRequirement {
                relocatable,
                window_align: window_align(resource, align),
                ..BridgeRequirement::new(bridge, resource)
            }
        } else {
            self.combine_fixed(bridge, resource, relocatable, needs.fixed)?
        };
        Ok(self.cache_requirement(req))
    }

    fn cache_requirement(&mut self, req: BridgeRequirement) -> BridgeRequirement {
        tracing::trace!(
            bridge = %req.owner,
            resource = %req.resource,
            relocatable = req.relocatable.len(),
            fixed = req.fixed.len(),
            "resolved requirement"
        );
        self.handle.cache.insert(req.clone());
        req
    }

    /// Lays relocatable needs out around the fixed ones as far as the fixed ones allow.
    fn combine_fixed(
        &mut self,
        bridge: NodeId,
        resource: ResourceType,
        mut relocatable: Vec<SizedRequest>,
        mut fixed: Vec<BridgeRequirement>,
    ) -> Result<BridgeRequirement> {
        let range_base = self.current_range(bridge, resource).map(|r| r.base);

        for idx in 0..fixed.len() {
            if fixed[idx].relocatable.is_empty() {
                continue;
            }
            let owner = fixed[idx].owner;
            let base = range_base.or(fixed[idx].fixed_base()).unwrap_or(0);
            if grow(&mut fixed, idx, base).is_err() {
                tracing::warn!(
                    %bridge,
                    child = %owner,
                    %resource,
                    "no room around fixed resources for the rest of the subtree"
                );
                return Err(RebalanceError::ResourceExhausted {
                    node: owner,
                    resource,
                });
            }
            if owner != bridge && self.fabric.is_bridge(owner) {
                self.handle.cache.insert(fixed[idx].clone());
            }
        }

        // A movable bridge with pinned bus numbers below takes the bus right under them.
        if resource == ResourceType::Bus && !self.fabric.is_fabric_root(bridge) {
            let slot = fixed
                .first()
                .and_then(BridgeRequirement::fixed_base)
                .and_then(|base| base.checked_sub(1));
            let own = relocatable
                .first()
                .filter(|r| r.owner == bridge)
                .zip(slot)
                .and_then(|(r, base)| r.place_at(base));
            if let Some(own) = own {
                relocatable.remove(0);
                fixed.insert(0, BridgeRequirement::pinned(resource, own));
            }
        }

        let (residual, groups) = fill(resource, relocatable, fixed);

        let mut placed = Vec::new();
        for group in groups {
            let (Some(base), Some(end)) = (group.fixed_base(), group.fixed_end()) else {
                continue;
            };
            if group.owner != bridge && self.fabric.is_bridge(group.owner) {
                placed.push(PlacedRequest::new(group.owner, Slot::BridgeWindow, base, end));
            } else {
                placed.extend(group.fixed);
            }
        }
        placed.sort_by_key(|p| p.base);

        let align = residual.iter().map(|r| r.align).max().unwrap_or(1);
        Ok(BridgeRequirement {
            relocatable: residual,
            fixed: placed,
            window_align: window_align(resource, align),
            ..BridgeRequirement::new(bridge, resource)
        })
    }

    /// One relocatable entry standing for a child's whole need.
    pub(crate) fn collapse(&self, need: &BridgeRequirement) -> SizedRequest {
        match need.relocatable.as_slice() {
            [device]
                if device.owner == need.owner
                    && matches!(device.slot, Slot::Bar(_) | Slot::VirtualFunctions) =>
            {
                *device
            }
            list => {
                let resource = need.resource;
                let mut size = window_size(resource, sum_aligned_size(list));
                if self.fabric.is_hotplug_capable(need.owner) {
                    let current = self.current_range(need.owner, resource).map_or(0, |w| w.len);
                    size = size.max(current);
                }
                SizedRequest::new(need.owner, Slot::BridgeWindow, size, need.window_align)
            }
        }
    }

    /// Needs `child` puts on its parent: a bridge's resolved window, then its own device
    /// resources.
    fn child_needs(&self, child: NodeId, resource: ResourceType) -> Vec<BridgeRequirement> {
        let mut needs = Vec::new();
        if self.fabric.is_bridge(child) {
            needs.extend(
                self.handle
                    .cache
                    .get(child, resource)
                    .filter(|r| !r.is_empty())
                    .cloned(),
            );
        }
        needs.extend(self.device_needs(child, resource));
        needs
    }

    /// BAR and virtual-function needs of `node` itself.
    pub(crate) fn device_needs(
        &self,
        node: NodeId,
        resource: ResourceType,
    ) -> Vec<BridgeRequirement> {
        let mut needs = Vec::new();
        if let Some(vf) = self.fabric.vf_need(node, resource) {
            needs.extend(vf_need(node, resource, vf));
        }
        if !resource.is_address() {
            return needs;
        }

        let fixed_device = self.config.policy.is_fixed(self.fabric, node, resource);
        let regions = if fixed_device {
            self.fabric.assigned_regions(node)
        } else {
            self.fabric.declared_regions(node)
        };
        for region in regions {
            if !matches!(region.slot, Slot::Bar(_)) || region.len == 0 {
                continue;
            }
            if self.effective_type(node, &region) != resource {
                continue;
            }
            needs.extend(bar_need(node, resource, &region, fixed_device));
        }
        needs
    }
}

fn bar_need(
    node: NodeId,
    resource: ResourceType,
    region: &Region,
    fixed_device: bool,
) -> Option<BridgeRequirement> {
    let mut need = BridgeRequirement::new(node, resource);
    if fixed_device || !region.relocatable {
        let Some(end) = region.base.checked_add(region.len) else {
            tracing::warn!(%node, %resource, base = region.base, len = region.len, "BAR wraps");
            return None;
        };
        need.fixed
            .push(PlacedRequest::new(node, region.slot, region.base, end));
    } else {
        let Some(align) = region.len.checked_next_power_of_two() else {
            tracing::warn!(%node, %resource, len = region.len, "BAR too large to align");
            return None;
        };
        need.relocatable
            .push(SizedRequest::new(node, region.slot, region.len, align));
        need.window_align = align;
    }
    Some(need)
}

fn vf_need(node: NodeId, resource: ResourceType, vf: VfNeed) -> Option<BridgeRequirement> {
    if vf.total == 0 || vf.num_vfs == 0 {
        return None;
    }
    // Each VF's BAR is aligned to its own size; bus numbers are consecutive.
    let align = match resource {
        ResourceType::Bus => 1,
        _ => (vf.total / u64::from(vf.num_vfs)).checked_next_power_of_two()?,
    };
    Some(BridgeRequirement {
        relocatable: vec![SizedRequest::new(
            node,
            Slot::VirtualFunctions,
            vf.total,
            align,
        )],
        window_align: align,
        ..BridgeRequirement::new(node, resource)
    })
}
