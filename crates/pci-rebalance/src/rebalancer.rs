//! The in-flight rebalance and the top-level entry point.

use crate::config::RebalanceConfig;
use crate::error::{RebalanceError, Result, Unsupported};
use crate::escalation::EscalationSearch;
use crate::fitter::Layout;
use crate::handle::RebalanceHandle;
use crate::lock::{FabricLocks, Wait};
use crate::map::RebalanceEntry;
use crate::root::check_rebalance_allowed;
use pci_fabric::{
    DeviceTree, Interval, NodeId, PropertyStore, Region, ResourceType, ResourceTypes, Slot,
};
use pci_rangeset::RangeSet;

/// A request for more resources below `bridge`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RebalanceRequest {
    pub bridge: NodeId,
    /// Device number of a newly arrived child to try placing from free space first.
    pub device: Option<u8>,
    pub types: ResourceTypes,
    pub wait: Wait,
}

impl RebalanceRequest {
    pub fn new(bridge: NodeId, types: ResourceTypes) -> Self {
        Self {
            bridge,
            device: None,
            types,
            wait: Wait::Forever,
        }
    }

    pub fn device(mut self, device: u8) -> Self {
        self.device = Some(device);
        self
    }

    pub fn wait(mut self, wait: Wait) -> Self {
        self.wait = wait;
        self
    }
}

/// Finds room for everything below `request.bridge`, moving sibling resources if needed.
///
/// On success the returned handle holds the fabric lock and the list of moves; commit it or
/// drop it. Nothing is written to the fabric here.
pub fn find_resources<F>(
    fabric: &F,
    locks: &FabricLocks,
    config: &RebalanceConfig,
    request: &RebalanceRequest,
) -> Result<RebalanceHandle>
where
    F: DeviceTree + PropertyStore,
{
    let RebalanceRequest {
        bridge,
        device,
        types,
        wait,
    } = *request;

    if types.contains(ResourceTypes::IO) {
        return Err(RebalanceError::Unsupported(Unsupported::IoRebalance));
    }
    if types.is_empty() {
        return Err(RebalanceError::BadRequest("no resource types requested"));
    }
    if !fabric.is_bridge(bridge) {
        return Err(RebalanceError::BadRequest("target is not a bridge"));
    }
    let root = fabric
        .fabric_root_of(bridge)
        .ok_or(RebalanceError::BadRequest("target is not part of a fabric"))?;
    check_rebalance_allowed(fabric, config, root)?;

    let mut rebalancer = Rebalancer::begin(fabric, locks, config, bridge, wait)?;

    if let Some(device) = device {
        if rebalancer.try_available(bridge, device, types)? {
            tracing::debug!(%bridge, device, "satisfied from free space");
            return Ok(rebalancer.into_handle());
        }
    }

    for resource in types.types() {
        if rebalancer.requirement_for(bridge, resource)?.is_empty() {
            tracing::debug!(%bridge, %resource, "nothing needed");
            continue;
        }
        rebalancer.search(resource)?;
    }
    Ok(rebalancer.into_handle())
}

/// Working state of one rebalance: the fabric being read and the handle being built.
pub struct Rebalancer<'a, F> {
    pub(crate) fabric: &'a F,
    pub(crate) config: &'a RebalanceConfig,
    pub(crate) handle: RebalanceHandle,
}

impl<'a, F> Rebalancer<'a, F>
where
    F: DeviceTree + PropertyStore,
{
    /// Locks the fabric containing `target` and starts an empty rebalance there.
    pub fn begin(
        fabric: &'a F,
        locks: &FabricLocks,
        config: &'a RebalanceConfig,
        target: NodeId,
        wait: Wait,
    ) -> Result<Self> {
        if !fabric.is_bridge(target) {
            return Err(RebalanceError::BadRequest("target is not a bridge"));
        }
        let root = fabric
            .fabric_root_of(target)
            .ok_or(RebalanceError::BadRequest("target is not part of a fabric"))?;
        let guard = locks.acquire(root, wait)?;
        Ok(Self {
            fabric,
            config,
            handle: RebalanceHandle::new(guard, target),
        })
    }

    pub fn handle(&self) -> &RebalanceHandle {
        &self.handle
    }

    pub fn into_handle(self) -> RebalanceHandle {
        self.handle
    }

    /// Escalates from the target bridge until `resource` fits somewhere, recording the moves.
    pub fn search(&mut self, resource: ResourceType) -> Result<Layout> {
        EscalationSearch::new(self.handle.target, resource).run(self)
    }

    /// The range `node` currently forwards for `resource`, as this rebalance sees it.
    pub(crate) fn current_range(&self, node: NodeId, resource: ResourceType) -> Option<Interval> {
        match resource {
            ResourceType::Bus => {
                let range = self.fabric.bus_range(node)?.interval()?;
                match self.handle.roots.bus_end {
                    Some(end) if node == self.handle.root && end > range.base => {
                        Some(Interval::new(range.base, end - range.base))
                    }
                    _ => Some(range),
                }
            }
            _ if self.fabric.is_fabric_root(node) => self
                .handle
                .roots
                .sections(resource)
                .and_then(RangeSet::span),
            _ => self.fabric.bridge_window(node, resource),
        }
    }

    /// Prefetchable BARs assigned outside their parent's prefetchable window are plain
    /// memory as far as placement is concerned.
    pub(crate) fn effective_type(&self, node: NodeId, region: &Region) -> ResourceType {
        if region.resource != ResourceType::PrefetchMem {
            return region.resource;
        }
        let assigned = if region.base != 0 || !region.relocatable {
            Some(region.interval())
        } else {
            self.fabric
                .assigned_regions(node)
                .into_iter()
                .find(|r| r.slot == region.slot && r.resource == ResourceType::PrefetchMem)
                .map(|r| r.interval())
        };
        let Some(assigned) = assigned.filter(|a| !a.is_empty()) else {
            return ResourceType::PrefetchMem;
        };
        let Some(parent) = self.fabric.parent(node) else {
            return ResourceType::PrefetchMem;
        };

        let inside = if self.fabric.is_fabric_root(parent) {
            self.fabric
                .root_ranges(parent, ResourceType::PrefetchMem)
                .iter()
                .any(|r| r.contains(&assigned))
        } else {
            self.fabric
                .bridge_window(parent, ResourceType::PrefetchMem)
                .is_some_and(|w| w.contains(&assigned))
        };
        if inside {
            ResourceType::PrefetchMem
        } else {
            ResourceType::Mem
        }
    }

    /// Records a fitted layout of `node`'s window and everything it implies below.
    pub(crate) fn commit_layout(&mut self, node: NodeId, resource: ResourceType, layout: &Layout) {
        if let Some(end) = layout.extended_to {
            self.extend_root_bus(node, end);
        }
        self.mark_layout(node, resource, &layout.entries);
        self.mark_subtree(node, resource);

        let top = match self.handle.top {
            Some(top) => self.fabric.common_ancestor(top, node).unwrap_or(node),
            None => node,
        };
        self.handle.top = Some(top);
    }

    fn extend_root_bus(&mut self, root: NodeId, end: u64) {
        let Some(old) = self.current_range(root, ResourceType::Bus) else {
            return;
        };
        tracing::debug!(%root, from = old.end(), to = end, "extending root bus range");
        self.handle.map.record(
            self.fabric,
            RebalanceEntry {
                owner: root,
                slot: Slot::BridgeWindow,
                resource: ResourceType::Bus,
                old_base: old.base,
                old_len: old.len,
                new_base: old.base,
                new_len: end - old.base,
            },
        );
        self.handle.roots.bus_end = Some(end);
    }
}
