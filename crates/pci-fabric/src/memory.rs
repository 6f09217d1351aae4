use crate::{
    BootRole, BusRange, DeviceIdentity, DeviceTree, Interval, NodeId, PciId, PropertyStore,
    PropertyWriter, Region, ResourceType, Slot, VfNeed,
};
use pci_rangeset::RangeSet;
use std::collections::BTreeMap;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum NodeKind {
    Root,
    Bridge,
    Device,
}

/// Static identity of a node added to a [`MemoryFabric`].
#[derive(Debug, Clone, Default)]
pub struct DeviceSpec {
    identity: Option<DeviceIdentity>,
    device_number: Option<u8>,
    boot_role: Option<BootRole>,
    hotplug_capable: bool,
}

impl DeviceSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(vendor_id: u16, device_id: u16) -> Self {
        Self::new().identity(DeviceIdentity::new(PciId::new(vendor_id, device_id), 0))
    }

    pub fn identity(mut self, identity: DeviceIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn class_code(mut self, class_code: u32) -> Self {
        let id = self.identity.map_or(PciId::new(0xffff, 0xffff), |i| i.id);
        self.identity = Some(DeviceIdentity::new(id, class_code));
        self
    }

    pub fn device_number(mut self, device: u8) -> Self {
        self.device_number = Some(device);
        self
    }

    pub fn boot_role(mut self, role: BootRole) -> Self {
        self.boot_role = Some(role);
        self
    }

    pub fn hotplug_capable(mut self) -> Self {
        self.hotplug_capable = true;
        self
    }
}

#[derive(Debug, Clone)]
struct NodeRecord {
    kind: NodeKind,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    spec: DeviceSpec,
    /// Bus number the node itself sits on.
    bus: u8,
    declared: Vec<Region>,
    assigned: Vec<Region>,
    windows: BTreeMap<ResourceType, Interval>,
    ranges: BTreeMap<ResourceType, Vec<Interval>>,
    bus_range: Option<BusRange>,
    available: BTreeMap<ResourceType, Vec<Interval>>,
    vf: BTreeMap<ResourceType, VfNeed>,
}

/// An in-memory device tree with firmware properties.
///
/// "available" lists are derived from the windows and assignments unless explicitly
/// overridden, so a committed rebalance is immediately reflected in them.
#[derive(Debug, Clone, Default)]
pub struct MemoryFabric {
    nodes: Vec<NodeRecord>,
}

impl MemoryFabric {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, kind: NodeKind, parent: Option<NodeId>, spec: DeviceSpec) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        let bus = parent
            .and_then(|p| self.nodes[p.index()].bus_range)
            .map_or(0, |r| r.lo);
        self.nodes.push(NodeRecord {
            kind,
            parent,
            children: Vec::new(),
            spec,
            bus,
            declared: Vec::new(),
            assigned: Vec::new(),
            windows: BTreeMap::new(),
            ranges: BTreeMap::new(),
            bus_range: None,
            available: BTreeMap::new(),
            vf: BTreeMap::new(),
        });
        if let Some(p) = parent {
            self.nodes[p.index()].children.push(id);
        }
        id
    }

    fn node(&self, node: NodeId) -> Option<&NodeRecord> {
        self.nodes.get(node.index())
    }

    fn node_mut(&mut self, node: NodeId) -> &mut NodeRecord {
        &mut self.nodes[node.index()]
    }

    /// Adds a host bridge heading a new fabric.
    pub fn add_root(&mut self, bus_range: BusRange) -> NodeId {
        let id = self.push(NodeKind::Root, None, DeviceSpec::new());
        let root = self.node_mut(id);
        root.bus = bus_range.lo;
        root.bus_range = Some(bus_range);
        id
    }

    pub fn add_bridge(&mut self, parent: NodeId, spec: DeviceSpec) -> NodeId {
        self.push(NodeKind::Bridge, Some(parent), spec)
    }

    pub fn add_device(&mut self, parent: NodeId, spec: DeviceSpec) -> NodeId {
        self.push(NodeKind::Device, Some(parent), spec)
    }

    pub fn set_root_ranges(&mut self, root: NodeId, resource: ResourceType, ranges: &[Interval]) {
        self.node_mut(root).ranges.insert(resource, ranges.to_vec());
    }

    pub fn open_window(&mut self, bridge: NodeId, resource: ResourceType, window: Interval) {
        self.node_mut(bridge).windows.insert(resource, window);
    }

    pub fn assign_bus_range(&mut self, bridge: NodeId, range: BusRange) {
        self.node_mut(bridge).bus_range = Some(range);
        let children = self.node(bridge).map(|n| n.children.clone()).unwrap_or_default();
        for child in children {
            self.node_mut(child).bus = range.lo;
        }
    }

    pub fn declare(&mut self, node: NodeId, region: Region) {
        self.node_mut(node).declared.push(region);
    }

    /// Records a current assignment. The region is also declared, as firmware would.
    pub fn assign(&mut self, node: NodeId, region: Region) {
        let record = self.node_mut(node);
        record.assigned.push(region);
        if !record
            .declared
            .iter()
            .any(|d| d.slot == region.slot && d.resource == region.resource)
        {
            let declared = if region.relocatable {
                Region::sized(region.resource, region.slot, region.len)
            } else {
                region
            };
            record.declared.push(declared);
        }
    }

    pub fn override_available(&mut self, node: NodeId, resource: ResourceType, free: &[Interval]) {
        self.node_mut(node).available.insert(resource, free.to_vec());
    }

    pub fn set_vf_need(&mut self, node: NodeId, resource: ResourceType, need: VfNeed) {
        self.node_mut(node).vf.insert(resource, need);
    }

    pub fn window(&self, bridge: NodeId, resource: ResourceType) -> Option<Interval> {
        self.node(bridge)?.windows.get(&resource).copied()
    }

    pub fn assigned(&self, node: NodeId, resource: ResourceType, slot: Slot) -> Option<Interval> {
        self.node(node)?
            .assigned
            .iter()
            .find(|r| r.resource == resource && r.slot == slot)
            .map(Region::interval)
    }

    /// Bus number `node` currently sits on.
    pub fn bus_of(&self, node: NodeId) -> Option<u8> {
        self.node(node).map(|n| n.bus)
    }

    fn derived_available(&self, record: &NodeRecord, resource: ResourceType) -> Vec<Interval> {
        let mut free = RangeSet::new();
        let mut taken = Vec::new();

        if resource == ResourceType::Bus {
            let Some(range) = record.bus_range else {
                return Vec::new();
            };
            let Some(own) = range.interval() else {
                tracing::warn!(
                    lo = range.lo,
                    hi = range.hi,
                    "inverted bus range in fabric description"
                );
                return Vec::new();
            };
            // The bridge's own secondary bus is never free.
            if own.len > 1 {
                if let Err(err) = free.insert(own.base + 1, own.len - 1) {
                    tracing::warn!(%err, "unusable bus range in fabric description");
                }
            }
            for &child in &record.children {
                let Some(r) = self.node(child).and_then(|c| c.bus_range) else {
                    continue;
                };
                match r.interval() {
                    Some(interval) => taken.push(interval),
                    None => tracing::warn!(lo = r.lo, hi = r.hi, "inverted child bus range"),
                }
            }
        } else {
            let sections = match record.kind {
                NodeKind::Root => record.ranges.get(&resource).cloned().unwrap_or_default(),
                NodeKind::Bridge => record.windows.get(&resource).copied().into_iter().collect(),
                NodeKind::Device => Vec::new(),
            };
            for section in sections.into_iter().filter(|s| !s.is_empty()) {
                if let Err(err) = free.insert(section.base, section.len) {
                    tracing::warn!(%err, "overlapping sections in fabric description");
                }
            }
            for &child in &record.children {
                let Some(c) = self.node(child) else {
                    continue;
                };
                taken.extend(c.windows.get(&resource).copied());
                taken.extend(
                    c.assigned
                        .iter()
                        .filter(|r| r.resource == resource)
                        .map(Region::interval),
                );
            }
        }

        for interval in taken.into_iter().filter(|i| !i.is_empty()) {
            if let Err(err) = free.remove(interval.base, interval.len) {
                tracing::warn!(%err, "child resource outside its parent's window");
            }
        }
        free.intervals().to_vec()
    }
}

impl DeviceTree for MemoryFabric {
    fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.node(node)?.parent
    }

    fn first_child(&self, node: NodeId) -> Option<NodeId> {
        self.node(node)?.children.first().copied()
    }

    fn next_sibling(&self, node: NodeId) -> Option<NodeId> {
        let parent = self.node(self.node(node)?.parent?)?;
        let pos = parent.children.iter().position(|&c| c == node)?;
        parent.children.get(pos + 1).copied()
    }

    fn is_bridge(&self, node: NodeId) -> bool {
        self.node(node)
            .is_some_and(|n| matches!(n.kind, NodeKind::Root | NodeKind::Bridge))
    }

    fn is_fabric_root(&self, node: NodeId) -> bool {
        self.node(node).is_some_and(|n| n.kind == NodeKind::Root)
    }

    fn fabric_roots(&self) -> Vec<NodeId> {
        (0..self.nodes.len())
            .map(|i| NodeId(i as u32))
            .filter(|&n| self.is_fabric_root(n))
            .collect()
    }
}

impl PropertyStore for MemoryFabric {
    fn identity(&self, node: NodeId) -> Option<DeviceIdentity> {
        self.node(node)?.spec.identity
    }

    fn device_number(&self, node: NodeId) -> Option<u8> {
        self.node(node)?.spec.device_number
    }

    fn declared_regions(&self, node: NodeId) -> Vec<Region> {
        self.node(node).map(|n| n.declared.clone()).unwrap_or_default()
    }

    fn assigned_regions(&self, node: NodeId) -> Vec<Region> {
        self.node(node).map(|n| n.assigned.clone()).unwrap_or_default()
    }

    fn bridge_window(&self, node: NodeId, resource: ResourceType) -> Option<Interval> {
        let record = self.node(node)?;
        if record.kind != NodeKind::Bridge {
            return None;
        }
        record.windows.get(&resource).copied()
    }

    fn root_ranges(&self, root: NodeId, resource: ResourceType) -> Vec<Interval> {
        self.node(root)
            .and_then(|n| n.ranges.get(&resource).cloned())
            .unwrap_or_default()
    }

    fn bus_range(&self, node: NodeId) -> Option<BusRange> {
        self.node(node)?.bus_range
    }

    fn available(&self, node: NodeId, resource: ResourceType) -> Vec<Interval> {
        let Some(record) = self.node(node) else {
            return Vec::new();
        };
        match record.available.get(&resource) {
            Some(free) => free.clone(),
            None => self.derived_available(record, resource),
        }
    }

    fn boot_role(&self, node: NodeId) -> Option<BootRole> {
        self.node(node)?.spec.boot_role
    }

    fn is_hotplug_capable(&self, node: NodeId) -> bool {
        self.node(node).is_some_and(|n| n.spec.hotplug_capable)
    }

    fn vf_need(&self, node: NodeId, resource: ResourceType) -> Option<VfNeed> {
        self.node(node)?.vf.get(&resource).copied()
    }
}

impl PropertyWriter for MemoryFabric {
    fn set_bus_range(&mut self, node: NodeId, range: BusRange) {
        self.node_mut(node).bus_range = Some(range);
    }

    fn set_secondary_bus(&mut self, node: NodeId, bus: u8) {
        self.node_mut(node).bus = bus;
    }

    fn set_bridge_window(&mut self, node: NodeId, resource: ResourceType, window: Option<Interval>) {
        let record = self.node_mut(node);
        match window {
            Some(w) => record.windows.insert(resource, w),
            None => record.windows.remove(&resource),
        };
    }

    fn set_assigned(
        &mut self,
        node: NodeId,
        resource: ResourceType,
        slot: Slot,
        region: Option<Interval>,
    ) {
        let record = self.node_mut(node);
        let pos = record
            .assigned
            .iter()
            .position(|r| r.resource == resource && r.slot == slot);
        match (pos, region) {
            (Some(i), Some(new)) => {
                record.assigned[i].base = new.base;
                record.assigned[i].len = new.len;
            }
            (Some(i), None) => {
                record.assigned.remove(i);
            }
            (None, Some(new)) => record
                .assigned
                .push(Region::assigned(resource, slot, new.base, new.len)),
            (None, None) => {}
        }
    }
}
