use crate::{Interval, NodeId, ResourceType, Slot};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Vendor/device identity as found in config space.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PciId {
    pub vendor_id: u16,
    pub device_id: u16,
}

impl PciId {
    pub const fn new(vendor_id: u16, device_id: u16) -> Self {
        Self {
            vendor_id,
            device_id,
        }
    }
}

impl fmt::Display for PciId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor_id, self.device_id)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct DeviceIdentity {
    pub id: PciId,
    /// 24-bit class code: base class, sub-class, programming interface.
    pub class_code: u32,
}

impl DeviceIdentity {
    pub const CLASS_DISPLAY: u8 = 0x03;

    pub const fn new(id: PciId, class_code: u32) -> Self {
        Self { id, class_code }
    }

    pub const fn base_class(&self) -> u8 {
        (self.class_code >> 16) as u8
    }

    pub const fn is_display(&self) -> bool {
        self.base_class() == Self::CLASS_DISPLAY
    }
}

/// Devices the system cannot lose track of while running.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum BootRole {
    Disk,
    ConsoleHostController,
}

/// One resource entry of a device, either declared ("reg") or currently assigned.
///
/// Declared relocatable entries carry only a size; their `base` is zero.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Region {
    pub resource: ResourceType,
    pub slot: Slot,
    pub base: u64,
    pub len: u64,
    pub relocatable: bool,
}

impl Region {
    /// A declared need that the allocator may place anywhere.
    pub const fn sized(resource: ResourceType, slot: Slot, len: u64) -> Self {
        Self {
            resource,
            slot,
            base: 0,
            len,
            relocatable: true,
        }
    }

    /// A declared or assigned region pinned at `base`.
    pub const fn fixed(resource: ResourceType, slot: Slot, base: u64, len: u64) -> Self {
        Self {
            resource,
            slot,
            base,
            len,
            relocatable: false,
        }
    }

    /// A currently-assigned region that may move.
    pub const fn assigned(resource: ResourceType, slot: Slot, base: u64, len: u64) -> Self {
        Self {
            resource,
            slot,
            base,
            len,
            relocatable: true,
        }
    }

    pub const fn interval(&self) -> Interval {
        Interval::new(self.base, self.len)
    }
}

/// Secondary and subordinate bus numbers of a bridge, inclusive.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BusRange {
    pub lo: u8,
    pub hi: u8,
}

impl BusRange {
    pub const fn new(lo: u8, hi: u8) -> Self {
        Self { lo, hi }
    }

    /// Number of buses covered, or `None` when the subordinate bus lies below the secondary
    /// bus.
    pub const fn len(&self) -> Option<u64> {
        if self.hi < self.lo {
            return None;
        }
        Some(self.hi as u64 - self.lo as u64 + 1)
    }

    pub const fn interval(&self) -> Option<Interval> {
        match self.len() {
            Some(len) => Some(Interval::new(self.lo as u64, len)),
            None => None,
        }
    }
}

/// Resources needed by all virtual functions of an SR-IOV physical function.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct VfNeed {
    /// Total size; for bus numbers, the number of buses.
    pub total: u64,
    pub num_vfs: u32,
}

/// Read access to firmware-described resource properties.
pub trait PropertyStore {
    fn identity(&self, node: NodeId) -> Option<DeviceIdentity>;

    /// PCI device number of `node` on its parent bus.
    fn device_number(&self, node: NodeId) -> Option<u8>;

    /// Declared needs ("reg"): sizes for relocatable BARs, absolute ranges for pinned ones.
    fn declared_regions(&self, node: NodeId) -> Vec<Region>;

    /// Current assignments ("assigned-addresses").
    fn assigned_regions(&self, node: NodeId) -> Vec<Region>;

    /// The window a non-root bridge forwards for `resource`.
    fn bridge_window(&self, node: NodeId, resource: ResourceType) -> Option<Interval>;

    /// Address sections a fabric root decodes ("ranges"); may have holes.
    fn root_ranges(&self, root: NodeId, resource: ResourceType) -> Vec<Interval>;

    fn bus_range(&self, node: NodeId) -> Option<BusRange>;

    /// Unused parts of a bridge's window ("available").
    fn available(&self, node: NodeId, resource: ResourceType) -> Vec<Interval>;

    fn boot_role(&self, _node: NodeId) -> Option<BootRole> {
        None
    }

    fn is_hotplug_capable(&self, _node: NodeId) -> bool {
        false
    }

    fn vf_need(&self, _node: NodeId, _resource: ResourceType) -> Option<VfNeed> {
        None
    }
}

/// Write access used by a committer applying a rebalance.
pub trait PropertyWriter {
    fn set_bus_range(&mut self, node: NodeId, range: BusRange);

    /// Moves `node` onto a different bus number without touching its resources.
    fn set_secondary_bus(&mut self, node: NodeId, bus: u8);

    /// `None` closes the window.
    fn set_bridge_window(&mut self, node: NodeId, resource: ResourceType, window: Option<Interval>);

    /// `None` frees the slot.
    fn set_assigned(
        &mut self,
        node: NodeId,
        resource: ResourceType,
        slot: Slot,
        region: Option<Interval>,
    );
}
