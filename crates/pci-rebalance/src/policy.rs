//! Which devices must keep their current resources.

use pci_fabric::{BootRole, DeviceTree, NodeId, PciId, PropertyStore, ResourceType};
use serde::{Deserialize, Serialize};

/// Identity-based exceptions to relocation.
///
/// Errata lists are data, not code: hardware known to mishandle renumbering is listed in the
/// configuration rather than compiled in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FixedDevicePolicy {
    /// Bridges whose bus numbers, and whose children's addresses, never move.
    pub pinned_bridges: Vec<PciId>,
    /// Devices that pin the bus number of the bridge above them.
    pub pinned_children: Vec<PciId>,
    /// Display adapters keep their addresses.
    pub pin_display: bool,
    /// Boot disk and boot console controllers pin their bus; the console controller also keeps
    /// its addresses.
    pub pin_boot_devices: bool,
    /// Leaf devices directly below a fabric root keep their addresses.
    pub pin_root_leaves: bool,
}

impl Default for FixedDevicePolicy {
    fn default() -> Self {
        Self {
            pinned_bridges: Vec::new(),
            pinned_children: Vec::new(),
            pin_display: true,
            pin_boot_devices: true,
            pin_root_leaves: true,
        }
    }
}

impl FixedDevicePolicy {
    /// Whether `node`'s own `resource` (its bus number for [`ResourceType::Bus`], its BARs
    /// otherwise) must stay where it is.
    ///
    /// Depends only on static identity and position, so repeated calls agree.
    pub fn is_fixed<F>(&self, fabric: &F, node: NodeId, resource: ResourceType) -> bool
    where
        F: DeviceTree + PropertyStore,
    {
        if resource == ResourceType::Bus {
            return self.is_bus_fixed(fabric, node);
        }

        if self.pin_display && fabric.identity(node).is_some_and(|id| id.is_display()) {
            return true;
        }
        if self.pin_boot_devices
            && fabric.boot_role(node) == Some(BootRole::ConsoleHostController)
        {
            return true;
        }
        if fabric
            .parent(node)
            .is_some_and(|p| self.is_pinned_bridge(fabric, p))
        {
            return true;
        }

        self.pin_root_leaves
            && !fabric.is_bridge(node)
            && fabric.parent(node).is_some_and(|p| fabric.is_fabric_root(p))
    }

    fn is_bus_fixed<F>(&self, fabric: &F, node: NodeId) -> bool
    where
        F: DeviceTree + PropertyStore,
    {
        if !fabric.is_bridge(node) {
            return false;
        }
        // The root's base bus anchors every device below it.
        if fabric.is_fabric_root(node) || self.is_pinned_bridge(fabric, node) {
            return true;
        }
        fabric.children(node).any(|child| {
            let pinned_child = fabric
                .identity(child)
                .is_some_and(|id| self.pinned_children.contains(&id.id));
            let boot = self.pin_boot_devices && fabric.boot_role(child).is_some();
            pinned_child || boot
        })
    }

    fn is_pinned_bridge<F: PropertyStore>(&self, fabric: &F, node: NodeId) -> bool {
        fabric
            .identity(node)
            .is_some_and(|id| self.pinned_bridges.contains(&id.id))
    }
}
