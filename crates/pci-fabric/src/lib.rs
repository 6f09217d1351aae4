//! Device-tree and firmware-property contracts consumed by the rebalancing engine.
//!
//! The engine never owns the device tree. It navigates it through [`DeviceTree`], reads the
//! firmware-described resources through [`PropertyStore`], and hands its results to a committer
//! that writes them back through [`PropertyWriter`]. [`MemoryFabric`] implements all three for
//! tests and tooling.

mod memory;
mod props;
mod tree;

pub use memory::{DeviceSpec, MemoryFabric};
pub use pci_rangeset::Interval;
pub use props::{
    BootRole, BusRange, DeviceIdentity, PciId, PropertyStore, PropertyWriter, Region, VfNeed,
};
pub use tree::{Children, DeviceTree};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identity of a node in the device tree.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl NodeId {
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

/// A kind of resource a bridge sub-allocates to its children.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceType {
    Bus,
    Io,
    Mem,
    PrefetchMem,
}

impl ResourceType {
    /// Order in which a rebalance processes the types it was asked for.
    pub const ALL: [ResourceType; 4] = [
        ResourceType::Bus,
        ResourceType::Io,
        ResourceType::Mem,
        ResourceType::PrefetchMem,
    ];

    pub const fn flag(self) -> ResourceTypes {
        match self {
            ResourceType::Bus => ResourceTypes::BUS,
            ResourceType::Io => ResourceTypes::IO,
            ResourceType::Mem => ResourceTypes::MEM,
            ResourceType::PrefetchMem => ResourceTypes::PMEM,
        }
    }

    pub const fn is_address(self) -> bool {
        !matches!(self, ResourceType::Bus)
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResourceType::Bus => "bus",
            ResourceType::Io => "io",
            ResourceType::Mem => "mem",
            ResourceType::PrefetchMem => "pmem",
        })
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct ResourceTypes: u32 {
        const BUS = 1 << 0;
        const IO = 1 << 1;
        const MEM = 1 << 2;
        const PMEM = 1 << 3;
    }
}

impl ResourceTypes {
    /// The individual types in processing order.
    pub fn types(self) -> impl Iterator<Item = ResourceType> {
        ResourceType::ALL
            .into_iter()
            .filter(move |ty| self.contains(ty.flag()))
    }
}

/// Which resource slot of its owner a request or delta refers to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Slot {
    /// A BAR, identified by its config-space register offset.
    Bar(u8),
    /// The window (or, for bus numbers, the bus range) a bridge forwards to its children.
    BridgeWindow,
    /// A child's bus-relative identifiers; used only for renumbering notifications.
    BusNumber,
    /// The aggregate resources of an SR-IOV physical function's virtual functions.
    VirtualFunctions,
    /// A firmware-reserved hole in the fabric root's address space. Has no device behind it.
    Reserved,
}
