//! Resource rebalancing for PCI bridge trees.
//!
//! When a bridge cannot satisfy a newly arrived device from its current windows, the engine
//! computes, per resource type, a new layout for the smallest enclosing subtree that can hold
//! everything: bridge windows grow, relocatable BARs and bus numbers move, and anything the
//! [`FixedDevicePolicy`] pins stays put. The result is a [`RebalanceMap`] of old/new pairs,
//! ordered parents first, held in a [`RebalanceHandle`] together with the fabric lock it was
//! computed under.
//!
//! The engine only reads the device tree (through [`pci_fabric::DeviceTree`] and
//! [`pci_fabric::PropertyStore`]). Applying the moves is left to the caller, either directly
//! or through [`RebalanceHandle::commit`].
//!
//! ```no_run
//! use pci_fabric::{MemoryFabric, NodeId, ResourceTypes};
//! use pci_rebalance::{find_resources, FabricLocks, RebalanceConfig, RebalanceRequest};
//!
//! # fn demo(mut fabric: MemoryFabric, bridge: NodeId) -> pci_rebalance::Result<()> {
//! let locks = FabricLocks::new();
//! let config = RebalanceConfig::default();
//! let request = RebalanceRequest::new(bridge, ResourceTypes::BUS | ResourceTypes::MEM);
//! let handle = find_resources(&fabric, &locks, &config, &request)?;
//! let applied = handle.commit(&mut fabric);
//! # let _ = applied;
//! # Ok(())
//! # }
//! ```

mod calculator;
mod config;
mod error;
mod escalation;
mod filler;
mod fitter;
mod handle;
mod hotplug;
mod lock;
mod map;
mod policy;
mod rebalancer;
mod request;
mod root;
mod sorter;

#[cfg(all(test, not(target_arch = "wasm32")))]
mod proptests;

pub use calculator::RequirementCache;
pub use config::{RebalanceConfig, CLASS_CODE_IOMMU};
pub use error::{RebalanceError, Result, Unsupported};
pub use escalation::{Attempt, EscalationSearch, SearchState};
pub use filler::{fill, grow, place_high, NoRoom};
pub use fitter::{Layout, RangeFitter, Unfit};
pub use handle::RebalanceHandle;
pub use lock::{FabricGuard, FabricLocks, Wait};
pub use map::{RebalanceEntry, RebalanceMap};
pub use policy::FixedDevicePolicy;
pub use rebalancer::{find_resources, RebalanceRequest, Rebalancer};
pub use request::{
    sum_aligned_size, window_align, window_size, BridgeRequirement, PlacedRequest,
    SizedRequest, IO_WINDOW_ALIGN, MEM_WINDOW_ALIGN,
};
pub use root::check_rebalance_allowed;
pub use sorter::{insert_fixed, insert_sized, SortedNeeds};
