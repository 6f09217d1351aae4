//! PCI bridge-tree resource management.
//!
//! Re-exports the workspace crates under one roof: [`rangeset`] for interval bookkeeping,
//! [`fabric`] for the device-tree and property contracts, and the rebalancing engine at the
//! top level.

pub use pci_fabric as fabric;
pub use pci_rangeset as rangeset;
pub use pci_rebalance::*;
