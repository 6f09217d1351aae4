//! Fabric-root address sections and the checks that gate a rebalance.

use crate::config::RebalanceConfig;
use crate::error::{RebalanceError, Result, Unsupported};
use crate::rebalancer::Rebalancer;
use pci_fabric::{DeviceTree, Interval, NodeId, PropertyStore, Region, ResourceType};
use pci_rangeset::RangeSet;
use std::collections::HashMap;

/// Per-rebalance view of the fabric root's own resources.
#[derive(Debug, Default, Clone)]
pub(crate) struct RootWindows {
    sections: HashMap<ResourceType, RangeSet>,
    /// Exclusive end of the root's bus range once a rebalance has grown it.
    pub(crate) bus_end: Option<u64>,
}

impl RootWindows {
    pub(crate) fn sections(&self, resource: ResourceType) -> Option<&RangeSet> {
        self.sections.get(&resource)
    }
}

fn decoded_ranges<F: PropertyStore>(
    fabric: &F,
    root: NodeId,
    resource: ResourceType,
) -> Result<RangeSet> {
    let mut set = RangeSet::new();
    for range in fabric
        .root_ranges(root, resource)
        .into_iter()
        .filter(|r| !r.is_empty())
    {
        set.insert(range.base, range.len).map_err(|err| {
            RebalanceError::inconsistent(root, resource, format!("decoded ranges: {err}"))
        })?;
    }
    Ok(set)
}

/// The root's "available" list for `resource`.
///
/// Entries sticking out of the decoded ranges are clipped to the section they start in, and
/// prefetchable entries lying wholly outside are dropped, when the configuration allows it.
/// Anything else outside the ranges is an inconsistency.
pub(crate) fn checked_available<F: PropertyStore>(
    fabric: &F,
    config: &RebalanceConfig,
    root: NodeId,
    resource: ResourceType,
) -> Result<Vec<Interval>> {
    let ranges = decoded_ranges(fabric, root, resource)?;
    let mut checked = Vec::new();

    for entry in fabric
        .available(root, resource)
        .into_iter()
        .filter(|e| !e.is_empty())
    {
        if ranges.is_empty() || ranges.contains(entry.base, entry.len) {
            checked.push(entry);
            continue;
        }
        let outside = || {
            RebalanceError::inconsistent(
                root,
                resource,
                format!(
                    "available {:#x}+{:#x} lies outside the decoded ranges",
                    entry.base, entry.len
                ),
            )
        };
        if !config.trim_root_available {
            return Err(outside());
        }

        match ranges
            .iter()
            .find(|s| s.base <= entry.base && entry.base < s.end())
        {
            Some(section) => {
                let trimmed = Interval::new(entry.base, section.end() - entry.base);
                tracing::warn!(
                    %root,
                    %resource,
                    "trimming available {:#x}+{:#x} to {:#x}+{:#x}",
                    entry.base,
                    entry.len,
                    trimmed.base,
                    trimmed.len
                );
                checked.push(trimmed);
            }
            None if resource == ResourceType::PrefetchMem => {
                tracing::warn!(
                    %root,
                    "dropping available pmem {:#x}+{:#x} outside the decoded ranges",
                    entry.base,
                    entry.len
                );
            }
            None => return Err(outside()),
        }
    }
    Ok(checked)
}

/// Refuses to rebalance a fabric whose root description is contradictory or which contains a
/// device that must not see its resources move.
pub fn check_rebalance_allowed<F>(fabric: &F, config: &RebalanceConfig, root: NodeId) -> Result<()>
where
    F: DeviceTree + PropertyStore,
{
    let mem = checked_available(fabric, config, root, ResourceType::Mem)?;
    let pmem = checked_available(fabric, config, root, ResourceType::PrefetchMem)?;

    let mut free = RangeSet::new();
    for entry in mem.iter().chain(&pmem) {
        if let Err(err) = free.insert(entry.base, entry.len) {
            tracing::warn!(%root, %err, "rebalancing disabled");
            return Err(RebalanceError::inconsistent(
                root,
                ResourceType::PrefetchMem,
                "mem and pmem available lists overlap",
            ));
        }
    }

    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        if let Some(identity) = fabric.identity(node) {
            if config.blocking_class_codes.contains(&identity.class_code) {
                tracing::warn!(%root, %node, class_code = identity.class_code, "rebalancing disabled");
                return Err(RebalanceError::Unsupported(Unsupported::BlockedByDevice {
                    node,
                    class_code: identity.class_code,
                }));
            }
        }
        if let Some(range) = fabric.bus_range(node) {
            if range.interval().is_none() {
                return Err(RebalanceError::inconsistent(
                    node,
                    ResourceType::Bus,
                    format!(
                        "subordinate bus {:#x} lies below secondary bus {:#x}",
                        range.hi, range.lo
                    ),
                ));
            }
        }
        stack.extend(fabric.children(node));
    }
    Ok(())
}

impl<'a, F> Rebalancer<'a, F>
where
    F: DeviceTree + PropertyStore,
{
    /// Address space the root decodes for `resource`: its free space plus everything its
    /// children hold. Holes between sections are reserved by the platform.
    pub(crate) fn root_sections(&mut self, resource: ResourceType) -> Result<RangeSet> {
        if let Some(set) = self.handle.roots.sections(resource) {
            return Ok(set.clone());
        }

        let root = self.handle.root;
        let mut pieces = checked_available(self.fabric, self.config, root, resource)?;
        for child in self.fabric.children(root) {
            if self.fabric.is_bridge(child) {
                pieces.extend(self.fabric.bridge_window(child, resource));
            }
            pieces.extend(
                self.fabric
                    .assigned_regions(child)
                    .iter()
                    .filter(|r| self.effective_type(child, r) == resource)
                    .map(Region::interval),
            );
        }

        let mut set = RangeSet::new();
        for piece in pieces.into_iter().filter(|p| !p.is_empty()) {
            if let Err(err) = set.insert(piece.base, piece.len) {
                tracing::warn!(%root, %resource, %err, "ignoring overlapping piece of root space");
            }
        }
        tracing::debug!(%root, %resource, sections = set.len(), "root address space");
        self.handle.roots.sections.insert(resource, set.clone());
        Ok(set)
    }

    /// Exclusive bus number the root's bus range may grow to, if growing is allowed.
    pub(crate) fn bus_extension_limit(&self, root: NodeId) -> Option<u64> {
        if !self.config.allow_root_bus_extension {
            return None;
        }
        let base = u64::from(self.fabric.bus_range(root)?.lo);
        let mut limit = u64::from(self.config.max_bus_number) + 1;
        if self.config.shared_bus_space {
            for other in self.fabric.fabric_roots() {
                if other == root {
                    continue;
                }
                if let Some(range) = self.fabric.bus_range(other) {
                    let lo = u64::from(range.lo);
                    if lo > base {
                        limit = limit.min(lo);
                    }
                }
            }
        }
        Some(limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CLASS_CODE_IOMMU;
    use pci_fabric::{BusRange, DeviceSpec, MemoryFabric};

    fn fabric() -> (MemoryFabric, NodeId) {
        let mut fabric = MemoryFabric::new();
        let root = fabric.add_root(BusRange::new(0, 0x3f));
        fabric.set_root_ranges(
            root,
            ResourceType::Mem,
            &[Interval::new(0x8000_0000, 0x1000_0000), Interval::new(0xa000_0000, 0x1000_0000)],
        );
        (fabric, root)
    }

    #[test]
    fn available_inside_the_ranges_passes() {
        let (fabric, root) = fabric();
        let config = RebalanceConfig::default();
        let free = checked_available(&fabric, &config, root, ResourceType::Mem).unwrap();
        assert_eq!(free.len(), 2);
        check_rebalance_allowed(&fabric, &config, root).unwrap();
    }

    #[test]
    fn available_sticking_out_is_trimmed_or_refused() {
        let (mut fabric, root) = fabric();
        fabric.override_available(
            root,
            ResourceType::Mem,
            &[Interval::new(0x8f00_0000, 0x0200_0000)],
        );

        let config = RebalanceConfig::default();
        assert_eq!(
            checked_available(&fabric, &config, root, ResourceType::Mem).unwrap(),
            vec![Interval::new(0x8f00_0000, 0x0100_0000)]
        );

        let strict = RebalanceConfig {
            trim_root_available: false,
            ..RebalanceConfig::default()
        };
        assert!(matches!(
            check_rebalance_allowed(&fabric, &strict, root),
            Err(RebalanceError::Inconsistent { .. })
        ));
    }

    #[test]
    fn available_wholly_outside_disables_mem_but_not_pmem() {
        let (mut fabric, root) = fabric();
        let stray = [Interval::new(0x9000_0000, 0x0100_0000)];
        let config = RebalanceConfig::default();

        fabric.override_available(root, ResourceType::PrefetchMem, &stray);
        fabric.set_root_ranges(
            root,
            ResourceType::PrefetchMem,
            &[Interval::new(0xc000_0000, 0x1000_0000)],
        );
        assert!(checked_available(&fabric, &config, root, ResourceType::PrefetchMem)
            .unwrap()
            .is_empty());

        fabric.override_available(root, ResourceType::Mem, &stray);
        assert!(matches!(
            check_rebalance_allowed(&fabric, &config, root),
            Err(RebalanceError::Inconsistent { .. })
        ));
    }

    #[test]
    fn overlapping_mem_and_pmem_free_space_disables_rebalancing() {
        let (mut fabric, root) = fabric();
        fabric.set_root_ranges(
            root,
            ResourceType::PrefetchMem,
            &[Interval::new(0x8000_0000, 0x1000_0000)],
        );
        fabric.override_available(
            root,
            ResourceType::PrefetchMem,
            &[Interval::new(0x8800_0000, 0x0100_0000)],
        );

        let err = check_rebalance_allowed(&fabric, &RebalanceConfig::default(), root).unwrap_err();
        assert!(matches!(err, RebalanceError::Inconsistent { node, .. } if node == root));
    }

    #[test]
    fn inverted_bus_range_disables_rebalancing() {
        let (mut fabric, root) = fabric();
        let bridge = fabric.add_bridge(root, DeviceSpec::new());
        let below = fabric.add_bridge(bridge, DeviceSpec::new());
        fabric.assign_bus_range(bridge, BusRange::new(1, 4));
        fabric.assign_bus_range(below, BusRange::new(4, 2));

        let err = check_rebalance_allowed(&fabric, &RebalanceConfig::default(), root).unwrap_err();
        assert!(matches!(
            err,
            RebalanceError::Inconsistent { node, resource: ResourceType::Bus, .. } if node == below
        ));
    }

    #[test]
    fn blocking_device_anywhere_disables_rebalancing() {
        let (mut fabric, root) = fabric();
        let bridge = fabric.add_bridge(root, DeviceSpec::new());
        let iommu = fabric.add_device(bridge, DeviceSpec::id(0x1022, 0x1481).class_code(CLASS_CODE_IOMMU));

        assert_eq!(
            check_rebalance_allowed(&fabric, &RebalanceConfig::default(), root),
            Err(RebalanceError::Unsupported(Unsupported::BlockedByDevice {
                node: iommu,
                class_code: CLASS_CODE_IOMMU,
            }))
        );

        let permissive = RebalanceConfig {
            blocking_class_codes: Vec::new(),
            ..RebalanceConfig::default()
        };
        check_rebalance_allowed(&fabric, &permissive, root).unwrap();
    }
}
