//! Walking up from a bridge until some ancestor can lay its subtree out.

use crate::error::{RebalanceError, Result};
use crate::fitter::{Layout, RangeFitter, Unfit};
use crate::rebalancer::Rebalancer;
use pci_fabric::{DeviceTree, Interval, NodeId, PropertyStore, ResourceType};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchState {
    AtRequester(NodeId),
    /// `level` bridges above the requester.
    AtAncestor { node: NodeId, level: usize },
    Placed { node: NodeId, layout: Layout },
    /// Even the fabric root cannot hold the subtree.
    Exhausted { node: NodeId },
}

/// One fitting attempt, for diagnostics.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Attempt {
    pub node: NodeId,
    pub range: Option<Interval>,
    pub fitted: bool,
}

#[derive(Debug, Clone)]
pub struct EscalationSearch {
    resource: ResourceType,
    requester: NodeId,
    state: SearchState,
    attempts: Vec<Attempt>,
}

impl EscalationSearch {
    pub fn new(requester: NodeId, resource: ResourceType) -> Self {
        Self {
            resource,
            requester,
            state: SearchState::AtRequester(requester),
            attempts: Vec::new(),
        }
    }

    pub fn state(&self) -> &SearchState {
        &self.state
    }

    pub fn attempts(&self) -> &[Attempt] {
        &self.attempts
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self.state,
            SearchState::Placed { .. } | SearchState::Exhausted { .. }
        )
    }

    /// Tries the current node once and moves to the next state.
    ///
    /// The node's requirement is recomputed; the cached requirements of its other children
    /// are reused. A successful fit is recorded into the rebalancer's map.
    pub fn step<F>(&mut self, rb: &mut Rebalancer<'_, F>) -> Result<()>
    where
        F: DeviceTree + PropertyStore,
    {
        let (node, level) = match self.state {
            SearchState::AtRequester(node) => (node, 0),
            SearchState::AtAncestor { node, level } => (node, level),
            SearchState::Placed { .. } | SearchState::Exhausted { .. } => return Ok(()),
        };
        let resource = self.resource;

        rb.resolve_subtree(node, resource)?;
        let req = rb.resolve_bridge(node, resource)?;

        let at_root = rb.fabric.is_fabric_root(node);
        let mut fitter = RangeFitter::new();
        if at_root && resource == ResourceType::Bus {
            if let Some(limit) = rb.bus_extension_limit(node) {
                fitter = fitter.with_extension_limit(limit);
            }
        }
        let range = rb.current_range(node, resource);
        let outcome = match range {
            Some(range) => fitter.fit(&req, range),
            None => Err(Unfit),
        };
        tracing::debug!(
            %node,
            %resource,
            level,
            ?range,
            fitted = outcome.is_ok(),
            "escalation step"
        );
        self.attempts.push(Attempt {
            node,
            range,
            fitted: outcome.is_ok(),
        });

        self.state = match outcome {
            Ok(layout) => {
                rb.commit_layout(node, resource, &layout);
                SearchState::Placed { node, layout }
            }
            Err(Unfit) => match rb.fabric.bridge_parent(node).filter(|_| !at_root) {
                Some(parent) => SearchState::AtAncestor {
                    node: parent,
                    level: level + 1,
                },
                None => {
                    if at_root && resource == ResourceType::Bus {
                        tracing::warn!(%node, "root bus range cannot grow far enough");
                    }
                    SearchState::Exhausted { node }
                }
            },
        };
        Ok(())
    }

    /// Steps until placed or exhausted.
    pub fn run<F>(mut self, rb: &mut Rebalancer<'_, F>) -> Result<Layout>
    where
        F: DeviceTree + PropertyStore,
    {
        while !self.is_finished() {
            self.step(rb)?;
        }
        match self.state {
            SearchState::Placed { layout, .. } => Ok(layout),
            _ => Err(RebalanceError::ResourceExhausted {
                node: self.requester,
                resource: self.resource,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RebalanceConfig;
    use crate::lock::{FabricLocks, Wait};
    use pci_fabric::{BusRange, DeviceSpec, MemoryFabric, Region, Slot};

    const MEM: ResourceType = ResourceType::Mem;

    /// root [0x8000_0000, +0x400_0000) -> top -> mid -> leaf bridge, each window just big
    /// enough for what sits in it today; a 2 MiB BAR then appears below the leaf bridge.
    fn deep() -> (MemoryFabric, [NodeId; 4]) {
        let mut fabric = MemoryFabric::new();
        let root = fabric.add_root(BusRange::new(0, 0x1f));
        fabric.set_root_ranges(root, MEM, &[Interval::new(0x8000_0000, 0x400_0000)]);

        let top = fabric.add_bridge(root, DeviceSpec::new());
        fabric.open_window(top, MEM, Interval::new(0x8000_0000, 0x20_0000));
        let mid = fabric.add_bridge(top, DeviceSpec::new());
        fabric.open_window(mid, MEM, Interval::new(0x8000_0000, 0x10_0000));
        let leaf = fabric.add_bridge(mid, DeviceSpec::new());
        fabric.open_window(leaf, MEM, Interval::new(0x8000_0000, 0x10_0000));

        let nic = fabric.add_device(leaf, DeviceSpec::new());
        fabric.assign(nic, Region::assigned(MEM, Slot::Bar(0x10), 0x8000_0000, 0x1000));
        let gpu = fabric.add_device(leaf, DeviceSpec::new());
        fabric.declare(gpu, Region::sized(MEM, Slot::Bar(0x10), 0x20_0000));

        (fabric, [root, top, mid, leaf])
    }

    #[test]
    fn climbs_until_an_ancestor_has_room() {
        let (fabric, [root, top, mid, leaf]) = deep();
        let locks = FabricLocks::new();
        let config = RebalanceConfig::default();
        let mut rb = Rebalancer::begin(&fabric, &locks, &config, leaf, Wait::Never).unwrap();

        let mut search = EscalationSearch::new(leaf, MEM);
        search.step(&mut rb).unwrap();
        assert_eq!(search.state(), &SearchState::AtAncestor { node: mid, level: 1 });
        while !search.is_finished() {
            search.step(&mut rb).unwrap();
        }

        let visited: Vec<_> = search.attempts().iter().map(|a| a.node).collect();
        assert_eq!(visited, vec![leaf, mid, top, root]);
        assert!(matches!(search.state(), SearchState::Placed { node, .. } if *node == root));

        let lens: Vec<u64> = search
            .attempts()
            .iter()
            .map(|a| a.range.map_or(0, |r| r.len))
            .collect();
        assert!(lens.windows(2).all(|w| w[0] <= w[1]));
        assert!(search.attempts().len() <= 4);
        assert_eq!(rb.handle().top(), Some(root));
    }

    #[test]
    fn exhaustion_stops_at_the_root() {
        let (mut fabric, [_, _, _, leaf]) = deep();
        let huge = fabric.add_device(leaf, DeviceSpec::new());
        fabric.declare(huge, Region::sized(MEM, Slot::Bar(0x10), 0x1000_0000));

        let locks = FabricLocks::new();
        let config = RebalanceConfig::default();
        let mut rb = Rebalancer::begin(&fabric, &locks, &config, leaf, Wait::Never).unwrap();

        let err = EscalationSearch::new(leaf, MEM).run(&mut rb).unwrap_err();
        assert_eq!(
            err,
            RebalanceError::ResourceExhausted {
                node: leaf,
                resource: MEM
            }
        );
        assert!(rb.handle().map().is_empty());
    }
}
