use crate::calculator::RequirementCache;
use crate::lock::FabricGuard;
use crate::map::{RebalanceEntry, RebalanceMap};
use crate::request::BridgeRequirement;
use crate::root::RootWindows;
use pci_fabric::{BusRange, NodeId, PropertyWriter, ResourceType, Slot};

/// Result of a rebalance: the moves to apply, plus the fabric lock they were computed under.
///
/// Committing or aborting consumes the handle; either way the cached requirements are freed
/// and the fabric is unlocked.
#[derive(Debug)]
pub struct RebalanceHandle {
    pub(crate) guard: FabricGuard,
    pub(crate) root: NodeId,
    pub(crate) target: NodeId,
    pub(crate) top: Option<NodeId>,
    pub(crate) map: RebalanceMap,
    pub(crate) cache: RequirementCache,
    pub(crate) roots: RootWindows,
}

impl RebalanceHandle {
    pub(crate) fn new(guard: FabricGuard, target: NodeId) -> Self {
        Self {
            root: guard.root(),
            guard,
            target,
            top: None,
            map: RebalanceMap::new(),
            cache: RequirementCache::default(),
            roots: RootWindows::default(),
        }
    }

    pub fn root(&self) -> NodeId {
        self.guard.root()
    }

    pub fn target(&self) -> NodeId {
        self.target
    }

    /// Highest node whose window contents were laid out again.
    pub fn top(&self) -> Option<NodeId> {
        self.top
    }

    pub fn map(&self) -> &RebalanceMap {
        &self.map
    }

    pub fn requirement(&self, node: NodeId, resource: ResourceType) -> Option<&BridgeRequirement> {
        self.cache.get(node, resource)
    }

    /// Applies every entry through `writer`, parents before children.
    pub fn commit<W: PropertyWriter + ?Sized>(self, writer: &mut W) -> RebalanceMap {
        for entry in self.map.entries() {
            apply(writer, entry);
        }
        tracing::debug!(root = %self.root, entries = self.map.len(), "rebalance committed");
        self.map
    }

    /// Drops the computed moves without touching the fabric.
    pub fn abort(self) {
        tracing::debug!(root = %self.root, entries = self.map.len(), "rebalance aborted");
    }

    /// Gives up the lock and keeps only the moves.
    pub fn into_map(self) -> RebalanceMap {
        self.map
    }
}

fn apply<W: PropertyWriter + ?Sized>(writer: &mut W, entry: &RebalanceEntry) {
    let owner = entry.owner;
    let new = (entry.new_len != 0).then(|| entry.new_interval());
    match (entry.slot, entry.resource) {
        (Slot::Reserved, _) => {}
        (Slot::BusNumber, _) => match u8::try_from(entry.new_base) {
            Ok(bus) => writer.set_secondary_bus(owner, bus),
            Err(_) => tracing::warn!(%owner, bus = entry.new_base, "bus number out of range"),
        },
        (Slot::BridgeWindow, ResourceType::Bus) => {
            let range = new.and_then(|n| {
                let lo = u8::try_from(n.base).ok()?;
                let hi = u8::try_from(n.last()?).ok()?;
                Some(BusRange::new(lo, hi))
            });
            match range {
                Some(range) => writer.set_bus_range(owner, range),
                None => tracing::warn!(
                    %owner,
                    base = entry.new_base,
                    len = entry.new_len,
                    "bus range not representable"
                ),
            }
        }
        (Slot::BridgeWindow, resource) => writer.set_bridge_window(owner, resource, new),
        (slot, resource) => writer.set_assigned(owner, resource, slot, new),
    }
}
