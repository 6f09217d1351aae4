use crate::NodeId;

/// Navigation over a stable snapshot of the device tree.
///
/// A fabric root is a bridge whose parent is not a PCI bridge (a host bridge / root complex).
/// Implementations must not change shape while a rebalance is in flight.
pub trait DeviceTree {
    fn parent(&self, node: NodeId) -> Option<NodeId>;
    fn first_child(&self, node: NodeId) -> Option<NodeId>;
    fn next_sibling(&self, node: NodeId) -> Option<NodeId>;
    fn is_bridge(&self, node: NodeId) -> bool;
    fn is_fabric_root(&self, node: NodeId) -> bool;

    /// Every fabric root known to the host, in any order.
    fn fabric_roots(&self) -> Vec<NodeId>;

    fn children(&self, node: NodeId) -> Children<'_, Self>
    where
        Self: Sized,
    {
        Children {
            tree: self,
            next: self.first_child(node),
        }
    }

    /// The parent, if it is itself a bridge.
    fn bridge_parent(&self, node: NodeId) -> Option<NodeId> {
        self.parent(node).filter(|&p| self.is_bridge(p))
    }

    /// Walks bridge parents up to the root of the fabric containing `node`.
    fn fabric_root_of(&self, node: NodeId) -> Option<NodeId> {
        let mut cur = node;
        loop {
            if self.is_fabric_root(cur) {
                return Some(cur);
            }
            cur = self.bridge_parent(cur)?;
        }
    }

    /// Returns whether `ancestor` lies on the parent path of `node` (a node is not its own
    /// ancestor).
    fn is_ancestor(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut cur = self.parent(node);
        while let Some(p) = cur {
            if p == ancestor {
                return true;
            }
            cur = self.parent(p);
        }
        false
    }

    /// Nearest node that is `a` or an ancestor of `a` and also `b` or an ancestor of `b`.
    fn common_ancestor(&self, a: NodeId, b: NodeId) -> Option<NodeId> {
        let mut cur = Some(a);
        while let Some(n) = cur {
            if n == b || self.is_ancestor(n, b) {
                return Some(n);
            }
            cur = self.parent(n);
        }
        None
    }
}

/// Iterator over the immediate children of a node.
pub struct Children<'a, T: ?Sized> {
    tree: &'a T,
    next: Option<NodeId>,
}

impl<'a, T: DeviceTree + ?Sized> Iterator for Children<'a, T> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let cur = self.next?;
        self.next = self.tree.next_sibling(cur);
        Some(cur)
    }
}
