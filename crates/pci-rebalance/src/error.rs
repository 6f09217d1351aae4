use pci_fabric::{NodeId, ResourceType};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RebalanceError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RebalanceError {
    #[error("bad request: {0}")]
    BadRequest(&'static str),

    #[error("inconsistent {resource} resources at {node}: {detail}")]
    Inconsistent {
        node: NodeId,
        resource: ResourceType,
        detail: String,
    },

    #[error("no room for {resource} resources anywhere above {node}")]
    ResourceExhausted { node: NodeId, resource: ResourceType },

    #[error("unsupported: {0}")]
    Unsupported(Unsupported),

    #[error("fabric rooted at {root} is busy")]
    ConcurrentAccess { root: NodeId },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Error)]
pub enum Unsupported {
    #[error("I/O port space cannot be rebalanced")]
    IoRebalance,

    #[error("{node} with class code {class_code:#08x} blocks rebalancing")]
    BlockedByDevice { node: NodeId, class_code: u32 },
}

impl RebalanceError {
    pub(crate) fn inconsistent(
        node: NodeId,
        resource: ResourceType,
        detail: impl Into<String>,
    ) -> Self {
        let detail = detail.into();
        tracing::warn!(%node, %resource, "{detail}");
        RebalanceError::Inconsistent {
            node,
            resource,
            detail,
        }
    }
}
