//! One rebalance in flight per fabric.

use crate::error::{RebalanceError, Result};
use pci_fabric::NodeId;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// How long [`FabricLocks::acquire`] may block.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Wait {
    /// Fail immediately if the fabric is busy.
    Never,
    /// Block until the fabric is free or the wait is interrupted.
    Forever,
    Timeout(Duration),
}

#[derive(Debug, Default)]
struct LockState {
    held: HashSet<NodeId>,
    /// Bumped by [`FabricLocks::interrupt`]; a waiter that sees a change gives up.
    interrupts: HashMap<NodeId, u64>,
}

#[derive(Debug, Default)]
struct LockTable {
    state: Mutex<LockState>,
    released: Condvar,
}

/// Per-fabric exclusion, keyed on the fabric root.
///
/// Cloning shares the table. Distinct fabrics never contend.
#[derive(Debug, Clone, Default)]
pub struct FabricLocks {
    table: Arc<LockTable>,
}

impl FabricLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, LockState> {
        self.table
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn acquire(&self, root: NodeId, wait: Wait) -> Result<FabricGuard> {
        let deadline = match wait {
            Wait::Timeout(timeout) => Some(Instant::now() + timeout),
            Wait::Never | Wait::Forever => None,
        };

        let mut state = self.state();
        let generation = state.interrupts.get(&root).copied().unwrap_or(0);
        while state.held.contains(&root) {
            state = match wait {
                Wait::Never => return Err(RebalanceError::ConcurrentAccess { root }),
                Wait::Forever => self
                    .table
                    .released
                    .wait(state)
                    .unwrap_or_else(|poisoned| poisoned.into_inner()),
                Wait::Timeout(_) => {
                    let remaining = deadline
                        .map(|d| d.saturating_duration_since(Instant::now()))
                        .unwrap_or_default();
                    if remaining.is_zero() {
                        tracing::debug!(%root, "timed out waiting for fabric");
                        return Err(RebalanceError::ConcurrentAccess { root });
                    }
                    self.table
                        .released
                        .wait_timeout(state, remaining)
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .0
                }
            };
            if state.interrupts.get(&root).copied().unwrap_or(0) != generation {
                tracing::debug!(%root, "wait for fabric interrupted");
                return Err(RebalanceError::ConcurrentAccess { root });
            }
        }

        state.held.insert(root);
        Ok(FabricGuard {
            locks: self.clone(),
            root,
        })
    }

    /// Wakes every waiter blocked on `root`; they fail with
    /// [`RebalanceError::ConcurrentAccess`]. The current holder is unaffected.
    pub fn interrupt(&self, root: NodeId) {
        let mut state = self.state();
        *state.interrupts.entry(root).or_default() += 1;
        drop(state);
        self.table.released.notify_all();
    }

    pub fn is_held(&self, root: NodeId) -> bool {
        self.state().held.contains(&root)
    }

    fn release(&self, root: NodeId) {
        let mut state = self.state();
        state.held.remove(&root);
        drop(state);
        self.table.released.notify_all();
    }
}

/// Exclusive right to rebalance one fabric. Released on drop.
#[derive(Debug)]
pub struct FabricGuard {
    locks: FabricLocks,
    root: NodeId,
}

impl FabricGuard {
    pub fn root(&self) -> NodeId {
        self.root
    }
}

impl Drop for FabricGuard {
    fn drop(&mut self) {
        self.locks.release(self.root);
    }
}
