//! Fixed-capacity scratch arena for search nodes.
//!
//! A pool is reused across searches. [`NodePool::reset`] advances an epoch
//! counter instead of clearing the per-cell lookup table, so resetting is
//! O(1) in the map size and handles from an earlier search simply stop
//! resolving.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::error::{GameError, Result};
use crate::map::GridPos;
use crate::math::Fixed;

/// Handle to a node inside a [`NodePool`], valid for one search only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeHandle {
    index: u32,
    epoch: u32,
}

/// Open/closed state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// On the frontier.
    Open,
    /// Expanded.
    Closed,
}

/// A search candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchNode {
    /// Cell this node stands for.
    pub pos: GridPos,
    /// Cost from the start.
    pub g: Fixed,
    /// Heuristic estimate to the goal.
    pub h: Fixed,
    /// Back-reference to the predecessor on the best known path.
    pub parent: Option<NodeHandle>,
    /// Open or closed.
    pub state: NodeState,
    /// Allocation sequence within the search. Final tie-breaker.
    pub order: u32,
}

impl SearchNode {
    /// Estimated total cost through this node.
    #[must_use]
    pub fn f(&self) -> Fixed {
        self.g + self.h
    }
}

/// Heap entry. Entries are never updated in place: a cheaper path pushes a
/// fresh entry and the old one is skipped when popped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OpenEntry {
    f: Fixed,
    h: Fixed,
    order: u32,
    index: u32,
}

impl Ord for OpenEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap and we want the lowest f.
        other
            .f
            .cmp(&self.f)
            .then_with(|| other.h.cmp(&self.h))
            .then_with(|| other.order.cmp(&self.order))
    }
}

impl PartialOrd for OpenEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Stamp {
    epoch: u32,
    index: u32,
}

/// Reusable node arena with an open-set heap.
#[derive(Debug, Clone)]
pub struct NodePool {
    capacity: usize,
    nodes: Vec<SearchNode>,
    open: BinaryHeap<OpenEntry>,
    lookup: Vec<Stamp>,
    epoch: u32,
}

impl NodePool {
    /// Create a pool holding at most `capacity` nodes per search.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            nodes: Vec::with_capacity(capacity),
            open: BinaryHeap::with_capacity(capacity),
            lookup: Vec::new(),
            epoch: 1,
        }
    }

    /// Maximum nodes per search.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Nodes allocated in the current search.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True if no node has been allocated since the last reset.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Reclaim every node and size the lookup table for `cell_count` cells.
    pub fn reset(&mut self, cell_count: usize) {
        self.nodes.clear();
        self.open.clear();
        self.epoch = self.epoch.wrapping_add(1);
        if self.epoch == 0 {
            // Epoch wrapped: old stamps could collide, wipe them.
            self.lookup.iter_mut().for_each(|stamp| *stamp = Stamp::default());
            self.epoch = 1;
        }
        if self.lookup.len() != cell_count {
            self.lookup.resize(cell_count, Stamp::default());
        }
    }

    /// Allocate an open node for the cell at `cell_index`.
    ///
    /// # Errors
    ///
    /// Returns [`GameError::PoolExhausted`] when the pool is full, or
    /// [`GameError::InvalidState`] if `cell_index` is outside the lookup table.
    pub fn allocate(
        &mut self,
        pos: GridPos,
        cell_index: usize,
        g: Fixed,
        h: Fixed,
        parent: Option<NodeHandle>,
    ) -> Result<NodeHandle> {
        if self.nodes.len() >= self.capacity {
            return Err(GameError::PoolExhausted {
                capacity: self.capacity,
            });
        }
        let epoch = self.epoch;
        let stamp = self.lookup.get_mut(cell_index).ok_or_else(|| {
            GameError::InvalidState(format!("cell index {cell_index} outside node lookup"))
        })?;

        // Bounded by capacity, which the search config keeps well below u32::MAX.
        #[allow(clippy::cast_possible_truncation)]
        let index = self.nodes.len() as u32;
        *stamp = Stamp { epoch, index };
        self.nodes.push(SearchNode {
            pos,
            g,
            h,
            parent,
            state: NodeState::Open,
            order: index,
        });
        self.open.push(OpenEntry {
            f: g + h,
            h,
            order: index,
            index,
        });
        Ok(NodeHandle { index, epoch })
    }

    /// Handle of the node already allocated for a cell in this search.
    #[must_use]
    pub fn find(&self, cell_index: usize) -> Option<NodeHandle> {
        self.lookup
            .get(cell_index)
            .filter(|stamp| stamp.epoch == self.epoch)
            .map(|stamp| NodeHandle {
                index: stamp.index,
                epoch: self.epoch,
            })
    }

    /// Resolve a handle. Handles from an earlier search resolve to `None`.
    #[must_use]
    pub fn node(&self, handle: NodeHandle) -> Option<&SearchNode> {
        if handle.epoch != self.epoch {
            return None;
        }
        self.nodes.get(handle.index as usize)
    }

    /// Record a cheaper path to an existing node and put it back on the frontier.
    ///
    /// # Errors
    ///
    /// Returns [`GameError::InvalidState`] for a stale handle.
    pub fn reopen(&mut self, handle: NodeHandle, g: Fixed, parent: NodeHandle) -> Result<()> {
        if handle.epoch != self.epoch {
            return Err(GameError::InvalidState("stale node handle".into()));
        }
        let node = self
            .nodes
            .get_mut(handle.index as usize)
            .ok_or_else(|| GameError::InvalidState("unknown node handle".into()))?;
        node.g = g;
        node.parent = Some(parent);
        node.state = NodeState::Open;
        self.open.push(OpenEntry {
            f: node.f(),
            h: node.h,
            order: node.order,
            index: handle.index,
        });
        Ok(())
    }

    /// Pop and close the open node with the lowest `g + h`.
    ///
    /// Ties go to the lower `h`, then to the earlier allocation.
    pub fn best_open_node(&mut self) -> Option<NodeHandle> {
        while let Some(entry) = self.open.pop() {
            let node = &mut self.nodes[entry.index as usize];
            if node.state == NodeState::Closed || node.f() != entry.f {
                continue;
            }
            node.state = NodeState::Closed;
            return Some(NodeHandle {
                index: entry.index,
                epoch: self.epoch,
            });
        }
        None
    }

    /// Node closest to the goal by heuristic. Ties go to the lower `g`, then
    /// the earlier allocation.
    #[must_use]
    pub fn best_reached(&self) -> Option<NodeHandle> {
        self.nodes
            .iter()
            .min_by(|a, b| {
                a.h.cmp(&b.h)
                    .then_with(|| a.g.cmp(&b.g))
                    .then_with(|| a.order.cmp(&b.order))
            })
            .map(|node| NodeHandle {
                index: node.order,
                epoch: self.epoch,
            })
    }

    /// Cells from the search start to `handle`, inclusive.
    #[must_use]
    pub fn path_to(&self, handle: NodeHandle) -> Vec<GridPos> {
        let mut path = Vec::new();
        let mut current = self.node(handle);
        while let Some(node) = current {
            path.push(node.pos);
            current = node.parent.and_then(|parent| self.node(parent));
        }
        path.reverse();
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fx(n: i32) -> Fixed {
        Fixed::from_num(n)
    }

    #[test]
    fn test_allocate_until_exhausted() {
        let mut pool = NodePool::new(2);
        pool.reset(10);
        pool.allocate(GridPos::new(0, 0), 0, fx(0), fx(1), None)
            .unwrap();
        pool.allocate(GridPos::new(1, 0), 1, fx(1), fx(1), None)
            .unwrap();
        let err = pool
            .allocate(GridPos::new(2, 0), 2, fx(2), fx(1), None)
            .unwrap_err();
        assert!(matches!(err, GameError::PoolExhausted { capacity: 2 }));
    }

    #[test]
    fn test_best_open_node_tie_breaks() {
        let mut pool = NodePool::new(8);
        pool.reset(8);
        // f = 5 for all three; h decides first, then allocation order.
        let a = pool.allocate(GridPos::new(0, 0), 0, fx(2), fx(3), None).unwrap();
        let b = pool.allocate(GridPos::new(1, 0), 1, fx(3), fx(2), None).unwrap();
        let c = pool.allocate(GridPos::new(2, 0), 2, fx(3), fx(2), None).unwrap();
        let d = pool.allocate(GridPos::new(3, 0), 3, fx(1), fx(1), None).unwrap();

        assert_eq!(pool.best_open_node(), Some(d));
        assert_eq!(pool.best_open_node(), Some(b));
        assert_eq!(pool.best_open_node(), Some(c));
        assert_eq!(pool.best_open_node(), Some(a));
        assert_eq!(pool.best_open_node(), None);
    }

    #[test]
    fn test_reopen_skips_stale_entry() {
        let mut pool = NodePool::new(8);
        pool.reset(8);
        let root = pool.allocate(GridPos::new(0, 0), 0, fx(0), fx(9), None).unwrap();
        let far = pool.allocate(GridPos::new(1, 0), 1, fx(10), fx(1), None).unwrap();
        let mid = pool.allocate(GridPos::new(2, 0), 2, fx(4), fx(4), None).unwrap();
        pool.reopen(far, fx(2), root).unwrap();

        assert_eq!(pool.best_open_node(), Some(far));
        assert_eq!(pool.node(far).unwrap().parent, Some(root));
        assert_eq!(pool.best_open_node(), Some(mid));
        assert_eq!(pool.best_open_node(), Some(root));
        // Old entry for `far` (f = 11) is discarded.
        assert_eq!(pool.best_open_node(), None);
    }

    #[test]
    fn test_reset_hides_previous_search() {
        let mut pool = NodePool::new(4);
        pool.reset(4);
        let old = pool.allocate(GridPos::new(3, 0), 3, fx(0), fx(0), None).unwrap();
        assert_eq!(pool.find(3), Some(old));

        pool.reset(4);
        assert!(pool.is_empty());
        assert_eq!(pool.find(3), None);
        assert!(pool.node(old).is_none());
        assert!(pool.reopen(old, fx(0), old).is_err());
        assert_eq!(pool.best_open_node(), None);
        assert_eq!(pool.best_reached(), None);
    }

    #[test]
    fn test_best_reached_and_path() {
        let mut pool = NodePool::new(4);
        pool.reset(4);
        let a = pool.allocate(GridPos::new(0, 0), 0, fx(0), fx(3), None).unwrap();
        let b = pool.allocate(GridPos::new(1, 0), 1, fx(1), fx(2), Some(a)).unwrap();
        let c = pool.allocate(GridPos::new(2, 0), 2, fx(2), fx(1), Some(b)).unwrap();
        let _tie = pool.allocate(GridPos::new(2, 1), 3, fx(3), fx(1), Some(b)).unwrap();

        assert_eq!(pool.best_reached(), Some(c));
        assert_eq!(
            pool.path_to(c),
            vec![GridPos::new(0, 0), GridPos::new(1, 0), GridPos::new(2, 0)]
        );
    }

    #[test]
    fn test_allocate_rejects_index_outside_lookup() {
        let mut pool = NodePool::new(4);
        pool.reset(2);
        assert!(matches!(
            pool.allocate(GridPos::new(5, 5), 5, fx(0), fx(0), None),
            Err(GameError::InvalidState(_))
        ));
    }
}
