//! NUMA Node Identifiers
//!
//! `NodeId` replaces the C convention of an `int` node id where `-1` means
//! "any node": an optional node is `Option<NodeId>` everywhere.

use core::fmt;

/// log2 of the maximum number of NUMA nodes
pub const NODES_SHIFT: u32 = 4;
/// Maximum number of NUMA nodes
pub const MAX_NUMNODES: usize = 1 << NODES_SHIFT;

/// Distance from a node to itself
pub const LOCAL_DISTANCE: u8 = 10;
/// Default distance between two different nodes
pub const REMOTE_DISTANCE: u8 = 20;

const _: () = assert!(MAX_NUMNODES <= 64, "NodeMask is a single u64");

/// A NUMA node id, always `< MAX_NUMNODES`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct NodeId(u16);

impl NodeId {
    /// Node 0, the node used when NUMA is off
    pub const ZERO: Self = Self(0);

    /// Create a node id, rejecting values `>= MAX_NUMNODES`.
    #[inline]
    #[must_use]
    pub const fn new(nid: u32) -> Option<Self> {
        if (nid as usize) < MAX_NUMNODES {
            Some(Self(nid as u16))
        } else {
            None
        }
    }

    /// Index into per-node arrays.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Raw node number.
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0 as u32
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Set of NUMA nodes (`nodemask_t`).
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeMask(u64);

impl NodeMask {
    /// The empty set
    pub const EMPTY: Self = Self(0);

    /// Add a node to the set.
    #[inline]
    pub fn set(&mut self, nid: NodeId) {
        self.0 |= 1 << nid.index();
    }

    /// Remove a node from the set.
    #[inline]
    pub fn clear(&mut self, nid: NodeId) {
        self.0 &= !(1 << nid.index());
    }

    /// Check membership.
    #[inline]
    #[must_use]
    pub const fn contains(&self, nid: NodeId) -> bool {
        self.0 & (1 << nid.index()) != 0
    }

    /// Number of nodes in the set.
    #[inline]
    #[must_use]
    pub const fn weight(&self) -> u32 {
        self.0.count_ones()
    }

    /// Check whether the set is empty.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Highest node id in the set plus one (`nr_node_ids`).
    #[inline]
    #[must_use]
    pub const fn nr_ids(&self) -> usize {
        (64 - self.0.leading_zeros()) as usize
    }

    /// Iterate the member nodes in increasing order.
    pub fn iter(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..MAX_NUMNODES as u32)
            .filter_map(NodeId::new)
            .filter(|nid| self.contains(*nid))
    }
}

impl fmt::Debug for NodeMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter().map(|n| n.as_u32())).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_range() {
        assert!(NodeId::new(0).is_some());
        assert!(NodeId::new(MAX_NUMNODES as u32 - 1).is_some());
        assert!(NodeId::new(MAX_NUMNODES as u32).is_none());
    }

    #[test]
    fn test_node_mask() {
        let mut mask = NodeMask::EMPTY;
        assert!(mask.is_empty());
        for n in [0, 3, 1] {
            mask.set(NodeId::new(n).unwrap());
        }
        assert_eq!(mask.weight(), 3);
        assert_eq!(mask.nr_ids(), 4);
        let ids: [u32; 3] = {
            let mut it = mask.iter().map(|n| n.as_u32());
            [it.next().unwrap(), it.next().unwrap(), it.next().unwrap()]
        };
        assert_eq!(ids, [0, 1, 3]);
        mask.clear(NodeId::new(3).unwrap());
        assert_eq!(mask.nr_ids(), 2);
    }
}
