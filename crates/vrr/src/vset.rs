//! Virtual-neighbor set: membership on the circular identifier space.
//!
//! The set holds at most `vset_size` members, ideally the `vset_size / 2`
//! closest identifiers on each side of the owner. Admission is decided by
//! the order-statistic policy in [`VsetManager::should_add`]; an admission
//! that overflows the capacity displaces ("bumps") exactly one member.

use crate::types::{left_distance, right_distance, NodeId};
use tokio::sync::RwLock;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
struct VsetEntry {
    node: NodeId,
    diff_left: u32,
    diff_right: u32,
}

impl VsetEntry {
    fn new(owner: NodeId, node: NodeId) -> Self {
        Self {
            node,
            diff_left: left_distance(owner, node),
            diff_right: right_distance(owner, node),
        }
    }
}

/// Virtual-neighbor set of one node.
pub struct VsetManager {
    owner: NodeId,
    capacity: usize,
    entries: RwLock<Vec<VsetEntry>>,
}

impl VsetManager {
    pub fn new(owner: NodeId, capacity: usize) -> Self {
        Self {
            owner,
            capacity,
            entries: RwLock::new(Vec::with_capacity(capacity + 1)),
        }
    }

    fn radius(&self) -> usize {
        self.capacity / 2
    }

    /// Whether `node` belongs in the set: it is absent, and either the set
    /// is below capacity or `node` is closer on at least one side than the
    /// radius-th closest current member on that side.
    pub async fn should_add(&self, node: NodeId) -> bool {
        let entries = self.entries.read().await;
        self.should_add_inner(&entries, node)
    }

    fn should_add_inner(&self, entries: &[VsetEntry], node: NodeId) -> bool {
        if node == self.owner || entries.iter().any(|e| e.node == node) {
            return false;
        }
        if entries.len() < self.capacity {
            return true;
        }

        let candidate = VsetEntry::new(self.owner, node);
        let (lefts, rights) = sorted_diffs(entries);
        let radius = self.radius();
        lefts[radius - 1] > candidate.diff_left || rights[radius - 1] > candidate.diff_right
    }

    /// Insert `node`, bumping at most one member if the set overflows.
    /// Returns the bumped identifier, if any. Inserting a present member is
    /// a no-op.
    pub async fn add(&self, node: NodeId) -> Option<NodeId> {
        let mut entries = self.entries.write().await;
        if node == self.owner || entries.iter().any(|e| e.node == node) {
            return None;
        }

        entries.push(VsetEntry::new(self.owner, node));
        debug!(node = self.owner, neighbor = node, "vset added neighbor");

        if entries.len() <= self.capacity {
            return None;
        }

        // Displace the member sitting at the radius-th order statistic of
        // both sorted diff lists.
        let (lefts, rights) = sorted_diffs(&entries);
        let radius = self.radius();
        let (bump_left, bump_right) = (lefts[radius], rights[radius]);

        if let Some(pos) = entries
            .iter()
            .position(|e| e.diff_left == bump_left && e.diff_right == bump_right)
        {
            let bumped = entries.remove(pos).node;
            debug!(node = self.owner, neighbor = bumped, "vset bumped neighbor");
            Some(bumped)
        } else {
            warn!(node = self.owner, "vset bump found no displaceable member");
            None
        }
    }

    /// Remove `node` from the set.
    pub async fn remove(&self, node: NodeId) -> bool {
        let mut entries = self.entries.write().await;
        match entries.iter().position(|e| e.node == node) {
            Some(pos) => {
                entries.remove(pos);
                debug!(node = self.owner, neighbor = node, "vset removed neighbor");
                true
            }
            None => false,
        }
    }

    /// All member identifiers.
    pub async fn all(&self) -> Vec<NodeId> {
        self.entries.read().await.iter().map(|e| e.node).collect()
    }

    pub async fn contains(&self, node: NodeId) -> bool {
        self.entries.read().await.iter().any(|e| e.node == node)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

fn sorted_diffs(entries: &[VsetEntry]) -> (Vec<u32>, Vec<u32>) {
    let mut lefts: Vec<u32> = entries.iter().map(|e| e.diff_left).collect();
    let mut rights: Vec<u32> = entries.iter().map(|e| e.diff_right).collect();
    lefts.sort_unstable();
    rights.sort_unstable();
    (lefts, rights)
}
