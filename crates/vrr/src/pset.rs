//! Physical-neighbor set: one-hop adjacency with link status and failure
//! accounting.

use crate::types::NodeId;
use dashmap::DashMap;
use rand::seq::SliceRandom;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::debug;

/// Link status of a physical neighbor.
///
/// "Unknown" is not representable here: a neighbor with unknown status is
/// simply absent from the set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Linked,
    Pending,
    Failed,
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkStatus::Linked => write!(f, "linked"),
            LinkStatus::Pending => write!(f, "pending"),
            LinkStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Point-in-time view of one physical neighbor.
#[derive(Debug, Clone, Copy)]
pub struct NeighborInfo {
    pub node: NodeId,
    pub status: LinkStatus,
    pub active: bool,
}

struct PsetEntry {
    status: LinkStatus,
    active: bool,
    fail_count: AtomicU32,
}

/// Physical-neighbor table.
///
/// Structural mutations are serialized by the owning node; the failure
/// counters are atomic and may be touched concurrently.
pub struct PsetManager {
    owner: NodeId,
    entries: DashMap<NodeId, PsetEntry>,
}

impl PsetManager {
    pub fn new(owner: NodeId) -> Self {
        Self {
            owner,
            entries: DashMap::new(),
        }
    }

    /// Add a neighbor. Returns false without touching the entry if the
    /// neighbor already exists.
    pub fn add(&self, node: NodeId, status: LinkStatus, active: bool) -> bool {
        match self.entries.entry(node) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(PsetEntry {
                    status,
                    active,
                    fail_count: AtomicU32::new(0),
                });
                debug!(node = self.owner, neighbor = node, %status, "pset added neighbor");
                true
            }
        }
    }

    /// Update status and activity of an existing neighbor.
    pub fn update(&self, node: NodeId, status: LinkStatus, active: bool) -> bool {
        match self.entries.get_mut(&node) {
            Some(mut entry) => {
                entry.status = status;
                entry.active = active;
                debug!(node = self.owner, neighbor = node, %status, active, "pset updated neighbor");
                true
            }
            None => false,
        }
    }

    /// Remove a neighbor.
    pub fn remove(&self, node: NodeId) -> bool {
        let removed = self.entries.remove(&node).is_some();
        if removed {
            debug!(node = self.owner, neighbor = node, "pset removed neighbor");
        }
        removed
    }

    /// Status of a neighbor; `None` means the neighbor is unknown.
    pub fn status(&self, node: NodeId) -> Option<LinkStatus> {
        self.entries.get(&node).map(|e| e.status)
    }

    /// Activity flag of a neighbor; `None` means the neighbor is unknown.
    pub fn active(&self, node: NodeId) -> Option<bool> {
        self.entries.get(&node).map(|e| e.active)
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.entries.contains_key(&node)
    }

    /// Atomically increment the failure counter; returns the new count, or
    /// `None` for an unknown neighbor.
    pub fn inc_fail(&self, node: NodeId) -> Option<u32> {
        self.entries
            .get(&node)
            .map(|e| e.fail_count.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Atomically reset the failure counter. No-op for unknown neighbors.
    pub fn reset_fail(&self, node: NodeId) {
        if let Some(entry) = self.entries.get(&node) {
            entry.fail_count.store(0, Ordering::Relaxed);
        }
    }

    /// True iff the neighbor is stored as `Linked` with `active = true`.
    pub fn is_active_linked(&self, node: NodeId) -> bool {
        self.entries
            .get(&node)
            .map(|e| e.status == LinkStatus::Linked && e.active)
            .unwrap_or(false)
    }

    /// Pick a uniformly random neighbor from the active-linked subset.
    pub fn pick_random_active_proxy(&self) -> Option<NodeId> {
        let candidates: Vec<NodeId> = self
            .entries
            .iter()
            .filter(|e| e.status == LinkStatus::Linked && e.active)
            .map(|e| *e.key())
            .collect();
        candidates.choose(&mut rand::thread_rng()).copied()
    }

    /// Point-in-time view of all neighbors.
    pub fn snapshot(&self) -> Vec<NeighborInfo> {
        self.entries
            .iter()
            .map(|e| NeighborInfo {
                node: *e.key(),
                status: e.status,
                active: e.active,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for PsetManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.entries.is_empty() {
            return write!(f, "PSet: {{empty}}");
        }
        write!(f, "PSet: {{")?;
        for (i, entry) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", entry.key(), entry.status)?;
        }
        write!(f, "}}")
    }
}
