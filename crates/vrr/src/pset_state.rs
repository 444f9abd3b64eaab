//! Hello-driven neighbor state tracking.
//!
//! Every received hello classifies the local node from the sender's point
//! of view; the resulting `(neighbor, relation, active)` triple drives a
//! fixed transition table over the PSet. The tracker also caches the index
//! lists a hello beacon needs, so emission does not rescan the PSet.

use crate::pset::{LinkStatus, PsetManager};
use crate::types::NodeId;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// How a sender's hello classifies the local node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelloRelation {
    Linked,
    Pending,
    Missing,
}

/// One hello-derived transition, queued for the update worker.
#[derive(Debug, Clone, Copy)]
pub struct PsetUpdate {
    pub node: NodeId,
    pub relation: HelloRelation,
    pub active: bool,
}

/// Next-state table, indexed by current status (with `None` standing for an
/// unknown neighbor) and the relation the sender's hello reported.
pub fn next_status(current: Option<LinkStatus>, relation: HelloRelation) -> LinkStatus {
    use HelloRelation as R;
    use LinkStatus as S;
    match (current, relation) {
        (Some(S::Linked), R::Linked) => S::Linked,
        (Some(S::Linked), R::Pending) => S::Linked,
        (Some(S::Linked), R::Missing) => S::Failed,
        (Some(S::Pending), R::Linked) => S::Linked,
        (Some(S::Pending), R::Pending) => S::Linked,
        (Some(S::Pending), R::Missing) => S::Pending,
        (Some(S::Failed), R::Linked) => S::Failed,
        (Some(S::Failed), R::Pending) => S::Pending,
        (Some(S::Failed), R::Missing) => S::Pending,
        (None, R::Linked) => S::Failed,
        (None, R::Pending) => S::Linked,
        (None, R::Missing) => S::Pending,
    }
}

/// Classify the local node against the neighbor lists of a received hello.
/// A node listed as linked (active or not) is `Linked` even if it also
/// appears in the pending list.
pub fn classify(
    me: NodeId,
    linked_active: &[NodeId],
    linked_inactive: &[NodeId],
    pending: &[NodeId],
) -> HelloRelation {
    if linked_active.contains(&me) || linked_inactive.contains(&me) {
        HelloRelation::Linked
    } else if pending.contains(&me) {
        HelloRelation::Pending
    } else {
        HelloRelation::Missing
    }
}

/// Neighbor lists as they appear in a hello beacon.
#[derive(Debug, Clone, Default)]
pub struct HelloLists {
    pub linked_active: Vec<NodeId>,
    pub linked_inactive: Vec<NodeId>,
    pub pending: Vec<NodeId>,
}

/// Cached hello index lists plus the bounded update queue feeding the
/// per-node update worker.
pub struct PsetStateTracker {
    owner: NodeId,
    lists: RwLock<HelloLists>,
    update_tx: mpsc::Sender<PsetUpdate>,
}

impl PsetStateTracker {
    /// Create the tracker and the receiving end of its update queue.
    pub fn new(owner: NodeId, queue_depth: usize) -> (Self, mpsc::Receiver<PsetUpdate>) {
        let (update_tx, update_rx) = mpsc::channel(queue_depth);
        (
            Self {
                owner,
                lists: RwLock::new(HelloLists::default()),
                update_tx,
            },
            update_rx,
        )
    }

    /// Enqueue a hello-derived update without blocking. Overflow is dropped;
    /// the next hello period replaces the lost information.
    pub fn schedule(&self, update: PsetUpdate) {
        match self.update_tx.try_send(update) {
            Ok(()) => {}
            Err(TrySendError::Full(update)) => {
                warn!(
                    node = self.owner,
                    neighbor = update.node,
                    "pset update queue full, discarding update"
                );
            }
            Err(TrySendError::Closed(update)) => {
                debug!(
                    node = self.owner,
                    neighbor = update.node,
                    "pset update queue closed, discarding update"
                );
            }
        }
    }

    /// Rebuild the cached index lists from the PSet.
    pub async fn refresh(&self, pset: &PsetManager) {
        let mut lists = self.lists.write().await;
        lists.linked_active.clear();
        lists.linked_inactive.clear();
        lists.pending.clear();

        for info in pset.snapshot() {
            match info.status {
                LinkStatus::Linked => {
                    if info.active {
                        lists.linked_active.push(info.node);
                    } else {
                        lists.linked_inactive.push(info.node);
                    }
                }
                LinkStatus::Pending => lists.pending.push(info.node),
                LinkStatus::Failed => {}
            }
        }
    }

    /// Clone the current index lists.
    pub async fn lists(&self) -> HelloLists {
        self.lists.read().await.clone()
    }
}
