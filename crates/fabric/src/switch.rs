//! The in-process message switch.

use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use vrr::{Fabric, Message, NodeId, SubnetId, BROADCAST};

/// Delivery counters of a switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FabricStats {
    /// Deliveries attempted (one per copy of a broadcast).
    pub total: u64,
    /// Deliveries lost to simulated loss or to a full inbox.
    pub dropped: u64,
}

#[derive(Default)]
struct Counters {
    total: AtomicU64,
    dropped: AtomicU64,
}

/// In-process switch delivering messages between node inboxes.
///
/// Each delivery is independently subject to the configured loss
/// probability and added latency, so the switch does not guarantee FIFO
/// ordering between any pair of nodes. Enqueueing onto a full inbox drops
/// the message and counts it; loss there is indistinguishable from link
/// loss.
pub struct Switch {
    /// Registered node inboxes. Mutated before the topology maps.
    nodes: DashMap<NodeId, mpsc::Sender<Message>>,
    /// Subnet id to member nodes.
    subnet_members: DashMap<SubnetId, Vec<NodeId>>,
    /// Node id to subnets it belongs to.
    node_subnets: DashMap<NodeId, Vec<SubnetId>>,

    latency: Duration,
    loss_rate: f32,
    counters: Arc<Counters>,
}

impl Switch {
    /// Create a switch adding `latency` to every delivery and dropping each
    /// delivery independently with probability `loss_rate`.
    pub fn new(latency: Duration, loss_rate: f32) -> Arc<Self> {
        Arc::new(Self {
            nodes: DashMap::new(),
            subnet_members: DashMap::new(),
            node_subnets: DashMap::new(),
            latency,
            loss_rate,
            counters: Arc::new(Counters::default()),
        })
    }

    /// Register a node's inbox and its subnet membership.
    pub fn register(&self, node: NodeId, inbox: mpsc::Sender<Message>, subnets: &[SubnetId]) {
        self.nodes.insert(node, inbox);
        self.node_subnets.insert(node, subnets.to_vec());
        for &subnet in subnets {
            let mut members = self.subnet_members.entry(subnet).or_default();
            if !members.contains(&node) {
                members.push(node);
            }
        }
        info!(node, ?subnets, "registered node");
    }

    /// Remove a node from the switch entirely.
    pub fn unregister(&self, node: NodeId) {
        self.nodes.remove(&node);
        if let Some((_, subnets)) = self.node_subnets.remove(&node) {
            for subnet in subnets {
                if let Some(mut members) = self.subnet_members.get_mut(&subnet) {
                    members.retain(|&id| id != node);
                }
            }
        }
        info!(node, "unregistered node");
    }

    /// Remove a node from the given subnets; a node left with no subnets is
    /// removed entirely.
    pub fn unregister_from_subnets(&self, node: NodeId, subnets: &[SubnetId]) {
        if subnets.is_empty() {
            return;
        }

        for &subnet in subnets {
            if let Some(mut members) = self.subnet_members.get_mut(&subnet) {
                members.retain(|&id| id != node);
            }
        }

        let now_empty = match self.node_subnets.get_mut(&node) {
            Some(mut remaining) => {
                remaining.retain(|subnet| !subnets.contains(subnet));
                remaining.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.node_subnets.remove(&node);
            self.nodes.remove(&node);
        }
        info!(node, ?subnets, "unregistered node from subnets");
    }

    /// All registered node ids.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|e| *e.key()).collect()
    }

    /// Current delivery counters.
    pub fn stats(&self) -> FabricStats {
        FabricStats {
            total: self.counters.total.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }

    /// Deliver one copy to every distinct node sharing a subnet with the
    /// sender, excluding the sender itself.
    fn broadcast(&self, msg: Message) {
        let subnets = match self.node_subnets.get(&msg.src) {
            Some(subnets) => subnets.value().clone(),
            None => {
                warn!(src = msg.src, "broadcast from node in no subnet");
                return;
            }
        };

        let mut targets: Vec<NodeId> = Vec::new();
        let mut seen: HashSet<NodeId> = HashSet::new();
        for subnet in subnets {
            if let Some(members) = self.subnet_members.get(&subnet) {
                for &member in members.iter() {
                    if member != msg.src && seen.insert(member) {
                        targets.push(member);
                    }
                }
            }
        }

        for target in targets {
            let mut copy = msg.clone();
            copy.next_hop = target;
            self.deliver(copy);
        }
    }

    /// Deliver a single message, applying loss and latency.
    fn deliver(&self, msg: Message) {
        self.counters.total.fetch_add(1, Ordering::Relaxed);

        if self.loss_rate > 0.0 && rand::random::<f32>() < self.loss_rate {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(src = msg.src, next_hop = msg.next_hop, "packet lost");
            return;
        }

        let inbox = match self.nodes.get(&msg.next_hop) {
            Some(entry) => entry.value().clone(),
            None => {
                warn!(next_hop = msg.next_hop, "target node not registered, dropping");
                return;
            }
        };

        if self.latency.is_zero() {
            Self::enqueue(&inbox, msg, &self.counters);
        } else {
            let counters = self.counters.clone();
            let latency = self.latency;
            tokio::spawn(async move {
                tokio::time::sleep(latency).await;
                Self::enqueue(&inbox, msg, &counters);
            });
        }
    }

    fn enqueue(inbox: &mpsc::Sender<Message>, msg: Message, counters: &Counters) {
        if let Err(e) = inbox.try_send(msg) {
            counters.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, "inbox full or closed, dropping message");
        }
    }
}

impl Fabric for Switch {
    fn send(&self, msg: Message) {
        if msg.next_hop == BROADCAST {
            self.broadcast(msg);
        } else {
            self.deliver(msg);
        }
    }
}
