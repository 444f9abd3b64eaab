//! The link-layer fabric contract.
//!
//! The protocol core depends on nothing else from the deployment: a node
//! hands every outbound message to [`Fabric::send`] and receives inbound
//! messages on its bounded inbox. Delivery may reorder, delay, or drop
//! messages; the protocol tolerates all three.

use crate::message::Message;

/// One-way send surface of the link-layer fabric.
pub trait Fabric: Send + Sync {
    /// Hand a message to the fabric for delivery.
    ///
    /// A `next_hop` of [`crate::message::BROADCAST`] requests delivery to
    /// every peer sharing at least one subnet with `msg.src`, each copy with
    /// `next_hop` rewritten to that peer. Enqueueing never blocks the
    /// caller; overfull inboxes lose the message.
    fn send(&self, msg: Message);
}
