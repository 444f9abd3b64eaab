//! In-process link-layer fabric for VRR deployments.
//!
//! The [`Switch`] delivers messages between registered node inboxes with
//! configurable per-delivery latency and loss, and expands subnet
//! broadcasts. It implements the [`vrr::Fabric`] contract, which is the
//! only surface the protocol core depends on.

pub mod switch;

pub use switch::{FabricStats, Switch};
