//! Core identifier types and ring arithmetic.
//!
//! Node identifiers live on a circular space of size 2^32. All distance
//! computations are modular; signed subtraction is never used.

/// Node identifier on the virtual ring.
pub type NodeId = u32;

/// Subnet identifier for the link-layer fabric.
pub type SubnetId = u32;

/// Path identifier, chosen at the origin of a virtual path.
pub type PathId = u32;

/// Ring distance: the symmetric minimum of the two directed distances.
pub fn ring_distance(a: NodeId, b: NodeId) -> u32 {
    a.wrapping_sub(b).min(b.wrapping_sub(a))
}

/// Distance travelling rightward (increasing identifiers) from `from` to `to`.
pub fn right_distance(from: NodeId, to: NodeId) -> u32 {
    to.wrapping_sub(from)
}

/// Distance travelling leftward (decreasing identifiers) from `from` to `to`.
pub fn left_distance(from: NodeId, to: NodeId) -> u32 {
    from.wrapping_sub(to)
}
