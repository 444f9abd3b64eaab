//! Routing table of established virtual paths.
//!
//! One entry per path, keyed by the globally unique path id. Each entry
//! names the two path endpoints `ea`, `eb` and the next hops `na`, `nb`
//! toward them; a next hop of 0 means this node is that endpoint.

use crate::types::{ring_distance, NodeId, PathId};
use dashmap::DashMap;
use std::fmt;
use tracing::debug;

/// One established virtual path through this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteEntry {
    pub ea: NodeId,
    pub eb: NodeId,
    pub na: NodeId,
    pub nb: NodeId,
    pub path_id: PathId,
}

/// Per-node routing table.
pub struct RoutingTable {
    owner: NodeId,
    routes: DashMap<PathId, RouteEntry>,
}

impl RoutingTable {
    pub fn new(owner: NodeId) -> Self {
        Self {
            owner,
            routes: DashMap::new(),
        }
    }

    /// Add an entry. Fails if an entry with the same path id already
    /// exists.
    pub fn add(&self, ea: NodeId, eb: NodeId, na: NodeId, nb: NodeId, path_id: PathId) -> bool {
        match self.routes.entry(path_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                debug!(node = self.owner, path_id, "route with this path id already exists");
                false
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(RouteEntry {
                    ea,
                    eb,
                    na,
                    nb,
                    path_id,
                });
                debug!(node = self.owner, path_id, ea, eb, na, nb, "route added");
                true
            }
        }
    }

    /// Remove and return the entry for `path_id`. The endpoint names the
    /// path for tracing only; the path id alone identifies the entry.
    pub fn remove(&self, path_id: PathId, endpoint: NodeId) -> Option<RouteEntry> {
        let removed = self.routes.remove(&path_id).map(|(_, entry)| entry);
        if removed.is_some() {
            debug!(node = self.owner, path_id, endpoint, "route removed");
        }
        removed
    }

    /// Next hop toward `dst`: the hop serving the endpoint closest to `dst`
    /// on the ring. Returns 0 when the table is empty or this node itself
    /// is the closest endpoint.
    pub fn next_hop(&self, dst: NodeId) -> NodeId {
        self.next_hop_filtered(dst, None)
    }

    /// Like [`Self::next_hop`] but with `exclude` removed from the
    /// candidate endpoints.
    pub fn next_hop_exclude(&self, dst: NodeId, exclude: NodeId) -> NodeId {
        self.next_hop_filtered(dst, Some(exclude))
    }

    fn next_hop_filtered(&self, dst: NodeId, exclude: Option<NodeId>) -> NodeId {
        let closest = self.closest_endpoint(dst, exclude);
        if closest == 0 || closest == self.owner {
            return 0;
        }
        self.hop_toward(closest)
    }

    /// The endpoint appearing in any entry that is closest to `dst`. Ties
    /// resolve toward the numerically smaller endpoint.
    fn closest_endpoint(&self, dst: NodeId, exclude: Option<NodeId>) -> NodeId {
        let mut best: Option<(u32, NodeId)> = None;
        for entry in self.routes.iter() {
            for endpoint in [entry.ea, entry.eb] {
                if endpoint == 0 || exclude == Some(endpoint) {
                    continue;
                }
                let key = (ring_distance(dst, endpoint), endpoint);
                if best.map(|b| key < b).unwrap_or(true) {
                    best = Some(key);
                }
            }
        }
        best.map(|(_, endpoint)| endpoint).unwrap_or(0)
    }

    /// The hop toward `endpoint` from the entry with the numerically
    /// largest path id among those containing it.
    fn hop_toward(&self, endpoint: NodeId) -> NodeId {
        let mut best: Option<RouteEntry> = None;
        for entry in self.routes.iter() {
            if entry.ea != endpoint && entry.eb != endpoint {
                continue;
            }
            if best.map(|b| entry.path_id > b.path_id).unwrap_or(true) {
                best = Some(*entry);
            }
        }
        match best {
            Some(entry) if entry.ea == endpoint => entry.na,
            Some(entry) => entry.nb,
            None => 0,
        }
    }

    /// All entries with `endpoint` on either side.
    pub fn entries_for_endpoint(&self, endpoint: NodeId) -> Vec<RouteEntry> {
        self.routes
            .iter()
            .filter(|e| e.ea == endpoint || e.eb == endpoint)
            .map(|e| *e)
            .collect()
    }

    /// Look up an entry by path id.
    pub fn get(&self, path_id: PathId) -> Option<RouteEntry> {
        self.routes.get(&path_id).map(|e| *e)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl fmt::Display for RoutingTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.routes.is_empty() {
            return write!(f, "RoutingTable: {{empty}}");
        }
        writeln!(f, "RoutingTable:")?;
        for entry in self.routes.iter() {
            writeln!(
                f,
                "  - path_id: {}, ea: {}, eb: {}, na: {}, nb: {}",
                entry.path_id, entry.ea, entry.eb, entry.na, entry.nb
            )?;
        }
        Ok(())
    }
}
