//! Server topology: the spanning tree of linked servers.
//!
//! Every known server carries a `learned_from` back-reference naming the
//! SID that introduced it; the references form a tree rooted at this
//! server. Routing walks the chain toward the root to find the direct
//! neighbor; netsplit cleanup collects the subtree below a dead link.

use dashmap::DashMap;
use lattice_proto::ident::ServerId;
use std::collections::HashSet;

/// One linked server (direct or learned through a peer).
#[derive(Debug, Clone)]
pub struct LinkedServer {
    pub sid: ServerId,
    pub name: String,
    pub description: String,
    pub hopcount: u32,
    /// SID of the server that introduced this one; `None` for direct
    /// peers of ours.
    pub learned_from: Option<ServerId>,
}

/// The routing table.
pub struct Topology {
    servers: DashMap<ServerId, LinkedServer>,
}

impl Topology {
    pub fn new() -> Self {
        Self {
            servers: DashMap::new(),
        }
    }

    pub fn insert(&self, server: LinkedServer) {
        self.servers.insert(server.sid.clone(), server);
    }

    pub fn remove(&self, sid: &ServerId) -> Option<LinkedServer> {
        self.servers.remove(sid).map(|(_, s)| s)
    }

    pub fn contains(&self, sid: &ServerId) -> bool {
        self.servers.contains_key(sid)
    }

    pub fn get(&self, sid: &ServerId) -> Option<LinkedServer> {
        self.servers.get(sid).map(|r| r.clone())
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn all(&self) -> Vec<LinkedServer> {
        self.servers.iter().map(|e| e.value().clone()).collect()
    }

    /// The direct neighbor through which `target` is reached: walk the
    /// `learned_from` chain until a server with no back-reference (a
    /// direct peer) is found. Returns `None` for unknown SIDs; cycles
    /// cannot occur because insertion always points at an existing server.
    pub fn route_to(&self, target: &ServerId) -> Option<ServerId> {
        let mut current = self.get(target)?;
        let mut hops = 0;
        while let Some(via) = current.learned_from.clone() {
            current = self.get(&via)?;
            // Defensive bound in case a malicious peer manufactures a loop.
            hops += 1;
            if hops > 64 {
                return None;
            }
        }
        Some(current.sid)
    }

    /// The subtree rooted at `root`: `root` itself plus every server whose
    /// `learned_from` chain passes through it. This is the netsplit scope.
    pub fn subtree(&self, root: &ServerId) -> Vec<ServerId> {
        let mut result = Vec::new();
        let mut frontier = vec![root.clone()];
        let mut seen = HashSet::new();

        while let Some(current) = frontier.pop() {
            if !seen.insert(current.clone()) {
                continue;
            }
            result.push(current.clone());
            for entry in self.servers.iter() {
                if entry.value().learned_from.as_ref() == Some(&current)
                    && !seen.contains(&entry.value().sid)
                {
                    frontier.push(entry.value().sid.clone());
                }
            }
        }
        result
    }

    pub fn remove_many(&self, sids: &[ServerId]) {
        for sid in sids {
            self.servers.remove(sid);
        }
    }
}

impl Default for Topology {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid(s: &str) -> ServerId {
        ServerId::parse(s).unwrap()
    }

    fn server(id: &str, via: Option<&str>, hops: u32) -> LinkedServer {
        LinkedServer {
            sid: sid(id),
            name: format!("{}.lattice.test", id.to_lowercase()),
            description: String::new(),
            hopcount: hops,
            learned_from: via.map(sid),
        }
    }

    #[test]
    fn routes_through_direct_peer() {
        // us — A — B, and us — C
        let topo = Topology::new();
        topo.insert(server("0AA", None, 1));
        topo.insert(server("0BB", Some("0AA"), 2));
        topo.insert(server("0CC", None, 1));

        assert_eq!(topo.route_to(&sid("0BB")), Some(sid("0AA")));
        assert_eq!(topo.route_to(&sid("0AA")), Some(sid("0AA")));
        assert_eq!(topo.route_to(&sid("0CC")), Some(sid("0CC")));
        assert_eq!(topo.route_to(&sid("9ZZ")), None);
    }

    #[test]
    fn subtree_collects_cascade() {
        // A — B — C, plus sibling D directly linked.
        let topo = Topology::new();
        topo.insert(server("0AA", None, 1));
        topo.insert(server("0BB", Some("0AA"), 2));
        topo.insert(server("0CC", Some("0BB"), 3));
        topo.insert(server("0DD", None, 1));

        let mut cascade = topo.subtree(&sid("0AA"));
        cascade.sort();
        assert_eq!(cascade, vec![sid("0AA"), sid("0BB"), sid("0CC")]);

        let leaf = topo.subtree(&sid("0DD"));
        assert_eq!(leaf, vec![sid("0DD")]);
    }

    #[test]
    fn remove_many_clears_entries() {
        let topo = Topology::new();
        topo.insert(server("0AA", None, 1));
        topo.insert(server("0BB", Some("0AA"), 2));
        let cascade = topo.subtree(&sid("0AA"));
        topo.remove_many(&cascade);
        assert!(topo.is_empty());
    }
}
