//! Peer set (C3): the list of tracker peers, the current leader index,
//! and the "dirty peer list" pattern for safely growing that list while
//! requests are in flight (spec §4.3, §9).

use std::net::IpAddr;
use std::sync::Mutex;

/// One peer tracker.
#[derive(Debug, Clone, PartialEq)]
pub struct Peer {
    pub ip_addrs: Vec<IpAddr>,
    pub port: u16,
    pub is_local: bool,
    pub running_time: i64,
    pub restart_interval: i64,
    pub is_leader: bool,
}

impl Peer {
    pub fn new(ip: IpAddr, port: u16, is_local: bool) -> Peer {
        Peer {
            ip_addrs: vec![ip],
            port,
            is_local,
            running_time: 0,
            restart_interval: 0,
            is_leader: false,
        }
    }

    pub fn addr(&self) -> String {
        format!(
            "{}:{}",
            self.ip_addrs.first().map(|ip| ip.to_string()).unwrap_or_default(),
            self.port
        )
    }
}

/// Tracker peer list with the one-cycle-delayed free of a replaced
/// array (spec §9 "dirty peer list" design note): when the list grows,
/// the prior version is kept in `last_peers` and dropped only on the
/// next call to [`PeerSet::retire_dirty`], after any in-flight request
/// holding indexes into it has finished.
pub struct PeerSet {
    inner: Mutex<PeerSetInner>,
}

struct PeerSetInner {
    peers: Vec<Peer>,
    leader_index: Option<usize>,
    last_peers: Option<Vec<Peer>>,
}

impl Default for PeerSet {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerSet {
    pub fn new() -> PeerSet {
        PeerSet {
            inner: Mutex::new(PeerSetInner {
                peers: Vec::new(),
                leader_index: None,
                last_peers: None,
            }),
        }
    }

    pub fn snapshot(&self) -> Vec<Peer> {
        self.inner.lock().unwrap().peers.clone()
    }

    pub fn leader(&self) -> Option<Peer> {
        let inner = self.inner.lock().unwrap();
        inner.leader_index.map(|i| inner.peers[i].clone())
    }

    /// Merges a peer list reported by a joining storage (spec §4.3: "a
    /// peer list is constructed from the first storage-join... checked
    /// for additions thereafter"). Returns true if the set changed.
    pub fn merge(&self, reported: &[Peer]) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let mut changed = false;
        let mut next = inner.peers.clone();
        for p in reported {
            if !next.iter().any(|existing| existing.addr() == p.addr()) {
                next.push(p.clone());
                changed = true;
            }
        }
        if changed {
            let old = std::mem::replace(&mut inner.peers, next);
            inner.last_peers = Some(old);
        }
        changed
    }

    /// Frees the array retained by the previous [`PeerSet::merge`] call.
    /// Called once per supervisor cycle.
    pub fn retire_dirty(&self) {
        self.inner.lock().unwrap().last_peers = None;
    }

    pub fn has_dirty(&self) -> bool {
        self.inner.lock().unwrap().last_peers.is_some()
    }

    pub fn set_leader(&self, addr: &str) {
        let mut inner = self.inner.lock().unwrap();
        let idx = inner.peers.iter().position(|p| p.addr() == addr);
        for p in inner.peers.iter_mut() {
            p.is_leader = false;
        }
        if let Some(i) = idx {
            inner.peers[i].is_leader = true;
        }
        inner.leader_index = idx;
    }

    pub fn update_status(&self, addr: &str, running_time: i64, restart_interval: i64, is_leader: bool) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(p) = inner.peers.iter_mut().find(|p| p.addr() == addr) {
            p.running_time = running_time;
            p.restart_interval = restart_interval;
            p.is_leader = is_leader;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn merge_adds_new_peers_and_marks_dirty() {
        let set = PeerSet::new();
        assert!(set.merge(&[Peer::new(ip("10.0.0.1"), 23000, true)]));
        assert!(set.has_dirty());
        assert_eq!(set.snapshot().len(), 1);

        set.retire_dirty();
        assert!(!set.has_dirty());
    }

    #[test]
    fn merge_is_noop_for_known_peers() {
        let set = PeerSet::new();
        let p = Peer::new(ip("10.0.0.1"), 23000, true);
        set.merge(&[p.clone()]);
        set.retire_dirty();
        assert!(!set.merge(&[p]));
        assert!(!set.has_dirty());
    }

    #[test]
    fn set_leader_is_exclusive() {
        let set = PeerSet::new();
        set.merge(&[
            Peer::new(ip("10.0.0.1"), 23000, true),
            Peer::new(ip("10.0.0.2"), 23000, false),
        ]);
        set.set_leader("10.0.0.1:23000");
        let peers = set.snapshot();
        assert!(peers[0].is_leader);
        assert!(!peers[1].is_leader);
        set.set_leader("10.0.0.2:23000");
        let peers = set.snapshot();
        assert!(!peers[0].is_leader);
        assert!(peers[1].is_leader);
    }
}
