//! Leader/relationship manager (C4): periodic leader election among
//! tracker peers and the two-phase next-leader commit (spec §4.3).

use crate::error::{TrackerError, TrackerResult};
use crate::peers::{Peer, PeerSet};
use async_trait::async_trait;
use std::sync::Mutex;
use tracing::{info, warn};

/// `TRACKER_SYNC_STATUS_FILE_INTERVAL` (spec §4.3): the granularity at
/// which running-time and restart-interval are truncated, and the
/// baseline for the liveness supervisor's adaptive trunk timeouts.
pub const TRACKER_SYNC_STATUS_FILE_INTERVAL: i64 = 300;

/// A peer's self-reported standing, as exchanged during a relationship
/// tick (spec §4.3 step 2).
#[derive(Debug, Clone, PartialEq)]
pub struct PeerStatus {
    pub addr: String,
    pub running_time: i64,
    pub restart_interval: i64,
    pub is_leader: bool,
}

/// Truncates a duration to the nearest lower multiple of `interval`
/// (spec §4.3 step 1).
pub fn truncate(value: i64, interval: i64) -> i64 {
    if interval <= 0 {
        return value;
    }
    (value / interval) * interval
}

pub fn running_time(now: i64, process_start: i64) -> i64 {
    truncate(
        (now - process_start).max(0),
        TRACKER_SYNC_STATUS_FILE_INTERVAL,
    )
}

pub fn restart_interval(process_start: i64, last_known_check_time: i64) -> i64 {
    truncate(
        (process_start - last_known_check_time).max(0),
        TRACKER_SYNC_STATUS_FILE_INTERVAL,
    )
}

/// Sorts collected statuses per spec §4.3 step 3: declared leaders
/// last, within non-leaders larger running time wins, ties broken by
/// smaller restart interval.
pub fn rank_statuses(statuses: &mut [PeerStatus]) {
    statuses.sort_by(|a, b| {
        a.is_leader
            .cmp(&b.is_leader)
            .then(b.running_time.cmp(&a.running_time))
            .then(a.restart_interval.cmp(&b.restart_interval))
    });
}

/// Outcome of a single relationship tick's election pass.
#[derive(Debug, Clone, PartialEq)]
pub enum ElectionOutcome {
    /// The local tracker should declare itself leader.
    SelfLeader,
    /// `addr` is (or remains) the accepted leader.
    AcceptRemote(String),
    /// Two peers declared leadership simultaneously; both must demote
    /// and the selection restarts next tick.
    Conflict,
}

/// Runs the election pass of spec §4.3 steps 3-4 over a snapshot of
/// peer statuses (the local tracker's own status must be included).
pub fn elect(local_addr: &str, statuses: &[PeerStatus]) -> ElectionOutcome {
    let leader_count = statuses.iter().filter(|s| s.is_leader).count();
    if leader_count >= 2 {
        return ElectionOutcome::Conflict;
    }
    if leader_count == 1 {
        let leader = statuses.iter().find(|s| s.is_leader).unwrap();
        return if leader.addr == local_addr {
            ElectionOutcome::SelfLeader
        } else {
            ElectionOutcome::AcceptRemote(leader.addr.clone())
        };
    }

    let mut ranked = statuses.to_vec();
    rank_statuses(&mut ranked);
    match ranked.first() {
        Some(top) if top.addr == local_addr => ElectionOutcome::SelfLeader,
        Some(top) => ElectionOutcome::AcceptRemote(top.addr.clone()),
        None => ElectionOutcome::SelfLeader,
    }
}

/// Peer-side acceptance state for the two-phase
/// `NOTIFY_NEXT_LEADER`/`COMMIT_NEXT_LEADER` protocol (spec §4.3 step
/// 5): a commit is only accepted when it names the address most
/// recently notified.
#[derive(Default)]
pub struct LeaderCommit {
    notified: Mutex<Option<String>>,
}

impl LeaderCommit {
    pub fn new() -> LeaderCommit {
        LeaderCommit::default()
    }

    pub fn accept_notify(&self, addr: &str) {
        *self.notified.lock().unwrap() = Some(addr.to_string());
    }

    /// Returns true if `addr` matches the last notified address.
    pub fn accept_commit(&self, addr: &str) -> bool {
        let notified = self.notified.lock().unwrap();
        notified.as_deref() == Some(addr)
    }
}

/// Outbound peer RPCs needed to run a relationship tick. Implemented
/// over the real wire protocol by the protocol dispatcher's client
/// half; mocked in tests.
#[async_trait]
pub trait PeerClient: Send + Sync {
    async fn get_status(&self, peer: &Peer) -> TrackerResult<PeerStatus>;
    async fn notify_next_leader(&self, peer: &Peer, leader_addr: &str) -> TrackerResult<()>;
    async fn commit_next_leader(&self, peer: &Peer, leader_addr: &str) -> TrackerResult<()>;
}

/// Drives one relationship-check tick (spec §4.3).
pub struct LeaderManager {
    process_start: i64,
    last_known_check_time: Mutex<i64>,
}

impl LeaderManager {
    pub fn new(process_start: i64) -> LeaderManager {
        LeaderManager {
            process_start,
            last_known_check_time: Mutex::new(process_start),
        }
    }

    /// Reports this tracker's own status without advancing
    /// `last_known_check_time` (spec §4.3 step 2, queried by a peer's
    /// `TRACKER_GET_STATUS`, as opposed to `run_tick`'s own election pass).
    pub fn status_now(&self, local_addr: &str, peers: &PeerSet, now: i64) -> PeerStatus {
        PeerStatus {
            addr: local_addr.to_string(),
            running_time: running_time(now, self.process_start),
            restart_interval: restart_interval(
                self.process_start,
                *self.last_known_check_time.lock().unwrap(),
            ),
            is_leader: peers.leader().map(|p| p.addr() == local_addr).unwrap_or(false),
        }
    }

    pub async fn run_tick(
        &self,
        local_addr: &str,
        peers: &PeerSet,
        client: &dyn PeerClient,
        now: i64,
    ) -> TrackerResult<ElectionOutcome> {
        let r = running_time(now, self.process_start);
        let restart = restart_interval(
            self.process_start,
            *self.last_known_check_time.lock().unwrap(),
        );
        *self.last_known_check_time.lock().unwrap() = now;

        let mut statuses = vec![PeerStatus {
            addr: local_addr.to_string(),
            running_time: r,
            restart_interval: restart,
            is_leader: peers.leader().map(|p| p.addr() == local_addr).unwrap_or(false),
        }];

        for peer in peers.snapshot() {
            if peer.addr() == local_addr {
                continue;
            }
            match client.get_status(&peer).await {
                Ok(status) => statuses.push(status),
                Err(e) => warn!(peer = %peer.addr(), error = %e, "relationship check failed"),
            }
        }

        let outcome = elect(local_addr, &statuses);

        if outcome == ElectionOutcome::SelfLeader {
            for peer in peers.snapshot() {
                if peer.addr() == local_addr {
                    continue;
                }
                if let Err(e) = client.notify_next_leader(&peer, local_addr).await {
                    warn!(peer = %peer.addr(), error = %e, "notify_next_leader failed");
                }
            }
            for peer in peers.snapshot() {
                if peer.addr() == local_addr {
                    continue;
                }
                if let Err(e) = client.commit_next_leader(&peer, local_addr).await {
                    warn!(peer = %peer.addr(), error = %e, "commit_next_leader failed");
                }
            }
            peers.set_leader(local_addr);
            info!(leader = local_addr, "declared self as tracker leader");
        } else if let ElectionOutcome::AcceptRemote(ref addr) = outcome {
            peers.set_leader(addr);
        }

        Ok(outcome)
    }
}

/// Validates that `storage_replica_chg` is ignored on the leader and
/// applied otherwise (spec §9 open question, preserved verbatim).
pub fn accepts_storage_replica_chg(is_leader: bool) -> bool {
    !is_leader
}

#[derive(Debug)]
pub struct SysFileCatchUpDecision {
    pub needed: bool,
}

/// Decides whether a joining tracker must pull system files from a
/// peer (spec §4.3 "System-file catch-up"): state is empty, or
/// downtime exceeded `2 * TRACKER_SYNC_STATUS_FILE_INTERVAL`.
pub fn needs_sys_file_catch_up(state_is_empty: bool, downtime_secs: i64) -> SysFileCatchUpDecision {
    SysFileCatchUpDecision {
        needed: state_is_empty || downtime_secs > 2 * TRACKER_SYNC_STATUS_FILE_INTERVAL,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_time_truncates_to_interval() {
        assert_eq!(running_time(650, 0), 600);
        assert_eq!(running_time(299, 0), 0);
    }

    #[test]
    fn leader_tie_break_prefers_smaller_restart_interval() {
        // scenario 3 from spec §8
        let statuses = vec![
            PeerStatus {
                addr: "t1".to_string(),
                running_time: 600,
                restart_interval: 0,
                is_leader: false,
            },
            PeerStatus {
                addr: "t2".to_string(),
                running_time: 600,
                restart_interval: 300,
                is_leader: false,
            },
        ];
        assert_eq!(elect("t1", &statuses), ElectionOutcome::SelfLeader);
        assert_eq!(
            elect("t2", &statuses),
            ElectionOutcome::AcceptRemote("t1".to_string())
        );
    }

    #[test]
    fn two_declared_leaders_is_a_conflict() {
        let statuses = vec![
            PeerStatus {
                addr: "t1".to_string(),
                running_time: 600,
                restart_interval: 0,
                is_leader: true,
            },
            PeerStatus {
                addr: "t2".to_string(),
                running_time: 700,
                restart_interval: 0,
                is_leader: true,
            },
        ];
        assert_eq!(elect("t1", &statuses), ElectionOutcome::Conflict);
    }

    #[test]
    fn accepts_existing_remote_leader() {
        let statuses = vec![
            PeerStatus {
                addr: "t1".to_string(),
                running_time: 600,
                restart_interval: 0,
                is_leader: false,
            },
            PeerStatus {
                addr: "t2".to_string(),
                running_time: 100,
                restart_interval: 0,
                is_leader: true,
            },
        ];
        assert_eq!(
            elect("t1", &statuses),
            ElectionOutcome::AcceptRemote("t2".to_string())
        );
    }

    #[test]
    fn commit_requires_matching_notify() {
        let commit = LeaderCommit::new();
        assert!(!commit.accept_commit("t1"));
        commit.accept_notify("t1");
        assert!(commit.accept_commit("t1"));
        assert!(!commit.accept_commit("t2"));
    }

    #[test]
    fn sys_file_catch_up_triggers_on_empty_state_or_long_downtime() {
        assert!(needs_sys_file_catch_up(true, 0).needed);
        assert!(needs_sys_file_catch_up(false, 601).needed);
        assert!(!needs_sys_file_catch_up(false, 100).needed);
    }

    #[test]
    fn storage_replica_chg_is_noop_on_leader() {
        assert!(!accepts_storage_replica_chg(true));
        assert!(accepts_storage_replica_chg(false));
    }

    #[test]
    fn status_now_reports_running_time_without_mutating_check_time() {
        use crate::peers::PeerSet;

        let manager = LeaderManager::new(0);
        let peers = PeerSet::new();
        let status = manager.status_now("t1:23000", &peers, 650);
        assert_eq!(status.running_time, 600);
        assert!(!status.is_leader);

        // a second call with the same `now` reports the same restart
        // interval; only `run_tick` advances `last_known_check_time`.
        let status2 = manager.status_now("t1:23000", &peers, 650);
        assert_eq!(status.restart_interval, status2.restart_interval);
    }
}
