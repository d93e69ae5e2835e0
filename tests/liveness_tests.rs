use dfs_tracker::liveness::{
    elect_trunk_server, storages_to_demote, trunk_server_is_stale, HeartbeatSnapshot, TrunkCandidate,
    FDFS_MAX_SERVERS_EACH_GROUP,
};
use dfs_tracker::state::storage::StorageRef;

fn sref(group_idx: usize, storage_idx: usize) -> StorageRef {
    StorageRef { group_idx, storage_idx }
}

#[test]
fn demotion_cap_applies_independently_per_group() {
    let mut snapshots = Vec::new();
    for i in 0..40 {
        snapshots.push(HeartbeatSnapshot {
            storage_ref: sref(0, i),
            last_heartbeat: 0,
        });
    }
    for i in 0..5 {
        snapshots.push(HeartbeatSnapshot {
            storage_ref: sref(1, i),
            last_heartbeat: 0,
        });
    }

    let demoted = storages_to_demote(&snapshots, 1000, 120);
    let group0 = demoted.iter().filter(|r| r.group_idx == 0).count();
    let group1 = demoted.iter().filter(|r| r.group_idx == 1).count();
    assert_eq!(group0, FDFS_MAX_SERVERS_EACH_GROUP);
    assert_eq!(group1, 5);
}

#[test]
fn trunk_server_reelection_prefers_biggest_binlog_over_the_incumbent() {
    let candidates = vec![
        TrunkCandidate {
            storage_idx: 1,
            binlog_size: 5_000,
        },
        TrunkCandidate {
            storage_idx: 2,
            binlog_size: 9_000,
        },
    ];
    assert_eq!(elect_trunk_server(&candidates, Some(1)), Some(2));
}

#[test]
fn a_trunk_server_that_just_restarted_gets_a_wider_grace_window() {
    // up 10s ago, heartbeat 10s ago, 120s interval: well within any multiplier.
    assert!(!trunk_server_is_stale(10, 0, 10, 120, false, false));
    // still within the up_time<interval window (110s < 120s): 3x grace (360s)
    // covers a 60s-stale heartbeat.
    assert!(!trunk_server_is_stale(410, 300, 350, 120, false, false));
    // past the up_time<interval window: only the 2x multiplier (240s) applies.
    assert!(trunk_server_is_stale(620, 0, 10, 120, true, false));
}
