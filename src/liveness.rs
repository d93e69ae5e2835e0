//! Liveness supervisor (C6): heartbeat-timeout demotion and trunk
//! server re-election, run as a periodic background pass (spec §4.4).

use crate::state::storage::StorageRef;

/// `FDFS_MAX_SERVERS_EACH_GROUP` (spec §4.4): at most this many
/// storages are demoted per group on a single supervisor tick.
pub const FDFS_MAX_SERVERS_EACH_GROUP: usize = 32;

/// A storage whose heartbeat is stale enough to demote.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatSnapshot {
    pub storage_ref: StorageRef,
    pub last_heartbeat: i64,
}

/// First liveness pass (spec §4.4 step 1): picks which storages to
/// demote to `offline`, capped at [`FDFS_MAX_SERVERS_EACH_GROUP`] per
/// group per tick.
pub fn storages_to_demote(
    snapshots: &[HeartbeatSnapshot],
    now: i64,
    check_active_interval: i64,
) -> Vec<StorageRef> {
    let mut by_group: std::collections::HashMap<usize, usize> = std::collections::HashMap::new();
    let mut out = Vec::new();
    for s in snapshots {
        if now - s.last_heartbeat <= check_active_interval {
            continue;
        }
        let count = by_group.entry(s.storage_ref.group_idx).or_insert(0);
        if *count >= FDFS_MAX_SERVERS_EACH_GROUP {
            continue;
        }
        *count += 1;
        out.push(s.storage_ref);
    }
    out
}

/// Whether a group's trunk server has gone silent long enough to be
/// re-elected (spec §4.4 step 2). The adaptive threshold widens the
/// longer the current trunk server has been up, so a server that just
/// took over trunk duty isn't punished for a cold start.
pub fn trunk_server_is_stale(
    now: i64,
    trunk_server_up_time: i64,
    trunk_server_last_heartbeat: i64,
    check_active_interval: i64,
    trunk_init_check_occupying: bool,
    trunk_init_reload_from_binlog: bool,
) -> bool {
    let multiplier = if now - trunk_server_up_time < check_active_interval {
        if trunk_init_check_occupying || trunk_init_reload_from_binlog {
            5
        } else {
            3
        }
    } else {
        2
    };
    now - trunk_server_last_heartbeat > multiplier * check_active_interval
}

/// A candidate's reported trunk-binlog size, for the re-election
/// comparison (spec §4.4 "Trunk election").
#[derive(Debug, Clone, Copy)]
pub struct TrunkCandidate {
    pub storage_idx: usize,
    pub binlog_size: u64,
}

/// Picks the new trunk server: largest binlog size, ties broken by the
/// group's current `storeServer`.
pub fn elect_trunk_server(
    candidates: &[TrunkCandidate],
    store_server_idx: Option<usize>,
) -> Option<usize> {
    candidates
        .iter()
        .max_by(|a, b| {
            a.binlog_size.cmp(&b.binlog_size).then_with(|| {
                let a_is_store = store_server_idx == Some(a.storage_idx);
                let b_is_store = store_server_idx == Some(b.storage_idx);
                a_is_store.cmp(&b_is_store)
            })
        })
        .map(|c| c.storage_idx)
        .or(store_server_idx)
}
