use dfs_tracker::state::storage::StorageStatus;
use dfs_tracker::state::{ClusterState, PathUsage, StorageBrief};
use dfs_tracker::TrackerError;
use std::net::IpAddr;

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

#[test]
fn full_storage_lifecycle_join_activate_heartbeat_delete() {
    let state = ClusterState::new();
    state.add_group("group1").unwrap();
    state.add_storage("group1", "1", ip("10.0.0.1"), 0).unwrap();

    assert!(state.activate_storage("group1", "1").unwrap());
    assert!(state.record_heartbeat("group1", "1", 10).is_ok());

    state
        .record_disk_usage(
            "group1",
            "1",
            &[PathUsage {
                total_mb: 2000,
                free_mb: 800,
            }],
        )
        .unwrap();
    let free = state.with_group("group1", |g| g.free_mb).unwrap();
    assert_eq!(free, 800);

    // in-use storage cannot be deleted until demoted
    assert!(matches!(
        state.delete_storage("group1", "1"),
        Err(TrackerError::Busy(_))
    ));
    state.offline_storage("group1", "1").unwrap();
    state.delete_storage("group1", "1").unwrap();

    let status = state.with_group("group1", |g| g.storages[0].status).unwrap();
    assert_eq!(status, StorageStatus::Deleted);
}

#[test]
fn ip_change_replaces_storage_and_leaves_a_tombstone() {
    let state = ClusterState::new();
    state.add_group("group1").unwrap();
    state.add_storage("group1", "1", ip("10.0.0.1"), 0).unwrap();

    state
        .storage_ip_changed("group1", &ip("10.0.0.1"), ip("10.0.0.9"), 5)
        .unwrap();

    let (count, statuses) = state
        .with_group("group1", |g| {
            (
                g.count(),
                g.storages.iter().map(|s| s.status).collect::<Vec<_>>(),
            )
        })
        .unwrap();
    assert_eq!(count, 2);
    assert!(statuses.contains(&StorageStatus::IpChanged));
}

#[test]
fn synced_brief_never_downgrades_an_already_active_local_storage() {
    let state = ClusterState::new();
    state.add_group("group1").unwrap();
    state.add_storage("group1", "1", ip("10.0.0.1"), 0).unwrap();
    state.activate_storage("group1", "1").unwrap();

    state
        .sync_storage_briefs(
            "group1",
            &[StorageBrief {
                id: "1".to_string(),
                status: StorageStatus::Offline,
                ip: ip("10.0.0.1"),
                port: 23000,
            }],
            0,
        )
        .unwrap();

    let status = state.with_group("group1", |g| g.storages[0].status).unwrap();
    assert_eq!(status, StorageStatus::Active);
}

#[test]
fn group_with_no_storages_can_be_deleted() {
    let state = ClusterState::new();
    state.add_group("empty").unwrap();
    state.delete_group("empty").unwrap();
    assert!(state.group_names().is_empty());
}
