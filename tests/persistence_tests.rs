use dfs_tracker::persistence::{ChangeLog, Snapshots};
use dfs_tracker::state::storage::StorageStatus;
use dfs_tracker::state::ClusterState;
use std::net::IpAddr;

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

#[test]
fn groups_and_storages_survive_a_save_and_reload_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let state = ClusterState::new();
    state.add_group("group1").unwrap();
    state.add_storage("group1", "1", ip("10.0.0.1"), 0).unwrap();
    state.add_storage("group1", "2", ip("10.0.0.2"), 0).unwrap();
    state.activate_storage("group1", "1").unwrap();

    let snapshots = Snapshots::new(dir.path().to_path_buf());
    snapshots.save_groups(&state).unwrap();
    snapshots.save_storages(&state).unwrap();
    snapshots.save_sync_timestamps(&state).unwrap();

    let reloaded = ClusterState::new();
    snapshots.load_all(&reloaded).unwrap();

    let names = reloaded.group_names();
    assert_eq!(names, vec!["group1".to_string()]);
    assert_eq!(reloaded.with_group("group1", |g| g.count()), Some(2));

    let status = reloaded
        .with_group("group1", |g| g.find_index_by_id("1").map(|i| g.storages[i].status))
        .flatten();
    assert_eq!(status, Some(StorageStatus::Active));
}

#[test]
fn reload_on_an_empty_directory_leaves_state_empty() {
    let dir = tempfile::tempdir().unwrap();
    let state = ClusterState::new();
    let snapshots = Snapshots::new(dir.path().to_path_buf());
    snapshots.load_all(&state).unwrap();
    assert!(state.group_names().is_empty());
}

#[test]
fn change_log_survives_a_reopen_with_its_size_intact() {
    use dfs_tracker::state::ChangeLogAppender;

    let dir = tempfile::tempdir().unwrap();
    {
        let log = ChangeLog::open(dir.path()).unwrap();
        log.append(0, "group1", "1", StorageStatus::Online, "").unwrap();
        log.append(1, "group1", "2", StorageStatus::Offline, "").unwrap();
        assert!(log.size() > 0);
    }

    let reopened = ChangeLog::open(dir.path()).unwrap();
    assert!(reopened.size() > 0);

    let contents = std::fs::read_to_string(reopened.path()).unwrap();
    assert_eq!(contents.lines().count(), 2);
}
