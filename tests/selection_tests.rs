use dfs_tracker::config::{ReservedSpace, StoreLookupPolicy, StoreServerPolicy};
use dfs_tracker::selection::{select_upload_group, select_upload_storage, GroupSummary, StorageSummary};

fn group(name: &str, active: usize, free: u64, total: u64) -> GroupSummary {
    GroupSummary {
        name: name.to_string(),
        active_count: active,
        free_mb: free,
        total_mb: total,
        trunk_free_mb: 0,
    }
}

#[test]
fn round_robin_cursor_advances_across_repeated_calls() {
    let groups = vec![
        group("A", 1, 5000, 10000),
        group("B", 1, 5000, 10000),
        group("C", 1, 5000, 10000),
    ];
    let mut cursor = 0;
    let mut picks = Vec::new();
    for _ in 0..4 {
        let picked = select_upload_group(
            StoreLookupPolicy::RoundRobin,
            &groups,
            &mut cursor,
            None,
            ReservedSpace::AbsoluteMb(0),
            false,
        )
        .unwrap();
        picks.push(picked);
    }
    assert_eq!(picks, vec!["A", "B", "C", "A"]);
}

#[test]
fn spec_group_policy_is_pinned_regardless_of_free_space_elsewhere() {
    let groups = vec![group("A", 1, 9000, 10000), group("B", 1, 100, 10000)];
    let mut cursor = 0;
    let picked = select_upload_group(
        StoreLookupPolicy::SpecGroup,
        &groups,
        &mut cursor,
        Some("B"),
        ReservedSpace::AbsoluteMb(0),
        false,
    )
    .unwrap();
    assert_eq!(picked, "B");
}

#[test]
fn upload_storage_round_robin_wraps_around_active_set() {
    let active = vec![
        StorageSummary {
            id: "1".to_string(),
            upload_priority: 0,
        },
        StorageSummary {
            id: "2".to_string(),
            upload_priority: 0,
        },
    ];
    let mut cursor = 0;
    let first = select_upload_storage(StoreServerPolicy::RoundRobin, &active, &mut cursor).unwrap();
    let second = select_upload_storage(StoreServerPolicy::RoundRobin, &active, &mut cursor).unwrap();
    let third = select_upload_storage(StoreServerPolicy::RoundRobin, &active, &mut cursor).unwrap();
    assert_eq!([first, second, third], ["1".to_string(), "2".to_string(), "1".to_string()]);
}

#[test]
fn empty_group_list_is_not_found_not_no_space() {
    let groups: Vec<GroupSummary> = Vec::new();
    let mut cursor = 0;
    let err = select_upload_group(
        StoreLookupPolicy::RoundRobin,
        &groups,
        &mut cursor,
        None,
        ReservedSpace::AbsoluteMb(0),
        false,
    )
    .unwrap_err();
    assert!(matches!(err, dfs_tracker::TrackerError::NotFound(_)));
}
