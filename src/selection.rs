//! Selection engine (C5): pure functions implementing the upload
//! group/storage/path and download-server policies (spec §4.5). Every
//! function here takes a read-only snapshot taken under `stateLock`
//! and returns a decision without mutating anything itself; callers
//! apply the resulting cursor advances back through [`crate::state`].

use crate::config::{DownloadServerPolicy, ReservedSpace, StorePathPolicy, StoreLookupPolicy, StoreServerPolicy};
use crate::error::{TrackerError, TrackerResult};
use crate::state::group::Group;
use crate::state::storage::Storage;

/// A read-only summary of one group, enough to run the upload-group
/// policies without borrowing the whole store.
#[derive(Debug, Clone)]
pub struct GroupSummary {
    pub name: String,
    pub active_count: usize,
    pub free_mb: u64,
    pub total_mb: u64,
    pub trunk_free_mb: u64,
}

impl From<&Group> for GroupSummary {
    fn from(g: &Group) -> Self {
        GroupSummary {
            name: g.name.clone(),
            active_count: g.active_count(),
            free_mb: g.free_mb,
            total_mb: g.total_mb,
            trunk_free_mb: g.trunk_free_mb,
        }
    }
}

fn passes_reserved_space(g: &GroupSummary, reserved: ReservedSpace, with_trunk: bool) -> bool {
    let free = if with_trunk {
        g.free_mb + g.trunk_free_mb
    } else {
        g.free_mb
    };
    g.active_count > 0 && !reserved.exhausted(free, g.total_mb)
}

/// Upload group selection (spec §4.5).
pub fn select_upload_group(
    policy: StoreLookupPolicy,
    groups: &[GroupSummary],
    cursor: &mut usize,
    spec_group: Option<&str>,
    reserved: ReservedSpace,
    trunk_enabled: bool,
) -> TrackerResult<String> {
    if groups.is_empty() {
        return Err(TrackerError::NotFound("no groups available".to_string()));
    }

    match policy {
        StoreLookupPolicy::SpecGroup => {
            let name = spec_group
                .ok_or_else(|| TrackerError::Configuration {
                    field: "store_group".to_string(),
                    message: "spec-group policy requires a configured group".to_string(),
                })?;
            let g = groups
                .iter()
                .find(|g| g.name == name)
                .ok_or_else(|| TrackerError::NotFound(format!("group {} not found", name)))?;
            if g.active_count == 0 {
                return Err(TrackerError::NotFound(format!("group {} has no active storages", name)));
            }
            Ok(g.name.clone())
        }

        StoreLookupPolicy::RoundRobin => {
            let n = groups.len();
            for attempt in 0..n {
                let idx = (*cursor + attempt) % n;
                let g = &groups[idx];
                if passes_reserved_space(g, reserved, false) {
                    *cursor = (idx + 1) % n;
                    return Ok(g.name.clone());
                }
            }
            if trunk_enabled {
                for attempt in 0..n {
                    let idx = (*cursor + attempt) % n;
                    let g = &groups[idx];
                    if passes_reserved_space(g, reserved, true) {
                        *cursor = (idx + 1) % n;
                        return Ok(g.name.clone());
                    }
                }
            }
            Err(TrackerError::NoSpace("no group has free reserved space".to_string()))
        }

        StoreLookupPolicy::LoadBalance => {
            let best = groups
                .iter()
                .filter(|g| g.active_count > 0)
                .max_by_key(|g| g.free_mb);
            if let Some(g) = best {
                if passes_reserved_space(g, reserved, false) {
                    return Ok(g.name.clone());
                }
                if trunk_enabled && passes_reserved_space(g, reserved, true) {
                    return Ok(g.name.clone());
                }
            }
            Err(TrackerError::NoSpace("no group has free reserved space".to_string()))
        }
    }
}

/// A read-only summary of one active storage, for the upload-storage
/// and upload-path policies.
#[derive(Debug, Clone)]
pub struct StorageSummary {
    pub id: String,
    pub upload_priority: i32,
}

impl From<&Storage> for StorageSummary {
    fn from(s: &Storage) -> Self {
        StorageSummary {
            id: s.id.clone(),
            upload_priority: s.upload_priority,
        }
    }
}

/// Upload storage selection within a group (spec §4.5).
pub fn select_upload_storage(
    policy: StoreServerPolicy,
    active: &[StorageSummary],
    cursor: &mut usize,
) -> TrackerResult<String> {
    if active.is_empty() {
        return Err(TrackerError::NotFound("no active storages in group".to_string()));
    }
    match policy {
        StoreServerPolicy::FirstByIp => Ok(active[0].id.clone()),
        StoreServerPolicy::FirstByPri => Ok(active
            .iter()
            .min_by_key(|s| s.upload_priority)
            .unwrap()
            .id
            .clone()),
        StoreServerPolicy::RoundRobin => {
            let idx = *cursor % active.len();
            *cursor = (idx + 1) % active.len();
            Ok(active[idx].id.clone())
        }
    }
}

/// Upload path selection within a storage (spec §4.5).
pub fn select_upload_path(
    policy: StorePathPolicy,
    path_free_mb: &[u64],
    path_total_mb: &[u64],
    cursor: &mut usize,
    reserved_per_path: ReservedSpace,
    trunk_free_mb: u64,
    trunk_enabled: bool,
) -> TrackerResult<usize> {
    if path_free_mb.is_empty() {
        return Err(TrackerError::NotFound("storage has no paths".to_string()));
    }
    match policy {
        StorePathPolicy::LoadBalance => path_free_mb
            .iter()
            .enumerate()
            .max_by_key(|(_, &free)| free)
            .map(|(i, _)| i)
            .ok_or_else(|| TrackerError::NoSpace("no path has free space".to_string())),
        StorePathPolicy::RoundRobin => {
            let n = path_free_mb.len();
            for attempt in 0..n {
                let idx = (*cursor + attempt) % n;
                if !reserved_per_path.exhausted(path_free_mb[idx], path_total_mb[idx]) {
                    *cursor = (idx + 1) % n;
                    return Ok(idx);
                }
            }
            if trunk_enabled {
                for attempt in 0..n {
                    let idx = (*cursor + attempt) % n;
                    if !reserved_per_path.exhausted(path_free_mb[idx] + trunk_free_mb, path_total_mb[idx]) {
                        *cursor = (idx + 1) % n;
                        return Ok(idx);
                    }
                }
            }
            Err(TrackerError::NoSpace("no path has free reserved space".to_string()))
        }
    }
}

/// Decoded routing hints carried in a long download filename (spec
/// §4.5 "the filename... encodes the source storage's id/IP and
/// upload timestamp").
#[derive(Debug, Clone, Copy)]
pub struct FilenameSource {
    pub storage_id: u32,
    pub upload_timestamp: i64,
}

/// Whether `server` is known to have synced past `file_timestamp`
/// within the configured freshness window.
pub fn is_fresh_enough(
    server_last_sync_ts: i64,
    file_timestamp: i64,
    max_delay_secs: i64,
    max_time_secs: i64,
) -> bool {
    if server_last_sync_ts >= file_timestamp {
        return true;
    }
    let delay = file_timestamp - server_last_sync_ts;
    delay <= max_delay_secs || delay <= max_time_secs
}

/// Download server selection (spec §4.5, `FETCH_ONE`).
pub fn select_download_server(
    policy: DownloadServerPolicy,
    source: Option<FilenameSource>,
    source_is_active: bool,
    source_id: &str,
    is_normal_file: bool,
    candidate_fresh: bool,
    fallback_known_fresh_holder: Option<&str>,
    round_robin_pick: &str,
) -> String {
    match policy {
        DownloadServerPolicy::SourceFirst => {
            if source.is_some() && source_is_active {
                source_id.to_string()
            } else {
                round_robin_pick.to_string()
            }
        }
        DownloadServerPolicy::RoundRobin => {
            if is_normal_file && !candidate_fresh {
                if let Some(holder) = fallback_known_fresh_holder {
                    return holder.to_string();
                }
            }
            round_robin_pick.to_string()
        }
    }
}

/// Policy-upgrade rule (spec §4.5): trunk packing requires one
/// designated writer, so round-robin `store_server` is forced to
/// first-by-ip when trunk files are enabled.
pub fn upgrade_store_server_policy(
    use_trunk_file: bool,
    store_server: StoreServerPolicy,
) -> StoreServerPolicy {
    if use_trunk_file && matches!(store_server, StoreServerPolicy::RoundRobin) {
        StoreServerPolicy::FirstByIp
    } else {
        store_server
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(name: &str, active: usize, free: u64, total: u64, trunk_free: u64) -> GroupSummary {
        GroupSummary {
            name: name.to_string(),
            active_count: active,
            free_mb: free,
            total_mb: total,
            trunk_free_mb: trunk_free,
        }
    }

    #[test]
    fn reserved_space_gate_with_trunk_fallback() {
        // scenario 4 from spec §8
        let groups = vec![group("A", 1, 1000, 10000, 5000)];
        let mut cursor = 0;
        let reserved = ReservedSpace::Ratio(0.5);
        let result = select_upload_group(
            StoreLookupPolicy::RoundRobin,
            &groups,
            &mut cursor,
            None,
            reserved,
            false,
        );
        assert!(matches!(result, Err(TrackerError::NoSpace(_))));

        let result = select_upload_group(
            StoreLookupPolicy::RoundRobin,
            &groups,
            &mut cursor,
            None,
            reserved,
            true,
        );
        assert_eq!(result.unwrap(), "A");
    }

    #[test]
    fn round_robin_skips_inactive_groups() {
        let groups = vec![group("A", 0, 0, 0, 0), group("B", 1, 5000, 10000, 0)];
        let mut cursor = 0;
        let result = select_upload_group(
            StoreLookupPolicy::RoundRobin,
            &groups,
            &mut cursor,
            None,
            ReservedSpace::AbsoluteMb(0),
            false,
        )
        .unwrap();
        assert_eq!(result, "B");
    }

    #[test]
    fn load_balance_picks_largest_free() {
        let groups = vec![group("A", 1, 1000, 10000, 0), group("B", 1, 9000, 10000, 0)];
        let mut cursor = 0;
        let result = select_upload_group(
            StoreLookupPolicy::LoadBalance,
            &groups,
            &mut cursor,
            None,
            ReservedSpace::AbsoluteMb(0),
            false,
        )
        .unwrap();
        assert_eq!(result, "B");
    }

    #[test]
    fn spec_group_fails_when_inactive() {
        let groups = vec![group("A", 0, 0, 0, 0)];
        let mut cursor = 0;
        let result = select_upload_group(
            StoreLookupPolicy::SpecGroup,
            &groups,
            &mut cursor,
            Some("A"),
            ReservedSpace::AbsoluteMb(0),
            false,
        );
        assert!(result.is_err());
    }

    #[test]
    fn upload_storage_first_by_pri_picks_minimum() {
        let active = vec![
            StorageSummary {
                id: "1".to_string(),
                upload_priority: 10,
            },
            StorageSummary {
                id: "2".to_string(),
                upload_priority: 1,
            },
        ];
        let mut cursor = 0;
        let chosen = select_upload_storage(StoreServerPolicy::FirstByPri, &active, &mut cursor).unwrap();
        assert_eq!(chosen, "2");
    }

    #[test]
    fn upload_path_round_robin_advances_cursor() {
        let free = vec![1000, 1000];
        let total = vec![10000, 10000];
        let mut cursor = 0;
        let first = select_upload_path(
            StorePathPolicy::RoundRobin,
            &free,
            &total,
            &mut cursor,
            ReservedSpace::AbsoluteMb(0),
            0,
            false,
        )
        .unwrap();
        assert_eq!(first, 0);
        assert_eq!(cursor, 1);
    }

    #[test]
    fn policy_upgrade_forces_first_by_ip_with_trunk_files() {
        assert_eq!(
            upgrade_store_server_policy(true, StoreServerPolicy::RoundRobin),
            StoreServerPolicy::FirstByIp
        );
        assert_eq!(
            upgrade_store_server_policy(false, StoreServerPolicy::RoundRobin),
            StoreServerPolicy::RoundRobin
        );
    }

    #[test]
    fn freshness_check_respects_either_window() {
        assert!(is_fresh_enough(100, 100, 10, 10));
        assert!(is_fresh_enough(90, 100, 10, 20));
        assert!(!is_fresh_enough(50, 100, 10, 10));
    }
}
