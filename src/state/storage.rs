//! Storage records held inside a [`super::group::Group`] (spec §3).

use std::net::IpAddr;

/// Status of a storage server, numbered so that a peer-reported value
/// can be compared against the local one (spec §4.2 status merge rule).
/// Values mirror the on-wire status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum StorageStatus {
    Init = 0,
    WaitSync = 1,
    Syncing = 2,
    IpChanged = 3,
    Deleted = 4,
    Offline = 5,
    Online = 6,
    Active = 7,
    Recovery = 9,
    None = 99,
}

impl StorageStatus {
    pub fn from_u8(v: u8) -> Option<StorageStatus> {
        match v {
            0 => Some(StorageStatus::Init),
            1 => Some(StorageStatus::WaitSync),
            2 => Some(StorageStatus::Syncing),
            3 => Some(StorageStatus::IpChanged),
            4 => Some(StorageStatus::Deleted),
            5 => Some(StorageStatus::Offline),
            6 => Some(StorageStatus::Online),
            7 => Some(StorageStatus::Active),
            9 => Some(StorageStatus::Recovery),
            99 => Some(StorageStatus::None),
            _ => None,
        }
    }
}

/// Reference into another storage within the same group's arena
/// (spec §9 "cyclic references" design note).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageRef {
    pub group_idx: usize,
    pub storage_idx: usize,
}

/// Per-storage counters reported on each heartbeat. Mirrors the
/// `stat{40+ counters}` field of spec §3; grouped by operation kind.
#[derive(Debug, Clone, Default)]
pub struct StorageStats {
    pub total_upload_count: u64,
    pub success_upload_count: u64,
    pub total_append_count: u64,
    pub success_append_count: u64,
    pub total_modify_count: u64,
    pub success_modify_count: u64,
    pub total_truncate_count: u64,
    pub success_truncate_count: u64,
    pub total_set_meta_count: u64,
    pub success_set_meta_count: u64,
    pub total_delete_count: u64,
    pub success_delete_count: u64,
    pub total_download_count: u64,
    pub success_download_count: u64,
    pub total_get_meta_count: u64,
    pub success_get_meta_count: u64,
    pub total_create_link_count: u64,
    pub success_create_link_count: u64,
    pub total_delete_link_count: u64,
    pub success_delete_link_count: u64,
    pub total_upload_bytes: u64,
    pub success_upload_bytes: u64,
    pub total_append_bytes: u64,
    pub success_append_bytes: u64,
    pub total_modify_bytes: u64,
    pub success_modify_bytes: u64,
    pub total_download_bytes: u64,
    pub success_download_bytes: u64,
    pub total_sync_in_bytes: u64,
    pub success_sync_in_bytes: u64,
    pub total_sync_out_bytes: u64,
    pub success_sync_out_bytes: u64,
    pub total_file_open_count: u64,
    pub success_file_open_count: u64,
    pub total_file_read_count: u64,
    pub success_file_read_count: u64,
    pub total_file_write_count: u64,
    pub success_file_write_count: u64,
    pub last_source_update: i64,
    pub last_sync_update: i64,
}

/// A storage server within a group (spec §3).
#[derive(Debug, Clone)]
pub struct Storage {
    pub id: String,
    pub ip_addrs: Vec<IpAddr>,
    pub version: String,
    pub domain_name: String,
    pub status: StorageStatus,
    pub sync_src: Option<StorageRef>,
    pub sync_until_ts: i64,
    pub join_time: i64,
    pub up_time: i64,
    pub total_mb: u64,
    pub free_mb: u64,
    pub path_total_mb: Vec<u64>,
    pub path_free_mb: Vec<u64>,
    pub current_write_path: usize,
    pub storage_port: u16,
    pub storage_http_port: u16,
    pub store_path_count: u32,
    pub subdir_count_per_path: u32,
    pub upload_priority: i32,
    pub changelog_offset: u64,
    pub stat: StorageStats,
    pub last_heartbeat: i64,
    pub change_count: u64,
    pub trunk_change_count: u64,
}

impl Storage {
    pub fn new(id: impl Into<String>, ip: IpAddr, now: i64) -> Storage {
        Storage {
            id: id.into(),
            ip_addrs: vec![ip],
            version: String::new(),
            domain_name: String::new(),
            status: StorageStatus::Init,
            sync_src: None,
            sync_until_ts: 0,
            join_time: now,
            up_time: now,
            total_mb: 0,
            free_mb: 0,
            path_total_mb: Vec::new(),
            path_free_mb: Vec::new(),
            current_write_path: 0,
            storage_port: 0,
            storage_http_port: 0,
            store_path_count: 0,
            subdir_count_per_path: 0,
            upload_priority: 0,
            changelog_offset: 0,
            stat: StorageStats::default(),
            last_heartbeat: now,
            change_count: 0,
            trunk_change_count: 0,
        }
    }

    /// spec §4.2 activatability rule.
    pub fn is_activatable(&self) -> bool {
        !matches!(
            self.status,
            StorageStatus::WaitSync
                | StorageStatus::Syncing
                | StorageStatus::IpChanged
                | StorageStatus::Init
        )
    }
}

/// spec §4.2 status merge rule applied to a peer-reported brief.
pub fn merge_status(local: StorageStatus, incoming: StorageStatus) -> StorageStatus {
    if incoming == local {
        return local;
    }
    if matches!(
        local,
        StorageStatus::Init | StorageStatus::Online | StorageStatus::Active | StorageStatus::Recovery
    ) {
        return local;
    }
    if matches!(incoming, StorageStatus::Deleted | StorageStatus::IpChanged) {
        return incoming;
    }
    if matches!(incoming, StorageStatus::Online | StorageStatus::Active) {
        // active/online coming over the wire never override
        return local;
    }
    if (incoming as u8) > (local as u8) {
        return incoming;
    }
    local
}
