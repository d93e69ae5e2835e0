//! Group records (spec §3) — a logical shard and the storages in it.

use super::storage::{Storage, StorageStatus};
use std::cmp::Ordering;
use std::collections::HashMap;

/// Orders two storage ids the way `sortedByIdStorages` expects (spec
/// §3: "always sorted by id"). Storage ids are decimal when
/// identity-mode is on and IP-address strings otherwise (spec §4.2
/// `addStorage`: "otherwise id equals ip"); comparing numerically when
/// both sides parse as one keeps multi-digit decimal ids in the right
/// order, falling back to a plain string compare for IP-string ids.
pub(crate) fn compare_ids(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(na), Ok(nb)) => na.cmp(&nb),
        _ => a.cmp(b),
    }
}

/// Validates a group name against `[A-Za-z0-9_-]{1..16}` (spec §4.2).
pub fn is_valid_group_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 16
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// A storage group: all storages in it hold the same files.
#[derive(Debug, Clone)]
pub struct Group {
    pub name: String,
    pub storage_port: u16,
    pub storage_http_port: u16,
    pub store_path_count: u32,
    pub subdir_count_per_path: u32,
    pub current_trunk_file_id: u64,
    pub total_mb: u64,
    pub free_mb: u64,
    pub trunk_free_mb: u64,
    /// `storages` is the arena; `sorted_by_id`/`active_storages` hold
    /// indices into it (spec §9 arena+index design note).
    pub storages: Vec<Storage>,
    pub sorted_by_id: Vec<usize>,
    pub active_storages: Vec<usize>,
    pub store_server: Option<usize>,
    pub trunk_server: Option<usize>,
    pub last_trunk_server_id: Option<String>,
    pub current_write_server: usize,
    pub current_read_server: usize,
    pub current_write_group_cursor: usize,
    pub change_count: u64,
    pub trunk_change_count: u64,
    /// keyed by (src id, dest id).
    pub pairwise_last_sync_ts: HashMap<(String, String), i64>,
}

impl Group {
    pub fn new(name: impl Into<String>) -> Group {
        Group {
            name: name.into(),
            storage_port: 0,
            storage_http_port: 0,
            store_path_count: 0,
            subdir_count_per_path: 0,
            current_trunk_file_id: 0,
            total_mb: 0,
            free_mb: 0,
            trunk_free_mb: 0,
            storages: Vec::new(),
            sorted_by_id: Vec::new(),
            active_storages: Vec::new(),
            store_server: None,
            trunk_server: None,
            last_trunk_server_id: None,
            current_write_server: 0,
            current_read_server: 0,
            current_write_group_cursor: 0,
            change_count: 0,
            trunk_change_count: 0,
            pairwise_last_sync_ts: HashMap::new(),
        }
    }

    /// `count`, kept as a method rather than a stored field so it can
    /// never drift from `storages.len()` (spec invariant: `count` ≡
    /// `len(storages)`).
    pub fn count(&self) -> usize {
        self.storages.len()
    }

    pub fn active_count(&self) -> usize {
        self.active_storages.len()
    }

    pub fn find_index_by_id(&self, id: &str) -> Option<usize> {
        self.sorted_by_id
            .binary_search_by(|&idx| compare_ids(&self.storages[idx].id, id))
            .ok()
            .map(|pos| self.sorted_by_id[pos])
    }

    /// Inserts a storage in id order, keeping `sorted_by_id` sorted.
    pub fn insert_storage(&mut self, storage: Storage) -> usize {
        let idx = self.storages.len();
        let id = storage.id.clone();
        self.storages.push(storage);
        let pos = self
            .sorted_by_id
            .binary_search_by(|&i| compare_ids(&self.storages[i].id, &id))
            .unwrap_or_else(|p| p);
        self.sorted_by_id.insert(pos, idx);
        idx
    }

    pub fn activate(&mut self, idx: usize) -> bool {
        if !self.storages[idx].is_activatable() {
            return false;
        }
        self.storages[idx].status = StorageStatus::Active;
        let id = self.storages[idx].id.clone();
        let pos = self
            .active_storages
            .binary_search_by(|&i| compare_ids(&self.storages[i].id, &id))
            .unwrap_or_else(|p| p);
        if !self.active_storages.contains(&idx) {
            self.active_storages.insert(pos, idx);
        }
        self.change_count += 1;
        self.recompute_store_server();
        true
    }

    pub fn deactivate(&mut self, idx: usize) {
        self.active_storages.retain(|&i| i != idx);
        self.recompute_store_server();
    }

    fn recompute_store_server(&mut self) {
        // store_server defaults to the first active storage; a richer
        // policy (first-by-pri/round-robin) is applied by the selection
        // engine, which overwrites this pointer through `set_store_server`.
        self.store_server = self.active_storages.first().copied();
    }

    pub fn set_store_server(&mut self, idx: Option<usize>) {
        self.store_server = idx;
    }

    /// Recomputes `free_mb` as the minimum free space over active
    /// storages (spec §3 invariant).
    pub fn recompute_free_mb(&mut self) {
        self.free_mb = self
            .active_storages
            .iter()
            .map(|&i| self.storages[i].free_mb)
            .min()
            .unwrap_or(0);
    }
}
