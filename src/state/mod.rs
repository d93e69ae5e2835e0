//! Cluster state store (C2): the in-memory catalog of groups and the
//! storages within them, guarded by a single mutex per spec §4.2/§5.
//!
//! Every mutation lives on [`ClusterState`] as a plain, non-blocking
//! method; handlers acquire the lock, call one of these, and release it
//! before doing any I/O, per the "handlers must not suspend while
//! holding `stateLock`" rule.

pub mod group;
pub mod storage;

use crate::error::{TrackerError, TrackerResult};
use group::{is_valid_group_name, Group};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use storage::{merge_status, Storage, StorageStatus};
use tracing::{debug, info, warn};

/// How often (in successful heartbeats/disk-reports/sync-timestamp
/// updates) the cluster state is flushed to disk (spec §4.2).
pub const TRACKER_SYNC_TO_FILE_FREQ: u64 = 1000;

fn wall_clock_now() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// A peer-reported summary of one storage's state, used by
/// [`ClusterState::sync_storage_briefs`] and piggy-backed on heartbeat
/// responses (spec §4.6).
#[derive(Debug, Clone)]
pub struct StorageBrief {
    pub id: String,
    pub status: StorageStatus,
    pub ip: IpAddr,
    pub port: u16,
}

/// Per-path disk usage reported by a storage (spec §4.2
/// `recordDiskUsage`).
#[derive(Debug, Clone, Copy)]
pub struct PathUsage {
    pub total_mb: u64,
    pub free_mb: u64,
}

/// Sink for change-log records; implemented by the persistence layer
/// (C8) and injected here so the state store stays I/O-free.
pub trait ChangeLogAppender: Send + Sync {
    fn append(
        &self,
        unix_ts: i64,
        group: &str,
        storage_id: &str,
        status: StorageStatus,
        arg: &str,
    ) -> TrackerResult<()>;
}

struct ClusterStateInner {
    groups: HashMap<String, Group>,
    heartbeat_count: u64,
    disk_report_count: u64,
    sync_ts_count: u64,
}

/// The cluster's entire mutable catalog, behind one mutex.
pub struct ClusterState {
    inner: Mutex<ClusterStateInner>,
    change_log: Option<Arc<dyn ChangeLogAppender>>,
}

impl Default for ClusterState {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterState {
    pub fn new() -> ClusterState {
        ClusterState {
            inner: Mutex::new(ClusterStateInner {
                groups: HashMap::new(),
                heartbeat_count: 0,
                disk_report_count: 0,
                sync_ts_count: 0,
            }),
            change_log: None,
        }
    }

    /// Attaches the change-log sink that mutating operations append to
    /// (spec §3 "Change-log record"). Not set by [`ClusterState::new`]
    /// so unit tests that don't care about the change-log can skip it.
    pub fn with_change_log(mut self, change_log: Arc<dyn ChangeLogAppender>) -> ClusterState {
        self.change_log = Some(change_log);
        self
    }

    fn log_change(&self, group: &str, id: &str, status: StorageStatus, arg: &str) {
        if let Some(log) = &self.change_log {
            if let Err(e) = log.append(wall_clock_now(), group, id, status, arg) {
                warn!(group, id, error = %e, "failed to append change-log record");
            }
        }
    }

    /// Runs `f` with a read/write view of a single group. Used by the
    /// selection engine and protocol handlers that need to read more
    /// than one field under a single lock acquisition.
    pub fn with_group<R>(&self, name: &str, f: impl FnOnce(&Group) -> R) -> Option<R> {
        let inner = self.inner.lock();
        inner.groups.get(name).map(f)
    }

    pub fn group_names(&self) -> Vec<String> {
        self.inner.lock().groups.keys().cloned().collect()
    }

    /// Inserts a fully-formed [`Group`] directly, overwriting any
    /// existing entry of the same name. Used only by the startup load
    /// path (C8), which reconstructs groups from the on-disk snapshot
    /// outside the normal `addGroup`/`addStorage` handler contract.
    pub fn restore_group(&self, group: Group) {
        let mut inner = self.inner.lock();
        inner.groups.insert(group.name.clone(), group);
    }

    pub fn add_group(&self, name: &str) -> TrackerResult<()> {
        if !is_valid_group_name(name) {
            return Err(TrackerError::InvalidArgument(format!(
                "invalid group name: {}",
                name
            )));
        }
        let mut inner = self.inner.lock();
        if !inner.groups.contains_key(name) {
            inner.groups.insert(name.to_string(), Group::new(name));
            info!(group = name, "group created");
        }
        Ok(())
    }

    pub fn delete_group(&self, name: &str) -> TrackerResult<()> {
        let mut inner = self.inner.lock();
        let group = inner
            .groups
            .get(name)
            .ok_or_else(|| TrackerError::NotFound(format!("group {} not found", name)))?;
        if group.count() != 0 {
            return Err(TrackerError::Busy(format!(
                "group {} still has {} storages",
                name,
                group.count()
            )));
        }
        inner.groups.remove(name);
        info!(group = name, "group deleted");
        Ok(())
    }

    /// `addStorage` (spec §4.2). `id` is the resolved storage id (equal
    /// to `observed_ip` when identity-mode is off).
    pub fn add_storage(
        &self,
        group: &str,
        id: &str,
        observed_ip: IpAddr,
        now: i64,
    ) -> TrackerResult<()> {
        let mut inner = self.inner.lock();
        let g = inner
            .groups
            .get_mut(group)
            .ok_or_else(|| TrackerError::NotFound(format!("group {} not found", group)))?;

        if let Some(idx) = g.find_index_by_id(id) {
            let s = &mut g.storages[idx];
            if s.ip_addrs.first() != Some(&observed_ip) {
                s.ip_addrs = vec![observed_ip];
            }
            if matches!(s.status, StorageStatus::Deleted | StorageStatus::IpChanged) {
                s.status = StorageStatus::Init;
            }
            return Ok(());
        }

        let storage = Storage::new(id, observed_ip, now);
        g.insert_storage(storage);
        debug!(group, id, "storage added");
        Ok(())
    }

    pub fn delete_storage(&self, group: &str, id: &str) -> TrackerResult<()> {
        {
            let mut inner = self.inner.lock();
            let g = inner
                .groups
                .get_mut(group)
                .ok_or_else(|| TrackerError::NotFound(format!("group {} not found", group)))?;
            let idx = g
                .find_index_by_id(id)
                .ok_or_else(|| TrackerError::NotFound(format!("storage {} not found", id)))?;
            match g.storages[idx].status {
                StorageStatus::Online | StorageStatus::Active | StorageStatus::Recovery => {
                    return Err(TrackerError::Busy(format!("storage {} is in use", id)))
                }
                StorageStatus::Deleted => {
                    return Err(TrackerError::Already(format!("storage {} already deleted", id)))
                }
                _ => {}
            }
            g.deactivate(idx);
            g.storages[idx].stat = Default::default();
            g.storages[idx].status = StorageStatus::Deleted;
            g.change_count += 1;
        }
        info!(group, id, "storage deleted");
        self.log_change(group, id, StorageStatus::Deleted, "delete");
        Ok(())
    }

    /// `storageIpChanged` (spec §4.2). Only valid when identity-mode is
    /// off; callers enforce that at the protocol layer.
    pub fn storage_ip_changed(
        &self,
        group: &str,
        old_ip: &IpAddr,
        new_ip: IpAddr,
        now: i64,
    ) -> TrackerResult<()> {
        let mut inner = self.inner.lock();
        let g = inner
            .groups
            .get_mut(group)
            .ok_or_else(|| TrackerError::NotFound(format!("group {} not found", group)))?;

        let old_idx = g
            .storages
            .iter()
            .position(|s| s.ip_addrs.first() == Some(old_ip))
            .ok_or_else(|| TrackerError::NotFound(format!("storage with ip {} not found", old_ip)))?;

        if matches!(
            g.storages[old_idx].status,
            StorageStatus::Online | StorageStatus::Active | StorageStatus::Recovery
        ) {
            return Err(TrackerError::Busy(format!("storage {} is active", old_ip)));
        }
        if g.storages[old_idx].status == StorageStatus::IpChanged {
            return Err(TrackerError::Already("storage already ip-changed".to_string()));
        }
        if g.storages
            .iter()
            .any(|s| s.ip_addrs.first() == Some(&new_ip) && s.status != StorageStatus::Deleted)
        {
            return Err(TrackerError::Exists(format!("ip {} already in use", new_ip)));
        }

        let old_id = g.storages[old_idx].id.clone();
        let mut replaced = g.storages[old_idx].clone();
        replaced.ip_addrs = vec![new_ip];
        g.storages[old_idx] = replaced;

        let mut stale = Storage::new(old_id.clone(), *old_ip, now);
        stale.status = StorageStatus::IpChanged;
        g.insert_storage(stale);
        drop(inner);
        info!(group, %old_ip, %new_ip, "storage ip changed");
        self.log_change(group, &old_id, StorageStatus::IpChanged, &new_ip.to_string());
        Ok(())
    }

    /// `syncStorageBriefs` (spec §4.2), applying the status merge rule.
    pub fn sync_storage_briefs(&self, group: &str, briefs: &[StorageBrief], now: i64) -> TrackerResult<()> {
        let mut inner = self.inner.lock();
        let g = inner
            .groups
            .get_mut(group)
            .ok_or_else(|| TrackerError::NotFound(format!("group {} not found", group)))?;

        for brief in briefs {
            if let Some(idx) = g.find_index_by_id(&brief.id) {
                let local = g.storages[idx].status;
                g.storages[idx].status = merge_status(local, brief.status);
            } else if !matches!(
                brief.status,
                StorageStatus::Deleted
                    | StorageStatus::IpChanged
                    | StorageStatus::Online
                    | StorageStatus::Active
            ) {
                let mut s = Storage::new(brief.id.clone(), brief.ip, now);
                s.status = brief.status;
                s.storage_port = brief.port;
                g.insert_storage(s);
            }
        }
        Ok(())
    }

    pub fn activate_storage(&self, group: &str, id: &str) -> TrackerResult<bool> {
        let activated = {
            let mut inner = self.inner.lock();
            let g = inner
                .groups
                .get_mut(group)
                .ok_or_else(|| TrackerError::NotFound(format!("group {} not found", group)))?;
            let idx = g
                .find_index_by_id(id)
                .ok_or_else(|| TrackerError::NotFound(format!("storage {} not found", id)))?;
            let activated = g.activate(idx);
            if activated && g.trunk_server.is_none() {
                g.trunk_server = g.active_storages.first().copied();
                if g.trunk_server.is_some() {
                    g.trunk_change_count += 1;
                }
            }
            activated
        };
        if activated {
            self.log_change(group, id, StorageStatus::Active, "activate");
        }
        Ok(activated)
    }

    pub fn deactivate_storage(&self, group: &str, id: &str) -> TrackerResult<()> {
        let mut inner = self.inner.lock();
        let g = inner
            .groups
            .get_mut(group)
            .ok_or_else(|| TrackerError::NotFound(format!("group {} not found", group)))?;
        let idx = g
            .find_index_by_id(id)
            .ok_or_else(|| TrackerError::NotFound(format!("storage {} not found", id)))?;
        g.deactivate(idx);
        if g.trunk_server == Some(idx) {
            g.trunk_server = None;
        }
        Ok(())
    }

    /// `offlineStorage` (spec §4.2).
    pub fn offline_storage(&self, group: &str, id: &str) -> TrackerResult<()> {
        let went_offline = {
            let mut inner = self.inner.lock();
            let g = inner
                .groups
                .get_mut(group)
                .ok_or_else(|| TrackerError::NotFound(format!("group {} not found", group)))?;
            let idx = g
                .find_index_by_id(id)
                .ok_or_else(|| TrackerError::NotFound(format!("storage {} not found", id)))?;
            let went_offline = !matches!(
                g.storages[idx].status,
                StorageStatus::WaitSync
                    | StorageStatus::Syncing
                    | StorageStatus::Init
                    | StorageStatus::Deleted
                    | StorageStatus::IpChanged
                    | StorageStatus::Recovery
            );
            if went_offline {
                g.storages[idx].status = StorageStatus::Offline;
            }
            g.deactivate(idx);
            went_offline
        };
        if went_offline {
            self.log_change(group, id, StorageStatus::Offline, "offline");
        }
        Ok(())
    }

    /// `recordHeartbeat` (spec §4.2). Returns whether a snapshot flush
    /// is due (every [`TRACKER_SYNC_TO_FILE_FREQ`] heartbeats).
    pub fn record_heartbeat(&self, group: &str, id: &str, now: i64) -> TrackerResult<bool> {
        let activated = self.activate_storage(group, id)?;
        let mut inner = self.inner.lock();
        let g = inner
            .groups
            .get_mut(group)
            .ok_or_else(|| TrackerError::NotFound(format!("group {} not found", group)))?;
        let idx = g
            .find_index_by_id(id)
            .ok_or_else(|| TrackerError::NotFound(format!("storage {} not found", id)))?;
        g.storages[idx].last_heartbeat = now;
        let _ = activated;
        inner.heartbeat_count += 1;
        Ok(inner.heartbeat_count % TRACKER_SYNC_TO_FILE_FREQ == 0)
    }

    /// `recordDiskUsage` (spec §4.2).
    pub fn record_disk_usage(
        &self,
        group: &str,
        id: &str,
        per_path: &[PathUsage],
    ) -> TrackerResult<bool> {
        let mut inner = self.inner.lock();
        let g = inner
            .groups
            .get_mut(group)
            .ok_or_else(|| TrackerError::NotFound(format!("group {} not found", group)))?;
        let idx = g
            .find_index_by_id(id)
            .ok_or_else(|| TrackerError::NotFound(format!("storage {} not found", id)))?;

        let s = &mut g.storages[idx];
        s.path_total_mb = per_path.iter().map(|p| p.total_mb).collect();
        s.path_free_mb = per_path.iter().map(|p| p.free_mb).collect();
        s.total_mb = s.path_total_mb.iter().sum();
        s.free_mb = s.path_free_mb.iter().copied().min().unwrap_or(0);

        g.total_mb = g.storages.iter().map(|s| s.total_mb).sum();
        g.recompute_free_mb();

        inner.disk_report_count += 1;
        Ok(inner.disk_report_count % TRACKER_SYNC_TO_FILE_FREQ == 0)
    }

    /// `recordSyncTimestamps` (spec §4.2). `round_robin_store_server`
    /// selects the min-vs-max aggregation rule.
    pub fn record_sync_timestamps(
        &self,
        group: &str,
        dest: &str,
        tuples: &[(String, i64)],
        round_robin_store_server: bool,
    ) -> TrackerResult<bool> {
        let mut inner = self.inner.lock();
        let g = inner
            .groups
            .get_mut(group)
            .ok_or_else(|| TrackerError::NotFound(format!("group {} not found", group)))?;

        for (src, ts) in tuples {
            if src == dest {
                continue;
            }
            let key = (src.clone(), dest.to_string());
            let entry = g.pairwise_last_sync_ts.entry(key).or_insert(*ts);
            *entry = if round_robin_store_server {
                (*entry).min(*ts)
            } else {
                (*entry).max(*ts)
            };
        }
        inner.sync_ts_count += 1;
        Ok(inner.sync_ts_count % TRACKER_SYNC_TO_FILE_FREQ == 0)
    }

    /// Sets a storage's `changelogOffset` bookmark, used on join when a
    /// storage enters the cluster at the current change-log size (spec
    /// §4.2 `addStorage` step 6).
    pub fn set_changelog_offset(&self, group: &str, id: &str, offset: u64) -> TrackerResult<()> {
        let mut inner = self.inner.lock();
        let g = inner
            .groups
            .get_mut(group)
            .ok_or_else(|| TrackerError::NotFound(format!("group {} not found", group)))?;
        let idx = g
            .find_index_by_id(id)
            .ok_or_else(|| TrackerError::NotFound(format!("storage {} not found", id)))?;
        g.storages[idx].changelog_offset = offset;
        Ok(())
    }

    pub fn set_trunk_server(&self, group: &str, idx: Option<usize>) -> TrackerResult<()> {
        let mut inner = self.inner.lock();
        let g = inner
            .groups
            .get_mut(group)
            .ok_or_else(|| TrackerError::NotFound(format!("group {} not found", group)))?;
        if g.trunk_server != idx {
            g.last_trunk_server_id = idx.map(|i| g.storages[i].id.clone());
            g.trunk_server = idx;
            g.trunk_change_count += 1;
            warn!(group, trunk = ?g.last_trunk_server_id, "trunk server changed");
        }
        Ok(())
    }
}
