//! Persistence (C8): atomic snapshot writers for groups, storages and
//! sync-timestamps, and the append-only change-log (spec §4.7).
//!
//! Snapshots use a simple `[Section]` / `key = value` text format, in
//! the same spirit as [`crate::config`]'s flat parser. Each writer
//! takes `file_lock`, writes to a `.tmp` sibling, `fsync`s, then
//! renames over the final name; on failure the tmp file is removed.

use crate::error::{TrackerError, TrackerResult};
use crate::state::group::{compare_ids, Group};
use crate::state::storage::{Storage, StorageStatus};
use crate::state::ClusterState;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};

pub const GROUPS_FILE: &str = "storage_groups.dat";
pub const SERVERS_FILE: &str = "storage_servers.dat";
pub const SYNC_TIMESTAMPS_FILE: &str = "storage_sync_timestamps.dat";
pub const CHANGELOG_FILE: &str = "storage_changelog.dat";

/// One parsed `[Section]` block: its name and ordered `key = value` pairs.
struct IniSection {
    name: String,
    fields: Vec<(String, String)>,
}

fn parse_ini(text: &str) -> Vec<IniSection> {
    let mut sections = Vec::new();
    let mut current_name = "Global".to_string();
    let mut current_fields = Vec::new();

    for raw_line in text.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line.starts_with('[') && line.ends_with(']') {
            sections.push(IniSection {
                name: std::mem::take(&mut current_name),
                fields: std::mem::take(&mut current_fields),
            });
            current_name = line[1..line.len() - 1].to_string();
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            current_fields.push((k.trim().to_string(), v.trim().to_string()));
        }
    }
    sections.push(IniSection {
        name: current_name,
        fields: current_fields,
    });
    sections.into_iter().filter(|s| !s.fields.is_empty()).collect()
}

fn field(fields: &[(String, String)], key: &str) -> Option<String> {
    fields.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone())
}

fn field_or<T: std::str::FromStr>(fields: &[(String, String)], key: &str, default: T) -> T {
    field(fields, key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Writes `contents` to `path` via the write-tmp / fsync / rename
/// pattern (spec §4.7). Must be called under [`Snapshots::file_lock`].
fn atomic_write(path: &Path, contents: &str) -> TrackerResult<()> {
    let tmp = path.with_file_name(format!(
        "{}.tmp",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("snapshot")
    ));
    let result = (|| -> std::io::Result<()> {
        let mut f = File::create(&tmp)?;
        f.write_all(contents.as_bytes())?;
        f.sync_all()?;
        fs::rename(&tmp, path)?;
        Ok(())
    })();
    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        return Err(TrackerError::Io {
            source: e,
            path: Some(path.to_path_buf()),
        });
    }
    Ok(())
}

/// The four on-disk system files and the lock serializing writes to them.
pub struct Snapshots {
    base_path: PathBuf,
    file_lock: Mutex<()>,
}

impl Snapshots {
    pub fn new(base_path: impl Into<PathBuf>) -> Snapshots {
        Snapshots {
            base_path: base_path.into(),
            file_lock: Mutex::new(()),
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.base_path.join(name)
    }

    /// `saveGroups` (spec §4.7): one `[GroupNNN]` section per group.
    pub fn save_groups(&self, state: &ClusterState) -> TrackerResult<()> {
        let _guard = self.file_lock.lock().unwrap();
        let names = state.group_names();
        let mut out = format!("[Global]\ngroup_count = {}\n\n", names.len());
        for (i, name) in names.iter().enumerate() {
            state.with_group(name, |g| {
                out.push_str(&format!("[Group{:03}]\n", i));
                out.push_str(&format!("name = {}\n", g.name));
                out.push_str(&format!("storage_port = {}\n", g.storage_port));
                out.push_str(&format!("storage_http_port = {}\n", g.storage_http_port));
                out.push_str(&format!("store_path_count = {}\n", g.store_path_count));
                out.push_str(&format!("subdir_count_per_path = {}\n", g.subdir_count_per_path));
                out.push_str(&format!("total_mb = {}\n", g.total_mb));
                out.push_str(&format!("free_mb = {}\n", g.free_mb));
                out.push_str(&format!("trunk_free_mb = {}\n", g.trunk_free_mb));
                out.push_str(&format!(
                    "store_server = {}\n",
                    g.store_server.map(|i| g.storages[i].id.clone()).unwrap_or_default()
                ));
                out.push_str(&format!(
                    "trunk_server = {}\n",
                    g.trunk_server.map(|i| g.storages[i].id.clone()).unwrap_or_default()
                ));
                out.push_str(&format!("change_count = {}\n", g.change_count));
                out.push_str(&format!("trunk_change_count = {}\n\n", g.trunk_change_count));
            });
        }
        atomic_write(&self.path(GROUPS_FILE), &out)?;
        info!(groups = names.len(), "groups snapshot persisted");
        Ok(())
    }

    /// `saveStorages` (spec §4.7): one `[StorageNNN]` section per
    /// storage, across all groups.
    pub fn save_storages(&self, state: &ClusterState) -> TrackerResult<()> {
        let _guard = self.file_lock.lock().unwrap();
        let names = state.group_names();
        let mut out = String::from("[Global]\nformat = 1\n\n");
        let mut i = 0;
        for name in &names {
            state.with_group(name, |g| {
                for s in &g.storages {
                    out.push_str(&format!("[Storage{:04}]\n", i));
                    out.push_str(&format!("group = {}\n", g.name));
                    out.push_str(&format!("id = {}\n", s.id));
                    out.push_str(&format!(
                        "ip = {}\n",
                        s.ip_addrs.first().map(|ip| ip.to_string()).unwrap_or_default()
                    ));
                    out.push_str(&format!("status = {}\n", s.status as u8));
                    out.push_str(&format!("join_time = {}\n", s.join_time));
                    out.push_str(&format!("up_time = {}\n", s.up_time));
                    out.push_str(&format!("total_mb = {}\n", s.total_mb));
                    out.push_str(&format!("free_mb = {}\n", s.free_mb));
                    out.push_str(&format!("storage_port = {}\n", s.storage_port));
                    out.push_str(&format!("storage_http_port = {}\n", s.storage_http_port));
                    out.push_str(&format!("upload_priority = {}\n", s.upload_priority));
                    out.push_str(&format!("changelog_offset = {}\n", s.changelog_offset));
                    out.push_str(&format!("last_heartbeat = {}\n", s.last_heartbeat));
                    out.push_str(&format!("change_count = {}\n", s.change_count));
                    out.push_str(&format!("trunk_change_count = {}\n\n", s.trunk_change_count));
                    i += 1;
                }
            });
        }
        atomic_write(&self.path(SERVERS_FILE), &out)?;
        info!(storages = i, "storages snapshot persisted");
        Ok(())
    }

    /// `saveSyncTimestamps` (spec §4.7): pairwise `(src, dest) -> ts`,
    /// one line per group section.
    pub fn save_sync_timestamps(&self, state: &ClusterState) -> TrackerResult<()> {
        let _guard = self.file_lock.lock().unwrap();
        let names = state.group_names();
        let mut out = String::from("[Global]\nformat = 1\n\n");
        for name in &names {
            state.with_group(name, |g| {
                if g.pairwise_last_sync_ts.is_empty() {
                    return;
                }
                out.push_str(&format!("[Group.{}]\n", g.name));
                for ((src, dest), ts) in &g.pairwise_last_sync_ts {
                    out.push_str(&format!("{}.{} = {}\n", src, dest, ts));
                }
                out.push('\n');
            });
        }
        atomic_write(&self.path(SYNC_TIMESTAMPS_FILE), &out)?;
        Ok(())
    }

    /// Startup load order (spec §4.7): groups snapshot, then storages
    /// snapshot (allocating per-storage path arrays), then
    /// sync-timestamps, then rebind trunk/store-server pointers by id.
    /// Converts legacy plain-text snapshots to ini form once, if found.
    pub fn load_all(&self, state: &ClusterState) -> TrackerResult<()> {
        self.convert_legacy_if_present()?;

        let groups_text = self.read_optional(GROUPS_FILE)?;
        let mut group_meta: HashMap<String, GroupMeta> = HashMap::new();
        if let Some(text) = &groups_text {
            for section in parse_ini(text) {
                if !section.name.starts_with("Group") {
                    continue;
                }
                let name = match field(&section.fields, "name") {
                    Some(n) => n,
                    None => continue,
                };
                group_meta.insert(
                    name.clone(),
                    GroupMeta {
                        storage_port: field_or(&section.fields, "storage_port", 0),
                        storage_http_port: field_or(&section.fields, "storage_http_port", 0),
                        store_path_count: field_or(&section.fields, "store_path_count", 0),
                        subdir_count_per_path: field_or(&section.fields, "subdir_count_per_path", 0),
                        total_mb: field_or(&section.fields, "total_mb", 0),
                        free_mb: field_or(&section.fields, "free_mb", 0),
                        trunk_free_mb: field_or(&section.fields, "trunk_free_mb", 0),
                        store_server_id: field(&section.fields, "store_server").filter(|s| !s.is_empty()),
                        trunk_server_id: field(&section.fields, "trunk_server").filter(|s| !s.is_empty()),
                        change_count: field_or(&section.fields, "change_count", 0),
                        trunk_change_count: field_or(&section.fields, "trunk_change_count", 0),
                    },
                );
            }
        }

        let mut groups: HashMap<String, Group> = group_meta
            .keys()
            .map(|name| (name.clone(), Group::new(name.clone())))
            .collect();
        for (name, meta) in &group_meta {
            if let Some(g) = groups.get_mut(name) {
                g.storage_port = meta.storage_port;
                g.storage_http_port = meta.storage_http_port;
                g.store_path_count = meta.store_path_count;
                g.subdir_count_per_path = meta.subdir_count_per_path;
                g.total_mb = meta.total_mb;
                g.free_mb = meta.free_mb;
                g.trunk_free_mb = meta.trunk_free_mb;
                g.change_count = meta.change_count;
                g.trunk_change_count = meta.trunk_change_count;
            }
        }

        let storages_text = self.read_optional(SERVERS_FILE)?;
        if let Some(text) = &storages_text {
            for section in parse_ini(text) {
                if !section.name.starts_with("Storage") {
                    continue;
                }
                let group_name = match field(&section.fields, "group") {
                    Some(g) => g,
                    None => continue,
                };
                let id = match field(&section.fields, "id") {
                    Some(id) => id,
                    None => continue,
                };
                let ip: std::net::IpAddr = match field(&section.fields, "ip").and_then(|s| s.parse().ok()) {
                    Some(ip) => ip,
                    None => continue,
                };
                let status = StorageStatus::from_u8(field_or(&section.fields, "status", 0)).unwrap_or(StorageStatus::Offline);
                let join_time = field_or(&section.fields, "join_time", 0);
                let mut storage = Storage::new(id, ip, join_time);
                storage.status = status;
                storage.up_time = field_or(&section.fields, "up_time", join_time);
                storage.total_mb = field_or(&section.fields, "total_mb", 0);
                storage.free_mb = field_or(&section.fields, "free_mb", 0);
                storage.storage_port = field_or(&section.fields, "storage_port", 0);
                storage.storage_http_port = field_or(&section.fields, "storage_http_port", 0);
                storage.upload_priority = field_or(&section.fields, "upload_priority", 0);
                storage.changelog_offset = field_or(&section.fields, "changelog_offset", 0);
                storage.last_heartbeat = field_or(&section.fields, "last_heartbeat", join_time);
                storage.change_count = field_or(&section.fields, "change_count", 0);
                storage.trunk_change_count = field_or(&section.fields, "trunk_change_count", 0);

                let g = groups.entry(group_name.clone()).or_insert_with(|| Group::new(group_name.clone()));
                let is_active = matches!(
                    status,
                    StorageStatus::Online | StorageStatus::Active | StorageStatus::Recovery
                );
                let idx = g.insert_storage(storage);
                if is_active && !g.active_storages.contains(&idx) {
                    let pos = g
                        .active_storages
                        .binary_search_by(|&i| compare_ids(&g.storages[i].id, &g.storages[idx].id))
                        .unwrap_or_else(|p| p);
                    g.active_storages.insert(pos, idx);
                }
            }
        }

        let sync_text = self.read_optional(SYNC_TIMESTAMPS_FILE)?;
        if let Some(text) = &sync_text {
            let mut current_group: Option<String> = None;
            for raw_line in text.lines() {
                let line = raw_line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                if line.starts_with("[Group.") && line.ends_with(']') {
                    current_group = Some(line["[Group.".len()..line.len() - 1].to_string());
                    continue;
                }
                if line.starts_with('[') {
                    current_group = None;
                    continue;
                }
                let Some(group_name) = &current_group else { continue };
                let Some((key, value)) = line.split_once('=') else { continue };
                let Some((src, dest)) = key.trim().split_once('.') else { continue };
                let Ok(ts) = value.trim().parse::<i64>() else { continue };
                if let Some(g) = groups.get_mut(group_name) {
                    g.pairwise_last_sync_ts.insert((src.to_string(), dest.to_string()), ts);
                }
            }
        }

        for (name, meta) in &group_meta {
            if let Some(g) = groups.get_mut(name) {
                g.store_server = meta.store_server_id.as_deref().and_then(|id| g.find_index_by_id(id));
                g.trunk_server = meta.trunk_server_id.as_deref().and_then(|id| g.find_index_by_id(id));
                g.last_trunk_server_id = meta.trunk_server_id.clone();
            }
        }

        let restored = groups.len();
        for (_, g) in groups {
            state.restore_group(g);
        }
        info!(groups = restored, "state restored from snapshot");
        Ok(())
    }

    fn read_optional(&self, name: &str) -> TrackerResult<Option<String>> {
        let path = self.path(name);
        match fs::read_to_string(&path) {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(TrackerError::Io {
                source: e,
                path: Some(path),
            }),
        }
    }

    /// Converts legacy plain-text snapshots (pre-ini format) found
    /// alongside the configured base path, then deletes the legacy
    /// files (spec §4.7). A no-op when no legacy file is present or an
    /// ini-form file already exists.
    fn convert_legacy_if_present(&self) -> TrackerResult<()> {
        for (legacy_name, ini_name) in [
            ("groups.dat.legacy", GROUPS_FILE),
            ("servers.dat.legacy", SERVERS_FILE),
        ] {
            let legacy_path = self.path(legacy_name);
            let ini_path = self.path(ini_name);
            if ini_path.exists() || !legacy_path.exists() {
                continue;
            }
            let text = fs::read_to_string(&legacy_path).map_err(|e| TrackerError::Io {
                source: e,
                path: Some(legacy_path.clone()),
            })?;
            // Legacy format is one flat `key value` record per line with
            // no sections; wrap it as a single [Global] block so the ini
            // parser can read it without a dedicated legacy code path.
            let mut converted = String::from("[Global]\n");
            for line in text.lines() {
                if let Some((k, v)) = line.split_once(' ') {
                    converted.push_str(&format!("{} = {}\n", k.trim(), v.trim()));
                }
            }
            atomic_write(&ini_path, &converted)?;
            fs::remove_file(&legacy_path).ok();
            warn!(legacy = legacy_name, "converted legacy snapshot to ini format");
        }
        Ok(())
    }
}

struct GroupMeta {
    storage_port: u16,
    storage_http_port: u16,
    store_path_count: u32,
    subdir_count_per_path: u32,
    total_mb: u64,
    free_mb: u64,
    trunk_free_mb: u64,
    store_server_id: Option<String>,
    trunk_server_id: Option<String>,
    change_count: u64,
    trunk_change_count: u64,
}

/// Append-only change-log writer (spec §4.7, §3 "Change-log record"):
/// `fsync` per record, `changelogFsize` tracked in memory.
pub struct ChangeLog {
    path: PathBuf,
    inner: Mutex<ChangeLogInner>,
}

struct ChangeLogInner {
    file: File,
    size: u64,
}

impl ChangeLog {
    pub fn open(base_path: impl AsRef<Path>) -> TrackerResult<ChangeLog> {
        let path = base_path.as_ref().join(CHANGELOG_FILE);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| TrackerError::Io {
                source: e,
                path: Some(path.clone()),
            })?;
        let size = file
            .metadata()
            .map_err(|e| TrackerError::Io {
                source: e,
                path: Some(path.clone()),
            })?
            .len();
        Ok(ChangeLog {
            path,
            inner: Mutex::new(ChangeLogInner { file, size }),
        })
    }

    pub fn size(&self) -> u64 {
        self.inner.lock().unwrap().size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the change-log's full on-disk contents, for
    /// `STORAGE_CHANGELOG_REQ` tailing (spec §4.6).
    pub fn read_all(&self) -> TrackerResult<Vec<u8>> {
        fs::read(&self.path).map_err(|e| TrackerError::Io {
            source: e,
            path: Some(self.path.clone()),
        })
    }
}

impl crate::state::ChangeLogAppender for ChangeLog {
    /// `<unixTs> <group> <storageId> <status> <arg>` (spec §3).
    fn append(
        &self,
        unix_ts: i64,
        group: &str,
        storage_id: &str,
        status: StorageStatus,
        arg: &str,
    ) -> TrackerResult<()> {
        let line = format!("{} {} {} {} {}\n", unix_ts, group, storage_id, status as u8, arg);
        let mut inner = self.inner.lock().unwrap();
        inner
            .file
            .write_all(line.as_bytes())
            .and_then(|_| inner.file.sync_all())
            .map_err(|e| TrackerError::Io {
                source: e,
                path: Some(self.path.clone()),
            })?;
        inner.size += line.len() as u64;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ChangeLogAppender;
    use std::net::IpAddr;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn groups_and_storages_round_trip_through_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let state = ClusterState::new();
        state.add_group("group1").unwrap();
        state.add_storage("group1", "1", ip("10.0.0.1"), 100).unwrap();
        state.activate_storage("group1", "1").unwrap();
        state
            .record_disk_usage(
                "group1",
                "1",
                &[crate::state::PathUsage {
                    total_mb: 1000,
                    free_mb: 400,
                }],
            )
            .unwrap();

        let snapshots = Snapshots::new(dir.path());
        snapshots.save_groups(&state).unwrap();
        snapshots.save_storages(&state).unwrap();
        snapshots.save_sync_timestamps(&state).unwrap();

        let restored = ClusterState::new();
        snapshots.load_all(&restored).unwrap();

        let count = restored.with_group("group1", |g| g.count()).unwrap();
        assert_eq!(count, 1);
        let status = restored.with_group("group1", |g| g.storages[0].status).unwrap();
        assert_eq!(status, StorageStatus::Active);
        let free = restored.with_group("group1", |g| g.free_mb).unwrap();
        assert_eq!(free, 400);
    }

    #[test]
    fn atomic_write_leaves_no_tmp_file_on_success() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.dat");
        atomic_write(&path, "hello").unwrap();
        assert!(path.exists());
        assert!(!dir.path().join("x.dat.tmp").exists());
    }

    #[test]
    fn change_log_appends_and_tracks_size() {
        let dir = tempfile::tempdir().unwrap();
        let log = ChangeLog::open(dir.path()).unwrap();
        assert_eq!(log.size(), 0);
        log.append(1000, "group1", "1", StorageStatus::Online, "join").unwrap();
        assert!(log.size() > 0);
        let contents = fs::read_to_string(log.path()).unwrap();
        assert!(contents.contains("group1 1 6 join"));
    }

    #[test]
    fn read_all_returns_every_appended_record() {
        let dir = tempfile::tempdir().unwrap();
        let log = ChangeLog::open(dir.path()).unwrap();
        log.append(1, "group1", "1", StorageStatus::Online, "join").unwrap();
        log.append(2, "group1", "2", StorageStatus::Offline, "").unwrap();
        let contents = String::from_utf8(log.read_all().unwrap()).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }

    #[test]
    fn reopening_change_log_preserves_prior_size() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = ChangeLog::open(dir.path()).unwrap();
            log.append(1, "g", "1", StorageStatus::Init, "a").unwrap();
        }
        let log = ChangeLog::open(dir.path()).unwrap();
        assert!(log.size() > 0);
    }
}
