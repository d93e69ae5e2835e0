//! Tracker configuration.
//!
//! Configuration is parsed from a flat `key = value` text file (the
//! on-disk format FastDFS-style trackers use) into [`TrackerConfig`].
//! Unknown keys are logged and skipped rather than rejected, per the
//! "dynamic-typed option parsing" convention this cluster's config
//! files have always followed.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// Policy for picking which group an upload lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreLookupPolicy {
    RoundRobin,
    SpecGroup,
    LoadBalance,
}

/// Policy for picking which storage within a group serves an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreServerPolicy {
    RoundRobin,
    FirstByIp,
    FirstByPri,
}

/// Policy for picking which path on a storage serves an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorePathPolicy {
    RoundRobin,
    LoadBalance,
}

/// Policy for picking which server serves a download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownloadServerPolicy {
    RoundRobin,
    SourceFirst,
}

/// How a filename encodes the storage id of its source server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdTypeInFilename {
    Id,
    Ip,
}

/// Which address family to prefer in responses that carry an IP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseIpAddrSize {
    Auto,
    V4,
    V6,
}

/// The reserved-space floor below which a group is excluded from
/// upload candidate selection (spec §4.5, §6 `reserved_storage_space`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ReservedSpace {
    /// Absolute floor, in megabytes.
    AbsoluteMb(u64),
    /// Fraction of total space, in `[0.0, 1.0]`.
    Ratio(f64),
}

impl Default for ReservedSpace {
    fn default() -> Self {
        ReservedSpace::AbsoluteMb(0)
    }
}

impl ReservedSpace {
    /// Parses `"<N>G"`, `"<N>M"` (absolute) or `"<N>%"` (ratio), per spec §6.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some(pct) = s.strip_suffix('%') {
            let pct: f64 = pct
                .parse()
                .map_err(|_| anyhow::anyhow!("invalid reserved_storage_space ratio: {}", s))?;
            return Ok(ReservedSpace::Ratio(pct / 100.0));
        }
        if let Some(gb) = s.strip_suffix(['G', 'g']) {
            let gb: u64 = gb
                .parse()
                .map_err(|_| anyhow::anyhow!("invalid reserved_storage_space: {}", s))?;
            return Ok(ReservedSpace::AbsoluteMb(gb * 1024));
        }
        if let Some(mb) = s.strip_suffix(['M', 'm']) {
            let mb: u64 = mb
                .parse()
                .map_err(|_| anyhow::anyhow!("invalid reserved_storage_space: {}", s))?;
            return Ok(ReservedSpace::AbsoluteMb(mb));
        }
        let mb: u64 = s
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid reserved_storage_space: {}", s))?;
        Ok(ReservedSpace::AbsoluteMb(mb))
    }

    /// True when `free_mb`/`total_mb` falls below the reserved floor.
    pub fn exhausted(&self, free_mb: u64, total_mb: u64) -> bool {
        match *self {
            ReservedSpace::AbsoluteMb(floor) => free_mb <= floor,
            ReservedSpace::Ratio(ratio) => {
                if total_mb == 0 {
                    true
                } else {
                    (free_mb as f64) / (total_mb as f64) <= ratio
                }
            }
        }
    }
}

/// Trunk-file (small-file packing) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrunkFileConfig {
    pub use_trunk_file: bool,
    pub slot_min_size: u64,
    pub slot_max_size: u64,
    pub trunk_file_size: u64,
    pub trunk_alloc_alignment_size: u64,
    pub trunk_create_file_advance: bool,
    pub trunk_create_file_time_base: String,
    pub trunk_create_file_interval: u64,
    pub trunk_create_file_space_threshold: u64,
    pub trunk_init_check_occupying: bool,
    pub trunk_init_reload_from_binlog: bool,
    pub trunk_free_space_merge: bool,
    pub delete_unused_trunk_files: bool,
    pub trunk_compress_binlog_min_interval: u64,
    pub trunk_compress_binlog_interval: u64,
    pub trunk_compress_binlog_time_base: String,
    pub trunk_binlog_max_backups: u32,
}

impl Default for TrunkFileConfig {
    fn default() -> Self {
        Self {
            use_trunk_file: false,
            slot_min_size: 256,
            slot_max_size: 16 * 1024 * 1024,
            trunk_file_size: 64 * 1024 * 1024,
            trunk_alloc_alignment_size: 256,
            trunk_create_file_advance: false,
            trunk_create_file_time_base: "02:00".to_string(),
            trunk_create_file_interval: 86400,
            trunk_create_file_space_threshold: 0,
            trunk_init_check_occupying: false,
            trunk_init_reload_from_binlog: false,
            trunk_free_space_merge: true,
            delete_unused_trunk_files: false,
            trunk_compress_binlog_min_interval: 0,
            trunk_compress_binlog_interval: 86400,
            trunk_compress_binlog_time_base: "02:00".to_string(),
            trunk_binlog_max_backups: 7,
        }
    }
}

/// Selection-policy configuration (spec §4.5, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionConfig {
    pub store_lookup: StoreLookupPolicy,
    pub store_group: Option<String>,
    pub store_server: StoreServerPolicy,
    pub download_server: DownloadServerPolicy,
    pub store_path: StorePathPolicy,
    pub reserved_storage_space: ReservedSpace,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            store_lookup: StoreLookupPolicy::RoundRobin,
            store_group: None,
            store_server: StoreServerPolicy::RoundRobin,
            download_server: DownloadServerPolicy::RoundRobin,
            store_path: StorePathPolicy::RoundRobin,
            reserved_storage_space: ReservedSpace::default(),
        }
    }
}

/// Identity-mode and peer-facing network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    pub use_storage_id: bool,
    pub id_type_in_filename: IdTypeInFilename,
    pub trust_storage_server_id: bool,
    pub storage_ip_changed_auto_adjust: bool,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            use_storage_id: false,
            id_type_in_filename: IdTypeInFilename::Ip,
            trust_storage_server_id: false,
            storage_ip_changed_auto_adjust: true,
        }
    }
}

/// Top-level tracker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    pub bind_address: String,
    pub port: u16,
    pub base_path: String,

    pub selection: SelectionConfig,
    pub identity: IdentityConfig,
    pub trunk_file: TrunkFileConfig,

    pub check_active_interval: Duration,
    pub relationship_check_interval: Duration,
    pub sync_status_file_interval: Duration,
    pub network_timeout: Duration,

    pub storage_sync_file_max_delay: Duration,
    pub storage_sync_file_max_time: Duration,

    pub response_ip_addr_size: ResponseIpAddrSize,
    pub allow_hosts: Vec<String>,
    pub allow_ip_count: i32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 22122,
            base_path: "/data/fastdfs/tracker".to_string(),
            selection: SelectionConfig::default(),
            identity: IdentityConfig::default(),
            trunk_file: TrunkFileConfig::default(),
            check_active_interval: Duration::from_secs(120),
            relationship_check_interval: Duration::from_secs(10),
            sync_status_file_interval: Duration::from_secs(300),
            network_timeout: Duration::from_secs(30),
            storage_sync_file_max_delay: Duration::from_secs(86400),
            storage_sync_file_max_time: Duration::from_secs(300),
            response_ip_addr_size: ResponseIpAddrSize::Auto,
            allow_hosts: Vec::new(),
            allow_ip_count: -1,
        }
    }
}

/// Builder for [`TrackerConfig`] with fluent setters and validation.
#[derive(Default)]
pub struct ConfigBuilder {
    config: TrackerConfig,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: TrackerConfig::default(),
        }
    }

    pub fn bind_address(mut self, addr: impl Into<String>) -> Self {
        self.config.bind_address = addr.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn base_path(mut self, path: impl Into<String>) -> Self {
        self.config.base_path = path.into();
        self
    }

    pub fn selection(mut self, selection: SelectionConfig) -> Self {
        self.config.selection = selection;
        self
    }

    pub fn identity(mut self, identity: IdentityConfig) -> Self {
        self.config.identity = identity;
        self
    }

    pub fn trunk_file(mut self, trunk_file: TrunkFileConfig) -> Self {
        self.config.trunk_file = trunk_file;
        self
    }

    /// Build and validate the configuration.
    pub fn build(self) -> Result<TrackerConfig> {
        self.validate()?;
        Ok(self.config)
    }

    fn validate(&self) -> Result<()> {
        if self.config.port == 0 {
            return Err(anyhow::anyhow!("tracker port cannot be 0"));
        }
        if self.config.base_path.is_empty() {
            return Err(anyhow::anyhow!("base_path cannot be empty"));
        }
        if self.config.identity.use_storage_id
            && self.config.identity.storage_ip_changed_auto_adjust
        {
            return Err(anyhow::anyhow!(
                "storage_ip_changed_auto_adjust is incompatible with use_storage_id"
            ));
        }
        if let StoreLookupPolicy::SpecGroup = self.config.selection.store_lookup {
            if self.config.selection.store_group.is_none() {
                return Err(anyhow::anyhow!(
                    "store_lookup=spec-group requires store_group to be set"
                ));
            }
        }
        if let ReservedSpace::Ratio(r) = self.config.selection.reserved_storage_space {
            if !(0.0..=1.0).contains(&r) {
                return Err(anyhow::anyhow!(
                    "reserved_storage_space ratio must be between 0.0 and 1.0"
                ));
            }
        }
        Ok(())
    }
}

impl TrackerConfig {
    /// Parses a flat `key = value` text config, skipping blank lines and
    /// `#`-prefixed comments. Unknown keys are logged and ignored.
    pub fn from_text(text: &str) -> Result<TrackerConfig> {
        let mut builder = ConfigBuilder::new();
        let mut selection = SelectionConfig::default();
        let mut identity = IdentityConfig::default();
        let mut trunk = TrunkFileConfig::default();

        for raw_line in text.lines() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                warn!(line = raw_line, "config line missing '='; skipping");
                continue;
            };
            let key = key.trim();
            let value = value.trim();

            match key {
                "bind_address" => builder = builder.bind_address(value),
                "port" => {
                    builder = builder.port(value.parse().unwrap_or_else(|_| {
                        warn!(value, "invalid port, keeping default");
                        22122
                    }))
                }
                "base_path" => builder = builder.base_path(value),
                "store_lookup" => {
                    selection.store_lookup = parse_store_lookup(value).unwrap_or_else(|| {
                        warn!(value, "unrecognized store_lookup, keeping default");
                        selection.store_lookup
                    })
                }
                "store_group" => selection.store_group = Some(value.to_string()),
                "store_server" => {
                    selection.store_server = parse_store_server(value).unwrap_or_else(|| {
                        warn!(value, "unrecognized store_server, keeping default");
                        selection.store_server
                    })
                }
                "download_server" => {
                    selection.download_server =
                        parse_download_server(value).unwrap_or_else(|| {
                            warn!(value, "unrecognized download_server, keeping default");
                            selection.download_server
                        })
                }
                "store_path" => {
                    selection.store_path = parse_store_path(value).unwrap_or_else(|| {
                        warn!(value, "unrecognized store_path, keeping default");
                        selection.store_path
                    })
                }
                "reserved_storage_space" => {
                    selection.reserved_storage_space =
                        ReservedSpace::parse(value).unwrap_or_else(|e| {
                            warn!(value, error = %e, "invalid reserved_storage_space, keeping default");
                            selection.reserved_storage_space
                        })
                }
                "use_storage_id" => identity.use_storage_id = parse_bool(value),
                "id_type_in_filename" => {
                    identity.id_type_in_filename = match value {
                        "id" => IdTypeInFilename::Id,
                        "ip" => IdTypeInFilename::Ip,
                        _ => {
                            warn!(value, "unrecognized id_type_in_filename, keeping default");
                            identity.id_type_in_filename
                        }
                    }
                }
                "trust_storage_server_id" => identity.trust_storage_server_id = parse_bool(value),
                "storage_ip_changed_auto_adjust" => {
                    identity.storage_ip_changed_auto_adjust = parse_bool(value)
                }
                "use_trunk_file" => trunk.use_trunk_file = parse_bool(value),
                "slot_min_size" => trunk.slot_min_size = value.parse().unwrap_or(trunk.slot_min_size),
                "slot_max_size" => trunk.slot_max_size = value.parse().unwrap_or(trunk.slot_max_size),
                "trunk_file_size" => {
                    trunk.trunk_file_size = value.parse().unwrap_or(trunk.trunk_file_size)
                }
                "trunk_alloc_alignment_size" => {
                    trunk.trunk_alloc_alignment_size =
                        value.parse().unwrap_or(trunk.trunk_alloc_alignment_size)
                }
                "trunk_create_file_advance" => trunk.trunk_create_file_advance = parse_bool(value),
                "trunk_create_file_time_base" => {
                    trunk.trunk_create_file_time_base = value.to_string()
                }
                "trunk_create_file_interval" => {
                    trunk.trunk_create_file_interval =
                        value.parse().unwrap_or(trunk.trunk_create_file_interval)
                }
                "trunk_create_file_space_threshold" => {
                    trunk.trunk_create_file_space_threshold = value
                        .parse()
                        .unwrap_or(trunk.trunk_create_file_space_threshold)
                }
                "trunk_init_check_occupying" => {
                    trunk.trunk_init_check_occupying = parse_bool(value)
                }
                "trunk_init_reload_from_binlog" => {
                    trunk.trunk_init_reload_from_binlog = parse_bool(value)
                }
                "trunk_free_space_merge" => trunk.trunk_free_space_merge = parse_bool(value),
                "delete_unused_trunk_files" => {
                    trunk.delete_unused_trunk_files = parse_bool(value)
                }
                "trunk_compress_binlog_min_interval" => {
                    trunk.trunk_compress_binlog_min_interval = value
                        .parse()
                        .unwrap_or(trunk.trunk_compress_binlog_min_interval)
                }
                "trunk_compress_binlog_interval" => {
                    trunk.trunk_compress_binlog_interval = value
                        .parse()
                        .unwrap_or(trunk.trunk_compress_binlog_interval)
                }
                "trunk_compress_binlog_time_base" => {
                    trunk.trunk_compress_binlog_time_base = value.to_string()
                }
                "trunk_binlog_max_backups" => {
                    trunk.trunk_binlog_max_backups =
                        value.parse().unwrap_or(trunk.trunk_binlog_max_backups)
                }
                "check_active_interval" => {
                    if let Ok(secs) = value.parse() {
                        builder.config.check_active_interval = Duration::from_secs(secs);
                    }
                }
                "storage_sync_file_max_delay" => {
                    if let Ok(secs) = value.parse() {
                        builder.config.storage_sync_file_max_delay = Duration::from_secs(secs);
                    }
                }
                "storage_sync_file_max_time" => {
                    if let Ok(secs) = value.parse() {
                        builder.config.storage_sync_file_max_time = Duration::from_secs(secs);
                    }
                }
                "response_ip_addr_size" => {
                    builder.config.response_ip_addr_size = match value {
                        "v4" => ResponseIpAddrSize::V4,
                        "v6" => ResponseIpAddrSize::V6,
                        _ => ResponseIpAddrSize::Auto,
                    }
                }
                "allow_hosts" => {
                    builder.config.allow_hosts =
                        value.split(',').map(|s| s.trim().to_string()).collect()
                }
                "allow_ip_count" => {
                    builder.config.allow_ip_count =
                        value.parse().unwrap_or(builder.config.allow_ip_count)
                }
                _ => warn!(key, "unrecognized config key, skipping"),
            }
        }

        builder
            .selection(selection)
            .identity(identity)
            .trunk_file(trunk)
            .build()
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(value, "1" | "true" | "yes" | "on")
}

fn parse_store_lookup(value: &str) -> Option<StoreLookupPolicy> {
    match value {
        "0" | "round-robin" => Some(StoreLookupPolicy::RoundRobin),
        "1" | "spec-group" => Some(StoreLookupPolicy::SpecGroup),
        "2" | "load-balance" => Some(StoreLookupPolicy::LoadBalance),
        _ => None,
    }
}

fn parse_store_server(value: &str) -> Option<StoreServerPolicy> {
    match value {
        "0" | "round-robin" => Some(StoreServerPolicy::RoundRobin),
        "1" | "first-by-ip" => Some(StoreServerPolicy::FirstByIp),
        "2" | "first-by-pri" => Some(StoreServerPolicy::FirstByPri),
        _ => None,
    }
}

fn parse_download_server(value: &str) -> Option<DownloadServerPolicy> {
    match value {
        "0" | "round-robin" => Some(DownloadServerPolicy::RoundRobin),
        "1" | "source-first" => Some(DownloadServerPolicy::SourceFirst),
        _ => None,
    }
}

fn parse_store_path(value: &str) -> Option<StorePathPolicy> {
    match value {
        "0" | "round-robin" => Some(StorePathPolicy::RoundRobin),
        "2" | "load-balance" => Some(StorePathPolicy::LoadBalance),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = ConfigBuilder::new().build().unwrap();
        assert_eq!(cfg.port, 22122);
    }

    #[test]
    fn rejects_zero_port() {
        let err = ConfigBuilder::new().port(0).build();
        assert!(err.is_err());
    }

    #[test]
    fn rejects_conflicting_identity_flags() {
        let mut identity = IdentityConfig::default();
        identity.use_storage_id = true;
        identity.storage_ip_changed_auto_adjust = true;
        let err = ConfigBuilder::new().identity(identity).build();
        assert!(err.is_err());
    }

    #[test]
    fn reserved_space_parses_absolute_and_ratio() {
        assert_eq!(
            ReservedSpace::parse("100M").unwrap(),
            ReservedSpace::AbsoluteMb(100)
        );
        assert_eq!(
            ReservedSpace::parse("1G").unwrap(),
            ReservedSpace::AbsoluteMb(1024)
        );
        match ReservedSpace::parse("50%").unwrap() {
            ReservedSpace::Ratio(r) => assert!((r - 0.5).abs() < 1e-9),
            _ => panic!("expected ratio"),
        }
    }

    #[test]
    fn reserved_space_exhausted_checks_ratio() {
        let r = ReservedSpace::Ratio(0.5);
        assert!(r.exhausted(1000, 10000));
        assert!(!r.exhausted(6000, 10000));
    }

    #[test]
    fn unknown_keys_are_skipped_not_fatal() {
        let text = "port = 23000\nbogus_key = 1\n";
        let cfg = TrackerConfig::from_text(text).unwrap();
        assert_eq!(cfg.port, 23000);
    }

    #[test]
    fn spec_group_without_group_name_fails_validation() {
        let mut selection = SelectionConfig::default();
        selection.store_lookup = StoreLookupPolicy::SpecGroup;
        let err = ConfigBuilder::new().selection(selection).build();
        assert!(err.is_err());
    }
}
