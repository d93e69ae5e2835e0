//! Per-command handlers (spec §4.6). Each handler validates its body,
//! mutates or reads the cluster state, and returns a status byte plus
//! a response body.

use super::wire::{decode_fixed, encode_fixed, parse_ip, ChangeFlags, StorageBriefWire};
use crate::config::TrackerConfig;
use crate::error::TrackerError;
use crate::identity::IdentityRegistry;
use crate::leader::{LeaderManager, PeerStatus};
use crate::peers::{Peer, PeerSet};
use crate::persistence::ChangeLog;
use crate::selection::{self, GroupSummary, StorageSummary};
use crate::state::storage::StorageStatus;
use crate::state::{ClusterState, PathUsage, StorageBrief};
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Shared dependencies every handler needs. Cheap to clone (all fields
/// are `Arc`s), so one instance is built per listener and cloned per
/// connection.
#[derive(Clone)]
pub struct ProtocolContext {
    pub state: Arc<ClusterState>,
    pub peers: Arc<PeerSet>,
    pub identity: Option<Arc<IdentityRegistry>>,
    pub config: Arc<TrackerConfig>,
    pub upload_group_cursor: Arc<AtomicUsize>,
    pub leader_manager: Arc<LeaderManager>,
    pub change_log: Arc<ChangeLog>,
}

/// Outcome of dispatching one request: the status byte for the
/// response header plus its body. `close_after` mirrors spec §4.6:
/// "when a handler returns EINVAL as the body status and the response
/// body is empty, the connection is closed".
pub struct HandlerOutcome {
    pub status: u8,
    pub body: Vec<u8>,
    pub close_after: bool,
}

impl HandlerOutcome {
    fn ok(body: Vec<u8>) -> HandlerOutcome {
        HandlerOutcome {
            status: 0,
            body,
            close_after: false,
        }
    }

    fn err(e: &TrackerError) -> HandlerOutcome {
        let status = e.response_code();
        HandlerOutcome {
            status,
            body: Vec::new(),
            close_after: status == 22,
        }
    }
}

fn now() -> i64 {
    // Callers pass in the wall-clock time explicitly where it affects
    // test outcomes; handlers that only need "now" for bookkeeping
    // (join time, last heartbeat) use this helper.
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// `STORAGE_JOIN` (spec §4.6). The body layout used here is a simple
/// length-prefixed field encoding rather than FastDFS's exact binary
/// layout: field order and semantics match the spec; the concrete byte
/// layout is this crate's own.
pub struct StorageJoinRequest {
    pub group: String,
    pub storage_port: u16,
    pub storage_http_port: u16,
    pub store_path_count: u32,
    pub subdir_count_per_path: u32,
    pub upload_priority: i32,
    pub join_time: i64,
    pub up_time: i64,
    pub version: String,
    pub domain_name: String,
    pub init_flag: bool,
    pub status: u8,
    pub client_ip: IpAddr,
    pub peer_list: Vec<Peer>,
}

pub fn handle_storage_join(ctx: &ProtocolContext, req: StorageJoinRequest) -> HandlerOutcome {
    if !crate::state::group::is_valid_group_name(&req.group)
        || req.storage_port == 0
        || req.store_path_count == 0
        || req.store_path_count > 256
        || req.subdir_count_per_path > 256
    {
        return HandlerOutcome::err(&TrackerError::InvalidArgument(
            "storage_join: bad field value".to_string(),
        ));
    }

    let id = match &ctx.identity {
        Some(registry) => match registry.get_by_group_ip(&req.group, &req.client_ip) {
            Some(identity) => identity.id.clone(),
            None => {
                return HandlerOutcome::err(&TrackerError::NotFound(
                    "storage not present in identity registry".to_string(),
                ))
            }
        },
        None => req.client_ip.to_string(),
    };

    if !req.peer_list.is_empty() {
        ctx.peers.merge(&req.peer_list);
    }

    if let Err(e) = ctx.state.add_group(&req.group) {
        return HandlerOutcome::err(&e);
    }
    if let Err(e) = ctx.state.add_storage(&req.group, &id, req.client_ip, now()) {
        return HandlerOutcome::err(&e);
    }

    let mut my_status = StorageStatus::Online;
    if !req.init_flag {
        my_status = match StorageStatus::from_u8(req.status) {
            Some(StorageStatus::Active) => StorageStatus::Online,
            Some(StorageStatus::Offline) | Some(StorageStatus::Recovery) => StorageStatus::Online,
            Some(other) => other,
            None => StorageStatus::Online,
        };
    }
    if my_status == StorageStatus::Online {
        let _ = ctx.state.activate_storage(&req.group, &id);
    } else if my_status == StorageStatus::Init {
        let _ = ctx
            .state
            .set_changelog_offset(&req.group, &id, ctx.change_log.size());
    }

    info!(group = %req.group, id = %id, "storage joined");

    let mut body = Vec::new();
    body.push(my_status as u8);
    HandlerOutcome::ok(body)
}

/// `STORAGE_BEAT` (spec §4.2 `recordHeartbeat`). Returns whether the
/// caller should trigger a snapshot flush.
pub fn handle_storage_beat(ctx: &ProtocolContext, group: &str, id: &str) -> HandlerOutcome {
    match ctx.state.record_heartbeat(group, id, now()) {
        Ok(due_for_snapshot) => {
            let mut body = vec![0u8];
            body[0] = ChangeFlags::default().to_byte();
            let _ = due_for_snapshot;
            HandlerOutcome::ok(body)
        }
        Err(e) => HandlerOutcome::err(&e),
    }
}

/// `STORAGE_REPORT_DISK_USAGE` (spec §4.2 `recordDiskUsage`).
pub fn handle_report_disk_usage(
    ctx: &ProtocolContext,
    group: &str,
    id: &str,
    per_path: &[PathUsage],
) -> HandlerOutcome {
    match ctx.state.record_disk_usage(group, id, per_path) {
        Ok(_) => HandlerOutcome::ok(Vec::new()),
        Err(e) => HandlerOutcome::err(&e),
    }
}

/// `STORAGE_REPORT_STATUS` check-and-sync piggyback (spec §4.6),
/// applied via the status merge rule.
pub fn handle_report_status(
    ctx: &ProtocolContext,
    group: &str,
    briefs: Vec<StorageBriefWire>,
) -> HandlerOutcome {
    let parsed: Result<Vec<StorageBrief>, TrackerError> = briefs
        .into_iter()
        .map(|b| {
            Ok(StorageBrief {
                id: b.id,
                status: b.status,
                ip: parse_ip(&b.ip)?,
                port: b.port as u16,
            })
        })
        .collect();
    let parsed = match parsed {
        Ok(p) => p,
        Err(e) => return HandlerOutcome::err(&e),
    };
    match ctx.state.sync_storage_briefs(group, &parsed, now()) {
        Ok(()) => HandlerOutcome::ok(Vec::new()),
        Err(e) => HandlerOutcome::err(&e),
    }
}

/// `SERVER_DELETE_STORAGE` (admin command, spec §4.2 `deleteStorage`).
pub fn handle_delete_storage(ctx: &ProtocolContext, group: &str, id: &str) -> HandlerOutcome {
    match ctx.state.delete_storage(group, id) {
        Ok(()) => HandlerOutcome::ok(Vec::new()),
        Err(e) => HandlerOutcome::err(&e),
    }
}

/// `SERVER_DELETE_GROUP`.
pub fn handle_delete_group(ctx: &ProtocolContext, group: &str) -> HandlerOutcome {
    match ctx.state.delete_group(group) {
        Ok(()) => HandlerOutcome::ok(Vec::new()),
        Err(e) => HandlerOutcome::err(&e),
    }
}

/// `SERVICE_QUERY_STORE_WITHOUT_GROUP_ONE` (upload routing, spec
/// §4.5). Picks a group then a storage within it.
pub fn handle_query_store_without_group_one(ctx: &ProtocolContext) -> HandlerOutcome {
    let names = ctx.state.group_names();
    let summaries: Vec<GroupSummary> = names
        .iter()
        .filter_map(|n| ctx.state.with_group(n, GroupSummary::from))
        .collect();

    let mut cursor = ctx.upload_group_cursor.load(Ordering::Relaxed);
    let result = selection::select_upload_group(
        ctx.config.selection.store_lookup,
        &summaries,
        &mut cursor,
        ctx.config.selection.store_group.as_deref(),
        ctx.config.selection.reserved_storage_space,
        ctx.config.trunk_file.use_trunk_file,
    );
    ctx.upload_group_cursor.store(cursor, Ordering::Relaxed);

    let group_name = match result {
        Ok(name) => name,
        Err(e) => return HandlerOutcome::err(&e),
    };

    let storage_policy = selection::upgrade_store_server_policy(
        ctx.config.trunk_file.use_trunk_file,
        ctx.config.selection.store_server,
    );
    let active: Vec<StorageSummary> = ctx
        .state
        .with_group(&group_name, |g| {
            g.active_storages
                .iter()
                .map(|&i| StorageSummary::from(&g.storages[i]))
                .collect()
        })
        .unwrap_or_default();

    let mut storage_cursor = 0;
    let storage_id = match selection::select_upload_storage(storage_policy, &active, &mut storage_cursor) {
        Ok(id) => id,
        Err(e) => return HandlerOutcome::err(&e),
    };

    let mut body = Vec::new();
    body.extend_from_slice(&encode_fixed(&group_name, super::wire::GROUP_NAME_FIELD_LEN));
    body.extend_from_slice(&encode_fixed(&storage_id, super::wire::STORAGE_ID_FIELD_LEN));
    HandlerOutcome::ok(body)
}

/// `SERVER_LIST_ONE_GROUP`.
pub fn handle_list_one_group(ctx: &ProtocolContext, group: &str) -> HandlerOutcome {
    match ctx.state.with_group(group, |g| {
        let mut body = Vec::new();
        body.extend_from_slice(&encode_fixed(&g.name, super::wire::GROUP_NAME_FIELD_LEN));
        body.extend_from_slice(&(g.count() as u32).to_be_bytes());
        body.extend_from_slice(&(g.active_count() as u32).to_be_bytes());
        body.extend_from_slice(&g.free_mb.to_be_bytes());
        body
    }) {
        Some(body) => HandlerOutcome::ok(body),
        None => HandlerOutcome::err(&TrackerError::NotFound(format!("group {} not found", group))),
    }
}

/// `STORAGE_CHANGELOG_REQ` (spec §4.6 "changelog tailing").
pub fn handle_changelog_req(
    changelog_text: &[u8],
    requested_offset: u64,
    max_response_body: usize,
) -> HandlerOutcome {
    let size = changelog_text.len() as u64;
    if requested_offset > size {
        return HandlerOutcome::err(&TrackerError::InvalidArgument(
            "changelog offset beyond end of file".to_string(),
        ));
    }
    let available = (size - requested_offset) as usize;
    let take = available.min(max_response_body);
    let slice = &changelog_text[requested_offset as usize..requested_offset as usize + take];
    debug!(requested_offset, take, "changelog slice served");
    HandlerOutcome::ok(slice.to_vec())
}

/// `TRACKER_NOTIFY_NEXT_LEADER` / `TRACKER_COMMIT_NEXT_LEADER` (spec
/// §4.3 two-phase commit).
pub fn handle_notify_next_leader(commit: &crate::leader::LeaderCommit, addr: &str) -> HandlerOutcome {
    commit.accept_notify(addr);
    HandlerOutcome::ok(Vec::new())
}

pub fn handle_commit_next_leader(
    commit: &crate::leader::LeaderCommit,
    peers: &PeerSet,
    addr: &str,
) -> HandlerOutcome {
    if commit.accept_commit(addr) {
        peers.set_leader(addr);
        HandlerOutcome::ok(Vec::new())
    } else {
        HandlerOutcome::err(&TrackerError::InvalidArgument(
            "commit does not match last notify".to_string(),
        ))
    }
}

/// `ACTIVE_TEST` (cmd 82 with an empty body, spec §6).
pub fn handle_active_test() -> HandlerOutcome {
    HandlerOutcome::ok(Vec::new())
}

/// `TRACKER_GET_STATUS` (spec §4.3 step 2): reports this tracker's own
/// `{runningTime, restartInterval, isLeader}` so a peer's relationship
/// tick can rank it against its own. Body: `running_time(8) |
/// restart_interval(8) | is_leader(1)`, all big-endian.
pub fn handle_get_status(ctx: &ProtocolContext) -> HandlerOutcome {
    let local_addr = format!("{}:{}", ctx.config.bind_address, ctx.config.port);
    let PeerStatus {
        running_time,
        restart_interval,
        is_leader,
        ..
    } = ctx.leader_manager.status_now(&local_addr, &ctx.peers, now());

    let mut body = Vec::with_capacity(17);
    body.extend_from_slice(&running_time.to_be_bytes());
    body.extend_from_slice(&restart_interval.to_be_bytes());
    body.push(is_leader as u8);
    HandlerOutcome::ok(body)
}

/// Any recognized-but-unimplemented command from the full §6 table:
/// acknowledged as not supported rather than silently dropped.
pub fn handle_not_supported(command: u8) -> HandlerOutcome {
    HandlerOutcome::err(&TrackerError::OpNotSupported(format!(
        "command {} not implemented",
        command
    )))
}

pub fn decode_group_field(bytes: &[u8]) -> String {
    decode_fixed(bytes)
}
