//! Connection state machine (spec §4.6): `Idle -> ReadingHeader ->
//! ReadingBody -> Dispatching -> WritingResponse -> Idle | Closed`.

use super::handlers::{self, ProtocolContext, StorageJoinRequest};
use super::wire::{cmd, decode_fixed, Header, HEADER_LEN, TRACKER_MAX_PACKAGE_SIZE};
use crate::error::{TrackerError, TrackerResult};
use crate::leader::LeaderCommit;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};

/// States of the per-connection state machine. `Idle` and
/// `ReadingHeader` are distinguished only for observability: the
/// socket read that spans them is a single `read_exact` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    ReadingHeader,
    ReadingBody,
    Dispatching,
    WritingResponse,
    Closed,
}

/// Runs the request/response loop for one accepted connection until
/// the peer disconnects, sends `QUIT`, or a framing error occurs.
pub async fn serve_connection<S>(
    mut stream: S,
    ctx: ProtocolContext,
    leader_commit: Arc<LeaderCommit>,
    network_timeout: Duration,
) -> TrackerResult<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut req_count: u64 = 0;
    let mut state = ConnectionState::Idle;

    loop {
        state = ConnectionState::ReadingHeader;
        let mut header_buf = [0u8; HEADER_LEN];

        // Keep-alive idle reset (spec §4.6): the header-read timeout is
        // only enforced once a request is in flight; between requests on
        // an otherwise-idle keep-alive connection it does not fire.
        let read_result = if req_count == 0 {
            stream.read_exact(&mut header_buf).await
        } else {
            match timeout(network_timeout, stream.read_exact(&mut header_buf)).await {
                Ok(r) => r,
                Err(_) => {
                    debug!("connection idle past network_timeout; closing");
                    state = ConnectionState::Closed;
                    return Ok(());
                }
            }
        };

        match read_result {
            Ok(0) => {
                state = ConnectionState::Closed;
                return Ok(());
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                state = ConnectionState::Closed;
                return Ok(());
            }
            Err(e) => return Err(TrackerError::Io { source: e, path: None }),
        }

        let header = match Header::decode(&header_buf) {
            Ok(h) => h,
            Err(e) => {
                warn!(error = %e, "framing error; closing connection");
                return Err(e);
            }
        };

        state = ConnectionState::ReadingBody;
        let mut body = vec![0u8; header.pkg_len as usize];
        if !body.is_empty() {
            stream
                .read_exact(&mut body)
                .await
                .map_err(|e| TrackerError::Io { source: e, path: None })?;
        }

        state = ConnectionState::Dispatching;
        if header.cmd == cmd::QUIT && header.status == cmd::QUIT {
            state = ConnectionState::Closed;
            return Ok(());
        }

        let outcome = dispatch(header.cmd, &body, &ctx, &leader_commit);

        state = ConnectionState::WritingResponse;
        let response_header = Header::response(header.cmd, outcome.status, outcome.body.len());
        stream
            .write_all(&response_header.encode())
            .await
            .map_err(|e| TrackerError::Io { source: e, path: None })?;
        if !outcome.body.is_empty() {
            stream
                .write_all(&outcome.body)
                .await
                .map_err(|e| TrackerError::Io { source: e, path: None })?;
        }

        req_count += 1;
        if outcome.close_after {
            state = ConnectionState::Closed;
            return Ok(());
        }
        state = ConnectionState::Idle;
    }
}

/// Parses the body for a handful of fully-implemented commands and
/// routes everything else to [`handlers::handle_not_supported`].
fn dispatch(
    command: u8,
    body: &[u8],
    ctx: &ProtocolContext,
    leader_commit: &LeaderCommit,
) -> handlers::HandlerOutcome {
    match command {
        cmd::STORAGE_JOIN => dispatch_storage_join(body, ctx),
        cmd::ACTIVE_TEST if body.is_empty() => handlers::handle_active_test(),
        cmd::STORAGE_BEAT => dispatch_group_id_body(command, body, |group, id| {
            handlers::handle_storage_beat(ctx, group, id)
        }),
        cmd::TRACKER_GET_STATUS => handlers::handle_get_status(ctx),
        cmd::STORAGE_CHANGELOG_REQ => dispatch_changelog_req(body, ctx),
        cmd::SERVER_DELETE_STORAGE => dispatch_group_id_body(command, body, |group, id| {
            handlers::handle_delete_storage(ctx, group, id)
        }),
        cmd::SERVER_DELETE_GROUP => {
            if body.len() < 16 {
                return handlers::handle_not_supported(command);
            }
            let group = decode_fixed(&body[0..16]);
            handlers::handle_delete_group(ctx, &group)
        }
        cmd::SERVICE_QUERY_STORE_WITHOUT_GROUP_ONE => {
            handlers::handle_query_store_without_group_one(ctx)
        }
        cmd::SERVER_LIST_ONE_GROUP => {
            if body.len() < 16 {
                return handlers::handle_not_supported(command);
            }
            let group = decode_fixed(&body[0..16]);
            handlers::handle_list_one_group(ctx, &group)
        }
        cmd::TRACKER_NOTIFY_NEXT_LEADER => {
            let addr = String::from_utf8_lossy(body).to_string();
            handlers::handle_notify_next_leader(leader_commit, &addr)
        }
        cmd::TRACKER_COMMIT_NEXT_LEADER => {
            let addr = String::from_utf8_lossy(body).to_string();
            handlers::handle_commit_next_leader(leader_commit, &ctx.peers, &addr)
        }
        _ => handlers::handle_not_supported(command),
    }
}

/// `STORAGE_CHANGELOG_REQ` body: `offset(8)`.
fn dispatch_changelog_req(body: &[u8], ctx: &ProtocolContext) -> handlers::HandlerOutcome {
    if body.len() < 8 {
        return handlers::handle_not_supported(cmd::STORAGE_CHANGELOG_REQ);
    }
    let offset = u64::from_be_bytes(body[0..8].try_into().unwrap());
    let contents = match ctx.change_log.read_all() {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "failed to read change-log for STORAGE_CHANGELOG_REQ");
            return handlers::handle_not_supported(cmd::STORAGE_CHANGELOG_REQ);
        }
    };
    let max_body = (TRACKER_MAX_PACKAGE_SIZE as usize).saturating_sub(HEADER_LEN);
    handlers::handle_changelog_req(&contents, offset, max_body)
}

fn dispatch_group_id_body(
    command: u8,
    body: &[u8],
    f: impl FnOnce(&str, &str) -> handlers::HandlerOutcome,
) -> handlers::HandlerOutcome {
    if body.len() < 32 {
        return handlers::handle_not_supported(command);
    }
    let group = decode_fixed(&body[0..16]);
    let id = decode_fixed(&body[16..32]);
    f(&group, &id)
}

/// `STORAGE_JOIN` body: `group(16) | port(2) | http_port(2) |
/// path_count(4) | subdir_count(4) | priority(4) | join_time(8) |
/// up_time(8) | init_flag(1) | status(1) | client_ip(16, text)`.
fn dispatch_storage_join(body: &[u8], ctx: &ProtocolContext) -> handlers::HandlerOutcome {
    const MIN_LEN: usize = 16 + 2 + 2 + 4 + 4 + 4 + 8 + 8 + 1 + 1 + 16;
    if body.len() < MIN_LEN {
        return handlers::handle_not_supported(cmd::STORAGE_JOIN);
    }
    let group = decode_fixed(&body[0..16]);
    let storage_port = u16::from_be_bytes(body[16..18].try_into().unwrap());
    let storage_http_port = u16::from_be_bytes(body[18..20].try_into().unwrap());
    let store_path_count = u32::from_be_bytes(body[20..24].try_into().unwrap());
    let subdir_count_per_path = u32::from_be_bytes(body[24..28].try_into().unwrap());
    let upload_priority = i32::from_be_bytes(body[28..32].try_into().unwrap());
    let join_time = i64::from_be_bytes(body[32..40].try_into().unwrap());
    let up_time = i64::from_be_bytes(body[40..48].try_into().unwrap());
    let init_flag = body[48] != 0;
    let status = body[49];
    let client_ip_str = decode_fixed(&body[50..66]);

    let client_ip = match super::wire::parse_ip(&client_ip_str) {
        Ok(ip) => ip,
        Err(e) => return handlers::HandlerOutcome { status: e.response_code(), body: Vec::new(), close_after: true },
    };

    handlers::handle_storage_join(
        ctx,
        StorageJoinRequest {
            group,
            storage_port,
            storage_http_port,
            store_path_count,
            subdir_count_per_path,
            upload_priority,
            join_time,
            up_time,
            version: String::new(),
            domain_name: String::new(),
            init_flag,
            status,
            client_ip,
            peer_list: Vec::new(),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrackerConfig;
    use crate::identity::IdentityRegistry;
    use crate::leader::LeaderManager;
    use crate::peers::PeerSet;
    use crate::persistence::ChangeLog;
    use crate::state::ClusterState;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::duplex;

    fn test_ctx() -> ProtocolContext {
        let dir = tempfile::tempdir().unwrap();
        let change_log = ChangeLog::open(dir.path()).unwrap();
        // leaked so the temp directory backing the change-log outlives the
        // context; test processes are short-lived.
        std::mem::forget(dir);
        ProtocolContext {
            state: Arc::new(ClusterState::new()),
            peers: Arc::new(PeerSet::new()),
            identity: None::<Arc<IdentityRegistry>>,
            config: Arc::new(TrackerConfig::default()),
            upload_group_cursor: Arc::new(AtomicUsize::new(0)),
            leader_manager: Arc::new(LeaderManager::new(0)),
            change_log: Arc::new(change_log),
        }
    }

    fn storage_join_body(group: &str, client_ip: &str) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&super::super::wire::encode_fixed(group, 16));
        body.extend_from_slice(&23000u16.to_be_bytes());
        body.extend_from_slice(&8080u16.to_be_bytes());
        body.extend_from_slice(&1u32.to_be_bytes());
        body.extend_from_slice(&0u32.to_be_bytes());
        body.extend_from_slice(&0i32.to_be_bytes());
        body.extend_from_slice(&0i64.to_be_bytes());
        body.extend_from_slice(&0i64.to_be_bytes());
        body.push(1); // init_flag
        body.push(0); // status
        body.extend_from_slice(&super::super::wire::encode_fixed(client_ip, 16));
        body
    }

    #[tokio::test]
    async fn active_test_round_trips_over_a_duplex_stream() {
        let (client, server) = duplex(4096);
        let ctx = test_ctx();
        let leader_commit = Arc::new(LeaderCommit::default());
        tokio::spawn(serve_connection(server, ctx, leader_commit, Duration::from_secs(5)));

        let mut client = client;
        let header = Header {
            pkg_len: 0,
            cmd: cmd::ACTIVE_TEST,
            status: 0,
        };
        client.write_all(&header.encode()).await.unwrap();

        let mut resp_header = [0u8; HEADER_LEN];
        client.read_exact(&mut resp_header).await.unwrap();
        let decoded = Header::decode(&resp_header).unwrap();
        assert_eq!(decoded.status, 0);
        assert_eq!(decoded.pkg_len, 0);
    }

    #[tokio::test]
    async fn storage_join_then_beat_round_trips() {
        let (client, server) = duplex(8192);
        let ctx = test_ctx();
        let leader_commit = Arc::new(LeaderCommit::default());
        tokio::spawn(serve_connection(server, ctx, leader_commit, Duration::from_secs(5)));

        let mut client = client;
        let body = storage_join_body("group1", "10.0.0.5");
        let header = Header {
            pkg_len: body.len() as i64,
            cmd: cmd::STORAGE_JOIN,
            status: 0,
        };
        client.write_all(&header.encode()).await.unwrap();
        client.write_all(&body).await.unwrap();

        let mut resp_header = [0u8; HEADER_LEN];
        client.read_exact(&mut resp_header).await.unwrap();
        let decoded = Header::decode(&resp_header).unwrap();
        assert_eq!(decoded.status, 0);
        let mut resp_body = vec![0u8; decoded.pkg_len as usize];
        client.read_exact(&mut resp_body).await.unwrap();
        assert_eq!(resp_body.len(), 1);
    }

    #[tokio::test]
    async fn unsupported_command_reports_not_supported_without_closing() {
        let (client, server) = duplex(4096);
        let ctx = test_ctx();
        let leader_commit = Arc::new(LeaderCommit::default());
        tokio::spawn(serve_connection(server, ctx, leader_commit, Duration::from_secs(5)));

        let mut client = client;
        let header = Header {
            pkg_len: 0,
            cmd: cmd::STORAGE_SYNC_REPORT,
            status: 0,
        };
        client.write_all(&header.encode()).await.unwrap();

        let mut resp_header = [0u8; HEADER_LEN];
        client.read_exact(&mut resp_header).await.unwrap();
        let decoded = Header::decode(&resp_header).unwrap();
        assert_ne!(decoded.status, 0);
    }
}
