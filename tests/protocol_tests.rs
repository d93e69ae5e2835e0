use dfs_tracker::config::TrackerConfig;
use dfs_tracker::identity::IdentityRegistry;
use dfs_tracker::leader::{LeaderCommit, LeaderManager};
use dfs_tracker::peers::PeerSet;
use dfs_tracker::persistence::ChangeLog;
use dfs_tracker::protocol::serve_connection;
use dfs_tracker::protocol::wire::{cmd, encode_fixed, Header, HEADER_LEN};
use dfs_tracker::protocol::ProtocolContext;
use dfs_tracker::state::ClusterState;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn ctx() -> ProtocolContext {
    let dir = tempfile::tempdir().unwrap();
    let change_log = ChangeLog::open(dir.path()).unwrap();
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

fn join_body(group: &str, client_ip: &str) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&encode_fixed(group, 16));
    body.extend_from_slice(&23000u16.to_be_bytes());
    body.extend_from_slice(&8080u16.to_be_bytes());
    body.extend_from_slice(&1u32.to_be_bytes());
    body.extend_from_slice(&0u32.to_be_bytes());
    body.extend_from_slice(&0i32.to_be_bytes());
    body.extend_from_slice(&0i64.to_be_bytes());
    body.extend_from_slice(&0i64.to_be_bytes());
    body.push(1);
    body.push(0);
    body.extend_from_slice(&encode_fixed(client_ip, 16));
    body
}

async fn roundtrip(
    client: &mut (impl AsyncReadExt + AsyncWriteExt + Unpin),
    command: u8,
    body: &[u8],
) -> (u8, Vec<u8>) {
    let header = Header {
        pkg_len: body.len() as i64,
        cmd: command,
        status: 0,
    };
    client.write_all(&header.encode()).await.unwrap();
    if !body.is_empty() {
        client.write_all(body).await.unwrap();
    }
    let mut resp_header = [0u8; HEADER_LEN];
    client.read_exact(&mut resp_header).await.unwrap();
    let decoded = Header::decode(&resp_header).unwrap();
    let mut resp_body = vec![0u8; decoded.pkg_len as usize];
    if !resp_body.is_empty() {
        client.read_exact(&mut resp_body).await.unwrap();
    }
    (decoded.status, resp_body)
}

#[tokio::test]
async fn a_joined_storage_is_visible_through_list_one_group() {
    let (mut client, server) = tokio::io::duplex(16 * 1024);
    let ctx = ctx();
    let state = ctx.state.clone();
    tokio::spawn(serve_connection(
        server,
        ctx,
        Arc::new(LeaderCommit::default()),
        Duration::from_secs(5),
    ));

    let (status, _) = roundtrip(&mut client, cmd::STORAGE_JOIN, &join_body("group1", "10.0.0.5")).await;
    assert_eq!(status, 0);

    let (status, body) = roundtrip(&mut client, cmd::SERVER_LIST_ONE_GROUP, &encode_fixed("group1", 16)).await;
    assert_eq!(status, 0);
    assert!(!body.is_empty());

    assert_eq!(state.with_group("group1", |g| g.count()), Some(1));
}

#[tokio::test]
async fn quit_closes_the_connection_without_a_response() {
    let (mut client, server) = tokio::io::duplex(4096);
    tokio::spawn(serve_connection(
        server,
        ctx(),
        Arc::new(LeaderCommit::default()),
        Duration::from_secs(5),
    ));

    let header = Header {
        pkg_len: 0,
        cmd: cmd::QUIT,
        status: cmd::QUIT,
    };
    client.write_all(&header.encode()).await.unwrap();

    let mut buf = [0u8; 1];
    let n = client.read(&mut buf).await.unwrap();
    assert_eq!(n, 0);
}
