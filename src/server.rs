//! Top-level tracker process orchestrator: ties C1-C8 into a TCP
//! accept loop plus the two background schedulers (spec §4.3, §4.4,
//! §5 "Scheduling model").

use crate::config::TrackerConfig;
use crate::error::{TrackerError, TrackerResult};
use crate::identity::IdentityRegistry;
use crate::leader::{LeaderManager, PeerClient, PeerStatus};
use crate::peers::{Peer, PeerSet};
use crate::persistence::{ChangeLog, Snapshots};
use crate::protocol::{serve_connection, ProtocolContext};
use crate::state::ClusterState;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tracing::{error, info, warn};

/// Admin-facing snapshot of tracker health, not wire-exposed (§3 of
/// the expanded spec's supplemented-features section).
#[derive(Debug, Clone)]
pub struct TrackerStats {
    pub group_count: usize,
    pub storage_count: usize,
    pub active_storage_count: usize,
    pub is_leader: bool,
    pub leader_addr: Option<String>,
    pub uptime_secs: i64,
}

/// Owns every long-lived piece of tracker state and runs the accept
/// loop plus both background schedulers until shutdown is requested.
pub struct TrackerCoordinator {
    config: Arc<TrackerConfig>,
    state: Arc<ClusterState>,
    peers: Arc<PeerSet>,
    identity: Option<Arc<IdentityRegistry>>,
    leader_commit: Arc<crate::leader::LeaderCommit>,
    leader_manager: Arc<LeaderManager>,
    snapshots: Arc<Snapshots>,
    change_log: Arc<ChangeLog>,
    process_start: i64,
    shutdown: Arc<Notify>,
    shutting_down: Arc<AtomicBool>,
}

impl TrackerCoordinator {
    pub fn new(config: TrackerConfig) -> TrackerResult<TrackerCoordinator> {
        let now = now_secs();
        let snapshots = Snapshots::new(config.base_path.clone());
        let change_log = Arc::new(ChangeLog::open(&config.base_path)?);
        let state = ClusterState::new().with_change_log(change_log.clone());
        Ok(TrackerCoordinator {
            config: Arc::new(config),
            state: Arc::new(state),
            peers: Arc::new(PeerSet::new()),
            identity: None,
            leader_commit: Arc::new(crate::leader::LeaderCommit::new()),
            leader_manager: Arc::new(LeaderManager::new(now)),
            snapshots: Arc::new(snapshots),
            change_log,
            process_start: now,
            shutdown: Arc::new(Notify::new()),
            shutting_down: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn with_identity(mut self, registry: IdentityRegistry) -> Self {
        self.identity = Some(Arc::new(registry));
        self
    }

    pub fn local_addr(&self) -> String {
        format!("{}:{}", self.config.bind_address, self.config.port)
    }

    pub fn stats(&self) -> TrackerStats {
        let names = self.state.group_names();
        let mut storage_count = 0;
        let mut active_storage_count = 0;
        for name in &names {
            if let Some((c, a)) = self.state.with_group(name, |g| (g.count(), g.active_count())) {
                storage_count += c;
                active_storage_count += a;
            }
        }
        let leader = self.peers.leader();
        TrackerStats {
            group_count: names.len(),
            storage_count,
            active_storage_count,
            is_leader: leader.as_ref().map(|p| p.is_local).unwrap_or(false),
            leader_addr: leader.map(|p| p.addr()),
            uptime_secs: crate::utils::elapsed_secs(self.process_start, now_secs()),
        }
    }

    /// Restores state from disk, starts the accept loop and both
    /// background schedulers, and waits for a shutdown request. Waits
    /// up to 30s for tasks to drain before returning (spec §5).
    pub async fn run(self: Arc<Self>) -> TrackerResult<()> {
        self.snapshots.load_all(&self.state)?;

        let listener = TcpListener::bind((self.config.bind_address.as_str(), self.config.port))
            .await
            .map_err(|e| TrackerError::Io { source: e, path: None })?;
        info!(addr = %self.local_addr(), "tracker listening");

        let accept = {
            let this = self.clone();
            tokio::spawn(async move { this.accept_loop(listener).await })
        };
        let relationship = {
            let this = self.clone();
            tokio::spawn(async move { this.relationship_loop().await })
        };
        let liveness = {
            let this = self.clone();
            tokio::spawn(async move { this.liveness_loop().await })
        };

        self.shutdown.notified().await;
        self.shutting_down.store(true, Ordering::SeqCst);
        info!("shutdown requested, waiting up to 30s for background tasks to drain");

        let drain = async {
            let _ = accept.await;
            let _ = relationship.await;
            let _ = liveness.await;
        };
        if tokio::time::timeout(Duration::from_secs(30), drain).await.is_err() {
            warn!("graceful shutdown timed out after 30s, exiting anyway");
        }
        Ok(())
    }

    pub fn request_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.shutdown.notify_waiters();
    }

    fn protocol_context(&self) -> ProtocolContext {
        ProtocolContext {
            state: self.state.clone(),
            peers: self.peers.clone(),
            identity: self.identity.clone(),
            config: self.config.clone(),
            upload_group_cursor: Arc::new(AtomicUsize::new(0)),
            leader_manager: self.leader_manager.clone(),
            change_log: self.change_log.clone(),
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            if self.shutting_down.load(Ordering::SeqCst) {
                return;
            }
            let (socket, peer_addr) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };
            let ctx = self.protocol_context();
            let leader_commit = self.leader_commit.clone();
            let network_timeout = self.config.network_timeout;
            tokio::spawn(async move {
                if let Err(e) = serve_connection(socket, ctx, leader_commit, network_timeout).await {
                    warn!(peer = %peer_addr, error = %e, "connection ended with error");
                }
            });
        }
    }

    async fn relationship_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.relationship_check_interval);
        loop {
            ticker.tick().await;
            if self.shutting_down.load(Ordering::SeqCst) {
                return;
            }
            let client = WireClient {
                network_timeout: self.config.network_timeout,
            };
            let local_addr = self.local_addr();
            match self
                .leader_manager
                .run_tick(&local_addr, &self.peers, &client, now_secs())
                .await
            {
                Ok(outcome) => info!(?outcome, "relationship check completed"),
                Err(e) => error!(error = %e, "relationship check failed"),
            }
            self.peers.retire_dirty();
        }
    }

    /// One liveness-supervisor tick per group (spec §4.4): demotes
    /// storages whose heartbeat is stale, capped at
    /// [`crate::liveness::FDFS_MAX_SERVERS_EACH_GROUP`] per group.
    async fn liveness_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.check_active_interval);
        loop {
            ticker.tick().await;
            if self.shutting_down.load(Ordering::SeqCst) {
                return;
            }
            let now = now_secs();
            for name in self.state.group_names() {
                let snapshots: Vec<crate::liveness::HeartbeatSnapshot> = self
                    .state
                    .with_group(&name, |g| {
                        g.active_storages
                            .iter()
                            .map(|&idx| crate::liveness::HeartbeatSnapshot {
                                storage_ref: crate::state::storage::StorageRef {
                                    group_idx: 0,
                                    storage_idx: idx,
                                },
                                last_heartbeat: g.storages[idx].last_heartbeat,
                            })
                            .collect()
                    })
                    .unwrap_or_default();

                let stale = crate::liveness::storages_to_demote(
                    &snapshots,
                    now,
                    self.config.check_active_interval.as_secs() as i64,
                );
                for s_ref in stale {
                    let id = self
                        .state
                        .with_group(&name, |g| g.storages[s_ref.storage_idx].id.clone());
                    if let Some(id) = id {
                        if let Err(e) = self.state.offline_storage(&name, &id) {
                            warn!(group = %name, id, error = %e, "failed to demote stale storage");
                        } else {
                            info!(group = %name, id, "storage demoted for stale heartbeat");
                        }
                    }
                }
            }
        }
    }
}

fn now_secs() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Real-socket implementation of [`PeerClient`], driving the same wire
/// protocol the dispatcher serves on the other end (spec §4.3).
struct WireClient {
    network_timeout: Duration,
}

impl WireClient {
    async fn roundtrip(&self, peer: &Peer, cmd: u8, body: Vec<u8>) -> TrackerResult<(u8, Vec<u8>)> {
        let addr = peer.addr();
        let mut stream = tokio::time::timeout(self.network_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| TrackerError::NetworkTimeout(format!("connect to {} timed out", addr)))?
            .map_err(|e| TrackerError::Io { source: e, path: None })?;

        let header = crate::protocol::wire::Header {
            pkg_len: body.len() as i64,
            cmd,
            status: 0,
        };
        stream
            .write_all(&header.encode())
            .await
            .map_err(|e| TrackerError::Io { source: e, path: None })?;
        if !body.is_empty() {
            stream
                .write_all(&body)
                .await
                .map_err(|e| TrackerError::Io { source: e, path: None })?;
        }

        let mut resp_header = [0u8; crate::protocol::wire::HEADER_LEN];
        tokio::time::timeout(self.network_timeout, stream.read_exact(&mut resp_header))
            .await
            .map_err(|_| TrackerError::NetworkTimeout(format!("{} did not respond in time", addr)))?
            .map_err(|e| TrackerError::Io { source: e, path: None })?;
        let decoded = crate::protocol::wire::Header::decode(&resp_header)?;
        let mut resp_body = vec![0u8; decoded.pkg_len as usize];
        if !resp_body.is_empty() {
            stream
                .read_exact(&mut resp_body)
                .await
                .map_err(|e| TrackerError::Io { source: e, path: None })?;
        }
        Ok((decoded.status, resp_body))
    }
}

#[async_trait]
impl PeerClient for WireClient {
    async fn get_status(&self, peer: &Peer) -> TrackerResult<PeerStatus> {
        let (status, body) = self
            .roundtrip(peer, crate::protocol::wire::cmd::TRACKER_GET_STATUS, Vec::new())
            .await?;
        if status != 0 || body.len() < 17 {
            return Err(TrackerError::Protocol(format!(
                "bad TRACKER_GET_STATUS response from {}",
                peer.addr()
            )));
        }
        Ok(PeerStatus {
            addr: peer.addr(),
            running_time: i64::from_be_bytes(body[0..8].try_into().unwrap()),
            restart_interval: i64::from_be_bytes(body[8..16].try_into().unwrap()),
            is_leader: body[16] != 0,
        })
    }

    async fn notify_next_leader(&self, peer: &Peer, leader_addr: &str) -> TrackerResult<()> {
        self.roundtrip(
            peer,
            crate::protocol::wire::cmd::TRACKER_NOTIFY_NEXT_LEADER,
            leader_addr.as_bytes().to_vec(),
        )
        .await?;
        Ok(())
    }

    async fn commit_next_leader(&self, peer: &Peer, leader_addr: &str) -> TrackerResult<()> {
        let (status, _) = self
            .roundtrip(
                peer,
                crate::protocol::wire::cmd::TRACKER_COMMIT_NEXT_LEADER,
                leader_addr.as_bytes().to_vec(),
            )
            .await?;
        if status != 0 {
            return Err(TrackerError::Protocol(format!("{} rejected commit", peer.addr())));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_report_zero_on_fresh_coordinator() {
        let base_path = std::env::temp_dir()
            .join("dfs-tracker-server-test")
            .to_string_lossy()
            .to_string();
        std::fs::create_dir_all(&base_path).unwrap();
        let coordinator = TrackerCoordinator::new(TrackerConfig {
            base_path,
            ..TrackerConfig::default()
        })
        .unwrap();
        let stats = coordinator.stats();
        assert_eq!(stats.group_count, 0);
        assert_eq!(stats.storage_count, 0);
        assert!(!stats.is_leader);
    }
}
