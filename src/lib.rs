//! dfs-tracker: control-plane coordinator for a distributed file-storage
//! cluster.
//!
//! A tracker holds no file bytes. It keeps the catalog of storage
//! groups and the storages within them, routes uploads and downloads to
//! the right storage, and coordinates with peer trackers so that one of
//! them is always the elected leader. Storages and client-facing
//! gateways talk to it over a small binary protocol on one TCP port.
//!
//! # Modules
//!
//! - [`identity`] (C1): the optional static storage-id table.
//! - [`state`] (C2): the in-memory group/storage catalog.
//! - [`peers`] (C3): the tracker peer list.
//! - [`leader`] (C4): leader election and the two-phase next-leader commit.
//! - [`selection`] (C5): upload/download routing policies.
//! - [`liveness`] (C6): heartbeat-timeout demotion and trunk re-election.
//! - [`protocol`] (C7): wire framing, handlers, and the connection state machine.
//! - [`persistence`] (C8): snapshot and change-log I/O.
//! - [`server`]: ties the above into a running tracker process.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use dfs_tracker::config::TrackerConfig;
//! use dfs_tracker::server::TrackerCoordinator;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = TrackerConfig::default();
//!     let coordinator = Arc::new(TrackerCoordinator::new(config)?);
//!     coordinator.run().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod identity;
pub mod leader;
pub mod liveness;
pub mod peers;
pub mod persistence;
pub mod protocol;
pub mod selection;
pub mod server;
pub mod state;
pub mod utils;

pub use config::{ConfigBuilder, TrackerConfig};
pub use error::{ErrorContext, TrackerError, TrackerResult};
pub use identity::IdentityRegistry;
pub use leader::LeaderManager;
pub use peers::PeerSet;
pub use state::ClusterState;
