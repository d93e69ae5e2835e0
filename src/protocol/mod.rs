//! Wire protocol: framing (`wire`), per-command business logic
//! (`handlers`), and the connection state machine (`dispatcher`).

pub mod dispatcher;
pub mod handlers;
pub mod wire;

pub use dispatcher::{serve_connection, ConnectionState};
pub use handlers::{HandlerOutcome, ProtocolContext, StorageJoinRequest};
