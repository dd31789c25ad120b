//! Raft consensus on top of raft-rs: leader election, log replication,
//! snapshots and single-server membership changes.
//!
//! - [`worker`]: the thread that owns the `RawNode`, its store and the FSM
//! - [`node`]: async handle on the worker plus the outbound dispatcher
//! - [`storage`]: durable log, hard state and snapshots in RocksDB
//! - [`transport`]: HTTP and in-process message delivery
//! - [`api`]: axum route accepting peers' messages

pub mod api;
pub mod node;
pub mod storage;
pub mod transport;
pub mod types;
mod worker;

pub use node::RaftNode;
pub use transport::Envelope;
pub use types::{LogEntry, LogIndex, NodeId, Peer, RaftStatus, Role, RoleState, Term};
