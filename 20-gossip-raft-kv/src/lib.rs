//! Gossip-discovered, Raft-replicated key-value store.
//!
//! Every node keeps a full copy of a string-to-string map. Writes go through
//! the Raft leader and apply on every node in log order; reads are served
//! from the local copy. Nodes find each other through gossip, and the leader
//! turns each newly discovered node into a voter.
//!
//! # Architecture
//!
//! Each node runs one consensus worker thread next to a set of tokio tasks
//! sharing one shutdown signal:
//!
//! - **Consensus worker**: owns the raft-rs `RawNode`, the RocksDB log and
//!   the state machine; ticks, steps messages and applies committed entries
//! - **Dispatcher**: one sender task per peer carrying outbound messages
//! - **Gossip**: periodic push-pull exchange plus a membership reporter
//! - **Bridge**: feeds gossip joins into voter configuration changes
//! - **Servers**: axum routers for clients, consensus messages and gossip
//!
//! The async side reaches the worker only through channels and reads its
//! role and status from `watch` channels, so durable writes never run on a
//! tokio thread.
//!
//! # Modules
//!
//! - [`raft`]: consensus worker, durable log and message transport
//! - [`fsm`]: applies committed commands to the [`store`]
//! - [`membership`]: gossip directory and exchange protocol
//! - [`bridge`]: membership-to-voter bridge
//! - [`gateway`]: leader-only write path
//! - [`http`]: client HTTP API
//! - [`config`]: command-line flags and typed configuration
//! - [`runtime`]: spawns and wires a node
//! - [`command`]: commands replicated through the log
//! - [`error`]: error types

pub mod bridge;
pub mod command;
pub mod config;
pub mod error;
pub mod fsm;
pub mod gateway;
pub mod http;
pub mod membership;
pub mod raft;
pub mod runtime;
pub mod store;
