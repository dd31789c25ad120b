//! Error types shared by the consensus engine, the FSM and the gateway.
//!
//! Transport failures never leave the per-peer senders.
//! Apply and storage failures are fatal: the node halts instead of risking a
//! divergent state.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::raft::types::{LogIndex, NodeId};

/// Errors surfaced to callers of the consensus engine and the gateway.
#[derive(Debug, Error)]
pub enum KvError {
    /// Writes must go to the leader; `leader` is the last one this node heard from.
    #[error("node is not the leader{}", leader_hint(.leader))]
    NotLeader { leader: Option<NodeId> },

    /// The caller stopped waiting. The entry may still commit and apply.
    #[error("timed out waiting for the entry to commit; it may still be applied")]
    Timeout,

    /// This node stepped down before the entry committed. The entry may still
    /// commit under the next leader.
    #[error("leadership lost before the entry committed; it may still be applied")]
    LeadershipLost,

    #[error("failed to apply committed entry: {0}")]
    Apply(#[from] ApplyError),

    /// The change can never succeed as asked, e.g. the id is already a voter
    /// at another address.
    #[error("configuration change rejected: {0}")]
    ConfigChange(String),

    /// An earlier change has not applied yet; retry once it has.
    #[error("another configuration change is still uncommitted")]
    ConfigChangePending,

    #[error("consensus engine: {0}")]
    Raft(#[from] raft::Error),

    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("node is shutting down")]
    Shutdown,
}

fn leader_hint(leader: &Option<NodeId>) -> String {
    match leader {
        Some(id) => format!(" (leader is {id})"),
        None => String::new(),
    }
}

/// A committed entry could not be applied to the state machine.
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("entry {index} does not decode as a command: {source}")]
    Decode {
        index: LogIndex,
        #[source]
        source: serde_json::Error,
    },

    #[error("snapshot could not be encoded or decoded: {0}")]
    Snapshot(#[from] serde_json::Error),

    #[error("snapshot stream failed: {0}")]
    Io(#[from] io::Error),

    #[error("entry {index} does not decode as a configuration change: {source}")]
    ConfChange {
        index: LogIndex,
        #[source]
        source: prost::DecodeError,
    },
}

/// Durable log, hard state, or snapshot I/O failed.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("rocksdb: {0}")]
    Db(#[from] rocksdb::Error),

    #[error("corrupt persisted state in {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("{path} belongs to raft id {stored}, not {requested}")]
    NodeMismatch {
        path: PathBuf,
        stored: u64,
        requested: u64,
    },

    #[error("log store: {0}")]
    Raft(#[from] raft::Error),
}

impl StorageError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        StorageError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        StorageError::Corrupt {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

/// An RPC to a peer failed. Retried inside the consensus loops.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer {0} is unreachable")]
    Unreachable(String),

    #[error("rpc to {0} timed out")]
    Timeout(String),

    #[error("peer {addr} answered with status {status}")]
    Status { addr: String, status: u16 },

    #[error("http transport: {0}")]
    Http(#[from] reqwest::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_leader_mentions_known_leader() {
        let err = KvError::NotLeader {
            leader: Some("node2".into()),
        };
        assert_eq!(err.to_string(), "node is not the leader (leader is node2)");

        let err = KvError::NotLeader { leader: None };
        assert_eq!(err.to_string(), "node is not the leader");
    }

    #[test]
    fn pending_change_is_distinct_from_rejection() {
        assert_eq!(
            KvError::ConfigChangePending.to_string(),
            "another configuration change is still uncommitted"
        );
        assert!(!matches!(KvError::ConfigChangePending, KvError::ConfigChange(_)));
    }

    #[test]
    fn timeout_does_not_claim_failure() {
        assert!(KvError::Timeout.to_string().contains("may still be applied"));
    }
}
