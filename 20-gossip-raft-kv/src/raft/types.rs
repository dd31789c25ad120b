//! Names and views layered over raft-rs's numeric ids.
//!
//! raft-rs identifies voters by `u64`. Nodes here are named by string, so the
//! numeric id is derived from the name and the name plus consensus address
//! ride along in every `AddNode` change as a [`Peer`].

use std::collections::BTreeMap;
use std::fmt;

use raft::StateRole;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub type NodeId = String;
pub type Term = u64;
pub type LogIndex = u64;

/// Numeric raft id for a node name: the first eight bytes of its SHA-256.
///
/// Zero is reserved by raft-rs for "no node" and maps to one.
pub fn raft_id(name: &str) -> u64 {
    let digest = Sha256::digest(name.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    match u64::from_be_bytes(bytes) {
        0 => 1,
        id => id,
    }
}

/// A voter's name and consensus address, carried as the context of its
/// `AddNode` change and inside every snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: NodeId,
    pub addr: String,
}

impl Peer {
    pub fn new(id: impl Into<NodeId>, addr: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            addr: addr.into(),
        }
    }

    pub fn raft_id(&self) -> u64 {
        raft_id(&self.id)
    }
}

/// What a log entry carries, as seen by the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// An encoded [`crate::command::Command`].
    Command,
    /// A voter change, applied by the consensus layer itself.
    Configuration,
    /// Appended by every new leader so entries from earlier terms can commit.
    NoOp,
}

/// A committed entry handed to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub term: Term,
    pub index: LogIndex,
    pub kind: EntryKind,
    pub payload: Vec<u8>,
}

impl LogEntry {
    pub fn noop(term: Term, index: LogIndex) -> Self {
        Self {
            term,
            index,
            kind: EntryKind::NoOp,
            payload: Vec::new(),
        }
    }

    pub fn command(term: Term, index: LogIndex, payload: Vec<u8>) -> Self {
        Self {
            term,
            index,
            kind: EntryKind::Command,
            payload,
        }
    }

    pub fn configuration(term: Term, index: LogIndex, payload: Vec<u8>) -> Self {
        Self {
            term,
            index,
            kind: EntryKind::Configuration,
            payload,
        }
    }
}

/// The set of nodes whose votes count, keyed by id, valued by consensus address.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoterConfiguration {
    pub voters: BTreeMap<NodeId, String>,
}

impl VoterConfiguration {
    pub fn contains(&self, id: &str) -> bool {
        self.voters.contains_key(id)
    }

    pub fn address(&self, id: &str) -> Option<&str> {
        self.voters.get(id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.voters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.voters.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &NodeId> {
        self.voters.keys()
    }
}

impl FromIterator<Peer> for VoterConfiguration {
    fn from_iter<I: IntoIterator<Item = Peer>>(iter: I) -> Self {
        Self {
            voters: iter.into_iter().map(|p| (p.id, p.addr)).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl From<StateRole> for Role {
    fn from(role: StateRole) -> Self {
        match role {
            StateRole::Leader => Role::Leader,
            StateRole::Candidate | StateRole::PreCandidate => Role::Candidate,
            StateRole::Follower => Role::Follower,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Follower => "follower",
            Role::Candidate => "candidate",
            Role::Leader => "leader",
        };
        f.write_str(name)
    }
}

/// Role, term and known leader, published on every transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleState {
    pub role: Role,
    pub term: Term,
    pub leader: Option<NodeId>,
}

impl RoleState {
    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }
}

/// Point-in-time view of a node, for status endpoints and tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RaftStatus {
    pub id: NodeId,
    pub role: Role,
    pub term: Term,
    pub leader: Option<NodeId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub last_log_index: LogIndex,
    pub snapshot_index: LogIndex,
    pub voters: VoterConfiguration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
    pub configuration: VoterConfiguration,
}

/// The `data` of every raft snapshot: voter names plus the serialized store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotPayload {
    pub voters: Vec<Peer>,
    #[serde(with = "base64_bytes")]
    pub state: Vec<u8>,
}

pub(crate) mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
