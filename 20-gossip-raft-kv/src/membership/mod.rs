//! Gossip-based cluster membership.
//!
//! Nodes find each other through push-pull exchanges of their member lists.
//! The [`directory::MembershipDirectory`] owns the merged view and announces
//! joins and departures on a broadcast channel; the consensus layer only ever
//! sees copies of [`ClusterNode`].

pub mod directory;
pub mod gossip;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use directory::MembershipDirectory;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberState {
    Alive,
    Suspect,
    Dead,
}

impl fmt::Display for MemberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MemberState::Alive => "alive",
            MemberState::Suspect => "suspect",
            MemberState::Dead => "dead",
        };
        f.write_str(name)
    }
}

/// One member as seen through gossip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterNode {
    pub id: String,
    /// Client HTTP API address.
    pub api_addr: String,
    /// Consensus RPC address; what the voter configuration records.
    pub raft_addr: String,
    pub gossip_addr: String,
    pub state: MemberState,
    /// Bumped by the node itself; orders conflicting reports about it.
    pub incarnation: u64,
}

impl ClusterNode {
    pub fn new(
        id: impl Into<String>,
        api_addr: impl Into<String>,
        raft_addr: impl Into<String>,
        gossip_addr: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            api_addr: api_addr.into(),
            raft_addr: raft_addr.into(),
            gossip_addr: gossip_addr.into(),
            state: MemberState::Alive,
            incarnation: 0,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.state == MemberState::Alive
    }
}

/// Change in membership delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    Joined(ClusterNode),
    Left(ClusterNode),
}
