//! Command-line flags and the typed configuration built from them.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;

/// Flags for a single store node.
#[derive(Debug, Clone, Parser)]
#[command(name = "gossip-raft-kv", version, about = "Gossip-discovered, Raft-replicated key-value store")]
pub struct Cli {
    /// Unique id of this node within the cluster
    #[arg(long, default_value = "node1")]
    pub node_id: String,

    /// Port for the client HTTP API
    #[arg(long, default_value_t = 2222)]
    pub http_port: u16,

    /// Port for consensus RPCs
    #[arg(long, default_value_t = 8222)]
    pub raft_port: u16,

    /// Port for gossip exchanges
    #[arg(long, default_value_t = 7946)]
    pub gossip_port: u16,

    /// Gossip address of any existing member; omit to bootstrap a new cluster
    #[arg(long)]
    pub join: Option<String>,

    /// Host other nodes use to reach this one
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Directory holding the persisted log and snapshots
    #[arg(long, default_value = "data")]
    pub data_dir: PathBuf,

    #[arg(long, default_value_t = 150)]
    pub election_timeout_min_ms: u64,

    #[arg(long, default_value_t = 300)]
    pub election_timeout_max_ms: u64,

    #[arg(long, default_value_t = 50)]
    pub heartbeat_ms: u64,

    /// Applied entries between automatic snapshots
    #[arg(long, default_value_t = 1024)]
    pub snapshot_threshold: u64,

    /// How long a write waits for its entry to apply
    #[arg(long, default_value_t = 3000)]
    pub apply_timeout_ms: u64,

    #[arg(long, default_value_t = 1000)]
    pub gossip_interval_ms: u64,

    /// Period of the membership report in the log
    #[arg(long, default_value_t = 5)]
    pub report_interval_secs: u64,
}

/// Timing and compaction knobs of the consensus engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaftConfig {
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub heartbeat_interval: Duration,
    /// Applied entries since the last snapshot that trigger a new one.
    /// Zero disables automatic snapshots.
    pub snapshot_threshold: u64,
    /// Byte budget of the entries in one append message; at least one
    /// entry is always sent.
    pub max_size_per_msg: u64,
    /// Append messages in flight to one follower before waiting for acks.
    pub max_inflight_msgs: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(50),
            snapshot_threshold: 1024,
            max_size_per_msg: 1024 * 1024,
            max_inflight_msgs: 256,
        }
    }
}

impl RaftConfig {
    pub fn validate(&self) -> Result<()> {
        if self.election_timeout_min >= self.election_timeout_max {
            bail!(
                "election timeout range is empty: min {:?} must be below max {:?}",
                self.election_timeout_min,
                self.election_timeout_max
            );
        }
        if self.heartbeat_interval >= self.election_timeout_min {
            bail!(
                "heartbeat interval {:?} must be smaller than the minimum election timeout {:?}",
                self.heartbeat_interval,
                self.election_timeout_min
            );
        }
        if self.max_inflight_msgs == 0 {
            bail!("max_inflight_msgs must be at least 1");
        }
        Ok(())
    }
}

/// Everything [`crate::runtime::spawn_node`] needs to start a node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: String,
    /// Bind addresses.
    pub http_addr: SocketAddr,
    pub raft_addr: SocketAddr,
    pub gossip_addr: SocketAddr,
    /// Host advertised to other members.
    pub advertise_host: String,
    pub join: Option<String>,
    pub data_dir: PathBuf,
    pub raft: RaftConfig,
    pub apply_timeout: Duration,
    pub gossip_interval: Duration,
    pub report_interval: Duration,
}

impl NodeConfig {
    pub fn advertised(&self, addr: SocketAddr) -> String {
        format!("{}:{}", self.advertise_host, addr.port())
    }
}

impl TryFrom<Cli> for NodeConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self> {
        if cli.node_id.trim().is_empty() {
            bail!("--node-id must not be empty");
        }
        let bind = |port: u16| -> Result<SocketAddr> {
            format!("0.0.0.0:{port}")
                .parse()
                .with_context(|| format!("invalid port {port}"))
        };
        let raft = RaftConfig {
            election_timeout_min: Duration::from_millis(cli.election_timeout_min_ms),
            election_timeout_max: Duration::from_millis(cli.election_timeout_max_ms),
            heartbeat_interval: Duration::from_millis(cli.heartbeat_ms),
            snapshot_threshold: cli.snapshot_threshold,
            ..RaftConfig::default()
        };
        raft.validate()?;

        Ok(Self {
            http_addr: bind(cli.http_port)?,
            raft_addr: bind(cli.raft_port)?,
            gossip_addr: bind(cli.gossip_port)?,
            advertise_host: cli.host,
            join: cli.join.filter(|seed| !seed.is_empty()),
            data_dir: cli.data_dir,
            raft,
            apply_timeout: Duration::from_millis(cli.apply_timeout_ms),
            gossip_interval: Duration::from_millis(cli.gossip_interval_ms),
            report_interval: Duration::from_secs(cli.report_interval_secs),
            node_id: cli.node_id,
        })
    }
}
