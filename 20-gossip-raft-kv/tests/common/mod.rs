//! In-process cluster harness shared by the integration tests.
//!
//! Nodes talk over a [`LocalNetwork`], so partitions are a function call and
//! no ports are needed.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};

use gossip_raft_kv::command::Command;
use gossip_raft_kv::config::RaftConfig;
use gossip_raft_kv::fsm::{ApplyOutcome, KvFsm};
use gossip_raft_kv::raft::storage::{LogStore, MemoryLogStore};
use gossip_raft_kv::raft::transport::{LocalNetwork, LocalTransport};
use gossip_raft_kv::raft::{Peer, RaftNode, Role};
use gossip_raft_kv::store::KvStore;

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestNode {
    pub id: String,
    pub addr: String,
    pub store: Arc<KvStore>,
    pub raft: RaftNode<LocalTransport>,
    log: MemoryLogStore,
}

pub struct TestCluster {
    pub network: LocalNetwork,
    pub config: RaftConfig,
    nodes: Vec<TestNode>,
    isolated: HashSet<String>,
}

pub fn test_config() -> RaftConfig {
    RaftConfig {
        election_timeout_min: Duration::from_millis(150),
        election_timeout_max: Duration::from_millis(300),
        heartbeat_interval: Duration::from_millis(30),
        snapshot_threshold: 0,
        max_size_per_msg: 64 * 1024,
        max_inflight_msgs: 16,
    }
}

pub fn addr_of(id: &str) -> String {
    format!("{id}:8222")
}

pub fn set(key: &str, value: &str) -> Command {
    Command::Set {
        key: key.to_string(),
        value: value.to_string(),
    }
}

/// Builds a stopped node on `network`: registers its address and feeds it
/// the messages sent there.
pub fn launch<S: LogStore>(
    network: &LocalNetwork,
    id: &str,
    config: RaftConfig,
    log: S,
    store: Arc<KvStore>,
) -> Result<RaftNode<LocalTransport>> {
    let (transport, rx) = network.register(&addr_of(id));
    let fsm = Arc::new(KvFsm::new(store));
    let raft = RaftNode::new(Peer::new(id, addr_of(id)), config, log, fsm, transport)?;
    raft.serve_local(rx);
    Ok(raft)
}

pub async fn eventually(what: &str, timeout: Duration, mut check: impl FnMut() -> bool) -> Result<()> {
    let start = Instant::now();
    loop {
        if check() {
            return Ok(());
        }
        if start.elapsed() > timeout {
            bail!("timeout waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

impl TestCluster {
    /// Bootstraps `node1`, then adds `node2..=noden` as voters one at a time.
    pub async fn start(n: usize, config: RaftConfig) -> Result<Self> {
        let mut cluster = Self {
            network: LocalNetwork::new(),
            config,
            nodes: Vec::new(),
            isolated: HashSet::new(),
        };
        let first = cluster.add_node("node1")?;
        first.raft.bootstrap()?;
        first.raft.start();
        cluster.wait_for_leader(TIMEOUT).await?;

        for i in 2..=n {
            let id = format!("node{i}");
            let node = cluster.add_node(&id)?;
            node.raft.start();
            let addr = node.addr.clone();
            let leader = cluster.wait_for_leader(TIMEOUT).await?;
            cluster.nodes[leader].raft.add_voter(&id, &addr, TIMEOUT).await?;
        }
        Ok(cluster)
    }

    /// Creates a stopped, unbootstrapped node and registers it.
    pub fn add_node(&mut self, id: &str) -> Result<&TestNode> {
        let log = MemoryLogStore::new();
        let store = Arc::new(KvStore::new());
        let raft = launch(
            &self.network,
            id,
            self.config.clone(),
            log.clone(),
            store.clone(),
        )?;
        self.nodes.push(TestNode {
            id: id.to_string(),
            addr: addr_of(id),
            store,
            raft,
            log,
        });
        Ok(&self.nodes[self.nodes.len() - 1])
    }

    /// Node by 1-based id number.
    pub fn node(&self, n: usize) -> &TestNode {
        &self.nodes[n - 1]
    }

    pub fn nodes(&self) -> &[TestNode] {
        &self.nodes
    }

    /// Index of a leader that can reach a majority, waiting for one to emerge.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<usize> {
        let start = Instant::now();
        loop {
            if let Some(index) = self.current_leader() {
                return Ok(index);
            }
            if start.elapsed() > timeout {
                bail!("timeout waiting for a leader");
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    fn current_leader(&self) -> Option<usize> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| !self.isolated.contains(&n.id) && !n.raft.is_shut_down())
            .filter(|(_, n)| n.raft.role().role == Role::Leader)
            .max_by_key(|(_, n)| n.raft.role().term)
            .map(|(i, _)| i)
    }

    pub async fn leader(&self) -> Result<&TestNode> {
        let index = self.wait_for_leader(TIMEOUT).await?;
        Ok(&self.nodes[index])
    }

    /// Writes through whichever node currently leads.
    pub async fn write(&self, command: Command) -> Result<ApplyOutcome> {
        let leader = self.leader().await?;
        Ok(leader.raft.apply_command(command, TIMEOUT).await?)
    }

    pub async fn wait_for_value(&self, key: &str, value: Option<&str>) -> Result<()> {
        for node in &self.nodes {
            if node.raft.is_shut_down() {
                continue;
            }
            let store = node.store.clone();
            eventually(&format!("{key} on {}", node.id), TIMEOUT, || {
                store.get(key).as_deref() == value
            })
            .await?;
        }
        Ok(())
    }

    pub fn isolate(&mut self, n: usize) {
        let node = &self.nodes[n - 1];
        self.network.isolate(&node.addr);
        self.isolated.insert(node.id.clone());
    }

    pub fn heal(&mut self, n: usize) {
        let node = &self.nodes[n - 1];
        self.network.heal(&node.addr);
        self.isolated.remove(&node.id);
    }

    /// Stops node `n`, waits for its worker to let go of the log, and
    /// starts a fresh instance on that log with an empty store.
    pub async fn restart(&mut self, n: usize) -> Result<()> {
        let old = self.nodes[n - 1].raft.clone();
        old.shutdown();
        old.wait_stopped().await;

        let store = Arc::new(KvStore::new());
        let log = self.nodes[n - 1].log.clone();
        let raft = launch(
            &self.network,
            &self.nodes[n - 1].id,
            self.config.clone(),
            log,
            store.clone(),
        )?;
        raft.start();
        let node = &mut self.nodes[n - 1];
        node.raft = raft;
        node.store = store;
        Ok(())
    }

    pub fn shutdown(self) {
        for node in &self.nodes {
            node.raft.shutdown();
        }
    }
}
