//! Process wiring for one store node.
//!
//! [`spawn_node`] binds the three listeners, opens durable state on a
//! blocking thread, starts the consensus node and the gossip, bridge and
//! reporter tasks, and serves:
//!
//! - the client API ([`crate::http`]) on the HTTP port
//! - consensus RPCs ([`crate::raft::api`]) on the raft port
//! - push-pull exchanges ([`crate::membership::gossip`]) on the gossip port
//!
//! Every task listens to one shutdown signal owned by the returned
//! [`NodeHandle`].

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::bridge::VoterBridge;
use crate::config::NodeConfig;
use crate::fsm::KvFsm;
use crate::gateway::WriteGateway;
use crate::membership::gossip::{self, Gossiper};
use crate::membership::{ClusterNode, MembershipDirectory};
use crate::raft::storage::RocksLogStore;
use crate::raft::transport::HttpTransport;
use crate::raft::{api, Peer, RaftNode};
use crate::store::KvStore;

/// Timeout of one consensus RPC or gossip exchange.
const RPC_TIMEOUT: Duration = Duration::from_secs(2);

/// How long shutdown waits for servers to drain.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Addresses the node actually listens on.
#[derive(Debug, Clone, Copy)]
pub struct BoundAddrs {
    pub http: SocketAddr,
    pub raft: SocketAddr,
    pub gossip: SocketAddr,
}

/// A running node. Dropping it leaves the tasks running; call
/// [`NodeHandle::shutdown`] to stop them.
pub struct NodeHandle {
    node: RaftNode<HttpTransport>,
    store: Arc<KvStore>,
    directory: Arc<MembershipDirectory>,
    gossiper: Gossiper,
    addrs: BoundAddrs,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl NodeHandle {
    pub fn raft(&self) -> &RaftNode<HttpTransport> {
        &self.node
    }

    pub fn store(&self) -> &Arc<KvStore> {
        &self.store
    }

    pub fn directory(&self) -> &Arc<MembershipDirectory> {
        &self.directory
    }

    pub fn addrs(&self) -> BoundAddrs {
        self.addrs
    }

    /// Resolves with the reason once consensus halted on a storage or apply
    /// failure.
    pub async fn wait_fatal(&self) -> String {
        self.node.wait_fatal().await
    }

    /// Announces departure through gossip, then stops every task and waits
    /// for the consensus worker to close the log store.
    pub async fn shutdown(self) {
        info!(node = %self.node.id(), "stopping node");
        self.gossiper.leave().await;
        self.shutdown_tx.send_replace(true);
        self.node.shutdown();
        for task in self.tasks {
            let abort = task.abort_handle();
            if tokio::time::timeout(DRAIN_TIMEOUT, task).await.is_err() {
                warn!("task did not stop in time, aborting");
                abort.abort();
            }
        }
        if tokio::time::timeout(DRAIN_TIMEOUT, self.node.wait_stopped()).await.is_err() {
            warn!(node = %self.node.id(), "consensus worker did not stop in time");
        }
    }
}

/// Starts a node described by `config`.
///
/// Without a join seed the node bootstraps a single-voter cluster (a no-op
/// when durable state already exists). With a seed it joins through gossip
/// and waits for the leader to add it as a voter.
pub async fn spawn_node(config: NodeConfig) -> Result<NodeHandle> {
    let http_listener = bind(config.http_addr, "client api").await?;
    let raft_listener = bind(config.raft_addr, "consensus").await?;
    let gossip_listener = bind(config.gossip_addr, "gossip").await?;
    let addrs = BoundAddrs {
        http: http_listener.local_addr()?,
        raft: raft_listener.local_addr()?,
        gossip: gossip_listener.local_addr()?,
    };
    let local = ClusterNode::new(
        config.node_id.clone(),
        config.advertised(addrs.http),
        config.advertised(addrs.raft),
        config.advertised(addrs.gossip),
    );

    let store = Arc::new(KvStore::new());
    let fsm = Arc::new(KvFsm::new(store.clone()));
    let transport = HttpTransport::new(RPC_TIMEOUT).context("failed to build consensus transport")?;
    let peer = Peer::new(config.node_id.clone(), local.raft_addr.clone());
    let data_dir = config.data_dir.clone();
    let raft_config = config.raft.clone();
    let bootstrap = config.join.is_none();
    let node = tokio::task::spawn_blocking(move || -> Result<RaftNode<HttpTransport>> {
        let log_store = RocksLogStore::open(&data_dir, &peer.id)
            .with_context(|| format!("failed to open durable state under {}", data_dir.display()))?;
        let node = RaftNode::new(peer, raft_config, log_store, fsm, transport)
            .context("failed to load consensus state")?;
        if bootstrap && node.bootstrap()? {
            info!(node = %node.id(), "bootstrapped new cluster");
        }
        Ok(node)
    })
    .await
    .context("consensus startup task failed")??;
    node.start();

    let directory = Arc::new(MembershipDirectory::new(local));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let gateway = Arc::new(WriteGateway::new(
        Arc::new(node.clone()),
        store.clone(),
        config.apply_timeout,
    ));

    let mut tasks = vec![
        serve(http_listener, crate::http::router(gateway), shutdown_rx.clone(), "client api"),
        serve(raft_listener, api::router(node.clone()), shutdown_rx.clone(), "consensus"),
        serve(
            gossip_listener,
            gossip::router(directory.clone()),
            shutdown_rx.clone(),
            "gossip",
        ),
    ];

    let gossiper = Gossiper::new(directory.clone(), config.join.clone(), RPC_TIMEOUT)?;
    let mut handle = NodeHandle {
        node: node.clone(),
        store,
        directory: directory.clone(),
        gossiper: gossiper.clone(),
        addrs,
        shutdown_tx,
        tasks: Vec::new(),
    };

    if let Err(err) = gossiper.join().await {
        handle.tasks = tasks;
        handle.shutdown().await;
        return Err(err);
    }

    tasks.push(tokio::spawn(
        gossiper.run(config.gossip_interval, shutdown_rx.clone()),
    ));
    tasks.push(tokio::spawn(gossip::run_reporter(
        directory.clone(),
        config.report_interval,
        shutdown_rx.clone(),
    )));
    tasks.push(
        VoterBridge::new(Arc::new(node), directory, config.apply_timeout).spawn(shutdown_rx),
    );
    handle.tasks = tasks;

    info!(
        node = %config.node_id,
        http = %addrs.http,
        raft = %addrs.raft,
        gossip = %addrs.gossip,
        "node started"
    );
    Ok(handle)
}

async fn bind(addr: SocketAddr, what: &str) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {what} listener on {addr}"))
}

fn serve(
    listener: TcpListener,
    app: Router,
    shutdown: watch::Receiver<bool>,
    what: &'static str,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app)
            .with_graceful_shutdown(stopped(shutdown))
            .await
        {
            error!(server = what, %err, "server failed");
        }
    })
}

fn stopped(mut shutdown: watch::Receiver<bool>) -> impl Future<Output = ()> + Send + 'static {
    async move {
        let _ = shutdown.wait_for(|stop| *stop).await;
    }
}
