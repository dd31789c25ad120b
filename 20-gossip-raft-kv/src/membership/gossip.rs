//! Push-pull gossip over HTTP.
//!
//! Each round a node posts its full member list to one random alive peer and
//! merges the list it gets back. A new node does the same against its seed to
//! join. Lists are small (one entry per node), so full-state exchange keeps
//! the protocol trivial.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{ClusterNode, MembershipDirectory};

pub const EXCHANGE_PATH: &str = "/gossip/exchange";

/// Attempts made against the seed before giving up on the initial join.
const JOIN_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Digest {
    pub from: String,
    pub members: Vec<ClusterNode>,
}

/// Builds the router answering push-pull exchanges.
pub fn router(directory: Arc<MembershipDirectory>) -> Router {
    Router::new()
        .route(EXCHANGE_PATH, post(handle_exchange))
        .with_state(directory)
}

async fn handle_exchange(
    State(directory): State<Arc<MembershipDirectory>>,
    Json(digest): Json<Digest>,
) -> Json<Digest> {
    debug!(from = %digest.from, members = digest.members.len(), "gossip exchange");
    directory.merge(digest.members);
    Json(Digest {
        from: directory.local_id().to_string(),
        members: directory.members(),
    })
}

/// Client side of the gossip protocol for one node.
#[derive(Debug, Clone)]
pub struct Gossiper {
    directory: Arc<MembershipDirectory>,
    client: reqwest::Client,
    seed: Option<String>,
}

impl Gossiper {
    pub fn new(directory: Arc<MembershipDirectory>, seed: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build gossip http client")?;
        Ok(Self {
            directory,
            client,
            seed,
        })
    }

    pub fn directory(&self) -> &Arc<MembershipDirectory> {
        &self.directory
    }

    /// One push-pull round with the node gossiping at `addr`.
    pub async fn exchange(&self, addr: &str) -> Result<()> {
        let digest = Digest {
            from: self.directory.local_id().to_string(),
            members: self.directory.members(),
        };
        let reply: Digest = self
            .client
            .post(format!("http://{addr}{EXCHANGE_PATH}"))
            .json(&digest)
            .send()
            .await
            .with_context(|| format!("gossip exchange with {addr} failed"))?
            .error_for_status()
            .with_context(|| format!("gossip peer {addr} rejected the exchange"))?
            .json()
            .await
            .with_context(|| format!("gossip peer {addr} sent an unreadable digest"))?;
        self.directory.merge(reply.members);
        Ok(())
    }

    /// Joins the cluster through the seed, retrying with backoff.
    pub async fn join(&self) -> Result<()> {
        let Some(seed) = self.seed.as_deref() else {
            return Ok(());
        };
        let mut delay = Duration::from_millis(100);
        let mut last_err = None;
        for attempt in 1..=JOIN_ATTEMPTS {
            match self.exchange(seed).await {
                Ok(()) => {
                    info!(seed, members = self.directory.members().len(), "joined cluster");
                    return Ok(());
                }
                Err(err) => {
                    warn!(seed, attempt, "join attempt failed: {err:#}");
                    last_err = Some(err);
                    sleep(delay).await;
                    delay *= 2;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("no join attempts made")))
            .with_context(|| format!("could not join cluster through seed {seed}"))
    }

    /// Gossip target for the next round: a random alive peer, or the seed
    /// while no peer is known.
    fn pick_target(&self) -> Option<String> {
        let local = self.directory.local_id();
        let peers: Vec<String> = self
            .directory
            .alive_members()
            .into_iter()
            .filter(|n| n.id != local)
            .map(|n| n.gossip_addr)
            .collect();
        peers
            .choose(&mut rand::thread_rng())
            .cloned()
            .or_else(|| self.seed.clone())
    }

    /// Runs push-pull rounds every `period` until `shutdown` flips.
    pub async fn run(self, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
            let Some(target) = self.pick_target() else {
                continue;
            };
            if let Err(err) = self.exchange(&target).await {
                debug!(target = %target, "gossip round failed: {err:#}");
            }
        }
    }

    /// Marks this node dead and tells every alive peer, best effort.
    pub async fn leave(&self) {
        if self.directory.leave().is_none() {
            return;
        }
        let local = self.directory.local_id().to_string();
        for peer in self.directory.alive_members() {
            if peer.id == local {
                continue;
            }
            if let Err(err) = self.exchange(&peer.gossip_addr).await {
                debug!(peer = %peer.id, "leave notice not delivered: {err:#}");
            }
        }
    }
}

/// Logs the member list every `period` until `shutdown` flips.
pub async fn run_reporter(
    directory: Arc<MembershipDirectory>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }
        let members = directory.members();
        let summary: Vec<String> = members
            .iter()
            .map(|n| format!("{}@{} ({})", n.id, n.gossip_addr, n.state))
            .collect();
        info!(count = members.len(), members = %summary.join(", "), "cluster members");
    }
}
