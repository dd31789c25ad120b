//! Gossip-discovered nodes becoming voters through the bridge.

mod common;

use std::sync::Arc;

use anyhow::Result;
use common::{eventually, set, TestCluster, TIMEOUT};
use gossip_raft_kv::bridge::VoterBridge;
use gossip_raft_kv::membership::{ClusterNode, MemberState, MembershipDirectory};
use tokio::sync::watch;

fn directory_for(node: &common::TestNode) -> Arc<MembershipDirectory> {
    Arc::new(MembershipDirectory::new(ClusterNode::new(
        &node.id,
        format!("{}:2222", node.id),
        node.addr.clone(),
        format!("{}:7946", node.id),
    )))
}

#[tokio::test]
async fn gossip_joins_become_voters() -> Result<()> {
    let mut cluster = TestCluster::start(1, common::test_config()).await?;
    cluster.add_node("node2")?.raft.start();
    cluster.add_node("node3")?.raft.start();

    let directories: Vec<_> = cluster.nodes().iter().map(directory_for).collect();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    for (node, directory) in cluster.nodes().iter().zip(&directories) {
        VoterBridge::new(Arc::new(node.raft.clone()), directory.clone(), TIMEOUT)
            .spawn(shutdown_rx.clone());
    }

    // One push-pull round per newcomer against the seed.
    for directory in &directories[1..] {
        directories[0].merge(directory.members());
        directory.merge(directories[0].members());
    }

    let leader = &cluster.node(1).raft;
    eventually("both newcomers to become voters", TIMEOUT, || {
        let voters = leader.status().voters;
        voters.contains("node2") && voters.contains("node3")
    })
    .await?;
    assert_eq!(
        leader.status().voters.address("node3"),
        Some("node3:8222")
    );

    cluster.write(set("joined", "yes")).await?;
    cluster.wait_for_value("joined", Some("yes")).await?;

    shutdown_tx.send_replace(true);
    cluster.shutdown();
    Ok(())
}

#[tokio::test]
async fn departure_keeps_the_voter() -> Result<()> {
    let cluster = TestCluster::start(2, common::test_config()).await?;
    let seed = directory_for(cluster.node(1));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    VoterBridge::new(Arc::new(cluster.node(1).raft.clone()), seed.clone(), TIMEOUT)
        .spawn(shutdown_rx);

    let departing = directory_for(cluster.node(2));
    seed.merge(departing.members());
    departing.leave();
    seed.merge(departing.members());
    assert_eq!(seed.get("node2").map(|n| n.state), Some(MemberState::Dead));

    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert!(cluster.node(1).raft.status().voters.contains("node2"));

    shutdown_tx.send_replace(true);
    cluster.shutdown();
    Ok(())
}
