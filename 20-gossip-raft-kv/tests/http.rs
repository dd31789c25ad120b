//! Two real nodes over TCP: gossip join, replication and the client API.

mod common;

use std::time::Duration;

use anyhow::Result;
use common::{eventually, TIMEOUT};
use gossip_raft_kv::config::NodeConfig;
use gossip_raft_kv::runtime::{spawn_node, NodeHandle};

fn config(id: &str, data_dir: &std::path::Path, join: Option<String>) -> NodeConfig {
    let any = "127.0.0.1:0".parse().expect("socket addr");
    NodeConfig {
        node_id: id.to_string(),
        http_addr: any,
        raft_addr: any,
        gossip_addr: any,
        advertise_host: "127.0.0.1".to_string(),
        join,
        data_dir: data_dir.to_path_buf(),
        raft: common::test_config(),
        apply_timeout: Duration::from_secs(3),
        gossip_interval: Duration::from_millis(100),
        report_interval: Duration::from_secs(1),
    }
}

async fn get(handle: &NodeHandle, path: &str) -> Result<(u16, String)> {
    let response = reqwest::get(format!("http://{}{path}", handle.addrs().http)).await?;
    Ok((response.status().as_u16(), response.text().await?))
}

async fn post(handle: &NodeHandle, path: &str) -> Result<(u16, String)> {
    let response = reqwest::Client::new()
        .post(format!("http://{}{path}", handle.addrs().http))
        .send()
        .await?;
    Ok((response.status().as_u16(), response.text().await?))
}

#[tokio::test]
async fn joined_node_serves_replicated_reads() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let first = spawn_node(config("node1", dir.path(), None)).await?;
    eventually("bootstrap leader", TIMEOUT, || first.raft().role().is_leader()).await?;

    let seed = first.addrs().gossip.to_string();
    let second = spawn_node(config("node2", dir.path(), Some(seed))).await?;
    eventually("node2 to become a voter", TIMEOUT, || {
        first.raft().status().voters.contains("node2")
    })
    .await?;

    assert_eq!(
        post(&first, "/Set/color/blue").await?,
        (200, "Set key 'color' to value 'blue'\n".to_string())
    );
    eventually("replication to node2", TIMEOUT, || {
        second.store().get("color").as_deref() == Some("blue")
    })
    .await?;
    assert_eq!(get(&second, "/Get/color").await?, (200, "blue".to_string()));

    let (status, body) = post(&second, "/Set/color/red").await?;
    assert_eq!(status, 500);
    assert!(body.starts_with("Could not write key-value: "), "{body}");

    let (status, body) = get(&second, "/Leader").await?;
    assert_eq!(status, 200);
    let leader: serde_json::Value = serde_json::from_str(&body)?;
    assert_eq!(leader["is_leader"], false);
    assert_eq!(leader["leader"], "node1");

    assert_eq!(get(&second, "/Health").await?, (200, "200".to_string()));

    second.shutdown().await;
    first.shutdown().await;
    Ok(())
}
