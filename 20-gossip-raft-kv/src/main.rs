//! Runs one store node.
//!
//! Start a three-node cluster on one machine:
//! ```bash
//! cargo run -- --node-id node1 --data-dir data
//! cargo run -- --node-id node2 --http-port 2223 --raft-port 8223 --gossip-port 7947 \
//!   --join 127.0.0.1:7946 --data-dir data
//! cargo run -- --node-id node3 --http-port 2224 --raft-port 8224 --gossip-port 7948 \
//!   --join 127.0.0.1:7946 --data-dir data
//! curl -X POST localhost:2222/Set/greeting/hello
//! curl localhost:2224/Get/greeting
//! ```

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tracing::{error, info};

use gossip_raft_kv::config::{Cli, NodeConfig};
use gossip_raft_kv::runtime::spawn_node;

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = NodeConfig::try_from(Cli::parse())?;
    let handle = spawn_node(config).await?;

    let outcome = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for ctrl-c")?;
            info!("ctrl-c received");
            Ok(())
        }
        reason = handle.wait_fatal() => {
            error!(%reason, "node halted");
            Err(anyhow!("node halted: {reason}"))
        }
    };

    handle.shutdown().await;
    outcome
}
