//! How raft messages reach other nodes.
//!
//! Delivery is one-way: raft-rs answers a message with another message, so
//! there is no reply to wait for. Every message travels with the sender's
//! name and consensus address, so a node that has not applied the change
//! adding its leader can still answer it.
//!
//! [`HttpTransport`] posts protobuf-encoded messages to the peer's consensus
//! port, with the sender in two headers. [`LocalNetwork`] hands them over
//! in-process channels and can cut nodes off, which is what the cluster
//! tests use.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use percent_encoding::{percent_decode_str, utf8_percent_encode, NON_ALPHANUMERIC};
use prost::Message as ProstMessage;
use raft::prelude::Message;
use tokio::sync::mpsc;
use tracing::trace;

use super::types::Peer;
use crate::error::TransportError;

/// A raft message and the node that sent it.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub from: Peer,
    pub msg: Message,
}

/// Delivers raft messages to a peer identified by its consensus address.
pub trait Transport: Clone + Send + Sync + 'static {
    fn send(
        &self,
        addr: &str,
        from: &Peer,
        msg: Message,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;
}

pub const MESSAGE_PATH: &str = "/raft/message";

pub const PROTOBUF: &str = "application/x-protobuf";

/// Percent-encoded name of the sending node.
pub const FROM_ID_HEADER: &str = "x-raft-from-id";

/// Percent-encoded consensus address of the sending node.
pub const FROM_ADDR_HEADER: &str = "x-raft-from-addr";

pub(crate) fn encode_header(value: &str) -> String {
    utf8_percent_encode(value, NON_ALPHANUMERIC).to_string()
}

pub(crate) fn decode_header(value: &str) -> Option<String> {
    percent_decode_str(value).decode_utf8().ok().map(|s| s.into_owned())
}

/// Protobuf over HTTP, served by [`super::api::router`] on the other side.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self { client })
    }
}

impl Transport for HttpTransport {
    async fn send(&self, addr: &str, from: &Peer, msg: Message) -> Result<(), TransportError> {
        let url = format!("http://{addr}{MESSAGE_PATH}");
        let response = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, PROTOBUF)
            .header(FROM_ID_HEADER, encode_header(&from.id))
            .header(FROM_ADDR_HEADER, encode_header(&from.addr))
            .body(msg.encode_to_vec())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout(addr.to_string())
                } else if e.is_connect() {
                    TransportError::Unreachable(addr.to_string())
                } else {
                    TransportError::Http(e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                addr: addr.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct NetworkState {
    endpoints: HashMap<String, mpsc::UnboundedSender<Envelope>>,
    isolated: HashSet<String>,
}

/// In-process network connecting nodes by address.
#[derive(Debug, Clone, Default)]
pub struct LocalNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `addr`, replacing any earlier registration, and returns the
    /// transport that node sends with plus the stream of messages it receives.
    pub fn register(&self, addr: &str) -> (LocalTransport, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().endpoints.insert(addr.to_string(), tx);
        let transport = LocalTransport {
            network: self.clone(),
            local_addr: addr.to_string(),
        };
        (transport, rx)
    }

    /// Drops every message to or from `addr` until [`Self::heal`].
    pub fn isolate(&self, addr: &str) {
        self.lock().isolated.insert(addr.to_string());
    }

    pub fn heal(&self, addr: &str) {
        self.lock().isolated.remove(addr);
    }

    pub fn heal_all(&self) {
        self.lock().isolated.clear();
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn route(&self, from: &str, to: &str) -> Result<mpsc::UnboundedSender<Envelope>, TransportError> {
        let state = self.lock();
        if state.isolated.contains(from) || state.isolated.contains(to) {
            return Err(TransportError::Unreachable(to.to_string()));
        }
        state
            .endpoints
            .get(to)
            .cloned()
            .ok_or_else(|| TransportError::Unreachable(to.to_string()))
    }
}

/// A node's handle on a [`LocalNetwork`].
#[derive(Debug, Clone)]
pub struct LocalTransport {
    network: LocalNetwork,
    local_addr: String,
}

impl Transport for LocalTransport {
    async fn send(&self, addr: &str, from: &Peer, msg: Message) -> Result<(), TransportError> {
        let endpoint = self.network.route(&self.local_addr, addr)?;
        trace!(from = %self.local_addr, to = addr, kind = ?msg.msg_type(), "local message sent");
        let envelope = Envelope {
            from: from.clone(),
            msg,
        };
        endpoint
            .send(envelope)
            .map_err(|_| TransportError::Unreachable(addr.to_string()))
    }
}
