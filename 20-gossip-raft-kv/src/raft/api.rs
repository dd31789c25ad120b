//! Server side of [`super::transport::HttpTransport`]: protobuf raft messages
//! over HTTP on the consensus port.

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use prost::Message as ProstMessage;
use raft::prelude::Message;
use tracing::{debug, warn};

use super::node::RaftNode;
use super::transport::{decode_header, Envelope, Transport, FROM_ADDR_HEADER, FROM_ID_HEADER, MESSAGE_PATH};
use super::types::Peer;

/// Largest message accepted; a snapshot message carries the whole store.
const MAX_MESSAGE_BODY: usize = 256 * 1024 * 1024;

/// Builds the router for inbound raft messages.
pub fn router<T: Transport>(node: RaftNode<T>) -> Router {
    Router::new()
        .route(MESSAGE_PATH, post(handle_message::<T>))
        .layer(DefaultBodyLimit::max(MAX_MESSAGE_BODY))
        .with_state(node)
}

/// Queues the message for the consensus worker; never waits for it to be
/// processed.
async fn handle_message<T: Transport>(
    State(node): State<RaftNode<T>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(from) = sender(&headers) else {
        return (StatusCode::BAD_REQUEST, "missing sender headers").into_response();
    };
    let msg = match Message::decode(body) {
        Ok(msg) => msg,
        Err(err) => {
            debug!(%err, "undecodable raft message");
            return (StatusCode::BAD_REQUEST, err.to_string()).into_response();
        }
    };
    match node.step(Envelope { from, msg }) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => {
            warn!(%err, "raft message refused");
            (StatusCode::SERVICE_UNAVAILABLE, err.to_string()).into_response()
        }
    }
}

fn sender(headers: &HeaderMap) -> Option<Peer> {
    let header = |name: &str| headers.get(name)?.to_str().ok().and_then(decode_header);
    Some(Peer::new(header(FROM_ID_HEADER)?, header(FROM_ADDR_HEADER)?))
}
