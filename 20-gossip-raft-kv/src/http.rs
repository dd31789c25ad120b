//! Client-facing HTTP API.
//!
//! | Route | Purpose |
//! |---|---|
//! | `GET /Get/{key}` | local read |
//! | `GET/POST /Set/{key}/{value}` | replicated write |
//! | `GET/POST /Delete/{key}` | replicated delete |
//! | `GET /Join?followerId=&followerAddr=` | add a voter by hand |
//! | `GET /Leader` | role and leader as JSON |
//! | `GET /Health` | liveness |
//!
//! Keys and values travel as path segments, so the raw path is split by hand
//! and each segment percent-decoded; a decoded `/` is rejected by the gateway.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use percent_encoding::percent_decode_str;
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::error::KvError;
use crate::gateway::{Consensus, WriteGateway};

/// Builds the client API router.
pub fn router<C: Consensus>(gateway: Arc<WriteGateway<C>>) -> Router {
    Router::new()
        .route("/Get", get(handle_get::<C>))
        .route("/Get/", get(handle_get::<C>))
        .route("/Get/*rest", get(handle_get::<C>))
        .route("/Set", get(handle_set::<C>).post(handle_set::<C>))
        .route("/Set/", get(handle_set::<C>).post(handle_set::<C>))
        .route("/Set/*rest", get(handle_set::<C>).post(handle_set::<C>))
        .route("/Delete", get(handle_delete::<C>).post(handle_delete::<C>))
        .route("/Delete/", get(handle_delete::<C>).post(handle_delete::<C>))
        .route("/Delete/*rest", get(handle_delete::<C>).post(handle_delete::<C>))
        .route("/Join", get(handle_join::<C>))
        .route("/Leader", get(handle_leader::<C>))
        .route("/Health", get(handle_health))
        .layer(TraceLayer::new_for_http())
        .with_state(gateway)
}

/// Splits the path after `/{route}/` into exactly `count` non-empty,
/// percent-decoded segments.
fn segments(uri: &Uri, route: &str, count: usize) -> Option<Vec<String>> {
    let rest = uri.path().strip_prefix('/')?.strip_prefix(route)?.strip_prefix('/')?;
    let parts: Vec<&str> = rest.split('/').collect();
    if parts.len() != count || parts.iter().any(|p| p.is_empty()) {
        return None;
    }
    parts
        .into_iter()
        .map(|p| percent_decode_str(p).decode_utf8().ok().map(|s| s.into_owned()))
        .collect()
}

fn text(status: StatusCode, body: String) -> Response {
    (status, body).into_response()
}

async fn handle_get<C: Consensus>(State(gateway): State<Arc<WriteGateway<C>>>, uri: Uri) -> Response {
    let Some(parts) = segments(&uri, "Get", 1) else {
        return text(
            StatusCode::BAD_REQUEST,
            "Invalid URL format. Expected Get/{key}\n".into(),
        );
    };
    match gateway.get(&parts[0]) {
        Some(value) => text(StatusCode::OK, value),
        None => text(StatusCode::NOT_FOUND, "Key not found\n".into()),
    }
}

async fn handle_set<C: Consensus>(State(gateway): State<Arc<WriteGateway<C>>>, uri: Uri) -> Response {
    const BAD_URL: &str = "Invalid URL format. Expected Set/{key}/{value}\n";
    let Some(parts) = segments(&uri, "Set", 2) else {
        return text(StatusCode::BAD_REQUEST, BAD_URL.into());
    };
    let (key, value) = (&parts[0], &parts[1]);
    match gateway.set(key, value).await {
        Ok(_) => text(StatusCode::OK, format!("Set key '{key}' to value '{value}'\n")),
        Err(KvError::InvalidInput(_)) => text(StatusCode::BAD_REQUEST, BAD_URL.into()),
        Err(err) => {
            warn!(key = %key, %err, "set failed");
            text(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Could not write key-value: {err}\n"),
            )
        }
    }
}

async fn handle_delete<C: Consensus>(State(gateway): State<Arc<WriteGateway<C>>>, uri: Uri) -> Response {
    const BAD_URL: &str = "Invalid URL format. Expected Delete/{key}\n";
    let Some(parts) = segments(&uri, "Delete", 1) else {
        return text(StatusCode::BAD_REQUEST, BAD_URL.into());
    };
    let key = &parts[0];
    match gateway.delete(key).await {
        Ok(_) => text(StatusCode::OK, format!("Deleted key '{key}'\n")),
        Err(KvError::InvalidInput(_)) => text(StatusCode::BAD_REQUEST, BAD_URL.into()),
        Err(err) => {
            warn!(key = %key, %err, "delete failed");
            text(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Could not delete key: {err}\n"),
            )
        }
    }
}

#[derive(Debug, Deserialize)]
struct JoinParams {
    #[serde(rename = "followerId")]
    follower_id: Option<String>,
    #[serde(rename = "followerAddr")]
    follower_addr: Option<String>,
}

async fn handle_join<C: Consensus>(
    State(gateway): State<Arc<WriteGateway<C>>>,
    Query(params): Query<JoinParams>,
) -> Response {
    let (Some(id), Some(addr)) = (
        params.follower_id.filter(|s| !s.is_empty()),
        params.follower_addr.filter(|s| !s.is_empty()),
    ) else {
        return text(
            StatusCode::BAD_REQUEST,
            "Missing followerId or followerAddr\n".into(),
        );
    };
    match gateway.join(&id, &addr).await {
        Ok(()) => text(
            StatusCode::OK,
            format!("Successfully added follower {id} at {addr}\n"),
        ),
        Err(KvError::NotLeader { .. }) => {
            text(StatusCode::BAD_REQUEST, "Error not the leader\n".into())
        }
        Err(err) => {
            warn!(follower = %id, %err, "join failed");
            text(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to add follower\n".into(),
            )
        }
    }
}

async fn handle_leader<C: Consensus>(State(gateway): State<Arc<WriteGateway<C>>>) -> Response {
    Json(gateway.leader_status()).into_response()
}

async fn handle_health() -> &'static str {
    "200"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::tests::FakeConsensus;
    use crate::raft::Role;
    use crate::store::KvStore;
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    struct Harness {
        app: Router,
        store: Arc<KvStore>,
        consensus: Arc<FakeConsensus>,
    }

    fn harness(role: Role) -> Harness {
        let store = Arc::new(KvStore::new());
        let consensus = FakeConsensus::new(role, store.clone());
        let gateway = Arc::new(WriteGateway::new(
            consensus.clone(),
            store.clone(),
            Duration::from_secs(1),
        ));
        Harness {
            app: router(gateway),
            store,
            consensus,
        }
    }

    async fn call(app: &Router, method: &str, uri: &str) -> (StatusCode, String) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn get_handler() {
        let h = harness(Role::Follower);
        h.store.set("testkey".into(), "testvalue".into());

        assert_eq!(
            call(&h.app, "GET", "/Get/testkey").await,
            (StatusCode::OK, "testvalue".to_string())
        );
        assert_eq!(
            call(&h.app, "GET", "/Get/nonexistent").await,
            (StatusCode::NOT_FOUND, "Key not found\n".to_string())
        );
        for bad in ["/Get/", "/Get", "/Get/a/b"] {
            assert_eq!(
                call(&h.app, "GET", bad).await,
                (
                    StatusCode::BAD_REQUEST,
                    "Invalid URL format. Expected Get/{key}\n".to_string()
                ),
                "{bad}"
            );
        }
    }

    #[tokio::test]
    async fn set_handler_on_leader() {
        let h = harness(Role::Leader);
        assert_eq!(
            call(&h.app, "POST", "/Set/testkey/testvalue").await,
            (
                StatusCode::OK,
                "Set key 'testkey' to value 'testvalue'\n".to_string()
            )
        );
        assert_eq!(h.store.get("testkey").as_deref(), Some("testvalue"));

        // Segments are percent-decoded.
        let (status, _) = call(&h.app, "GET", "/Set/hello%20world/v").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(h.store.get("hello world").as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn set_handler_rejects_bad_urls() {
        let h = harness(Role::Leader);
        for bad in ["/Set/onlykey", "/Set/", "/Set/a/b/c", "/Set/a%2Fb/v"] {
            assert_eq!(
                call(&h.app, "POST", bad).await,
                (
                    StatusCode::BAD_REQUEST,
                    "Invalid URL format. Expected Set/{key}/{value}\n".to_string()
                ),
                "{bad}"
            );
        }
        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn set_on_follower_reports_cause() {
        let h = harness(Role::Follower);
        let (status, body) = call(&h.app, "POST", "/Set/k/v").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.starts_with("Could not write key-value: "), "{body}");
        assert!(body.contains("not the leader"), "{body}");
        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn delete_handler() {
        let h = harness(Role::Leader);
        h.store.set("testkey".into(), "v".into());
        assert_eq!(
            call(&h.app, "POST", "/Delete/testkey").await,
            (StatusCode::OK, "Deleted key 'testkey'\n".to_string())
        );
        assert_eq!(h.store.get("testkey"), None);

        assert_eq!(
            call(&h.app, "POST", "/Delete/").await,
            (
                StatusCode::BAD_REQUEST,
                "Invalid URL format. Expected Delete/{key}\n".to_string()
            )
        );

        *h.consensus.fail_with.lock().unwrap() = Some(|| KvError::Timeout);
        let (status, body) = call(&h.app, "GET", "/Delete/other").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.starts_with("Could not delete key: "), "{body}");
    }

    #[tokio::test]
    async fn join_handler() {
        let h = harness(Role::Leader);
        assert_eq!(
            call(&h.app, "GET", "/Join?followerId=node2").await,
            (
                StatusCode::BAD_REQUEST,
                "Missing followerId or followerAddr\n".to_string()
            )
        );
        assert_eq!(
            call(&h.app, "GET", "/Join?followerId=node2&followerAddr=127.0.0.1:8223").await,
            (
                StatusCode::OK,
                "Successfully added follower node2 at 127.0.0.1:8223\n".to_string()
            )
        );
        assert_eq!(
            h.consensus.voters.lock().unwrap().as_slice(),
            &[("node2".to_string(), "127.0.0.1:8223".to_string())]
        );

        *h.consensus.fail_with.lock().unwrap() =
            Some(|| KvError::ConfigChange("busy".into()));
        assert_eq!(
            call(&h.app, "GET", "/Join?followerId=node3&followerAddr=x:1").await,
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to add follower\n".to_string()
            )
        );
    }

    #[tokio::test]
    async fn join_on_follower() {
        let h = harness(Role::Follower);
        assert_eq!(
            call(&h.app, "GET", "/Join?followerId=node2&followerAddr=x:1").await,
            (StatusCode::BAD_REQUEST, "Error not the leader\n".to_string())
        );
    }

    #[tokio::test]
    async fn leader_and_health() {
        let h = harness(Role::Leader);
        let (status, body) = call(&h.app, "GET", "/Leader").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["is_leader"], true);
        assert_eq!(json["role"], "leader");
        assert_eq!(json["node_id"], "node1");

        assert_eq!(
            call(&h.app, "GET", "/Health").await,
            (StatusCode::OK, "200".to_string())
        );
    }
}
